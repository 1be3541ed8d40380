//! Orchestrator Configuration - paths, intervals and the inference service
//!
//! Each struct implements `Default` with the values in [`super::defaults`],
//! so a missing file or section behaves like the built-in setup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use super::defaults;

/// Environment variable pointing at the config file
pub const CONFIG_ENV_VAR: &str = "ORCHESTRATOR_CONFIG";

/// Config file looked for in the working directory
pub const LOCAL_CONFIG_FILE: &str = "orchestrator.toml";

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration.
///
/// Load with `OrchestratorConfig::load()` which searches:
/// 1. `$ORCHESTRATOR_CONFIG` env var
/// 2. `./orchestrator.toml`
/// 3. Built-in defaults
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub reconciler: ReconcilerConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub inference: InferenceConfig,
}

/// Filesystem locations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Upload root; presence of `<uploads_dir>/<identity>/` means the bundle exists
    pub uploads_dir: PathBuf,
    /// Archive root; presence of `<records_dir>/<identity>` means it is finalized
    pub records_dir: PathBuf,
    /// Status document
    pub status_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            uploads_dir: PathBuf::from(defaults::UPLOADS_DIR),
            records_dir: PathBuf::from(defaults::RECORDS_DIR),
            status_file: PathBuf::from(defaults::STATUS_FILE),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub interval_secs: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval_secs: defaults::RECONCILE_INTERVAL_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub interval_secs: u64,
    /// Secondary-channel media file name inside each bundle
    pub media_file: String,
    /// Artifact directory inside each bundle
    pub output_dir: String,
    /// Artifact file name
    pub output_file: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: defaults::SCHEDULE_INTERVAL_SECS,
            media_file: defaults::SECONDARY_MEDIA_FILE.to_string(),
            output_dir: defaults::OUTPUT_DIR.to_string(),
            output_file: defaults::SECONDARY_OUTPUT_FILE.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub endpoint: String,
    pub timeout_secs: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            endpoint: defaults::INFERENCE_ENDPOINT.to_string(),
            timeout_secs: defaults::INFERENCE_TIMEOUT_SECS,
        }
    }
}

// ============================================================================
// Loading
// ============================================================================

impl OrchestratorConfig {
    /// Load configuration using the standard search order, then apply
    /// environment overrides.
    pub fn load() -> Self {
        let mut config = Self::load_file_or_default();
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    fn load_file_or_default() -> Self {
        // 1. Check env var
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), "Loaded config from {}", CONFIG_ENV_VAR);
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from {}, falling back", CONFIG_ENV_VAR);
                    }
                }
            } else {
                warn!(path = %path, "{} points to non-existent file, falling back", CONFIG_ENV_VAR);
            }
        }

        // 2. Check ./orchestrator.toml
        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!("Loaded config from ./{}", LOCAL_CONFIG_FILE);
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./{}, using defaults", LOCAL_CONFIG_FILE);
                }
            }
        }

        // 3. Defaults
        info!("No {} found — using built-in defaults", LOCAL_CONFIG_FILE);
        Self::default()
    }

    /// Load from a specific TOML file path.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let config = Self::from_toml(&contents).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Apply environment overrides.
    ///
    /// `lookup` resolves a variable name; `load()` passes `std::env::var`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(secs) = parse_override(&lookup, "RECONCILE_INTERVAL_SECS") {
            self.reconciler.interval_secs = secs;
        }
        if let Some(secs) = parse_override(&lookup, "SCHEDULE_INTERVAL_SECS") {
            self.scheduler.interval_secs = secs;
        }
        if let Some(endpoint) = lookup("INFERENCE_ENDPOINT").filter(|v| !v.is_empty()) {
            self.inference.endpoint = endpoint;
        }
    }

    /// Check ranges and formats, reporting every problem at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.reconciler.interval_secs == 0 {
            errors.push("reconciler.interval_secs must be greater than 0".to_string());
        }
        if self.scheduler.interval_secs == 0 {
            errors.push("scheduler.interval_secs must be greater than 0".to_string());
        }
        if self.inference.timeout_secs == 0 {
            errors.push("inference.timeout_secs must be greater than 0".to_string());
        }
        if !(self.inference.endpoint.starts_with("http://")
            || self.inference.endpoint.starts_with("https://"))
        {
            errors.push(format!(
                "inference.endpoint must be an http(s) URL, got {:?}",
                self.inference.endpoint
            ));
        }
        for (key, value) in [
            ("scheduler.media_file", &self.scheduler.media_file),
            ("scheduler.output_dir", &self.scheduler.output_dir),
            ("scheduler.output_file", &self.scheduler.output_file),
        ] {
            if value.is_empty() || value.contains('/') || value.contains('\\') {
                errors.push(format!("{key} must be a plain file name, got {value:?}"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    pub const fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconciler.interval_secs)
    }

    pub const fn schedule_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.interval_secs)
    }

    pub const fn inference_timeout(&self) -> Duration {
        Duration::from_secs(self.inference.timeout_secs)
    }
}

fn parse_override<F>(lookup: &F, key: &str) -> Option<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key = key, value = %raw, "Ignoring non-numeric override");
            None
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum ConfigError {
    Io(PathBuf, std::io::Error),
    Parse(PathBuf, toml::de::Error),
    Validation(Vec<String>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(path, e) => write!(f, "Config I/O error ({}): {}", path.display(), e),
            ConfigError::Parse(path, e) => {
                write!(f, "Config parse error ({}): {}", path.display(), e)
            }
            ConfigError::Validation(errors) => {
                writeln!(f, "Config validation failed:")?;
                for e in errors {
                    writeln!(f, "  - {}", e)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(_, e) => Some(e),
            ConfigError::Parse(_, e) => Some(e),
            ConfigError::Validation(_) => None,
        }
    }
}
