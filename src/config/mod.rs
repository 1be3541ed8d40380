//! Orchestrator Configuration Module
//!
//! ## Loading Order
//!
//! 1. `ORCHESTRATOR_CONFIG` environment variable (path to TOML file)
//! 2. `orchestrator.toml` in the current working directory
//! 3. Built-in defaults (see [`defaults`])
//!
//! `RECONCILE_INTERVAL_SECS`, `SCHEDULE_INTERVAL_SECS` and
//! `INFERENCE_ENDPOINT` override the loaded values.
//!
//! ```toml
//! [paths]
//! uploads_dir = "/srv/pi_uploads"
//! records_dir = "/srv/records"
//! status_file = "/srv/folderStatus.json"
//!
//! [scheduler]
//! interval_secs = 10
//!
//! [inference]
//! endpoint = "http://inference:7860/predict"
//! timeout_secs = 600
//! ```

mod orchestrator_config;
pub mod defaults;

pub use orchestrator_config::*;
