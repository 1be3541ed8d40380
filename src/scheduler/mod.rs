//! Processing Scheduler: one inference call at a time
//!
//! Every scan reloads the status document, picks the first live, unprocessed
//! record (in document order) whose secondary channel is waiting, marks it `processing`, and sends
//! its media to the inference service. The outcome is written back as `done`
//! with the artifact path, or rolled back to `waiting` so a later scan retries.
//!
//! A single-flight gate keeps at most one call outstanding. A scan that finds
//! the gate held returns without touching the store. The call blocks the scan
//! that dispatched it, so a slow service throttles the whole pipeline.

pub mod gate;

pub use gate::{GateGuard, SingleFlightGate};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::OrchestratorConfig;
use crate::inference::{InferenceClient, InferenceError, InferenceRequest};
use crate::storage::{StatusStore, StoreError};
use crate::types::{Channel, ChannelStatus};

/// Where media and artifacts live, and how often / how long to wait.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub uploads_dir: PathBuf,
    pub media_file: String,
    pub output_dir: String,
    pub output_file: String,
    pub interval: Duration,
    pub inference_timeout: Duration,
}

impl SchedulerSettings {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            uploads_dir: config.paths.uploads_dir.clone(),
            media_file: config.scheduler.media_file.clone(),
            output_dir: config.scheduler.output_dir.clone(),
            output_file: config.scheduler.output_file.clone(),
            interval: config.schedule_interval(),
            inference_timeout: config.inference_timeout(),
        }
    }

    /// `<uploads>/<identity>/<media_file>`
    pub fn media_path(&self, identity: &str) -> PathBuf {
        self.uploads_dir.join(identity).join(&self.media_file)
    }

    /// `<uploads>/<identity>/<output_dir>/<output_file>`
    pub fn artifact_path(&self, identity: &str) -> PathBuf {
        self.uploads_dir
            .join(identity)
            .join(&self.output_dir)
            .join(&self.output_file)
    }
}

/// Why a dispatch failed. Every variant rolls the channel back to waiting.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("cannot read media {}: {source}", path.display())]
    Media {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("inference failed: {0}")]
    Inference(#[from] InferenceError),
    #[error("cannot write artifact {}: {source}", path.display())]
    Artifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result of one scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// A call is already in flight; nothing was read or written
    GateHeld,
    /// No eligible record (or the store could not be updated)
    Idle,
    Completed { identity: String, result: String },
    Failed { identity: String, reason: String },
}

/// How a write-back landed on the freshly reloaded record.
enum WriteBack {
    Applied { processed: bool },
    /// The channel was changed by someone else while the call was out
    Superseded(ChannelStatus),
    Missing,
}

/// Periodic dispatch actor.
pub struct ProcessingScheduler {
    store: Arc<StatusStore>,
    client: Arc<dyn InferenceClient>,
    settings: SchedulerSettings,
    gate: SingleFlightGate,
}

impl ProcessingScheduler {
    pub fn new(
        store: Arc<StatusStore>,
        client: Arc<dyn InferenceClient>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            store,
            client,
            settings,
            gate: SingleFlightGate::new(),
        }
    }

    /// Whether an inference call is outstanding.
    pub fn is_busy(&self) -> bool {
        self.gate.is_held()
    }

    /// Revert secondary channels left `processing` by a previous process.
    ///
    /// The gate does not survive a restart, so no call can be in flight for
    /// them. Tombstoned records are left as they are.
    pub async fn recover_interrupted(&self) -> Result<Vec<String>, StoreError> {
        let recovered = self
            .store
            .update(|doc| {
                let mut recovered = Vec::new();
                for (identity, record) in &mut doc.folders {
                    if !record.tombstoned && record.secondary.is(ChannelStatus::Processing) {
                        record.secondary = Channel::waiting();
                        recovered.push(identity.clone());
                    }
                }
                recovered
            })
            .await?;

        for identity in &recovered {
            warn!(identity = %identity, "Secondary channel left processing by a previous run — back to waiting");
        }
        Ok(recovered)
    }

    /// Run one scan: claim at most one record and drive it through inference.
    pub async fn scan_once(&self) -> ScanOutcome {
        let Some(_gate) = self.gate.try_acquire() else {
            debug!("Inference in flight, skipping scan");
            return ScanOutcome::GateHeld;
        };

        let identity = match self.claim_next().await {
            Ok(Some(identity)) => identity,
            Ok(None) => return ScanOutcome::Idle,
            Err(e) => {
                warn!(error = %e, "Could not claim work, will retry next scan");
                return ScanOutcome::Idle;
            }
        };

        info!(
            identity = %identity,
            backend = self.client.backend_name(),
            "Sending secondary media for inference"
        );

        match self.dispatch(&identity).await {
            Ok(result) => match self.complete(&identity, &result).await {
                Ok(()) => ScanOutcome::Completed { identity, result },
                Err(e) => {
                    error!(identity = %identity, error = %e, "Could not persist inference result, rolling back");
                    self.roll_back(&identity).await;
                    ScanOutcome::Failed {
                        identity,
                        reason: e.to_string(),
                    }
                }
            },
            Err(e) => {
                warn!(identity = %identity, error = %e, "Inference failed, will retry on a later scan");
                self.roll_back(&identity).await;
                ScanOutcome::Failed {
                    identity,
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Mark the first eligible record's secondary channel `processing`.
    ///
    /// Records are tried in the order they were first recorded. Records whose
    /// media file is not on disk are passed over so one broken
    /// bundle cannot hold up the rest.
    async fn claim_next(&self) -> Result<Option<String>, StoreError> {
        let settings = &self.settings;
        self.store
            .update(|doc| {
                let identity = doc
                    .folders
                    .iter()
                    .filter(|(_, record)| record.is_dispatchable())
                    .map(|(identity, _)| identity)
                    .find(|identity| {
                        let media = settings.media_path(identity);
                        let present = media.is_file();
                        if !present {
                            debug!(identity = %identity, media = %media.display(), "Media not found, skipping");
                        }
                        present
                    })
                    .cloned()?;

                if let Some(record) = doc.get_mut(&identity) {
                    record.secondary = Channel {
                        status: ChannelStatus::Processing,
                        result: None,
                    };
                }
                Some(identity)
            })
            .await
    }

    /// Read the media, call the service under the timeout, store the artifact.
    async fn dispatch(&self, identity: &str) -> Result<String, DispatchError> {
        let media_path = self.settings.media_path(identity);
        let media = tokio::fs::read(&media_path)
            .await
            .map_err(|source| DispatchError::Media {
                path: media_path.clone(),
                source,
            })?;

        let request = InferenceRequest {
            identity: identity.to_string(),
            file_name: self.settings.media_file.clone(),
            media,
        };

        let timeout = self.settings.inference_timeout;
        let artifact = tokio::time::timeout(timeout, self.client.infer(request))
            .await
            .map_err(|_| InferenceError::Timeout(timeout))??;

        info!(identity = %identity, size_bytes = artifact.len(), "Inference response received");

        let artifact_path = self.settings.artifact_path(identity);
        if let Some(dir) = artifact_path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| DispatchError::Artifact {
                    path: dir.to_path_buf(),
                    source,
                })?;
        }
        tokio::fs::write(&artifact_path, &artifact)
            .await
            .map_err(|source| DispatchError::Artifact {
                path: artifact_path.clone(),
                source,
            })?;

        debug!(identity = %identity, path = %artifact_path.display(), "Artifact saved");
        Ok(artifact_path.to_string_lossy().into_owned())
    }

    /// Record the artifact. Only a failed save is an error; a superseded or
    /// vanished record is logged and left as it is.
    async fn complete(&self, identity: &str, result: &str) -> Result<(), StoreError> {
        let write_back = self
            .store
            .update(|doc| {
                let Some(record) = doc.get_mut(identity) else {
                    return WriteBack::Missing;
                };
                match record.secondary.status {
                    ChannelStatus::Waiting => WriteBack::Superseded(ChannelStatus::Waiting),
                    ChannelStatus::Processing | ChannelStatus::Done => {
                        record.secondary = Channel {
                            status: ChannelStatus::Done,
                            result: Some(result.to_string()),
                        };
                        record.refresh_processed();
                        WriteBack::Applied {
                            processed: record.processed,
                        }
                    }
                }
            })
            .await?;

        match write_back {
            WriteBack::Applied { processed: true } => {
                info!(identity = %identity, result = %result, "Folder fully processed");
            }
            WriteBack::Applied { processed: false } => {
                info!(identity = %identity, result = %result, "Secondary channel done");
            }
            WriteBack::Superseded(status) => {
                warn!(identity = %identity, status = %status, "Record was reset during inference — result discarded");
            }
            WriteBack::Missing => {
                warn!(identity = %identity, "Record vanished during inference — result discarded");
            }
        }
        Ok(())
    }

    async fn roll_back(&self, identity: &str) {
        let write_back = self
            .store
            .update(|doc| {
                let Some(record) = doc.get_mut(identity) else {
                    return WriteBack::Missing;
                };
                if record.secondary.is(ChannelStatus::Processing) {
                    record.secondary = Channel::waiting();
                    WriteBack::Applied {
                        processed: record.processed,
                    }
                } else {
                    WriteBack::Superseded(record.secondary.status)
                }
            })
            .await;

        match write_back {
            Ok(WriteBack::Applied { .. }) => {
                debug!(identity = %identity, "Secondary channel back to waiting");
            }
            Ok(WriteBack::Superseded(status)) => {
                debug!(identity = %identity, status = %status, "Channel changed during inference, rollback skipped");
            }
            Ok(WriteBack::Missing) => {
                warn!(identity = %identity, "Record vanished during inference");
            }
            Err(e) => {
                error!(identity = %identity, error = %e, "Could not roll back channel — stays processing until restart");
            }
        }
    }

    /// Recover orphans, then scan on every tick until cancelled.
    ///
    /// Cancellation during a call abandons it; the channel is picked up by
    /// `recover_interrupted` on the next start.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            interval_secs = self.settings.interval.as_secs(),
            timeout_secs = self.settings.inference_timeout.as_secs(),
            backend = self.client.backend_name(),
            "Processing scheduler started"
        );

        if let Err(e) = self.recover_interrupted().await {
            warn!(error = %e, "Startup recovery failed");
        }

        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => {
                            warn!("Shutdown during inference — call abandoned");
                            break;
                        }
                        outcome = self.scan_once() => {
                            debug!(outcome = ?outcome, "Scan finished");
                        }
                    }
                }
            }
        }

        info!("Processing scheduler stopping");
    }
}
