//! Bundle Orchestrator: folder lifecycle and inference scheduling
//!
//! Tracks uploaded media bundles through a two-channel processing pipeline.
//!
//! ## Architecture
//!
//! - **StatusStore**: the persisted `folderStatus.json` document
//! - **FolderReconciler**: periodic pass aligning the document with the upload filesystem
//! - **ProcessingScheduler**: periodic scan dispatching one inference call at a time
//! - **InferenceClient**: capability boundary to the external model service

pub mod config;
pub mod types;
pub mod storage;
pub mod inference;
pub mod reconciler;
pub mod scheduler;

pub use config::OrchestratorConfig;

pub use types::{
    Channel, ChannelKind, ChannelStatus, FolderRecord, FolderSummary, StatusDocument,
};

pub use storage::{SeedOutcome, StatusStore, StoreError, StoreLock};

pub use inference::{HttpInferenceClient, InferenceClient, InferenceError, InferenceRequest};

pub use reconciler::{FolderReconciler, ReconcileError, ReconcileReport};

pub use scheduler::{ProcessingScheduler, ScanOutcome, SchedulerSettings};
