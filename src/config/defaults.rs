//! System-wide default constants.
//!
//! Grouped by subsystem for easy discovery.

// ============================================================================
// Paths
// ============================================================================

/// Upload root; one directory per extracted bundle.
pub const UPLOADS_DIR: &str = "pi_uploads";

/// Archive root; a bundle appearing here has been finalized downstream.
pub const RECORDS_DIR: &str = "records";

/// Persisted status document.
pub const STATUS_FILE: &str = "folderStatus.json";

// ============================================================================
// Folder Reconciler
// ============================================================================

/// Interval between reconciliation passes (seconds).
pub const RECONCILE_INTERVAL_SECS: u64 = 30;

// ============================================================================
// Processing Scheduler
// ============================================================================

/// Interval between scheduler scans (seconds).
pub const SCHEDULE_INTERVAL_SECS: u64 = 10;

/// Secondary-channel media file inside a bundle directory.
pub const SECONDARY_MEDIA_FILE: &str = "side.mp4";

/// Directory inside a bundle where inference artifacts are written.
pub const OUTPUT_DIR: &str = "outputs";

/// File name of the secondary-channel artifact.
pub const SECONDARY_OUTPUT_FILE: &str = "side_output.zip";

// ============================================================================
// Inference Service
// ============================================================================

/// Default inference endpoint.
pub const INFERENCE_ENDPOINT: &str = "http://127.0.0.1:7860/predict";

/// Upper bound on one inference call, after which it counts as failed (seconds).
///
/// 600 = 10 minutes; video inference on CPU is slow.
pub const INFERENCE_TIMEOUT_SECS: u64 = 600;
