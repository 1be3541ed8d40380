//! Folder Reconciler: filesystem truth vs. the status document
//!
//! On a fixed period, lists the bundle directories under the upload root and
//! the finalized bundles under the archive root, then brings the status
//! document in line:
//! - unseen bundles get a record (already `done` if archived)
//! - tracked bundles are refreshed, never touching a `processing` channel
//! - bundles gone from the upload root are tombstoned, never deleted
//!
//! The reconciler never triggers inference.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::storage::{StatusStore, StoreError};
use crate::types::{Channel, ChannelKind, ChannelStatus, FolderRecord, StatusDocument};

/// Reconciliation errors; each aborts the current pass only.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("cannot list upload root {}: {source}", path.display())]
    Uploads {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot list archive root {}: {source}", path.display())]
    Archive {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What one pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Records created for newly observed bundles
    pub created: usize,
    /// Existing records refreshed
    pub refreshed: usize,
    /// Records forced to done by the archive signal this pass
    pub finalized: usize,
    /// Records tombstoned this pass
    pub tombstoned: usize,
    /// Tombstoned identities seen on disk again (left tombstoned)
    pub reappeared: Vec<String>,
}

/// Apply one reconciliation pass to `doc`.
///
/// `present` are the identities on the upload root, `archived` those on the
/// archive root. Pure with respect to the filesystem.
pub fn reconcile_document(
    doc: &mut StatusDocument,
    present: &BTreeSet<String>,
    archived: &BTreeSet<String>,
    now: DateTime<Utc>,
) -> ReconcileReport {
    let mut report = ReconcileReport::default();

    for identity in present {
        let is_archived = archived.contains(identity);

        let Some(record) = doc.folders.get_mut(identity) else {
            let record = if is_archived {
                FolderRecord::archived(now)
            } else {
                FolderRecord::waiting(now)
            };
            doc.folders.insert(identity.clone(), record);
            report.created += 1;
            continue;
        };

        // Identity reuse after removal is not honoured.
        if record.tombstoned {
            report.reappeared.push(identity.clone());
            continue;
        }

        if is_archived {
            if !record.both_done() {
                report.finalized += 1;
            }
            finalize_channel(record.channel_mut(ChannelKind::Primary));
            finalize_channel(record.channel_mut(ChannelKind::Secondary));
        } else {
            refresh_channel(record.channel_mut(ChannelKind::Primary));
            refresh_channel(record.channel_mut(ChannelKind::Secondary));
        }

        record.refresh_processed();
        record.last_checked = now;
        report.refreshed += 1;
    }

    for (identity, record) in &mut doc.folders {
        if !record.tombstoned && !present.contains(identity) {
            record.tombstoned = true;
            report.tombstoned += 1;
            info!(identity = %identity, primary = %record.primary.status, secondary = %record.secondary.status, "Folder removed — tombstoned");
        }
    }

    report
}

/// Archive-confirmed: the channel is done, keeping any artifact it produced.
fn finalize_channel(channel: &mut Channel) {
    if !channel.is(ChannelStatus::Done) {
        *channel = Channel::archived();
    }
}

/// Not archived: a channel that is neither in flight nor done is waiting and
/// carries no result.
fn refresh_channel(channel: &mut Channel) {
    match channel.status {
        ChannelStatus::Processing | ChannelStatus::Done => {}
        ChannelStatus::Waiting => *channel = Channel::waiting(),
    }
}

/// Names of the directories directly under `root`.
pub fn list_bundle_dirs(root: &Path) -> std::io::Result<BTreeSet<String>> {
    let mut names = BTreeSet::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        match entry.file_name().into_string() {
            Ok(name) => {
                names.insert(name);
            }
            Err(raw) => warn!(name = ?raw, "Skipping bundle directory with non UTF-8 name"),
        }
    }
    Ok(names)
}

/// Names of every entry directly under `root`.
pub fn list_archive_entries(root: &Path) -> std::io::Result<BTreeSet<String>> {
    let mut names = BTreeSet::new();
    for entry in std::fs::read_dir(root)? {
        if let Ok(name) = entry?.file_name().into_string() {
            names.insert(name);
        }
    }
    Ok(names)
}

/// Periodic reconciliation actor.
pub struct FolderReconciler {
    store: Arc<StatusStore>,
    uploads_dir: PathBuf,
    records_dir: PathBuf,
    interval: Duration,
}

impl FolderReconciler {
    pub fn new(
        store: Arc<StatusStore>,
        uploads_dir: impl Into<PathBuf>,
        records_dir: impl Into<PathBuf>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            uploads_dir: uploads_dir.into(),
            records_dir: records_dir.into(),
            interval,
        }
    }

    /// Run one reconciliation pass against the filesystem and the store.
    pub async fn run_pass(&self) -> Result<ReconcileReport, ReconcileError> {
        let present = list_bundle_dirs(&self.uploads_dir).map_err(|source| ReconcileError::Uploads {
            path: self.uploads_dir.clone(),
            source,
        })?;
        let archived =
            list_archive_entries(&self.records_dir).map_err(|source| ReconcileError::Archive {
                path: self.records_dir.clone(),
                source,
            })?;

        let now = Utc::now();
        let report = self
            .store
            .update(|doc| reconcile_document(doc, &present, &archived, now))
            .await?;

        for identity in &report.reappeared {
            warn!(identity = %identity, "Tombstoned folder reappeared on disk — identity not reused, record stays tombstoned");
        }

        if report.created > 0 || report.finalized > 0 || report.tombstoned > 0 {
            info!(
                present = present.len(),
                created = report.created,
                finalized = report.finalized,
                tombstoned = report.tombstoned,
                "Reconciliation pass applied changes"
            );
        } else {
            debug!(present = present.len(), refreshed = report.refreshed, "Reconciliation pass complete");
        }

        Ok(report)
    }

    /// Run passes until cancelled. A failed pass is logged and retried on the
    /// next tick.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            uploads = %self.uploads_dir.display(),
            records = %self.records_dir.display(),
            interval_secs = self.interval.as_secs(),
            "Folder reconciler started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("Folder reconciler stopping");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_pass().await {
                        warn!(error = %e, "Reconciliation pass aborted, will retry next tick");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_new_folder_starts_waiting() {
        let mut doc = StatusDocument::default();
        let report = reconcile_document(&mut doc, &ids(&["F1"]), &ids(&[]), Utc::now());

        assert_eq!(report.created, 1);
        let record = doc.get("F1").unwrap();
        assert_eq!(record.primary, Channel::waiting());
        assert_eq!(record.secondary, Channel::waiting());
        assert!(!record.processed);
        assert!(!record.tombstoned);
    }

    #[test]
    fn test_new_archived_folder_starts_done() {
        let mut doc = StatusDocument::default();
        reconcile_document(&mut doc, &ids(&["F1"]), &ids(&["F1"]), Utc::now());

        let record = doc.get("F1").unwrap();
        assert!(record.both_done());
        assert!(record.processed);
    }

    #[test]
    fn test_archive_forces_done_and_keeps_result() {
        let mut doc = StatusDocument::default();
        let mut record = FolderRecord::waiting(Utc::now());
        record.secondary = Channel {
            status: ChannelStatus::Done,
            result: Some("pi_uploads/F1/outputs/side_output.zip".to_string()),
        };
        doc.folders.insert("F1".to_string(), record);

        let report = reconcile_document(&mut doc, &ids(&["F1"]), &ids(&["F1"]), Utc::now());

        assert_eq!(report.finalized, 1);
        let record = doc.get("F1").unwrap();
        assert!(record.processed);
        assert_eq!(
            record.secondary.result.as_deref(),
            Some("pi_uploads/F1/outputs/side_output.zip")
        );
    }

    #[test]
    fn test_refresh_never_downgrades_processing_or_done() {
        let mut doc = StatusDocument::default();
        let mut record = FolderRecord::waiting(Utc::now());
        record.primary.status = ChannelStatus::Done;
        record.secondary.status = ChannelStatus::Processing;
        doc.folders.insert("F1".to_string(), record);

        reconcile_document(&mut doc, &ids(&["F1"]), &ids(&[]), Utc::now());

        let record = doc.get("F1").unwrap();
        assert_eq!(record.primary.status, ChannelStatus::Done);
        assert_eq!(record.secondary.status, ChannelStatus::Processing);
        assert!(!record.processed);
    }

    #[test]
    fn test_refresh_clears_stale_result_on_waiting_channel() {
        let mut doc = StatusDocument::default();
        let mut record = FolderRecord::waiting(Utc::now());
        record.secondary.result = Some("stale.zip".to_string());
        record.processed = true;
        doc.folders.insert("F1".to_string(), record);

        reconcile_document(&mut doc, &ids(&["F1"]), &ids(&[]), Utc::now());

        let record = doc.get("F1").unwrap();
        assert_eq!(record.secondary, Channel::waiting());
        assert!(!record.processed);
    }

    #[test]
    fn test_removed_folder_tombstoned_without_touching_channels() {
        let mut doc = StatusDocument::default();
        let mut record = FolderRecord::waiting(Utc::now());
        record.primary.status = ChannelStatus::Processing;
        doc.folders.insert("F1".to_string(), record);

        let report = reconcile_document(&mut doc, &ids(&[]), &ids(&[]), Utc::now());

        assert_eq!(report.tombstoned, 1);
        let record = doc.get("F1").unwrap();
        assert!(record.tombstoned);
        assert_eq!(record.primary.status, ChannelStatus::Processing);
    }

    #[test]
    fn test_tombstone_survives_reappearance() {
        let mut doc = StatusDocument::default();
        reconcile_document(&mut doc, &ids(&["F1"]), &ids(&[]), Utc::now());
        reconcile_document(&mut doc, &ids(&[]), &ids(&[]), Utc::now());
        let before = doc.get("F1").cloned().unwrap();

        let report = reconcile_document(&mut doc, &ids(&["F1"]), &ids(&["F1"]), Utc::now());

        assert_eq!(report.reappeared, vec!["F1".to_string()]);
        assert_eq!(doc.get("F1"), Some(&before));
    }

    #[test]
    fn test_second_pass_only_moves_last_checked() {
        let mut doc = StatusDocument::default();
        let t0 = Utc::now();
        reconcile_document(&mut doc, &ids(&["F1", "F2", "F3"]), &ids(&["F2"]), t0);
        let first = doc.clone();

        let t1 = t0 + chrono::Duration::seconds(30);
        reconcile_document(&mut doc, &ids(&["F1", "F2", "F3"]), &ids(&["F2"]), t1);

        for (identity, record) in &doc.folders {
            let mut expected = first.get(identity).cloned().unwrap();
            expected.last_checked = t1;
            assert_eq!(record, &expected);
        }
    }

    #[tokio::test]
    async fn test_run_pass_reads_filesystem() {
        let tmp = tempfile::tempdir().unwrap();
        let uploads = tmp.path().join("pi_uploads");
        let records = tmp.path().join("records");
        std::fs::create_dir_all(uploads.join("rec_001")).unwrap();
        std::fs::create_dir_all(uploads.join("rec_002")).unwrap();
        std::fs::write(uploads.join("stray.zip"), b"zip").unwrap();
        std::fs::create_dir_all(records.join("rec_002")).unwrap();

        let store = Arc::new(StatusStore::new(tmp.path().join("folderStatus.json")));
        let reconciler = FolderReconciler::new(store.clone(), &uploads, &records, Duration::from_secs(30));

        let report = reconciler.run_pass().await.unwrap();
        assert_eq!(report.created, 2);

        let doc = store.snapshot();
        assert_eq!(doc.folders.len(), 2);
        assert!(!doc.get("rec_001").unwrap().processed);
        assert!(doc.get("rec_002").unwrap().processed);
    }

    #[tokio::test]
    async fn test_missing_upload_root_aborts_pass() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("records")).unwrap();
        let store = Arc::new(StatusStore::new(tmp.path().join("folderStatus.json")));
        store.seed("rec_001").await.unwrap();

        let reconciler = FolderReconciler::new(
            store.clone(),
            tmp.path().join("missing"),
            tmp.path().join("records"),
            Duration::from_secs(30),
        );

        let err = reconciler.run_pass().await.unwrap_err();
        assert!(matches!(err, ReconcileError::Uploads { .. }));
        assert!(!store.snapshot().get("rec_001").unwrap().tombstoned);
    }
}
