//! Folder status data model
//!
//! A single [`StatusDocument`] maps bundle identity to a [`FolderRecord`].
//! The serde layout is the persisted `folderStatus.json` shape: the primary
//! channel is stored as `back`, the secondary channel as `side`, and the
//! tombstone flag as `deleted`.
//!
//! Decoding heals records field by field: a null or malformed channel is read
//! as `waiting`, a bad `lastChecked` as now, and a record that cannot be read
//! at all is dropped without taking the rest of the document with it.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;

// ============================================================================
// Channels
// ============================================================================

/// Lifecycle status of one processing channel.
///
/// Transitions are `Waiting -> Processing -> Done` or `Processing -> Waiting`
/// on failure. `Done` only leaves through an external reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStatus {
    #[default]
    Waiting,
    Processing,
    Done,
}

impl std::fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelStatus::Waiting => write!(f, "waiting"),
            ChannelStatus::Processing => write!(f, "processing"),
            ChannelStatus::Done => write!(f, "done"),
        }
    }
}

/// Which of the two channels of a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Front/back footage (`back` on disk)
    Primary,
    /// Side footage (`side` on disk), the one sent for inference
    Secondary,
}

/// One channel of a bundle: its status and, once done, the produced artifact.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Channel {
    #[serde(default, deserialize_with = "lenient")]
    pub status: ChannelStatus,
    /// Artifact location. Only meaningful while `status == Done`.
    #[serde(default, deserialize_with = "lenient")]
    pub result: Option<String>,
}

impl Channel {
    pub const fn waiting() -> Self {
        Self {
            status: ChannelStatus::Waiting,
            result: None,
        }
    }

    /// Done without a locally produced artifact (finalized downstream).
    pub const fn archived() -> Self {
        Self {
            status: ChannelStatus::Done,
            result: None,
        }
    }

    pub fn is(&self, status: ChannelStatus) -> bool {
        self.status == status
    }
}

// ============================================================================
// Folder Record
// ============================================================================

/// Tracked state of one uploaded bundle. The identity is the key it is
/// stored under in [`StatusDocument::folders`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderRecord {
    /// True iff both channels are done. Recomputed, never set on its own.
    #[serde(default, deserialize_with = "lenient")]
    pub processed: bool,

    /// Missing, null or malformed channels deserialize as `waiting`.
    #[serde(default, rename = "back", deserialize_with = "lenient")]
    pub primary: Channel,

    #[serde(default, rename = "side", deserialize_with = "lenient")]
    pub secondary: Channel,

    #[serde(default = "Utc::now", deserialize_with = "lenient_timestamp")]
    pub last_checked: DateTime<Utc>,

    /// Set once the backing folder disappears; the record is kept for history.
    #[serde(
        default,
        rename = "deleted",
        skip_serializing_if = "is_false",
        deserialize_with = "lenient"
    )]
    pub tombstoned: bool,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
const fn is_false(value: &bool) -> bool {
    !*value
}

/// `T` if the value decodes as one, otherwise `T::default()`.
fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or_default())
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or_else(|_| Utc::now()))
}

impl FolderRecord {
    /// Fresh record with both channels waiting.
    pub const fn waiting(now: DateTime<Utc>) -> Self {
        Self {
            processed: false,
            primary: Channel::waiting(),
            secondary: Channel::waiting(),
            last_checked: now,
            tombstoned: false,
        }
    }

    /// Record for a bundle that was already finalized when first seen.
    pub const fn archived(now: DateTime<Utc>) -> Self {
        Self {
            processed: true,
            primary: Channel::archived(),
            secondary: Channel::archived(),
            last_checked: now,
            tombstoned: false,
        }
    }

    pub fn channel_mut(&mut self, kind: ChannelKind) -> &mut Channel {
        match kind {
            ChannelKind::Primary => &mut self.primary,
            ChannelKind::Secondary => &mut self.secondary,
        }
    }

    pub fn both_done(&self) -> bool {
        self.primary.is(ChannelStatus::Done) && self.secondary.is(ChannelStatus::Done)
    }

    /// Re-derive `processed` from the channel statuses.
    pub fn refresh_processed(&mut self) {
        self.processed = self.both_done();
    }

    /// Whether any channel has an inference call outstanding.
    pub fn has_in_flight(&self) -> bool {
        self.primary.is(ChannelStatus::Processing) || self.secondary.is(ChannelStatus::Processing)
    }

    /// Eligible for dispatch: live, unfinished, secondary channel waiting.
    pub fn is_dispatchable(&self) -> bool {
        !self.tombstoned && !self.processed && self.secondary.is(ChannelStatus::Waiting)
    }
}

// ============================================================================
// Status Document
// ============================================================================

/// Root of the persisted status file.
///
/// Folders keep the order they were first recorded in, which is also the
/// order the scheduler dispatches them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusDocument {
    #[serde(default, deserialize_with = "deserialize_folders")]
    pub folders: IndexMap<String, FolderRecord>,
}

/// Decode records one at a time so a single unreadable entry is dropped
/// instead of failing the whole document.
fn deserialize_folders<'de, D>(deserializer: D) -> Result<IndexMap<String, FolderRecord>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<IndexMap<String, serde_json::Value>>::deserialize(deserializer)?
        .unwrap_or_default();

    let mut folders = IndexMap::with_capacity(raw.len());
    for (identity, value) in raw {
        match serde_json::from_value::<FolderRecord>(value) {
            Ok(record) => {
                folders.insert(identity, record);
            }
            Err(e) => warn!(identity = %identity, error = %e, "Dropping unreadable folder record"),
        }
    }
    Ok(folders)
}

impl StatusDocument {
    pub fn get(&self, identity: &str) -> Option<&FolderRecord> {
        self.folders.get(identity)
    }

    pub fn get_mut(&mut self, identity: &str) -> Option<&mut FolderRecord> {
        self.folders.get_mut(identity)
    }

    /// Records that are not tombstoned.
    pub fn live(&self) -> impl Iterator<Item = (&String, &FolderRecord)> {
        self.folders.iter().filter(|(_, record)| !record.tombstoned)
    }

    /// Processed / unprocessed identities, tombstoned records excluded.
    pub fn summary(&self) -> FolderSummary {
        let mut summary = FolderSummary::default();
        for (identity, record) in self.live() {
            if record.processed {
                summary.processed.push(identity.clone());
            } else {
                summary.unprocessed.push(identity.clone());
            }
        }
        summary
    }
}

/// Read-only progress view handed to the presentation layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderSummary {
    pub processed: Vec<String>,
    pub unprocessed: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERSISTED: &str = r#"{
      "folders": {
        "rec_001": {
          "processed": false,
          "back": { "status": "done", "result": null },
          "side": { "status": "processing", "result": null },
          "lastChecked": "2025-03-01T10:15:00.000Z"
        },
        "rec_002": {
          "processed": true,
          "back": { "status": "done", "result": null },
          "side": { "status": "done", "result": "pi_uploads/rec_002/outputs/side_output.zip" },
          "lastChecked": "2025-03-01T10:15:00.000Z",
          "deleted": true
        }
      }
    }"#;

    #[test]
    fn test_parses_persisted_layout() {
        let doc: StatusDocument = serde_json::from_str(PERSISTED).unwrap();
        assert_eq!(doc.folders.len(), 2);

        let first = doc.get("rec_001").unwrap();
        assert_eq!(first.primary.status, ChannelStatus::Done);
        assert_eq!(first.secondary.status, ChannelStatus::Processing);
        assert!(!first.tombstoned);

        let second = doc.get("rec_002").unwrap();
        assert!(second.tombstoned);
        assert_eq!(
            second.secondary.result.as_deref(),
            Some("pi_uploads/rec_002/outputs/side_output.zip")
        );
    }

    #[test]
    fn test_missing_channel_defaults_to_waiting() {
        let doc: StatusDocument = serde_json::from_str(
            r#"{ "folders": { "rec_003": { "processed": false, "back": { "status": "done" } } } }"#,
        )
        .unwrap();

        let record = doc.get("rec_003").unwrap();
        assert_eq!(record.primary.status, ChannelStatus::Done);
        assert_eq!(record.secondary, Channel::waiting());
    }

    #[test]
    fn test_malformed_fields_heal_per_record() {
        let doc: StatusDocument = serde_json::from_str(
            r#"{ "folders": {
                "rec_done": {
                    "processed": true,
                    "back": { "status": "done", "result": null },
                    "side": { "status": "done", "result": "out.zip" },
                    "lastChecked": "2025-03-01T10:15:00.000Z"
                },
                "rec_null_side": {
                    "processed": false,
                    "back": { "status": "done" },
                    "side": null,
                    "lastChecked": "yesterday"
                },
                "rec_bad_status": {
                    "back": { "status": "finished", "result": 7 },
                    "side": "done",
                    "deleted": true
                },
                "rec_garbage": 42
            } }"#,
        )
        .unwrap();

        assert_eq!(doc.folders.len(), 3);
        assert!(doc.get("rec_garbage").is_none());

        let done = doc.get("rec_done").unwrap();
        assert!(done.both_done());
        assert_eq!(done.secondary.result.as_deref(), Some("out.zip"));

        let healed = doc.get("rec_null_side").unwrap();
        assert_eq!(healed.primary.status, ChannelStatus::Done);
        assert_eq!(healed.secondary, Channel::waiting());

        let bad = doc.get("rec_bad_status").unwrap();
        assert_eq!(bad.primary, Channel::waiting());
        assert_eq!(bad.secondary, Channel::waiting());
        assert!(bad.tombstoned);
    }

    #[test]
    fn test_folders_keep_file_order() {
        let doc: StatusDocument = serde_json::from_str(
            r#"{ "folders": { "zeta": {}, "alpha": {}, "mid": {} } }"#,
        )
        .unwrap();

        let order: Vec<&str> = doc.folders.keys().map(String::as_str).collect();
        assert_eq!(order, ["zeta", "alpha", "mid"]);

        let json = serde_json::to_string(&doc).unwrap();
        let zeta = json.find("\"zeta\"").unwrap();
        let alpha = json.find("\"alpha\"").unwrap();
        assert!(zeta < alpha);
    }

    #[test]
    fn test_tombstone_serialized_as_deleted_only_when_set() {
        let now = Utc::now();
        let mut record = FolderRecord::waiting(now);

        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("deleted").is_none());
        assert_eq!(json["back"]["status"], "waiting");
        assert!(json.get("lastChecked").is_some());

        record.tombstoned = true;
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["deleted"], true);
    }

    #[test]
    fn test_processed_follows_channels() {
        let mut record = FolderRecord::waiting(Utc::now());
        record.primary = Channel::archived();
        record.refresh_processed();
        assert!(!record.processed);

        record.secondary.status = ChannelStatus::Done;
        record.refresh_processed();
        assert!(record.processed);
        assert!(!record.is_dispatchable());
    }

    #[test]
    fn test_summary_excludes_tombstoned() {
        let doc: StatusDocument = serde_json::from_str(PERSISTED).unwrap();
        let summary = doc.summary();
        assert_eq!(summary.unprocessed, vec!["rec_001".to_string()]);
        assert!(summary.processed.is_empty());
    }
}
