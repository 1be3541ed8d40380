//! Status Store: the persisted folder status document
//!
//! Owns `folderStatus.json`. Loading never fails: a missing file is an empty
//! document, an unparsable one is quarantined beside the status file and also
//! treated as empty. Saving writes a temp file and renames it over the
//! target, so a concurrent reader sees either the old or the new document.
//!
//! Both background actors mutate the document through [`StatusStore::update`],
//! which reloads from disk, applies the change and saves while holding an
//! in-process mutex. Every tick still starts from what is on disk.

use std::ffi::OsString;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use indexmap::map::Entry;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::types::{FolderRecord, StatusDocument};

/// Status store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("status file {} is owned by another running instance (PID {pid})", path.display())]
    Locked { path: PathBuf, pid: u32 },
    #[error("invalid folder identity {0:?}")]
    InvalidIdentity(String),
    #[error("folder {0} has a channel in flight")]
    InFlight(String),
    #[error("folder {0} was removed and its identity cannot be reused")]
    Retired(String),
}

impl StoreError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Result of seeding a record at upload time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedOutcome {
    /// New record created with both channels waiting
    Created,
    /// Existing live record reset to waiting (bundle re-uploaded)
    Reset,
}

/// File-backed store for the [`StatusDocument`].
#[derive(Debug)]
pub struct StatusStore {
    path: PathBuf,
    /// Serializes read-modify-write cycles within this process
    write_lock: Mutex<()>,
}

impl StatusStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document from disk.
    ///
    /// Returns an empty document if the file is missing or cannot be parsed.
    pub fn load(&self) -> StatusDocument {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No status file yet, starting empty");
                return StatusDocument::default();
            }
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "Could not read status file — using empty document");
                return StatusDocument::default();
            }
        };

        match serde_json::from_slice::<StatusDocument>(&data) {
            Ok(doc) => doc,
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "Corrupted status file — using empty document");
                self.quarantine(&data);
                StatusDocument::default()
            }
        }
    }

    /// Keep a copy of an unparsable document before it gets overwritten.
    fn quarantine(&self, data: &[u8]) {
        let corrupt_path = sibling_path(&self.path, ".corrupt");
        match fs::write(&corrupt_path, data) {
            Ok(()) => warn!(path = %corrupt_path.display(), "Corrupted status file preserved"),
            Err(e) => warn!(path = %corrupt_path.display(), error = %e, "Could not preserve corrupted status file"),
        }
    }

    /// Persist the document atomically (write temp file, then rename).
    pub fn save(&self, doc: &StatusDocument) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(doc)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }

        let tmp_path = sibling_path(&self.path, ".tmp");
        let mut file = fs::File::create(&tmp_path).map_err(|e| StoreError::io(&tmp_path, e))?;
        file.write_all(&json)
            .and_then(|()| file.sync_all())
            .map_err(|e| StoreError::io(&tmp_path, e))?;
        drop(file);

        fs::rename(&tmp_path, &self.path).map_err(|e| StoreError::io(&self.path, e))?;

        debug!(
            path = %self.path.display(),
            folders = doc.folders.len(),
            size_bytes = json.len(),
            "Status document saved"
        );
        Ok(())
    }

    /// Reload, mutate and save as one step.
    ///
    /// The document is only written back if `apply` changed it.
    pub async fn update<T, F>(&self, apply: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut StatusDocument) -> T,
    {
        let _guard = self.write_lock.lock().await;

        let before = self.load();
        let mut doc = before.clone();
        let value = apply(&mut doc);

        if doc != before {
            self.save(&doc)?;
        }
        Ok(value)
    }

    /// Current document, read fresh from disk.
    pub fn snapshot(&self) -> StatusDocument {
        self.load()
    }

    /// Seed a record for a freshly extracted bundle.
    ///
    /// A tombstoned identity is never brought back, and a record with a
    /// channel in flight is left alone.
    pub async fn seed(&self, identity: &str) -> Result<SeedOutcome, StoreError> {
        if !is_valid_identity(identity) {
            return Err(StoreError::InvalidIdentity(identity.to_string()));
        }

        let outcome = self
            .update(|doc| match doc.folders.entry(identity.to_string()) {
                Entry::Vacant(slot) => {
                    slot.insert(FolderRecord::waiting(Utc::now()));
                    Ok(SeedOutcome::Created)
                }
                Entry::Occupied(slot) if slot.get().tombstoned => {
                    Err(StoreError::Retired(identity.to_string()))
                }
                Entry::Occupied(slot) if slot.get().has_in_flight() => {
                    Err(StoreError::InFlight(identity.to_string()))
                }
                Entry::Occupied(mut slot) => {
                    slot.insert(FolderRecord::waiting(Utc::now()));
                    Ok(SeedOutcome::Reset)
                }
            })
            .await??;

        info!(identity = identity, outcome = ?outcome, "Folder seeded");
        Ok(outcome)
    }
}

/// A bundle identity is a single directory name under the upload root.
pub fn is_valid_identity(identity: &str) -> bool {
    !identity.is_empty()
        && identity != "."
        && identity != ".."
        && !identity.contains(['/', '\\', '\0'])
}

/// `path` with `suffix` appended to its file name.
fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}
