//! Status persistence
//!
//! The folder status document lives in one JSON file owned by one process.

pub mod lockfile;
pub mod status_store;

pub use lockfile::StoreLock;
pub use status_store::{SeedOutcome, StatusStore, StoreError};
