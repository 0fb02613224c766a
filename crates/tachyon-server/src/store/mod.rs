pub mod db;
pub mod model;

use std::fmt;
use std::time::{Duration, Instant};

use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

pub use db::RedbNoteStore;
pub use model::{Note, NoteContent, NoteDocument, NoteUpdate};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("note not found")]
    NotFound,
    #[error("a note with this sign already exists")]
    DuplicateKey,
    #[error("revision does not match the stored note")]
    Conflict,
    #[error("store deadline exceeded")]
    DeadlineExceeded,
    #[error("stored document is corrupt: {0}")]
    Corrupt(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Opaque document version, required to update or delete a note.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Revision(String);

impl Revision {
    /// Revision following `prev`, or the first one when creating.
    pub fn next(prev: Option<&Revision>) -> Self {
        let generation = prev.and_then(Revision::generation).unwrap_or(0) + 1;
        let mut suffix = [0u8; 8];
        OsRng.fill_bytes(&mut suffix);
        Self(format!("{generation}-{}", hex::encode(suffix)))
    }

    pub fn generation(&self) -> Option<u64> {
        self.0.split_once('-').and_then(|(g, _)| g.parse().ok())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Revision {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Point in time after which a store call must not commit.
#[derive(Debug, Clone, Copy)]
pub struct Deadline(Instant);

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self(Instant::now() + timeout)
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.0
    }

    pub fn check(&self) -> Result<(), StoreError> {
        if self.is_expired() {
            Err(StoreError::DeadlineExceeded)
        } else {
            Ok(())
        }
    }
}

/// Document collection holding notes, with optimistic concurrency.
///
/// Calls are blocking. Each one either commits fully before `deadline` or
/// leaves the collection untouched.
pub trait NoteStore: Send + Sync {
    fn create(&self, note: &Note, deadline: Deadline) -> Result<Revision, StoreError>;

    fn get(&self, sign: &str, deadline: Deadline) -> Result<(Note, Revision), StoreError>;

    /// Apply `update` only if the stored revision is still `revision`.
    fn compare_and_update(
        &self,
        sign: &str,
        revision: &Revision,
        update: &NoteUpdate,
        deadline: Deadline,
    ) -> Result<Revision, StoreError>;

    /// Delete only if the stored revision is still `revision`.
    fn compare_and_delete(
        &self,
        sign: &str,
        revision: &Revision,
        deadline: Deadline,
    ) -> Result<(), StoreError>;

    /// Number of live notes.
    fn count(&self, deadline: Deadline) -> Result<u64, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revisions_advance_generation() {
        let first = Revision::next(None);
        assert_eq!(first.generation(), Some(1));
        let second = Revision::next(Some(&first));
        assert_eq!(second.generation(), Some(2));
        assert_ne!(first, second);
        assert_eq!(second.as_str().len(), "2-".len() + 16);
    }

    #[test]
    fn expired_deadline_is_reported() {
        let deadline = Deadline::after(Duration::ZERO);
        assert!(matches!(deadline.check(), Err(StoreError::DeadlineExceeded)));
        assert!(Deadline::after(Duration::from_secs(60)).check().is_ok());
    }
}
