use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use tracing::{debug, info};

use super::model::{Note, NoteDocument, NoteUpdate};
use super::{Deadline, NoteStore, Revision, StoreError};

macro_rules! unavailable_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for StoreError {
                fn from(e: $ty) -> Self {
                    StoreError::Unavailable(e.to_string())
                }
            }
        )*
    };
}

unavailable_from!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);

/// Thread-safe handle to the redb-backed note collection.
///
/// Opened once at startup and shared by every request.
#[derive(Clone)]
pub struct RedbNoteStore {
    db: Arc<Database>,
    collection: String,
}

impl RedbNoteStore {
    /// Open (or create) the database at `path` and ensure `collection` exists.
    pub fn open(path: &Path, collection: &str) -> Result<Self, StoreError> {
        let db = Database::create(path)?;
        let store = Self {
            db: Arc::new(db),
            collection: collection.to_owned(),
        };
        store.ensure_collection()?;
        Ok(store)
    }

    /// Idempotent: an existing collection is left as is.
    pub fn ensure_collection(&self) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write()?;
        write_txn.open_table(self.table())?;
        write_txn.commit()?;
        info!(collection = %self.collection, "note collection ready");
        Ok(())
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    fn table(&self) -> TableDefinition<'_, &'static str, &'static [u8]> {
        TableDefinition::new(&self.collection)
    }
}

impl NoteStore for RedbNoteStore {
    fn create(&self, note: &Note, deadline: Deadline) -> Result<Revision, StoreError> {
        deadline.check()?;
        let revision = Revision::next(None);
        let bytes = NoteDocument::new(note, &revision).encode()?;

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(self.table())?;
            if table.get(note.sign.as_str())?.is_some() {
                return Err(StoreError::DuplicateKey);
            }
            table.insert(note.sign.as_str(), bytes.as_slice())?;
        }
        // An uncommitted transaction is rolled back on drop.
        deadline.check()?;
        write_txn.commit()?;

        debug!(rev = %revision, "created note");
        Ok(revision)
    }

    fn get(&self, sign: &str, deadline: Deadline) -> Result<(Note, Revision), StoreError> {
        deadline.check()?;
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(self.table())?;

        let bytes = table
            .get(sign)?
            .map(|guard| guard.value().to_vec())
            .ok_or(StoreError::NotFound)?;

        Ok(NoteDocument::decode(&bytes)?.into_note())
    }

    fn compare_and_update(
        &self,
        sign: &str,
        revision: &Revision,
        update: &NoteUpdate,
        deadline: Deadline,
    ) -> Result<Revision, StoreError> {
        deadline.check()?;
        let write_txn = self.db.begin_write()?;
        let next = {
            let mut table = write_txn.open_table(self.table())?;

            // Copy out so the AccessGuard's borrow of `table` ends before insert.
            let bytes = table
                .get(sign)?
                .map(|guard| guard.value().to_vec())
                .ok_or(StoreError::NotFound)?;

            let (mut note, current) = NoteDocument::decode(&bytes)?.into_note();
            if &current != revision {
                return Err(StoreError::Conflict);
            }

            update.apply(&mut note);
            let next = Revision::next(Some(&current));
            let updated = NoteDocument::new(&note, &next).encode()?;
            table.insert(sign, updated.as_slice())?;
            next
        };
        deadline.check()?;
        write_txn.commit()?;

        debug!(rev = %next, "updated note");
        Ok(next)
    }

    fn compare_and_delete(
        &self,
        sign: &str,
        revision: &Revision,
        deadline: Deadline,
    ) -> Result<(), StoreError> {
        deadline.check()?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(self.table())?;

            let bytes = table
                .get(sign)?
                .map(|guard| guard.value().to_vec())
                .ok_or(StoreError::NotFound)?;

            let (_, current) = NoteDocument::decode(&bytes)?.into_note();
            if &current != revision {
                return Err(StoreError::Conflict);
            }
            table.remove(sign)?;
        }
        deadline.check()?;
        write_txn.commit()?;

        debug!(rev = %revision, "deleted note");
        Ok(())
    }

    fn count(&self, deadline: Deadline) -> Result<u64, StoreError> {
        deadline.check()?;
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(self.table())?;
        Ok(table.len()?)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use tempfile::tempdir;

    fn make_store() -> (RedbNoteStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = RedbNoteStore::open(&dir.path().join("test.db"), "notes").unwrap();
        (store, dir)
    }

    fn soon() -> Deadline {
        Deadline::after(Duration::from_secs(30))
    }

    fn note(sign: &str) -> Note {
        Note {
            sign: sign.into(),
            name: "name".into(),
            text: "text".into(),
            max_visits: 2,
            current_visits: 0,
            is_encrypted: false,
            password_hash: String::new(),
        }
    }

    #[test]
    fn create_then_get() {
        let (s, _dir) = make_store();
        let rev = s.create(&note("A"), soon()).unwrap();
        let (stored, stored_rev) = s.get("A", soon()).unwrap();
        assert_eq!(stored, note("A"));
        assert_eq!(stored_rev, rev);
    }

    #[test]
    fn duplicate_sign_is_rejected() {
        let (s, _dir) = make_store();
        s.create(&note("DUP"), soon()).unwrap();
        assert!(matches!(
            s.create(&note("DUP"), soon()),
            Err(StoreError::DuplicateKey)
        ));
    }

    #[test]
    fn get_missing_is_not_found() {
        let (s, _dir) = make_store();
        assert!(matches!(s.get("NOPE", soon()), Err(StoreError::NotFound)));
    }

    #[test]
    fn update_requires_current_revision() {
        let (s, _dir) = make_store();
        let rev1 = s.create(&note("U"), soon()).unwrap();
        let rev2 = s
            .compare_and_update("U", &rev1, &NoteUpdate::visits(1), soon())
            .unwrap();
        assert_ne!(rev1, rev2);

        // A writer still holding rev1 lost the race.
        assert!(matches!(
            s.compare_and_update("U", &rev1, &NoteUpdate::visits(1), soon()),
            Err(StoreError::Conflict)
        ));

        let (stored, rev) = s.get("U", soon()).unwrap();
        assert_eq!(stored.current_visits, 1);
        assert_eq!(rev, rev2);
    }

    #[test]
    fn update_missing_is_not_found() {
        let (s, _dir) = make_store();
        let rev = Revision::next(None);
        assert!(matches!(
            s.compare_and_update("GONE", &rev, &NoteUpdate::visits(1), soon()),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn delete_requires_current_revision() {
        let (s, _dir) = make_store();
        let rev1 = s.create(&note("D"), soon()).unwrap();
        let rev2 = s
            .compare_and_update("D", &rev1, &NoteUpdate::visits(1), soon())
            .unwrap();

        assert!(matches!(
            s.compare_and_delete("D", &rev1, soon()),
            Err(StoreError::Conflict)
        ));
        s.compare_and_delete("D", &rev2, soon()).unwrap();
        assert!(matches!(s.get("D", soon()), Err(StoreError::NotFound)));
        assert!(matches!(
            s.compare_and_delete("D", &rev2, soon()),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn count_tracks_live_notes() {
        let (s, _dir) = make_store();
        assert_eq!(s.count(soon()).unwrap(), 0);
        let rev = s.create(&note("C1"), soon()).unwrap();
        s.create(&note("C2"), soon()).unwrap();
        assert_eq!(s.count(soon()).unwrap(), 2);
        s.compare_and_delete("C1", &rev, soon()).unwrap();
        assert_eq!(s.count(soon()).unwrap(), 1);
    }

    #[test]
    fn expired_deadline_leaves_state_unchanged() {
        let (s, _dir) = make_store();
        let expired = Deadline::after(Duration::ZERO);
        assert!(matches!(
            s.create(&note("T"), expired),
            Err(StoreError::DeadlineExceeded)
        ));
        assert!(matches!(s.get("T", soon()), Err(StoreError::NotFound)));

        let rev = s.create(&note("T"), soon()).unwrap();
        assert!(matches!(
            s.compare_and_update("T", &rev, &NoteUpdate::visits(1), expired),
            Err(StoreError::DeadlineExceeded)
        ));
        let (stored, stored_rev) = s.get("T", soon()).unwrap();
        assert_eq!(stored.current_visits, 0);
        assert_eq!(stored_rev, rev);
    }

    #[test]
    fn reopening_keeps_existing_collection() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reopen.db");
        {
            let s = RedbNoteStore::open(&path, "notes").unwrap();
            s.create(&note("KEEP"), soon()).unwrap();
        }
        let s = RedbNoteStore::open(&path, "notes").unwrap();
        s.ensure_collection().unwrap();
        assert!(s.get("KEEP", soon()).is_ok());
    }

    #[test]
    fn collections_are_isolated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("multi.db");
        let a = RedbNoteStore::open(&path, "notes_a").unwrap();
        a.create(&note("X"), soon()).unwrap();
        drop(a);
        let b = RedbNoteStore::open(&path, "notes_b").unwrap();
        assert_eq!(b.collection(), "notes_b");
        assert!(matches!(b.get("X", soon()), Err(StoreError::NotFound)));
    }

    #[test]
    fn corrupt_document_is_reported() {
        let (s, _dir) = make_store();
        let write_txn = s.db.begin_write().unwrap();
        {
            let mut table = write_txn.open_table(s.table()).unwrap();
            table.insert("BAD", b"{not json".as_slice()).unwrap();
        }
        write_txn.commit().unwrap();
        assert!(matches!(s.get("BAD", soon()), Err(StoreError::Corrupt(_))));
    }
}
