use serde::{Deserialize, Serialize};

use super::{Revision, StoreError};

/// A persisted note.
///
/// `text` is the plaintext, or the encoded ciphertext blob when
/// `is_encrypted` is set. `password_hash` is non-empty iff `is_encrypted`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Note {
    pub sign: String,
    pub name: String,
    pub text: String,
    /// 0 means unlimited.
    pub max_visits: u32,
    pub current_visits: u32,
    pub is_encrypted: bool,
    pub password_hash: String,
}

impl Note {
    /// True once the visit quota is spent. Unlimited notes never are.
    pub fn is_exhausted(&self) -> bool {
        self.max_visits != 0 && self.current_visits >= self.max_visits
    }
}

/// Fields a read is allowed to change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NoteUpdate {
    pub current_visits: Option<u32>,
}

impl NoteUpdate {
    pub fn visits(current_visits: u32) -> Self {
        Self {
            current_visits: Some(current_visits),
        }
    }

    pub fn apply(&self, note: &mut Note) {
        if let Some(visits) = self.current_visits {
            note.current_visits = visits;
        }
    }
}

/// What a successful read hands back. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NoteContent {
    pub name: String,
    pub message: String,
}

/// On-disk document. Field names are the storage contract.
#[derive(Debug, Serialize, Deserialize)]
pub struct NoteDocument {
    #[serde(rename = "_rev")]
    pub rev: String,
    pub sign: String,
    pub name: String,
    pub text: String,
    pub max_visits: u32,
    pub current_visits: u32,
    pub is_encrypted: bool,
    #[serde(default)]
    pub password_hash: String,
}

impl NoteDocument {
    pub fn new(note: &Note, revision: &Revision) -> Self {
        Self {
            rev: revision.as_str().to_owned(),
            sign: note.sign.clone(),
            name: note.name.clone(),
            text: note.text.clone(),
            max_visits: note.max_visits,
            current_visits: note.current_visits,
            is_encrypted: note.is_encrypted,
            password_hash: note.password_hash.clone(),
        }
    }

    pub fn into_note(self) -> (Note, Revision) {
        let note = Note {
            sign: self.sign,
            name: self.name,
            text: self.text,
            max_visits: self.max_visits,
            current_visits: self.current_visits,
            is_encrypted: self.is_encrypted,
            password_hash: self.password_hash,
        };
        (note, Revision::from(self.rev))
    }

    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        serde_json::to_vec(self).map_err(|e| StoreError::Corrupt(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let doc: Self =
            serde_json::from_slice(bytes).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        if doc.is_encrypted == doc.password_hash.is_empty() {
            return Err(StoreError::Corrupt(format!(
                "is_encrypted={} disagrees with password_hash",
                doc.is_encrypted
            )));
        }
        Ok(doc)
    }
}
