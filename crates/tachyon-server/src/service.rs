use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::crypto::CryptoBox;
use crate::hasher::{HashError, PasswordHasher};
use crate::sign::{self, RandomSignGenerator, SignGenerator};
use crate::store::{Deadline, Note, NoteContent, NoteStore, NoteUpdate, Revision, StoreError};

pub const MAX_NAME_CHARS: usize = 200;
pub const MAX_TEXT_BYTES: usize = 1_048_576;

/// A fresh sign is tried once more after a duplicate-key rejection.
const CREATE_ATTEMPTS: u32 = 2;

#[derive(Debug, Error)]
pub enum NoteError {
    #[error("note not found")]
    NotFound,
    #[error("wrong or missing password")]
    Unauthorized,
    #[error("{0}")]
    Validation(String),
    /// Decryption failed after the password verified: stored data is damaged.
    #[error("note failed integrity check: {0}")]
    IntegrityFailure(String),
    #[error("note kept changing under concurrent reads")]
    Conflict,
    #[error("could not allocate an unused sign")]
    DuplicateKey,
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("internal error: {0}")]
    Internal(String),
}

/// A create request as accepted from the HTTP layer.
#[derive(Debug, Clone, Default)]
pub struct NewNote {
    pub name: String,
    pub text: String,
    /// 0 means unlimited.
    pub max_visits: u32,
    pub is_encrypted: bool,
    pub password: Option<String>,
}

impl NewNote {
    fn validate(&self) -> Result<(), NoteError> {
        if self.name.chars().count() > MAX_NAME_CHARS {
            return Err(NoteError::Validation(format!(
                "name must be at most {MAX_NAME_CHARS} characters"
            )));
        }
        if self.text.len() > MAX_TEXT_BYTES {
            return Err(NoteError::Validation("text exceeds 1 MiB limit".into()));
        }
        if self.is_encrypted && self.password.as_deref().unwrap_or("").is_empty() {
            return Err(NoteError::Validation(
                "is_encrypted is set but encrypt_password is empty".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NoteStats {
    pub current_notes_count: u64,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Deadline applied to every individual store call.
    pub store_timeout: Duration,
    /// Extra compare-and-update attempts after a revision conflict.
    pub read_retries: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_secs(5),
            read_retries: 5,
        }
    }
}

/// Create/read lifecycle of self-destructing notes.
///
/// Holds no per-note state. Every decision about visits is made against the
/// store's revision tokens, so concurrent readers of one note never get
/// more than `max_visits` successes between them.
#[derive(Clone)]
pub struct NoteService {
    store: Arc<dyn NoteStore>,
    signs: Arc<dyn SignGenerator>,
    cipher: CryptoBox,
    hasher: PasswordHasher,
    config: ServiceConfig,
}

impl NoteService {
    pub fn new(
        store: Arc<dyn NoteStore>,
        cipher: CryptoBox,
        hasher: PasswordHasher,
        config: ServiceConfig,
    ) -> Self {
        Self {
            store,
            signs: Arc::new(RandomSignGenerator),
            cipher,
            hasher,
            config,
        }
    }

    pub fn with_sign_generator(mut self, signs: Arc<dyn SignGenerator>) -> Self {
        self.signs = signs;
        self
    }

    /// Store a new note and return its sign.
    pub async fn create_note(&self, request: NewNote) -> Result<String, NoteError> {
        request.validate()?;
        let NewNote {
            name,
            text,
            max_visits,
            is_encrypted,
            password,
        } = request;

        let (text, password_hash) = match password.filter(|_| is_encrypted) {
            Some(password) => {
                let key = CryptoBox::derive_key(&password);
                let sealed = self
                    .cipher
                    .seal_text(&text, &key)
                    .map_err(|e| NoteError::Internal(e.to_string()))?;
                let hash = self.hasher.hash(password).await.map_err(hash_failure)?;
                (sealed, hash)
            }
            None => (text, String::new()),
        };

        let mut note = Note {
            sign: String::new(),
            name,
            text,
            max_visits,
            current_visits: 0,
            is_encrypted,
            password_hash,
        };

        for attempt in 1..=CREATE_ATTEMPTS {
            note.sign = self.signs.generate();
            let candidate = note.clone();
            match self
                .with_store("create", move |store, deadline| {
                    store.create(&candidate, deadline)
                })
                .await
            {
                Ok(_) => {
                    info!(sign = redact(&note.sign), max_visits, is_encrypted, "note created");
                    return Ok(note.sign);
                }
                Err(StoreError::DuplicateKey) => {
                    warn!(attempt, "sign collision, generating a new one");
                }
                Err(e) => return Err(store_failure(e)),
            }
        }
        Err(NoteError::DuplicateKey)
    }

    /// Count one visit and return the note, destroying it on its last visit.
    ///
    /// A failed password check returns before the store is touched, so it
    /// never costs a visit.
    pub async fn read_note(
        &self,
        sign: &str,
        password: Option<&str>,
    ) -> Result<NoteContent, NoteError> {
        if !sign::is_well_formed(sign) {
            return Err(NoteError::Validation(format!(
                "sign must be {} URL-safe characters",
                sign::SIGN_LENGTH
            )));
        }

        let (note, revision) = self.fetch(sign).await?;
        if note.is_exhausted() {
            // Left behind by an earlier failed cleanup.
            self.destroy(sign, revision).await;
            return Err(NoteError::NotFound);
        }

        let message = if note.is_encrypted {
            let password = password.unwrap_or_default().to_owned();
            match self
                .hasher
                .verify(password.clone(), note.password_hash.clone())
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    debug!(sign = redact(sign), "password rejected");
                    return Err(NoteError::Unauthorized);
                }
                Err(HashError::Malformed(e)) => {
                    warn!(sign = redact(sign), error = %e, "stored password hash is malformed");
                    return Err(NoteError::Unauthorized);
                }
                Err(e) => return Err(hash_failure(e)),
            }

            let key = CryptoBox::derive_key(&password);
            self.cipher.open_text(&note.text, &key).map_err(|e| {
                error!(sign = redact(sign), error = %e, "decryption failed after password verified");
                NoteError::IntegrityFailure(e.to_string())
            })?
        } else {
            note.text.clone()
        };

        let (note, revision) = self.record_visit(sign, note, revision).await?;
        if note.is_exhausted() {
            self.destroy(sign, revision).await;
        }

        Ok(NoteContent {
            name: note.name,
            message,
        })
    }

    /// Bump `current_visits` with compare-and-swap, retrying on conflicts.
    async fn record_visit(
        &self,
        sign: &str,
        mut note: Note,
        mut revision: Revision,
    ) -> Result<(Note, Revision), NoteError> {
        let mut conflicts = 0;
        loop {
            let visits = note.current_visits.saturating_add(1);
            let (key, expected) = (sign.to_owned(), revision.clone());
            let outcome = self
                .with_store("compare_and_update", move |store, deadline| {
                    store.compare_and_update(&key, &expected, &NoteUpdate::visits(visits), deadline)
                })
                .await;

            match outcome {
                Ok(next) => {
                    note.current_visits = visits;
                    debug!(sign = redact(sign), visits, "visit recorded");
                    return Ok((note, next));
                }
                Err(StoreError::Conflict) => {
                    conflicts += 1;
                    if conflicts > self.config.read_retries {
                        warn!(sign = redact(sign), conflicts, "gave up after repeated conflicts");
                        return Err(NoteError::Conflict);
                    }
                    debug!(sign = redact(sign), conflicts, "revision conflict, re-reading");
                    let (fresh, fresh_revision) = self.fetch(sign).await?;
                    if fresh.is_exhausted() {
                        // The winning reader took the last visit.
                        return Err(NoteError::NotFound);
                    }
                    note = fresh;
                    revision = fresh_revision;
                }
                Err(StoreError::NotFound) => return Err(NoteError::NotFound),
                Err(e) => return Err(store_failure(e)),
            }
        }
    }

    /// Live note count for the monitoring endpoint.
    pub async fn stats(&self) -> Result<NoteStats, NoteError> {
        let current_notes_count = self
            .with_store("count", |store, deadline| store.count(deadline))
            .await
            .map_err(store_failure)?;
        Ok(NoteStats { current_notes_count })
    }

    async fn fetch(&self, sign: &str) -> Result<(Note, Revision), NoteError> {
        let key = sign.to_owned();
        match self
            .with_store("get", move |store, deadline| store.get(&key, deadline))
            .await
        {
            Ok(found) => Ok(found),
            Err(StoreError::NotFound) => Err(NoteError::NotFound),
            Err(e) => Err(store_failure(e)),
        }
    }

    /// Never fails the caller; a note that survives is caught by the
    /// exhausted check on its next read.
    async fn destroy(&self, sign: &str, revision: Revision) {
        let key = sign.to_owned();
        match self
            .with_store("compare_and_delete", move |store, deadline| {
                store.compare_and_delete(&key, &revision, deadline)
            })
            .await
        {
            Ok(()) => info!(sign = redact(sign), "note destroyed after final visit"),
            Err(StoreError::NotFound) => info!(sign = redact(sign), "note already destroyed"),
            Err(e) => warn!(sign = redact(sign), error = %e, "failed to destroy exhausted note"),
        }
    }

    /// Run a blocking store call off the async runtime.
    ///
    /// The store's `Deadline` is the only cancellation point: a call that
    /// overruns the timeout may already be committing, so its real outcome
    /// is always awaited and reported.
    async fn with_store<T, F>(&self, op: &'static str, call: F) -> Result<T, StoreError>
    where
        F: FnOnce(&dyn NoteStore, Deadline) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let deadline = Deadline::after(self.config.store_timeout);
        let mut task = tokio::task::spawn_blocking(move || call(store.as_ref(), deadline));

        let joined = match tokio::time::timeout(self.config.store_timeout, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                warn!(op, timeout = ?self.config.store_timeout, "store call overran its deadline");
                task.await
            }
        };
        joined.map_err(|e| StoreError::Unavailable(format!("{op} task failed: {e}")))?
    }
}

fn store_failure(e: StoreError) -> NoteError {
    match e {
        StoreError::NotFound => NoteError::NotFound,
        StoreError::Conflict => NoteError::Conflict,
        StoreError::DuplicateKey => NoteError::DuplicateKey,
        StoreError::Corrupt(msg) => {
            error!(error = %msg, "corrupt note document");
            NoteError::IntegrityFailure(msg)
        }
        StoreError::DeadlineExceeded | StoreError::Unavailable(_) => {
            NoteError::ServiceUnavailable(e.to_string())
        }
    }
}

fn hash_failure(e: HashError) -> NoteError {
    match e {
        HashError::Worker(msg) => NoteError::ServiceUnavailable(msg),
        other => NoteError::Internal(other.to_string()),
    }
}

/// Signs are bearer capabilities; logs only carry a prefix.
fn redact(sign: &str) -> &str {
    sign.get(..6).unwrap_or(sign)
}
