use std::sync::Arc;

use argon2::password_hash::{self, PasswordHash, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use tokio::sync::Semaphore;

#[derive(Debug, Error)]
pub enum HashError {
    #[error("malformed password hash: {0}")]
    Malformed(String),
    #[error("password hashing failed: {0}")]
    Hashing(String),
    #[error("hash worker unavailable: {0}")]
    Worker(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HasherConfig {
    pub argon2_params: Params,
    /// Upper bound on hashes computed at once.
    pub workers: usize,
}

impl Default for HasherConfig {
    fn default() -> Self {
        Self {
            argon2_params: Params::default(),
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        }
    }
}

/// Argon2id hashing that gates access to encrypted notes.
///
/// The async entry points run on the blocking pool behind a semaphore, so a
/// burst of password checks can't starve request handling.
#[derive(Clone)]
pub struct PasswordHasher {
    params: Params,
    permits: Arc<Semaphore>,
}

impl PasswordHasher {
    pub fn new(config: HasherConfig) -> Self {
        Self {
            params: config.argon2_params,
            permits: Arc::new(Semaphore::new(config.workers.max(1))),
        }
    }

    fn argon2(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }

    /// PHC string embedding algorithm, version, cost parameters and salt.
    pub fn hash_blocking(&self, password: &str) -> Result<String, HashError> {
        let mut salt_bytes = [0u8; 16];
        OsRng.fill_bytes(&mut salt_bytes);
        let salt =
            SaltString::encode_b64(&salt_bytes).map_err(|e| HashError::Hashing(e.to_string()))?;

        password_hash::PasswordHasher::hash_password(&self.argon2(), password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| HashError::Hashing(e.to_string()))
    }

    /// `Ok(false)` on mismatch; `Err(Malformed)` only when `encoded` can't be used.
    pub fn verify_blocking(&self, password: &str, encoded: &str) -> Result<bool, HashError> {
        let hash = PasswordHash::new(encoded).map_err(|e| HashError::Malformed(e.to_string()))?;
        // Parameters come from the hash itself, not from `self.params`.
        match Argon2::default().verify_password(password.as_bytes(), &hash) {
            Ok(()) => Ok(true),
            Err(password_hash::Error::Password) => Ok(false),
            Err(e) => Err(HashError::Malformed(e.to_string())),
        }
    }

    pub async fn hash(&self, password: String) -> Result<String, HashError> {
        let this = self.clone();
        self.dispatch(move || this.hash_blocking(&password)).await
    }

    pub async fn verify(&self, password: String, encoded: String) -> Result<bool, HashError> {
        let this = self.clone();
        self.dispatch(move || this.verify_blocking(&password, &encoded)).await
    }

    async fn dispatch<T, F>(&self, job: F) -> Result<T, HashError>
    where
        F: FnOnce() -> Result<T, HashError> + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|e| HashError::Worker(e.to_string()))?;

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        })
        .await
        .map_err(|e| HashError::Worker(e.to_string()))?
    }
}

#[cfg(test)]
pub(crate) fn fast_config() -> HasherConfig {
    HasherConfig {
        argon2_params: Params::new(1024, 1, 1, None).unwrap(),
        workers: 2,
    }
}
