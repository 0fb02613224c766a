use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::ZeroizeOnDrop;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    /// Wrong key, wrong associated data, or tampered ciphertext.
    #[error("ciphertext failed authentication")]
    Authentication,
    #[error("malformed ciphertext encoding: {0}")]
    Encoding(String),
    #[error("encryption failed")]
    Encryption,
}

/// 32-byte note key derived from the note password.
#[derive(ZeroizeOnDrop)]
pub struct NoteKey([u8; 32]);

impl NoteKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// ChaCha20-Poly1305 sealing of note text.
///
/// Blobs are `nonce || ciphertext || tag`, stored as URL-safe base64. When
/// the server has a crypto secret it is bound in as associated data, so
/// ciphertexts only open on the deployment that sealed them.
#[derive(Clone, Default)]
pub struct CryptoBox {
    aad: Vec<u8>,
}

impl CryptoBox {
    pub fn new(server_secret: Option<&str>) -> Self {
        Self {
            aad: server_secret.map(|s| s.as_bytes().to_vec()).unwrap_or_default(),
        }
    }

    /// Plain SHA-256 of the password: no salt, no stretching. Access is gated
    /// separately by the argon2 hash in [`crate::hasher`].
    pub fn derive_key(password: &str) -> NoteKey {
        let digest = Sha256::digest(password.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        NoteKey(key)
    }

    pub fn seal(&self, plaintext: &[u8], key: &NoteKey) -> Result<Vec<u8>, CryptoError> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);

        let ciphertext = cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext,
                    aad: &self.aad,
                },
            )
            .map_err(|_| CryptoError::Encryption)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    pub fn open(&self, blob: &[u8], key: &NoteKey) -> Result<Vec<u8>, CryptoError> {
        if blob.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Encoding(format!(
                "blob is {} bytes, need at least {}",
                blob.len(),
                NONCE_LEN + TAG_LEN
            )));
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));

        cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: &self.aad,
                },
            )
            .map_err(|_| CryptoError::Authentication)
    }

    /// Seal `text` and encode the blob for storage.
    pub fn seal_text(&self, text: &str, key: &NoteKey) -> Result<String, CryptoError> {
        self.seal(text.as_bytes(), key).map(|blob| URL_SAFE.encode(blob))
    }

    /// Decode a stored blob and open it back into text.
    pub fn open_text(&self, encoded: &str, key: &NoteKey) -> Result<String, CryptoError> {
        let blob = URL_SAFE
            .decode(encoded)
            .map_err(|e| CryptoError::Encoding(e.to_string()))?;
        let plaintext = self.open(&blob, key)?;
        String::from_utf8(plaintext).map_err(|e| CryptoError::Encoding(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let boxed = CryptoBox::new(None);
        let key = CryptoBox::derive_key("hunter2");
        let sealed = boxed.seal_text("hello, tachyon!", &key).unwrap();
        assert_ne!(sealed, "hello, tachyon!");
        assert_eq!(boxed.open_text(&sealed, &key).unwrap(), "hello, tachyon!");
    }

    #[test]
    fn wrong_key_fails() {
        let boxed = CryptoBox::new(None);
        let sealed = boxed
            .seal_text("secret", &CryptoBox::derive_key("key-one"))
            .unwrap();
        assert_eq!(
            boxed.open_text(&sealed, &CryptoBox::derive_key("key-two")),
            Err(CryptoError::Authentication)
        );
    }

    #[test]
    fn server_secret_is_bound_into_ciphertext() {
        let key = CryptoBox::derive_key("pw");
        let sealed = CryptoBox::new(Some("server-a")).seal_text("x", &key).unwrap();
        assert_eq!(
            CryptoBox::new(Some("server-b")).open_text(&sealed, &key),
            Err(CryptoError::Authentication)
        );
        assert_eq!(
            CryptoBox::new(Some("server-a")).open_text(&sealed, &key).unwrap(),
            "x"
        );
    }

    #[test]
    fn tampered_blob_fails_authentication() {
        let boxed = CryptoBox::new(None);
        let key = CryptoBox::derive_key("pw");
        let mut blob = boxed.seal(b"payload", &key).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        assert_eq!(boxed.open(&blob, &key), Err(CryptoError::Authentication));
    }

    #[test]
    fn malformed_encoding_is_reported() {
        let boxed = CryptoBox::new(None);
        let key = CryptoBox::derive_key("pw");
        assert!(matches!(
            boxed.open_text("not base64 at all!", &key),
            Err(CryptoError::Encoding(_))
        ));
        assert!(matches!(
            boxed.open_text("AAAA", &key),
            Err(CryptoError::Encoding(_))
        ));
    }

    #[test]
    fn nonces_differ_between_seals() {
        let boxed = CryptoBox::new(None);
        let key = CryptoBox::derive_key("pw");
        let a = boxed.seal_text("same", &key).unwrap();
        let b = boxed.seal_text("same", &key).unwrap();
        assert_ne!(a, b);
    }
}
