use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;

/// Random bytes behind each sign.
pub const SIGN_BYTES: usize = 32;

/// Length of an encoded sign (unpadded base64 of `SIGN_BYTES`).
pub const SIGN_LENGTH: usize = 43;

/// Source of note identifiers.
///
/// Uniqueness is statistical only. The store rejects a duplicate sign on
/// create and the service retries with a fresh one.
pub trait SignGenerator: Send + Sync {
    fn generate(&self) -> String;
}

/// 256-bit signs from the OS RNG, URL-safe base64 without padding.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomSignGenerator;

impl SignGenerator for RandomSignGenerator {
    fn generate(&self) -> String {
        loop {
            let mut bytes = [0u8; SIGN_BYTES];
            OsRng.fill_bytes(&mut bytes);
            let sign = URL_SAFE_NO_PAD.encode(bytes);
            // Leading underscores are reserved ids in document stores.
            if !sign.starts_with('_') {
                return sign;
            }
        }
    }
}

/// Cheap shape check run before any store lookup.
pub fn is_well_formed(sign: &str) -> bool {
    sign.len() == SIGN_LENGTH
        && sign
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}
