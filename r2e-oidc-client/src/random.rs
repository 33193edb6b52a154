use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::rngs::OsRng;
use rand::RngCore;

/// Secure random source for `state` and `nonce` values.
pub trait SecureRandom: Send + Sync {
    /// A fresh URL-safe random token.
    fn token(&self) -> String;
}

/// OS-backed random source producing 256-bit base64url tokens.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsRandom;

impl SecureRandom for OsRandom {
    fn token(&self) -> String {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    }
}
