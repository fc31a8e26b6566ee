pub mod aes_gcm;
pub mod chacha20_poly1305;
pub mod content_id;
pub mod key;

use crate::error::{CaskError, Result};

/// Size of AEAD nonces used throughout the repository.
pub const NONCE_SIZE: usize = 12;
/// Size of AEAD authentication tags.
pub const TAG_SIZE: usize = 16;

/// Authenticated encryption engine for repository payloads.
///
/// Callers supply the nonce: content payloads derive it from the content ID
/// (so identical plaintexts encrypt identically, which dedupe requires),
/// metadata envelopes use a random one.
pub trait AeadEngine: Send + Sync {
    /// Encrypt `plaintext`, returning `ciphertext + tag`.
    fn seal(&self, nonce: &[u8; NONCE_SIZE], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt data produced by `seal`. Any failure is `CorruptData`.
    fn open(&self, nonce: &[u8; NONCE_SIZE], data: &[u8], aad: &[u8]) -> Result<Vec<u8>>;

    /// Algorithm name as stored in the repository parameters.
    fn algorithm(&self) -> &'static str;
}

/// Construct the AEAD engine named by the repository's `encryption` parameter.
pub fn create_aead(algorithm: &str, key: &[u8; 32]) -> Result<Box<dyn AeadEngine>> {
    match algorithm {
        aes_gcm::ALGORITHM => Ok(Box::new(aes_gcm::Aes256GcmEngine::new(key))),
        chacha20_poly1305::ALGORITHM => Ok(Box::new(
            chacha20_poly1305::ChaCha20Poly1305Engine::new(key),
        )),
        other => Err(CaskError::Config(format!(
            "unsupported encryption algorithm: '{other}'"
        ))),
    }
}
