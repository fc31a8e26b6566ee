use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};

use super::{AeadEngine, NONCE_SIZE};
use crate::error::{CaskError, Result};

pub const ALGORITHM: &str = "AES256-GCM";

/// AES-256-GCM authenticated encryption engine.
pub struct Aes256GcmEngine {
    cipher: Aes256Gcm,
}

impl Aes256GcmEngine {
    pub fn new(key: &[u8; 32]) -> Self {
        let cipher = Aes256Gcm::new_from_slice(key).expect("valid 32-byte key for AES-256-GCM");
        Self { cipher }
    }
}

impl AeadEngine for Aes256GcmEngine {
    fn seal(&self, nonce: &[u8; NONCE_SIZE], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        self.cipher
            .encrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|e| CaskError::Other(format!("AES-GCM encrypt: {e}")))
    }

    fn open(&self, nonce: &[u8; NONCE_SIZE], data: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        self.cipher
            .decrypt(Nonce::from_slice(nonce), Payload { msg: data, aad })
            .map_err(|_| CaskError::CorruptData("AES-GCM authentication failed".into()))
    }

    fn algorithm(&self) -> &'static str {
        ALGORITHM
    }
}
