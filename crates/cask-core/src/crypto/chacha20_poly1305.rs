use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};

use super::{AeadEngine, NONCE_SIZE};
use crate::error::{CaskError, Result};

pub const ALGORITHM: &str = "CHACHA20-POLY1305";

/// ChaCha20-Poly1305 authenticated encryption engine.
pub struct ChaCha20Poly1305Engine {
    cipher: ChaCha20Poly1305,
}

impl ChaCha20Poly1305Engine {
    pub fn new(key: &[u8; 32]) -> Self {
        let cipher =
            ChaCha20Poly1305::new_from_slice(key).expect("valid 32-byte key for ChaCha20-Poly1305");
        Self { cipher }
    }
}

impl AeadEngine for ChaCha20Poly1305Engine {
    fn seal(&self, nonce: &[u8; NONCE_SIZE], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        self.cipher
            .encrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|e| CaskError::Other(format!("ChaCha20-Poly1305 encrypt: {e}")))
    }

    fn open(&self, nonce: &[u8; NONCE_SIZE], data: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        self.cipher
            .decrypt(Nonce::from_slice(nonce), Payload { msg: data, aad })
            .map_err(|_| CaskError::CorruptData("ChaCha20-Poly1305 authentication failed".into()))
    }

    fn algorithm(&self) -> &'static str {
        ALGORITHM
    }
}
