use std::fmt;

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{CaskError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Truncated length of the HMAC-SHA256 content hash, in bytes.
pub const CONTENT_HASH_LEN: usize = 16;
/// Serialized size of a content ID: prefix byte + truncated hash.
pub const CONTENT_ID_LEN: usize = 1 + CONTENT_HASH_LEN;

/// Deterministic public identifier of a content.
///
/// The hash is `HMAC-SHA256(secret, plaintext)` truncated to 128 bits; the
/// HMAC key prevents precomputing collisions without the repository secret.
/// The optional single-character prefix is assigned by higher layers to
/// bucket contents, and distinguishes IDs: the same plaintext written under
/// two prefixes yields two distinct contents.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentId {
    prefix: u8,
    hash: [u8; CONTENT_HASH_LEN],
}

impl ContentId {
    /// Compute the ID for `plaintext` under `prefix`.
    pub fn compute(secret: &[u8], prefix: Option<char>, plaintext: &[u8]) -> Result<Self> {
        let prefix = validate_prefix(prefix)?;
        let mut mac =
            HmacSha256::new_from_slice(secret).map_err(|e| CaskError::Config(format!("HMAC key: {e}")))?;
        mac.update(plaintext);
        let digest = mac.finalize().into_bytes();

        let mut hash = [0u8; CONTENT_HASH_LEN];
        hash.copy_from_slice(&digest[..CONTENT_HASH_LEN]);
        Ok(Self { prefix, hash })
    }

    /// The bucketing prefix, if any.
    pub fn prefix(&self) -> Option<char> {
        if self.prefix == 0 {
            None
        } else {
            Some(self.prefix as char)
        }
    }

    pub fn hash(&self) -> &[u8; CONTENT_HASH_LEN] {
        &self.hash
    }

    /// First 12 bytes of the hash, used as the deterministic AEAD nonce.
    pub fn nonce(&self) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&self.hash[..12]);
        nonce
    }

    /// Fixed-width serialized form: `[prefix-or-0][hash]`.
    pub fn to_bytes(self) -> [u8; CONTENT_ID_LEN] {
        let mut out = [0u8; CONTENT_ID_LEN];
        out[0] = self.prefix;
        out[1..].copy_from_slice(&self.hash);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != CONTENT_ID_LEN {
            return Err(CaskError::InvalidFormat(format!(
                "content id must be {CONTENT_ID_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let prefix = match bytes[0] {
            0 => None,
            b => Some(b as char),
        };
        let prefix = validate_prefix(prefix)?;
        let mut hash = [0u8; CONTENT_HASH_LEN];
        hash.copy_from_slice(&bytes[1..]);
        Ok(Self { prefix, hash })
    }
}

fn validate_prefix(prefix: Option<char>) -> Result<u8> {
    match prefix {
        None => Ok(0),
        Some(c) if c.is_ascii_lowercase() => Ok(c as u8),
        Some(c) => Err(CaskError::InvalidFormat(format!(
            "content id prefix must be a lowercase ASCII letter, got '{c}'"
        ))),
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(p) = self.prefix() {
            write!(f, "{p}")?;
        }
        write!(f, "{}", hex::encode(self.hash))
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentId({self})")
    }
}
