use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::Argon2;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{CaskError, Result};

/// The repository master key material, never stored in plaintext.
/// Zeroized on drop so key bytes do not linger in memory.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    /// Key for the content/metadata AEAD engine.
    pub encryption_key: [u8; 32],
    /// Secret for HMAC-based content IDs.
    pub hmac_secret: [u8; 32],
}

impl MasterKey {
    /// Generate fresh key material from OS entropy.
    pub fn generate() -> Self {
        let mut encryption_key = [0u8; 32];
        let mut hmac_secret = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut encryption_key);
        rand::rngs::OsRng.fill_bytes(&mut hmac_secret);
        Self {
            encryption_key,
            hmac_secret,
        }
    }
}

/// KDF parameters stored alongside the wrapped payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KdfParams {
    pub algorithm: String,
    pub time_cost: u32,
    pub memory_cost: u32,
    pub parallelism: u32,
    #[serde(with = "hex_bytes")]
    pub salt: Vec<u8>,
}

/// A passphrase-wrapped secret as stored inside `cask.repository`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrappedSecret {
    pub kdf: KdfParams,
    #[serde(with = "hex_bytes")]
    pub nonce: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub ciphertext: Vec<u8>,
}

// KDF parameter bounds to reject maliciously crafted config blobs.
const MAX_TIME_COST: u32 = 10;
const MAX_PARALLELISM: u32 = 16;
const MAX_MEMORY_KIB: u32 = 524_288; // 512 MiB
const MIN_SALT_LEN: usize = 16;
const MAX_SALT_LEN: usize = 64;

fn validate_kdf_params(kdf: &KdfParams) -> Result<()> {
    if kdf.algorithm != "argon2id"
        || kdf.time_cost == 0
        || kdf.time_cost > MAX_TIME_COST
        || kdf.parallelism == 0
        || kdf.parallelism > MAX_PARALLELISM
        || kdf.memory_cost == 0
        || kdf.memory_cost > MAX_MEMORY_KIB
        || kdf.salt.len() < MIN_SALT_LEN
        || kdf.salt.len() > MAX_SALT_LEN
    {
        return Err(CaskError::Config(
            "repository key blob has unsafe KDF parameters".into(),
        ));
    }
    Ok(())
}

fn derive_wrapping_key(passphrase: &str, kdf: &KdfParams) -> Result<Zeroizing<[u8; 32]>> {
    let params = argon2::Params::new(kdf.memory_cost, kdf.time_cost, kdf.parallelism, Some(32))
        .map_err(|e| CaskError::Config(format!("argon2 params: {e}")))?;
    let argon = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

    let mut out = Zeroizing::new([0u8; 32]);
    argon
        .hash_password_into(passphrase.as_bytes(), &kdf.salt, out.as_mut())
        .map_err(|e| CaskError::Config(format!("argon2: {e}")))?;
    Ok(out)
}

/// AAD binding the KDF parameters to the wrapped payload, preventing
/// parameter-substitution attacks on the config blob.
fn kdf_aad(kdf: &KdfParams) -> Vec<u8> {
    format!(
        "cask-kdf-v1:{}:{}:{}:{}:{}",
        kdf.algorithm,
        kdf.time_cost,
        kdf.memory_cost,
        kdf.parallelism,
        hex::encode(&kdf.salt)
    )
    .into_bytes()
}

/// Wrap `plaintext` with a passphrase: Argon2id KDF + AES-256-GCM.
pub fn wrap_with_passphrase(passphrase: &str, plaintext: &[u8]) -> Result<WrappedSecret> {
    let mut salt = vec![0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut salt);

    let kdf = KdfParams {
        algorithm: "argon2id".to_string(),
        time_cost: 3,
        memory_cost: 65_536, // 64 MiB
        parallelism: 4,
        salt,
    };
    let wrapping_key = derive_wrapping_key(passphrase, &kdf)?;

    let cipher = Aes256Gcm::new_from_slice(wrapping_key.as_ref())
        .map_err(|e| CaskError::Config(format!("cipher init: {e}")))?;
    let mut nonce = [0u8; 12];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: &kdf_aad(&kdf),
            },
        )
        .map_err(|e| CaskError::Other(format!("key wrap: {e}")))?;

    Ok(WrappedSecret {
        kdf,
        nonce: nonce.to_vec(),
        ciphertext,
    })
}

/// Unwrap a [`WrappedSecret`]. A wrong passphrase or tampered blob yields
/// `CorruptData`.
pub fn unwrap_with_passphrase(passphrase: &str, wrapped: &WrappedSecret) -> Result<Zeroizing<Vec<u8>>> {
    validate_kdf_params(&wrapped.kdf)?;
    if wrapped.nonce.len() != 12 {
        return Err(CaskError::Config("repository key blob has invalid nonce".into()));
    }

    let wrapping_key = derive_wrapping_key(passphrase, &wrapped.kdf)?;
    let cipher = Aes256Gcm::new_from_slice(wrapping_key.as_ref())
        .map_err(|e| CaskError::Config(format!("cipher init: {e}")))?;

    cipher
        .decrypt(
            Nonce::from_slice(&wrapped.nonce),
            Payload {
                msg: &wrapped.ciphertext,
                aad: &kdf_aad(&wrapped.kdf),
            },
        )
        .map(Zeroizing::new)
        .map_err(|_| CaskError::CorruptData("wrong passphrase or corrupted key blob".into()))
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}
