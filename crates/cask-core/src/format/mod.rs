use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroize::Zeroizing;

use crate::crypto::content_id::ContentId;
use crate::crypto::key::{self, MasterKey, WrappedSecret};
use crate::crypto::{create_aead, AeadEngine, NONCE_SIZE};
use crate::error::{CaskError, Result};
use crate::storage::{BlobId, BlobStore, PutOptions, REPOSITORY_CONFIG_BLOB_ID};
use crate::trace::CancelToken;

/// Schema version of the `cask.repository` config blob.
pub const REPOSITORY_FORMAT_VERSION: u32 = 1;
/// Content format version recorded in index entries.
pub const CONTENT_FORMAT_VERSION: u8 = 2;
/// Index blob wire-format version.
pub const INDEX_VERSION_2: u8 = 2;

pub const HASH_HMAC_SHA256_128: &str = "HMAC-SHA256-128";

/// Parameters governing epoch advancement and retention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochParameters {
    /// Advance once an epoch holds more than this many index blobs.
    pub advance_threshold: usize,
    /// Advance once an epoch is older than this many seconds.
    pub advance_age_seconds: i64,
    /// Number of recent epochs always kept un-dropped.
    pub retain_epochs: u64,
    /// Epoch markers older than `current - retain_epoch_markers` may be removed.
    pub retain_epoch_markers: u64,
}

impl Default for EpochParameters {
    fn default() -> Self {
        Self {
            advance_threshold: 20,
            advance_age_seconds: 24 * 3600,
            retain_epochs: 3,
            retain_epoch_markers: 5,
        }
    }
}

/// Repository-level mutable configuration, persisted encrypted inside
/// `cask.repository`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutableParameters {
    pub version: u32,
    pub max_pack_size: usize,
    pub index_version: u8,
    pub epoch: EpochParameters,
    pub hash: String,
    pub encryption: String,
}

impl Default for MutableParameters {
    fn default() -> Self {
        Self {
            version: REPOSITORY_FORMAT_VERSION,
            max_pack_size: 20 * 1024 * 1024,
            index_version: INDEX_VERSION_2,
            epoch: EpochParameters::default(),
            hash: HASH_HMAC_SHA256_128.to_string(),
            encryption: crate::crypto::aes_gcm::ALGORITHM.to_string(),
        }
    }
}

impl MutableParameters {
    pub fn validate(&self) -> Result<()> {
        if self.version != REPOSITORY_FORMAT_VERSION {
            return Err(CaskError::Config(format!(
                "unsupported repository version: {}",
                self.version
            )));
        }
        if self.index_version != INDEX_VERSION_2 {
            return Err(CaskError::Config(format!(
                "unsupported index version: {}",
                self.index_version
            )));
        }
        if self.hash != HASH_HMAC_SHA256_128 {
            return Err(CaskError::Config(format!(
                "unsupported hash algorithm: '{}'",
                self.hash
            )));
        }
        if self.max_pack_size == 0 {
            return Err(CaskError::Config("max_pack_size must be positive".into()));
        }
        if self.epoch.advance_threshold == 0 || self.epoch.advance_age_seconds <= 0 {
            return Err(CaskError::Config("invalid epoch parameters".into()));
        }
        Ok(())
    }
}

/// Object-type tags for encrypted metadata envelopes. The tag byte is
/// authenticated (AAD) so a blob of one kind cannot be replayed as another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectType {
    IndexBlob = 1,
    PackFooter = 2,
}

/// Key material and parameters wrapped by the repository passphrase.
#[derive(Serialize, Deserialize)]
struct SecretPayload {
    #[serde(with = "hex_key")]
    encryption_key: [u8; 32],
    #[serde(with = "hex_key")]
    hmac_secret: [u8; 32],
    parameters: MutableParameters,
}

/// On-disk layout of the `cask.repository` blob (plaintext JSON wrapper
/// around the passphrase-wrapped secret payload).
#[derive(Serialize, Deserialize)]
struct RepositoryConfigBlob {
    version: u32,
    key: WrappedSecret,
}

/// Holds the repository's key material, hash/encryption choices and mutable
/// parameters; the single source for the per-content transformation.
pub struct FormatProvider {
    params: MutableParameters,
    hmac_secret: [u8; 32],
    aead: Box<dyn AeadEngine>,
}

impl FormatProvider {
    /// Build a provider from explicit key material.
    pub fn with_master_key(
        params: MutableParameters,
        encryption_key: [u8; 32],
        hmac_secret: [u8; 32],
    ) -> Result<Self> {
        params.validate()?;
        let aead = create_aead(&params.encryption, &encryption_key)?;
        Ok(Self {
            params,
            hmac_secret,
            aead,
        })
    }

    /// Create a new repository: generate a master key, wrap it with the
    /// passphrase and write `cask.repository` (refusing to overwrite an
    /// existing repository).
    pub fn initialize(
        store: &dyn BlobStore,
        cancel: &CancelToken,
        passphrase: &str,
        params: MutableParameters,
    ) -> Result<Self> {
        params.validate()?;
        let master = MasterKey::generate();

        let payload = SecretPayload {
            encryption_key: master.encryption_key,
            hmac_secret: master.hmac_secret,
            parameters: params.clone(),
        };
        let payload_json = Zeroizing::new(
            serde_json::to_vec(&payload)
                .map_err(|e| CaskError::Config(format!("config serialize: {e}")))?,
        );

        let blob = RepositoryConfigBlob {
            version: REPOSITORY_FORMAT_VERSION,
            key: key::wrap_with_passphrase(passphrase, &payload_json)?,
        };
        let blob_json = serde_json::to_vec_pretty(&blob)
            .map_err(|e| CaskError::Config(format!("config serialize: {e}")))?;

        let id = BlobId::new(REPOSITORY_CONFIG_BLOB_ID)?;
        match store.put_blob(
            cancel,
            &id,
            &blob_json,
            &PutOptions {
                do_not_recreate: true,
                ..Default::default()
            },
        ) {
            Ok(()) => {}
            Err(CaskError::BlobAlreadyExists(_)) => {
                return Err(CaskError::Config(
                    "repository is already initialized".into(),
                ))
            }
            Err(e) => return Err(e),
        }

        debug!(encryption = %params.encryption, "initialized repository format");
        Self::with_master_key(params, master.encryption_key, master.hmac_secret)
    }

    /// Open an existing repository by reading and unwrapping `cask.repository`.
    pub fn open(store: &dyn BlobStore, cancel: &CancelToken, passphrase: &str) -> Result<Self> {
        let id = BlobId::new(REPOSITORY_CONFIG_BLOB_ID)?;
        let blob_json = match store.get_blob(cancel, &id, 0, None) {
            Ok(data) => data,
            Err(CaskError::BlobNotFound(_)) => {
                return Err(CaskError::Config("repository is not initialized".into()))
            }
            Err(e) => return Err(e),
        };

        let blob: RepositoryConfigBlob = serde_json::from_slice(&blob_json)
            .map_err(|e| CaskError::Config(format!("config parse: {e}")))?;
        if blob.version != REPOSITORY_FORMAT_VERSION {
            return Err(CaskError::Config(format!(
                "unsupported repository version: {}",
                blob.version
            )));
        }

        let payload_json = key::unwrap_with_passphrase(passphrase, &blob.key)?;
        let payload: SecretPayload = serde_json::from_slice(&payload_json)
            .map_err(|e| CaskError::Config(format!("config payload parse: {e}")))?;

        Self::with_master_key(
            payload.parameters,
            payload.encryption_key,
            payload.hmac_secret,
        )
    }

    pub fn params(&self) -> &MutableParameters {
        &self.params
    }

    pub fn max_pack_size(&self) -> usize {
        self.params.max_pack_size
    }

    pub fn epoch_params(&self) -> &EpochParameters {
        &self.params.epoch
    }

    /// Compute the deterministic content ID for `plaintext` under `prefix`.
    pub fn content_id(&self, prefix: Option<char>, plaintext: &[u8]) -> Result<ContentId> {
        ContentId::compute(&self.hmac_secret, prefix, plaintext)
    }

    /// Encrypt a content payload. The nonce is derived from the content ID
    /// so identical plaintexts encrypt identically (dedupe requirement);
    /// the ID is authenticated as AAD.
    pub fn encrypt_content(&self, id: &ContentId, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.aead.seal(&id.nonce(), plaintext, &id.to_bytes())
    }

    /// Decrypt and verify a content payload.
    pub fn decrypt_content(&self, id: &ContentId, data: &[u8]) -> Result<Vec<u8>> {
        self.aead.open(&id.nonce(), data, &id.to_bytes())
    }

    /// Seal a metadata payload into a type-tagged envelope:
    /// `[1-byte tag][12-byte random nonce][ciphertext + tag]`.
    pub fn seal_envelope(&self, obj_type: ObjectType, plaintext: &[u8]) -> Result<Vec<u8>> {
        let tag = obj_type as u8;
        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);

        let sealed = self.aead.seal(&nonce, plaintext, &[tag])?;
        let mut out = Vec::with_capacity(1 + NONCE_SIZE + sealed.len());
        out.push(tag);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Open a metadata envelope, verifying it carries the expected type tag.
    pub fn open_envelope(&self, obj_type: ObjectType, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < 1 + NONCE_SIZE {
            return Err(CaskError::CorruptData("envelope too short".into()));
        }
        let tag = data[0];
        if tag != obj_type as u8 {
            return Err(CaskError::CorruptData(format!(
                "unexpected envelope type tag: {tag}"
            )));
        }
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&data[1..1 + NONCE_SIZE]);
        self.aead.open(&nonce, &data[1 + NONCE_SIZE..], &[tag])
    }
}

mod hex_key {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("key must be 32 bytes"))
    }
}
