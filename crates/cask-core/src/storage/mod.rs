pub mod local_store;
pub mod memory_store;
pub mod retry;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{CaskError, Result};
use crate::trace::CancelToken;

/// Prefix for regular pack blobs.
pub const PACK_BLOB_PREFIX_REGULAR: &str = "p";
/// Prefix for special (bucketed/metadata) pack blobs.
pub const PACK_BLOB_PREFIX_SPECIAL: &str = "q";
/// All pack blob prefixes, in listing order.
pub const PACK_BLOB_PREFIXES: [&str; 2] = [PACK_BLOB_PREFIX_REGULAR, PACK_BLOB_PREFIX_SPECIAL];
/// Prefix for index blobs (`x<epoch>_<random>`).
pub const INDEX_BLOB_PREFIX: &str = "x";
/// Prefix for epoch marker blobs (`n<epoch>`).
pub const EPOCH_MARKER_PREFIX: &str = "n";
/// Prefix for deletion watermark blobs (`w<target-blob-id>`).
pub const WATERMARK_PREFIX: &str = "w";
/// Well-known blob holding the encrypted repository configuration.
pub const REPOSITORY_CONFIG_BLOB_ID: &str = "cask.repository";
/// Well-known blob acting as the repository-wide maintenance lock.
pub const MAINTENANCE_LOCK_BLOB_ID: &str = "cask.maintenance";

/// Identifier of a physical blob in the store.
///
/// The first character encodes the blob kind (`p`, `q`, `x`, `n`, `w`);
/// well-known configuration blobs use dotted names.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobId(String);

impl BlobId {
    /// Construct a blob ID, validating the allowed character set.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(CaskError::InvalidFormat("empty blob id".into()));
        }
        if !id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'/' | b'-'))
        {
            return Err(CaskError::InvalidFormat(format!("invalid blob id: '{id}'")));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobId({})", self.0)
    }
}

/// Metadata for a single blob.
#[derive(Debug, Clone)]
pub struct BlobMetadata {
    pub id: BlobId,
    pub length: u64,
    pub timestamp: DateTime<Utc>,
}

/// Options for [`BlobStore::put_blob`].
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    /// Fail with `BlobAlreadyExists` instead of overwriting. Stores must
    /// honor this atomically (if-match precondition or equivalent).
    pub do_not_recreate: bool,
    /// Set the blob's modification time instead of using the store clock.
    pub set_mod_time: Option<DateTime<Utc>>,
    /// Retention period for stores with object-lock support; stores without
    /// it ignore the option.
    pub retention_period: Option<Duration>,
}

/// Abstract append-only key/value blob store.
///
/// All mutation is add-or-delete; there is no in-place update. Listing may
/// lag a recent write (eventual consistency) and may still include blobs
/// that were just deleted; callers must tolerate both.
pub trait BlobStore: Send + Sync {
    /// Read `length` bytes starting at `offset` (`None` = to end of blob).
    fn get_blob(
        &self,
        cancel: &CancelToken,
        id: &BlobId,
        offset: u64,
        length: Option<u64>,
    ) -> Result<Vec<u8>>;

    /// Blob length and modification time without reading the payload.
    fn get_metadata(&self, cancel: &CancelToken, id: &BlobId) -> Result<BlobMetadata>;

    /// Write a blob. The only write primitive.
    fn put_blob(
        &self,
        cancel: &CancelToken,
        id: &BlobId,
        data: &[u8],
        opts: &PutOptions,
    ) -> Result<()>;

    /// Delete a blob. Deleting a missing blob is success.
    fn delete_blob(&self, cancel: &CancelToken, id: &BlobId) -> Result<()>;

    /// Extend the retention period of a blob. Stores lacking object lock
    /// ignore the request.
    fn extend_blob_retention(
        &self,
        _cancel: &CancelToken,
        _id: &BlobId,
        _period: Duration,
    ) -> Result<()> {
        Ok(())
    }

    /// Invoke `callback` for every blob whose ID starts with `prefix`.
    fn list_blobs(
        &self,
        cancel: &CancelToken,
        prefix: &str,
        callback: &mut dyn FnMut(&BlobMetadata) -> Result<()>,
    ) -> Result<()>;
}

impl BlobStore for Arc<dyn BlobStore> {
    fn get_blob(
        &self,
        cancel: &CancelToken,
        id: &BlobId,
        offset: u64,
        length: Option<u64>,
    ) -> Result<Vec<u8>> {
        (**self).get_blob(cancel, id, offset, length)
    }

    fn get_metadata(&self, cancel: &CancelToken, id: &BlobId) -> Result<BlobMetadata> {
        (**self).get_metadata(cancel, id)
    }

    fn put_blob(
        &self,
        cancel: &CancelToken,
        id: &BlobId,
        data: &[u8],
        opts: &PutOptions,
    ) -> Result<()> {
        (**self).put_blob(cancel, id, data, opts)
    }

    fn delete_blob(&self, cancel: &CancelToken, id: &BlobId) -> Result<()> {
        (**self).delete_blob(cancel, id)
    }

    fn extend_blob_retention(
        &self,
        cancel: &CancelToken,
        id: &BlobId,
        period: Duration,
    ) -> Result<()> {
        (**self).extend_blob_retention(cancel, id, period)
    }

    fn list_blobs(
        &self,
        cancel: &CancelToken,
        prefix: &str,
        callback: &mut dyn FnMut(&BlobMetadata) -> Result<()>,
    ) -> Result<()> {
        (**self).list_blobs(cancel, prefix, callback)
    }
}

/// Collect the metadata of all blobs under `prefix`.
pub fn list_all_blobs(
    store: &dyn BlobStore,
    cancel: &CancelToken,
    prefix: &str,
) -> Result<Vec<BlobMetadata>> {
    let mut out = Vec::new();
    store.list_blobs(cancel, prefix, &mut |m| {
        out.push(m.clone());
        Ok(())
    })?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_id_charset() {
        assert!(BlobId::new("p0123abcd").is_ok());
        assert!(BlobId::new("x7_c_deadbeef").is_ok());
        assert!(BlobId::new("cask.repository").is_ok());
        assert!(BlobId::new("").is_err());
        assert!(BlobId::new("bad id").is_err());
        assert!(BlobId::new("bad\\id").is_err());
        assert!(BlobId::new("bad\u{e9}id").is_err());
    }

    #[test]
    fn blob_id_prefix_checks() {
        let id = BlobId::new("q00ff").unwrap();
        assert!(id.has_prefix(PACK_BLOB_PREFIX_SPECIAL));
        assert!(!id.has_prefix(PACK_BLOB_PREFIX_REGULAR));
    }
}
