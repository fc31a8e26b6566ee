use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::RngCore;
use tracing::{debug, info};

use crate::error::{CaskError, Result};
use crate::format::EpochParameters;
use crate::storage::{
    list_all_blobs, BlobId, BlobMetadata, BlobStore, PutOptions, EPOCH_MARKER_PREFIX,
    INDEX_BLOB_PREFIX,
};
use crate::trace::CancelToken;

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// A parsed index blob name.
#[derive(Debug, Clone)]
pub struct IndexBlobInfo {
    pub metadata: BlobMetadata,
    pub epoch: u64,
    pub compacted: bool,
}

/// Epoch bookkeeping: marker scanning, index blob naming, and the advance
/// protocol.
///
/// Epochs bound the working set of index blobs on eventually-consistent
/// stores. Advancing is a racy-but-idempotent event: every advancer writes
/// the next marker with `do_not_recreate` and losers accept the existing
/// marker as authoritative.
pub struct EpochManager {
    store: Arc<dyn BlobStore>,
    params: EpochParameters,
    clock: Clock,
}

impl EpochManager {
    pub fn new(store: Arc<dyn BlobStore>, params: EpochParameters, clock: Clock) -> Self {
        Self {
            store,
            params,
            clock,
        }
    }

    pub fn params(&self) -> &EpochParameters {
        &self.params
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Marker blob ID for `epoch`.
    pub fn marker_id(epoch: u64) -> BlobId {
        BlobId::new(format!("{EPOCH_MARKER_PREFIX}{epoch}")).expect("valid marker id")
    }

    /// Parse an epoch marker blob name (`n<epoch>`).
    pub fn parse_marker(id: &BlobId) -> Option<u64> {
        id.as_str()
            .strip_prefix(EPOCH_MARKER_PREFIX)?
            .parse()
            .ok()
    }

    /// Parse an index blob name (`x<epoch>_<random>` or `x<epoch>_c_<random>`).
    pub fn parse_index_blob(meta: &BlobMetadata) -> Option<IndexBlobInfo> {
        let rest = meta.id.as_str().strip_prefix(INDEX_BLOB_PREFIX)?;
        let (epoch_str, suffix) = rest.split_once('_')?;
        let epoch = epoch_str.parse().ok()?;
        Some(IndexBlobInfo {
            metadata: meta.clone(),
            epoch,
            compacted: suffix.starts_with("c_"),
        })
    }

    /// Determine the current epoch by scanning markers; no marker means 0.
    pub fn current_epoch(&self, cancel: &CancelToken) -> Result<u64> {
        let mut current = 0;
        self.store
            .list_blobs(cancel, EPOCH_MARKER_PREFIX, &mut |meta| {
                if let Some(epoch) = Self::parse_marker(&meta.id) {
                    current = current.max(epoch);
                }
                Ok(())
            })?;
        Ok(current)
    }

    /// List all live index blobs, parsed. Unparseable `x*` names are skipped.
    pub fn list_index_blobs(&self, cancel: &CancelToken) -> Result<Vec<IndexBlobInfo>> {
        let mut out = Vec::new();
        self.store
            .list_blobs(cancel, INDEX_BLOB_PREFIX, &mut |meta| {
                if let Some(info) = Self::parse_index_blob(meta) {
                    out.push(info);
                }
                Ok(())
            })?;
        Ok(out)
    }

    fn new_index_blob_id(epoch: u64, compacted: bool) -> BlobId {
        let mut suffix = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut suffix);
        let infix = if compacted { "c_" } else { "" };
        BlobId::new(format!(
            "{INDEX_BLOB_PREFIX}{epoch}_{infix}{}",
            hex::encode(suffix)
        ))
        .expect("valid index blob id")
    }

    /// Write `payload` as a new index blob in the current epoch, then check
    /// whether the epoch should advance. Returns the blob ID and its epoch.
    pub fn write_index_blob(&self, cancel: &CancelToken, payload: &[u8]) -> Result<(BlobId, u64)> {
        let epoch = self.current_epoch(cancel)?;
        let id = Self::new_index_blob_id(epoch, false);
        match self.store.put_blob(
            cancel,
            &id,
            payload,
            &PutOptions {
                do_not_recreate: true,
                ..Default::default()
            },
        ) {
            // A colliding random suffix means the identical write already
            // happened; index blob writes are idempotent.
            Ok(()) | Err(CaskError::BlobAlreadyExists(_)) => {}
            Err(e) => return Err(e),
        }

        self.maybe_advance(cancel, epoch)?;
        Ok((id, epoch))
    }

    /// Write a compaction snapshot blob for `epoch`.
    pub fn write_compacted_blob(
        &self,
        cancel: &CancelToken,
        epoch: u64,
        payload: &[u8],
    ) -> Result<BlobId> {
        let id = Self::new_index_blob_id(epoch, true);
        match self.store.put_blob(
            cancel,
            &id,
            payload,
            &PutOptions {
                do_not_recreate: true,
                ..Default::default()
            },
        ) {
            Ok(()) | Err(CaskError::BlobAlreadyExists(_)) => Ok(id),
            Err(e) => Err(e),
        }
    }

    /// Advance to `epoch + 1` when the current epoch has grown past the
    /// configured blob-count threshold or age.
    fn maybe_advance(&self, cancel: &CancelToken, epoch: u64) -> Result<()> {
        let blobs = self.list_index_blobs(cancel)?;
        let in_epoch: Vec<&IndexBlobInfo> = blobs.iter().filter(|b| b.epoch == epoch).collect();

        let over_count = in_epoch.len() > self.params.advance_threshold;
        let over_age = match self.epoch_started_at(cancel, epoch, &in_epoch)? {
            Some(start) => {
                (self.now() - start).num_seconds() > self.params.advance_age_seconds
            }
            None => false,
        };

        if !over_count && !over_age {
            return Ok(());
        }

        self.advance(cancel, epoch)
    }

    /// Write the marker for `epoch + 1`. Losing the race to another advancer
    /// is success: the existing marker is authoritative.
    pub fn advance(&self, cancel: &CancelToken, epoch: u64) -> Result<()> {
        let marker = Self::marker_id(epoch + 1);
        match self.store.put_blob(
            cancel,
            &marker,
            format!("{}", epoch + 1).as_bytes(),
            &PutOptions {
                do_not_recreate: true,
                ..Default::default()
            },
        ) {
            Ok(()) => {
                info!(epoch = epoch + 1, "advanced index epoch");
                Ok(())
            }
            Err(CaskError::BlobAlreadyExists(_)) => {
                debug!(epoch = epoch + 1, "epoch marker already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// When epoch `E` began: the timestamp of marker `n<E>`, or for epoch 0
    /// the earliest index blob in it.
    fn epoch_started_at(
        &self,
        cancel: &CancelToken,
        epoch: u64,
        in_epoch: &[&IndexBlobInfo],
    ) -> Result<Option<DateTime<Utc>>> {
        if epoch > 0 {
            match self.store.get_metadata(cancel, &Self::marker_id(epoch)) {
                Ok(meta) => return Ok(Some(meta.timestamp)),
                Err(CaskError::BlobNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(in_epoch.iter().map(|b| b.metadata.timestamp).min())
    }

    /// List all epoch marker metadata.
    pub fn list_markers(&self, cancel: &CancelToken) -> Result<Vec<(u64, BlobMetadata)>> {
        let mut out = Vec::new();
        for meta in list_all_blobs(&*self.store, cancel, EPOCH_MARKER_PREFIX)? {
            if let Some(epoch) = Self::parse_marker(&meta.id) {
                out.push((epoch, meta));
            }
        }
        Ok(out)
    }
}

/// Reduce a full index blob listing to the read set: within each epoch,
/// compaction snapshots supersede the individual blobs they merged.
pub fn select_read_set(blobs: Vec<IndexBlobInfo>) -> Vec<IndexBlobInfo> {
    let mut by_epoch: HashMap<u64, Vec<IndexBlobInfo>> = HashMap::new();
    for blob in blobs {
        by_epoch.entry(blob.epoch).or_default().push(blob);
    }

    let mut out = Vec::new();
    for (_, group) in by_epoch {
        if group.iter().any(|b| b.compacted) {
            out.extend(group.into_iter().filter(|b| b.compacted));
        } else {
            out.extend(group);
        }
    }
    out
}
