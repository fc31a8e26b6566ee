pub mod lock;
pub mod pack;
pub mod single_flight;

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{debug, warn};

use crate::compress::{self, Compression};
use crate::crypto::content_id::ContentId;
use crate::error::{CaskError, Result};
use crate::format::{FormatProvider, CONTENT_FORMAT_VERSION};
use crate::index::epoch::{Clock, EpochManager};
use crate::index::{ContentInfo, IndexManager};
use crate::repo::pack::{PackBuilder, PackKind, SealedPack};
use crate::repo::single_flight::SingleFlight;
use crate::storage::retry::{RetryConfig, RetryingStore};
use crate::storage::{BlobId, BlobStore, PutOptions};
use crate::trace::CancelToken;

/// Options for opening a [`WriteManager`].
pub struct WriteManagerOptions {
    pub retry: RetryConfig,
    /// Time source for content timestamps and epoch decisions.
    pub clock: Option<Clock>,
}

impl Default for WriteManagerOptions {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            clock: None,
        }
    }
}

/// Options for [`WriteManager::iterate_contents`].
#[derive(Debug, Clone, Copy, Default)]
pub struct IterateOptions {
    pub include_deleted: bool,
}

/// Write-path state guarded by the manager's lock: one pending pack per
/// bucket plus the entries not yet committed to an index blob.
struct PendingState {
    regular: PackBuilder,
    special: PackBuilder,
    /// Complete `ContentInfo` for every content written (or tombstoned)
    /// since the last successful index emission.
    uncommitted: HashMap<ContentId, ContentInfo>,
}

impl PendingState {
    fn builder_mut(&mut self, kind: PackKind) -> &mut PackBuilder {
        match kind {
            PackKind::Regular => &mut self.regular,
            PackKind::Special => &mut self.special,
        }
    }
}

/// The content store: turns raw bytes into deduplicated, encrypted,
/// pack-stored contents addressed by [`ContentId`].
///
/// Owns the pack builders and the index manager; shares the blob store.
pub struct WriteManager {
    store: Arc<dyn BlobStore>,
    format: Arc<FormatProvider>,
    index: IndexManager,
    pending: Mutex<PendingState>,
    /// Sealed pack bytes kept readable until the blob is durable.
    in_flight_packs: Mutex<HashMap<BlobId, Arc<Vec<u8>>>>,
    flights: SingleFlight<ContentId>,
    /// Serializes concurrent flushes.
    flush_lock: Mutex<()>,
    clock: Clock,
    last_timestamp: AtomicI64,
}

impl WriteManager {
    /// Open the content store over `store` with the repository format
    /// `format`, loading the committed index view.
    pub fn open(
        cancel: &CancelToken,
        store: Arc<dyn BlobStore>,
        format: Arc<FormatProvider>,
        options: WriteManagerOptions,
    ) -> Result<Self> {
        let clock: Clock = options.clock.unwrap_or_else(|| Arc::new(Utc::now));
        let store: Arc<dyn BlobStore> = Arc::new(RetryingStore::new(store, options.retry));
        let epochs = EpochManager::new(store.clone(), format.epoch_params().clone(), clock.clone());
        let index = IndexManager::new(store.clone(), format.clone(), epochs);

        let manager = Self {
            store,
            format,
            index,
            pending: Mutex::new(PendingState {
                regular: PackBuilder::new(PackKind::Regular),
                special: PackBuilder::new(PackKind::Special),
                uncommitted: HashMap::new(),
            }),
            in_flight_packs: Mutex::new(HashMap::new()),
            flights: SingleFlight::new(),
            flush_lock: Mutex::new(()),
            clock,
            last_timestamp: AtomicI64::new(0),
        };
        manager.index.load(cancel)?;
        Ok(manager)
    }

    pub fn format(&self) -> &FormatProvider {
        &self.format
    }

    pub(crate) fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    pub(crate) fn index_manager(&self) -> &IndexManager {
        &self.index
    }

    pub(crate) fn now(&self) -> chrono::DateTime<Utc> {
        (self.clock)()
    }

    /// Next content timestamp: wall clock, monotone non-decreasing within
    /// this manager.
    fn next_timestamp(&self) -> i64 {
        let now = self.now().timestamp();
        let prev = self.last_timestamp.fetch_max(now, Ordering::SeqCst);
        prev.max(now)
    }

    /// Resolve a content to its most recent entry, preferring local
    /// not-yet-committed state over the committed view.
    fn lookup_info(&self, id: &ContentId) -> Option<ContentInfo> {
        if let Some(info) = self.pending.lock().unwrap().uncommitted.get(id) {
            return Some(info.clone());
        }
        self.index.committed().get(id).cloned()
    }

    /// Write `plaintext` under the optional bucket `prefix`, returning its
    /// stable content ID.
    ///
    /// Deduplicates against everything visible: an already-live content is
    /// returned without a physical write. The content is durable only after
    /// [`WriteManager::flush`].
    pub fn write_content(
        &self,
        cancel: &CancelToken,
        plaintext: &[u8],
        prefix: Option<char>,
        compression: Compression,
    ) -> Result<ContentId> {
        cancel.check()?;
        let id = self.format.content_id(prefix, plaintext)?;

        loop {
            if let Some(info) = self.lookup_info(&id) {
                if !info.deleted {
                    return Ok(id);
                }
                // Tombstoned: fall through and resurrect with a newer entry.
            }

            match self.flights.lead_or_wait(&id) {
                // A concurrent writer of the same content finished; re-check.
                None => continue,
                Some(_guard) => {
                    // Re-check under leadership: the previous leader may have
                    // completed between our lookup and the wait.
                    if let Some(info) = self.lookup_info(&id) {
                        if !info.deleted {
                            return Ok(id);
                        }
                    }
                    self.write_new_content(cancel, id, plaintext, compression)?;
                    return Ok(id);
                }
            }
        }
    }

    fn write_new_content(
        &self,
        cancel: &CancelToken,
        id: ContentId,
        plaintext: &[u8],
        compression: Compression,
    ) -> Result<()> {
        // Hashing and encryption happen off-lock.
        let (payload, compressed) = if compression.is_none() {
            (plaintext.to_vec(), false)
        } else {
            (compress::compress(compression, plaintext)?, true)
        };
        let encrypted = self.format.encrypt_content(&id, &payload)?;
        let timestamp = self.next_timestamp();
        let max_pack_size = self.format.max_pack_size();
        let kind = PackKind::for_content_prefix(id.prefix());

        let mut sealed = Vec::new();
        {
            let mut st = self.pending.lock().unwrap();
            let builder = st.builder_mut(kind);

            // Seal the current pack first when this content would overflow it.
            if !builder.is_empty() && builder.len() + encrypted.len() > max_pack_size {
                sealed.push(self.seal_locked(builder)?);
            }

            let offset = builder.add(id, &encrypted);
            let info = ContentInfo {
                content_id: id,
                pack_blob_id: builder.blob_id().clone(),
                pack_offset: offset,
                length: encrypted.len() as u32,
                timestamp_seconds: timestamp,
                deleted: false,
                compressed,
                format_version: CONTENT_FORMAT_VERSION,
            };

            if builder.len() >= max_pack_size {
                sealed.push(self.seal_locked(builder)?);
            }
            st.uncommitted.insert(id, info);
        }

        for pack_id in sealed {
            self.upload_pack(cancel, pack_id, kind)?;
        }
        Ok(())
    }

    /// Seal `builder` and register the bytes as in-flight so reads keep
    /// working while the upload is pending. Called under the pending lock.
    fn seal_locked(&self, builder: &mut PackBuilder) -> Result<BlobId> {
        let SealedPack { blob_id, bytes, .. } = builder.seal(&self.format)?;
        self.in_flight_packs
            .lock()
            .unwrap()
            .insert(blob_id.clone(), Arc::new(bytes));
        Ok(blob_id)
    }

    /// Upload an in-flight pack. On `BlobAlreadyExists` (a random pack-ID
    /// collision, or a retry of a put that already landed) the pack ID is
    /// regenerated once unless the stored blob already matches ours.
    fn upload_pack(&self, cancel: &CancelToken, blob_id: BlobId, kind: PackKind) -> Result<()> {
        let Some(bytes) = self
            .in_flight_packs
            .lock()
            .unwrap()
            .get(&blob_id)
            .cloned()
        else {
            return Ok(()); // another path already completed this upload
        };

        let opts = PutOptions {
            do_not_recreate: true,
            ..Default::default()
        };
        match self.store.put_blob(cancel, &blob_id, &bytes, &opts) {
            Ok(()) => {
                self.in_flight_packs.lock().unwrap().remove(&blob_id);
                debug!(pack = %blob_id, bytes = bytes.len(), "uploaded pack");
                Ok(())
            }
            Err(CaskError::BlobAlreadyExists(_)) => {
                let existing = self.store.get_metadata(cancel, &blob_id)?;
                if existing.length == bytes.len() as u64 {
                    // Our earlier attempt landed; idempotent success.
                    self.in_flight_packs.lock().unwrap().remove(&blob_id);
                    return Ok(());
                }
                let new_id = pack::new_pack_blob_id(kind);
                warn!(old = %blob_id, new = %new_id, "pack blob id collision, regenerating");
                self.rename_in_flight(&blob_id, &new_id);
                match self.store.put_blob(cancel, &new_id, &bytes, &opts) {
                    Ok(()) => {
                        self.in_flight_packs.lock().unwrap().remove(&new_id);
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Repoint all uncommitted entries and in-flight bytes from `old` to `new`.
    fn rename_in_flight(&self, old: &BlobId, new: &BlobId) {
        let mut st = self.pending.lock().unwrap();
        for info in st.uncommitted.values_mut() {
            if &info.pack_blob_id == old {
                info.pack_blob_id = new.clone();
            }
        }
        drop(st);

        let mut packs = self.in_flight_packs.lock().unwrap();
        if let Some(bytes) = packs.remove(old) {
            packs.insert(new.clone(), bytes);
        }
    }

    /// Read a live content. Tombstoned contents return `ContentDeleted`.
    pub fn get_content(&self, cancel: &CancelToken, id: &ContentId) -> Result<Vec<u8>> {
        self.get_content_opt(cancel, id, false)
    }

    /// Read a content even when tombstoned; the payload remains available
    /// until maintenance drops it.
    pub fn get_content_including_deleted(
        &self,
        cancel: &CancelToken,
        id: &ContentId,
    ) -> Result<Vec<u8>> {
        self.get_content_opt(cancel, id, true)
    }

    fn get_content_opt(
        &self,
        cancel: &CancelToken,
        id: &ContentId,
        include_deleted: bool,
    ) -> Result<Vec<u8>> {
        cancel.check()?;
        let info = self
            .lookup_info(id)
            .ok_or(CaskError::ContentNotFound(*id))?;
        if info.deleted && !include_deleted {
            return Err(CaskError::ContentDeleted(*id));
        }

        let encrypted = self.read_encrypted(cancel, &info)?;
        let payload = self.format.decrypt_content(id, &encrypted)?;
        if info.compressed {
            compress::decompress(&payload)
        } else {
            Ok(payload)
        }
    }

    /// Fetch the ciphertext for `info` from wherever it currently lives:
    /// a pending pack buffer, an in-flight sealed pack, or the blob store.
    fn read_encrypted(&self, cancel: &CancelToken, info: &ContentInfo) -> Result<Vec<u8>> {
        {
            let st = self.pending.lock().unwrap();
            for builder in [&st.regular, &st.special] {
                if builder.blob_id() == &info.pack_blob_id {
                    if let Some(bytes) = builder.read_pending(info.pack_offset, info.length) {
                        return Ok(bytes);
                    }
                }
            }
        }

        if let Some(bytes) = self
            .in_flight_packs
            .lock()
            .unwrap()
            .get(&info.pack_blob_id)
            .cloned()
        {
            let start = info.pack_offset as usize;
            let end = start + info.length as usize;
            if let Some(slice) = bytes.get(start..end) {
                return Ok(slice.to_vec());
            }
        }

        self.store.get_blob(
            cancel,
            &info.pack_blob_id,
            info.pack_offset as u64,
            Some(info.length as u64),
        )
    }

    /// Most recent index entry for `id`, including tombstones.
    pub fn content_info(&self, id: &ContentId) -> Result<ContentInfo> {
        self.lookup_info(id).ok_or(CaskError::ContentNotFound(*id))
    }

    /// Write a tombstone for `id`. The pack bytes are untouched; the content
    /// stays resolvable as deleted until drop-deleted maintenance clears it.
    pub fn delete_content(&self, cancel: &CancelToken, id: &ContentId) -> Result<()> {
        cancel.check()?;
        let mut st = self.pending.lock().unwrap();

        let info = match st.uncommitted.get(id) {
            Some(info) => info.clone(),
            None => self
                .index
                .committed()
                .get(id)
                .cloned()
                .ok_or(CaskError::ContentNotFound(*id))?,
        };
        if info.deleted {
            return Ok(());
        }

        // Strictly newer than the live entry, so the tombstone wins the merge
        // even against a same-second write.
        let timestamp = self.next_timestamp().max(info.timestamp_seconds + 1);
        st.uncommitted.insert(
            *id,
            ContentInfo {
                deleted: true,
                timestamp_seconds: timestamp,
                ..info
            },
        );
        Ok(())
    }

    /// Seal and upload all pending packs, then commit every not-yet-indexed
    /// entry as one index blob in the current epoch.
    ///
    /// Contents are durable only after this returns. On failure before index
    /// emission, already-written packs are orphaned (collected by future
    /// maintenance) and the error is surfaced.
    pub fn flush(&self, cancel: &CancelToken) -> Result<()> {
        let _serialize = self.flush_lock.lock().unwrap();
        cancel.check()?;

        let mut to_upload: Vec<(BlobId, PackKind)> = Vec::new();
        let entries: Vec<ContentInfo>;
        {
            let mut st = self.pending.lock().unwrap();
            for kind in [PackKind::Regular, PackKind::Special] {
                let builder = st.builder_mut(kind);
                if !builder.is_empty() {
                    let blob_id = self.seal_locked(builder)?;
                    to_upload.push((blob_id, kind));
                }
            }
            entries = st.uncommitted.values().cloned().collect();
        }

        for (blob_id, kind) in to_upload {
            self.upload_pack(cancel, blob_id, kind)?;
        }

        // Re-drive uploads that failed in earlier write calls; their entries
        // are still uncommitted and their bytes still in flight.
        let leftover: Vec<BlobId> = self
            .in_flight_packs
            .lock()
            .unwrap()
            .keys()
            .cloned()
            .collect();
        for blob_id in leftover {
            let kind = if blob_id.has_prefix("q") {
                PackKind::Special
            } else {
                PackKind::Regular
            };
            self.upload_pack(cancel, blob_id, kind)?;
        }

        if entries.is_empty() {
            return Ok(());
        }
        self.index.commit_entries(cancel, &entries)?;

        let mut st = self.pending.lock().unwrap();
        for entry in &entries {
            // Only clear entries that were not superseded mid-flush (e.g. a
            // tombstone written while the index blob was uploading).
            if st.uncommitted.get(&entry.content_id) == Some(entry) {
                st.uncommitted.remove(&entry.content_id);
            }
        }
        Ok(())
    }

    /// Re-list and re-merge committed indexes, picking up flushes from other
    /// processes (subject to the store's list-after-write consistency).
    pub fn refresh(&self, cancel: &CancelToken) -> Result<()> {
        self.index.load(cancel)
    }

    /// Iterate all known contents (committed view overlaid with local
    /// uncommitted entries), in content-ID order per source.
    pub fn iterate_contents(
        &self,
        opts: IterateOptions,
        callback: &mut dyn FnMut(&ContentInfo) -> Result<()>,
    ) -> Result<()> {
        let uncommitted: Vec<ContentInfo> = {
            let st = self.pending.lock().unwrap();
            let mut v: Vec<ContentInfo> = st.uncommitted.values().cloned().collect();
            v.sort_by_key(|e| e.content_id);
            v
        };
        let uncommitted_ids: std::collections::HashSet<ContentId> =
            uncommitted.iter().map(|e| e.content_id).collect();

        let committed = self.index.committed();
        for (id, info) in committed.iter() {
            if uncommitted_ids.contains(id) {
                continue;
            }
            if info.deleted && !opts.include_deleted {
                continue;
            }
            callback(info)?;
        }
        for info in &uncommitted {
            if info.deleted && !opts.include_deleted {
                continue;
            }
            callback(info)?;
        }
        Ok(())
    }
}
