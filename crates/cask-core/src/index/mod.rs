pub mod epoch;

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::compress::{self, Compression};
use crate::crypto::content_id::{ContentId, CONTENT_ID_LEN};
use crate::error::{CaskError, Result};
use crate::format::{FormatProvider, ObjectType, INDEX_VERSION_2};
use crate::index::epoch::EpochManager;
use crate::storage::{BlobId, BlobStore};
use crate::trace::CancelToken;

/// Wire length of a pack blob ID: 1 prefix char + 32 hex chars.
pub const PACK_ID_WIRE_LEN: usize = 33;

/// Fixed wire length of a version-2 index entry.
pub const INDEX_ENTRY_LEN: usize = CONTENT_ID_LEN + PACK_ID_WIRE_LEN + 4 + 4 + 8 + 1 + 1;

const FLAG_DELETED: u8 = 0x01;
const FLAG_COMPRESSED: u8 = 0x02;

const TRAILER_LEN: usize = 7;

/// One index entry: where a content lives and whether it is deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentInfo {
    pub content_id: ContentId,
    pub pack_blob_id: BlobId,
    pub pack_offset: u32,
    pub length: u32,
    pub timestamp_seconds: i64,
    pub deleted: bool,
    pub compressed: bool,
    pub format_version: u8,
}

impl ContentInfo {
    fn encode_into(&self, out: &mut Vec<u8>) -> Result<()> {
        let pack = self.pack_blob_id.as_str().as_bytes();
        if pack.len() != PACK_ID_WIRE_LEN {
            return Err(CaskError::InvalidFormat(format!(
                "pack blob id '{}' is not {PACK_ID_WIRE_LEN} bytes",
                self.pack_blob_id
            )));
        }
        out.extend_from_slice(&self.content_id.to_bytes());
        out.extend_from_slice(pack);
        out.extend_from_slice(&self.pack_offset.to_le_bytes());
        out.extend_from_slice(&self.length.to_le_bytes());
        out.extend_from_slice(&self.timestamp_seconds.to_le_bytes());
        let mut flags = 0u8;
        if self.deleted {
            flags |= FLAG_DELETED;
        }
        if self.compressed {
            flags |= FLAG_COMPRESSED;
        }
        out.push(flags);
        out.push(self.format_version);
        Ok(())
    }

    fn decode(entry: &[u8]) -> Result<Self> {
        let content_id = ContentId::from_bytes(&entry[..CONTENT_ID_LEN])?;
        let mut pos = CONTENT_ID_LEN;

        let pack_str = std::str::from_utf8(&entry[pos..pos + PACK_ID_WIRE_LEN])
            .map_err(|_| CaskError::CorruptData("index entry pack id is not UTF-8".into()))?;
        let pack_blob_id = BlobId::new(pack_str)?;
        pos += PACK_ID_WIRE_LEN;

        let pack_offset = u32::from_le_bytes(entry[pos..pos + 4].try_into().unwrap());
        pos += 4;
        let length = u32::from_le_bytes(entry[pos..pos + 4].try_into().unwrap());
        pos += 4;
        let timestamp_seconds = i64::from_le_bytes(entry[pos..pos + 8].try_into().unwrap());
        pos += 8;
        let flags = entry[pos];
        let format_version = entry[pos + 1];

        Ok(Self {
            content_id,
            pack_blob_id,
            pack_offset,
            length,
            timestamp_seconds,
            deleted: flags & FLAG_DELETED != 0,
            compressed: flags & FLAG_COMPRESSED != 0,
            format_version,
        })
    }
}

/// Serialize entries into the version-2 index wire format: fixed-width
/// entries sorted ascending by content ID, then a trailer
/// `[version u8][entry_size u16][entry_count u32]` and one final byte
/// holding the trailer length.
pub fn encode_index(entries: &[ContentInfo]) -> Result<Vec<u8>> {
    let mut sorted: Vec<&ContentInfo> = entries.iter().collect();
    sorted.sort_by_key(|e| e.content_id);

    let mut out = Vec::with_capacity(sorted.len() * INDEX_ENTRY_LEN + TRAILER_LEN + 1);
    for entry in sorted {
        entry.encode_into(&mut out)?;
    }
    out.push(INDEX_VERSION_2);
    out.extend_from_slice(&(INDEX_ENTRY_LEN as u16).to_le_bytes());
    out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    out.push(TRAILER_LEN as u8);
    Ok(out)
}

/// Parse an index payload produced by [`encode_index`].
pub fn decode_index(data: &[u8]) -> Result<Vec<ContentInfo>> {
    if data.len() < TRAILER_LEN + 1 {
        return Err(CaskError::CorruptData("index blob too short".into()));
    }
    let trailer_len = data[data.len() - 1] as usize;
    if trailer_len != TRAILER_LEN || data.len() < trailer_len + 1 {
        return Err(CaskError::CorruptData("invalid index trailer".into()));
    }

    let trailer = &data[data.len() - 1 - trailer_len..data.len() - 1];
    let version = trailer[0];
    if version != INDEX_VERSION_2 {
        return Err(CaskError::CorruptData(format!(
            "unsupported index version: {version}"
        )));
    }
    let entry_size = u16::from_le_bytes(trailer[1..3].try_into().unwrap()) as usize;
    let count = u32::from_le_bytes(trailer[3..7].try_into().unwrap()) as usize;

    if entry_size != INDEX_ENTRY_LEN || data.len() != count * entry_size + trailer_len + 1 {
        return Err(CaskError::CorruptData("index blob length mismatch".into()));
    }

    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        entries.push(ContentInfo::decode(&data[i * entry_size..(i + 1) * entry_size])?);
    }
    Ok(entries)
}

/// Whether `candidate` supersedes `current` for the same content ID:
/// newest timestamp wins; on ties a live entry beats a tombstone, then the
/// lexicographically greater pack ID wins.
pub fn supersedes(candidate: &ContentInfo, current: &ContentInfo) -> bool {
    if candidate.timestamp_seconds != current.timestamp_seconds {
        return candidate.timestamp_seconds > current.timestamp_seconds;
    }
    if candidate.deleted != current.deleted {
        return !candidate.deleted;
    }
    candidate.pack_blob_id > current.pack_blob_id
}

/// Merge `entry` into `map` under the read-path rules.
pub fn merge_entry(map: &mut BTreeMap<ContentId, ContentInfo>, entry: ContentInfo) {
    match map.get(&entry.content_id) {
        Some(current) if !supersedes(&entry, current) => {}
        _ => {
            map.insert(entry.content_id, entry);
        }
    }
}

/// The merged, committed view of all live index blobs.
///
/// Readers receive an immutable `Arc` snapshot and never hold a lock while
/// resolving contents; the snapshot is swapped atomically on load and after
/// each local commit.
pub struct IndexManager {
    store: Arc<dyn BlobStore>,
    format: Arc<FormatProvider>,
    epochs: EpochManager,
    committed: RwLock<Arc<BTreeMap<ContentId, ContentInfo>>>,
}

impl IndexManager {
    pub fn new(store: Arc<dyn BlobStore>, format: Arc<FormatProvider>, epochs: EpochManager) -> Self {
        Self {
            store,
            format,
            epochs,
            committed: RwLock::new(Arc::new(BTreeMap::new())),
        }
    }

    pub fn epochs(&self) -> &EpochManager {
        &self.epochs
    }

    /// Current committed snapshot.
    pub fn committed(&self) -> Arc<BTreeMap<ContentId, ContentInfo>> {
        self.committed.read().unwrap().clone()
    }

    /// Re-list and re-merge all live index blobs, replacing the snapshot.
    pub fn load(&self, cancel: &CancelToken) -> Result<()> {
        let blobs = self.epochs.list_index_blobs(cancel)?;
        let read_set = epoch::select_read_set(blobs);

        let mut map = BTreeMap::new();
        for info in &read_set {
            cancel.check()?;
            for entry in self.read_index_blob(cancel, &info.metadata.id)? {
                merge_entry(&mut map, entry);
            }
        }
        debug!(
            blobs = read_set.len(),
            entries = map.len(),
            "loaded committed index"
        );
        *self.committed.write().unwrap() = Arc::new(map);
        Ok(())
    }

    /// Decode a single index blob.
    pub fn read_index_blob(&self, cancel: &CancelToken, id: &BlobId) -> Result<Vec<ContentInfo>> {
        let sealed = self.store.get_blob(cancel, id, 0, None)?;
        let compressed = self.format.open_envelope(ObjectType::IndexBlob, &sealed)?;
        let payload = compress::decompress(&compressed)?;
        decode_index(&payload)
    }

    /// Encode and seal `entries` into a payload ready to be written as an
    /// index blob.
    pub fn seal_index_payload(&self, entries: &[ContentInfo]) -> Result<Vec<u8>> {
        let encoded = encode_index(entries)?;
        let compressed = compress::compress(Compression::Zstd { level: 3 }, &encoded)?;
        self.format
            .seal_envelope(ObjectType::IndexBlob, &compressed)
    }

    /// Write one index blob carrying `entries` into the current epoch, then
    /// fold the entries into the committed snapshot (read-your-writes without
    /// waiting for the store's listing to catch up).
    pub fn commit_entries(&self, cancel: &CancelToken, entries: &[ContentInfo]) -> Result<BlobId> {
        let payload = self.seal_index_payload(entries)?;
        let (blob_id, epoch) = self.epochs.write_index_blob(cancel, &payload)?;
        debug!(blob = %blob_id, epoch, entries = entries.len(), "wrote index blob");

        let mut guard = self.committed.write().unwrap();
        let mut map = (**guard).clone();
        for entry in entries {
            merge_entry(&mut map, entry.clone());
        }
        *guard = Arc::new(map);
        Ok(blob_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid(tag: &[u8]) -> ContentId {
        ContentId::compute(b"secret", None, tag).unwrap()
    }

    fn pack_id(byte: u8) -> BlobId {
        BlobId::new(format!("p{}", hex::encode([byte; 16]))).unwrap()
    }

    fn info(tag: &[u8], ts: i64, deleted: bool) -> ContentInfo {
        ContentInfo {
            content_id: cid(tag),
            pack_blob_id: pack_id(7),
            pack_offset: 16,
            length: 42,
            timestamp_seconds: ts,
            deleted,
            compressed: false,
            format_version: 2,
        }
    }

    #[test]
    fn wire_roundtrip() {
        let entries = vec![
            info(b"b", 100, false),
            info(b"a", 101, true),
            ContentInfo {
                compressed: true,
                ..info(b"c", 102, false)
            },
        ];
        let encoded = encode_index(&entries).unwrap();
        assert_eq!(encoded.len(), 3 * INDEX_ENTRY_LEN + TRAILER_LEN + 1);

        let mut decoded = decode_index(&encoded).unwrap();
        decoded.sort_by_key(|e| e.timestamp_seconds);
        let mut expected = entries.clone();
        expected.sort_by_key(|e| e.timestamp_seconds);
        assert_eq!(decoded, expected);
    }

    #[test]
    fn decode_is_sorted_by_content_id() {
        let entries = vec![info(b"z", 1, false), info(b"a", 2, false), info(b"m", 3, false)];
        let decoded = decode_index(&encode_index(&entries).unwrap()).unwrap();
        let mut ids: Vec<ContentId> = decoded.iter().map(|e| e.content_id).collect();
        let sorted = {
            let mut s = ids.clone();
            s.sort();
            s
        };
        assert_eq!(ids, sorted);
        ids.dedup();
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn decode_rejects_truncation_and_bad_version() {
        let encoded = encode_index(&[info(b"a", 1, false)]).unwrap();
        assert!(decode_index(&encoded[..encoded.len() - 2]).is_err());

        let mut bad_version = encoded.clone();
        let idx = bad_version.len() - 1 - TRAILER_LEN;
        bad_version[idx] = 9;
        assert!(decode_index(&bad_version).is_err());
    }

    #[test]
    fn newest_timestamp_wins() {
        let older = info(b"a", 100, false);
        let newer = info(b"a", 200, true);
        assert!(supersedes(&newer, &older));
        assert!(!supersedes(&older, &newer));

        let mut map = BTreeMap::new();
        merge_entry(&mut map, older.clone());
        merge_entry(&mut map, newer.clone());
        assert!(map[&older.content_id].deleted);

        // Order independence.
        let mut map = BTreeMap::new();
        merge_entry(&mut map, newer.clone());
        merge_entry(&mut map, older);
        assert!(map[&newer.content_id].deleted);
    }

    #[test]
    fn live_wins_timestamp_tie() {
        let tombstone = info(b"a", 100, true);
        let live = info(b"a", 100, false);
        assert!(supersedes(&live, &tombstone));
        assert!(!supersedes(&tombstone, &live));
    }

    #[test]
    fn pack_id_breaks_remaining_ties() {
        let a = ContentInfo {
            pack_blob_id: pack_id(1),
            ..info(b"a", 100, false)
        };
        let b = ContentInfo {
            pack_blob_id: pack_id(2),
            ..info(b"a", 100, false)
        };
        assert!(supersedes(&b, &a));
        assert!(!supersedes(&a, &b));
    }
}
