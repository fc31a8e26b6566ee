use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{CaskError, Result};
use crate::storage::{BlobId, BlobMetadata, BlobStore, PutOptions};
use crate::trace::CancelToken;

type Clock = Box<dyn Fn() -> DateTime<Utc> + Send + Sync>;

struct StoredBlob {
    data: Vec<u8>,
    timestamp: DateTime<Utc>,
}

/// In-memory blob store. Thread-safe via a mutex around a sorted map.
///
/// Records a per-blob timestamp from an injectable clock so tests can
/// exercise time-dependent behavior (epoch ages, safety windows).
pub struct MemoryStore {
    blobs: Mutex<BTreeMap<BlobId, StoredBlob>>,
    clock: Clock,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Box::new(Utc::now))
    }

    pub fn with_clock(clock: Clock) -> Self {
        Self {
            blobs: Mutex::new(BTreeMap::new()),
            clock,
        }
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BlobStore for MemoryStore {
    fn get_blob(
        &self,
        cancel: &CancelToken,
        id: &BlobId,
        offset: u64,
        length: Option<u64>,
    ) -> Result<Vec<u8>> {
        cancel.check()?;
        let map = self.blobs.lock().unwrap();
        let blob = map
            .get(id)
            .ok_or_else(|| CaskError::BlobNotFound(id.clone()))?;

        let size = blob.data.len() as u64;
        let wanted = match length {
            Some(l) => l,
            None => size.saturating_sub(offset),
        };
        if offset + wanted > size {
            return Err(CaskError::InvalidRange {
                id: id.clone(),
                offset,
                length: wanted,
            });
        }
        Ok(blob.data[offset as usize..(offset + wanted) as usize].to_vec())
    }

    fn get_metadata(&self, cancel: &CancelToken, id: &BlobId) -> Result<BlobMetadata> {
        cancel.check()?;
        let map = self.blobs.lock().unwrap();
        let blob = map
            .get(id)
            .ok_or_else(|| CaskError::BlobNotFound(id.clone()))?;
        Ok(BlobMetadata {
            id: id.clone(),
            length: blob.data.len() as u64,
            timestamp: blob.timestamp,
        })
    }

    fn put_blob(
        &self,
        cancel: &CancelToken,
        id: &BlobId,
        data: &[u8],
        opts: &PutOptions,
    ) -> Result<()> {
        cancel.check()?;
        let mut map = self.blobs.lock().unwrap();
        if opts.do_not_recreate && map.contains_key(id) {
            return Err(CaskError::BlobAlreadyExists(id.clone()));
        }
        let timestamp = opts.set_mod_time.unwrap_or_else(|| self.now());
        map.insert(
            id.clone(),
            StoredBlob {
                data: data.to_vec(),
                timestamp,
            },
        );
        Ok(())
    }

    fn delete_blob(&self, cancel: &CancelToken, id: &BlobId) -> Result<()> {
        cancel.check()?;
        self.blobs.lock().unwrap().remove(id);
        Ok(())
    }

    fn extend_blob_retention(
        &self,
        cancel: &CancelToken,
        id: &BlobId,
        _period: Duration,
    ) -> Result<()> {
        cancel.check()?;
        let map = self.blobs.lock().unwrap();
        if !map.contains_key(id) {
            return Err(CaskError::BlobNotFound(id.clone()));
        }
        Ok(())
    }

    fn list_blobs(
        &self,
        cancel: &CancelToken,
        prefix: &str,
        callback: &mut dyn FnMut(&BlobMetadata) -> Result<()>,
    ) -> Result<()> {
        cancel.check()?;
        // Snapshot the matching metadata first so the callback never runs
        // under the map lock.
        let matches: Vec<BlobMetadata> = {
            let map = self.blobs.lock().unwrap();
            map.iter()
                .filter(|(id, _)| id.as_str().starts_with(prefix))
                .map(|(id, blob)| BlobMetadata {
                    id: id.clone(),
                    length: blob.data.len() as u64,
                    timestamp: blob.timestamp,
                })
                .collect()
        };
        for m in &matches {
            cancel.check()?;
            callback(m)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::list_all_blobs;

    fn bid(s: &str) -> BlobId {
        BlobId::new(s).unwrap()
    }

    #[test]
    fn put_get_delete() {
        let st = MemoryStore::new();
        let cancel = CancelToken::new();
        st.put_blob(&cancel, &bid("pa"), b"abc", &PutOptions::default())
            .unwrap();
        assert_eq!(st.get_blob(&cancel, &bid("pa"), 1, Some(2)).unwrap(), b"bc");
        st.delete_blob(&cancel, &bid("pa")).unwrap();
        assert!(matches!(
            st.get_blob(&cancel, &bid("pa"), 0, None),
            Err(CaskError::BlobNotFound(_))
        ));
        // Deleting again is still success.
        st.delete_blob(&cancel, &bid("pa")).unwrap();
    }

    #[test]
    fn do_not_recreate_refuses_overwrite() {
        let st = MemoryStore::new();
        let cancel = CancelToken::new();
        let opts = PutOptions {
            do_not_recreate: true,
            ..Default::default()
        };
        st.put_blob(&cancel, &bid("n0"), b"v1", &opts).unwrap();
        assert!(matches!(
            st.put_blob(&cancel, &bid("n0"), b"v2", &opts),
            Err(CaskError::BlobAlreadyExists(_))
        ));
    }

    #[test]
    fn list_is_sorted_and_prefix_filtered() {
        let st = MemoryStore::new();
        let cancel = CancelToken::new();
        for id in ["x1_b", "x0_a", "p0", "n1"] {
            st.put_blob(&cancel, &bid(id), b"d", &PutOptions::default())
                .unwrap();
        }
        let got: Vec<String> = list_all_blobs(&st, &cancel, "x")
            .unwrap()
            .into_iter()
            .map(|m| m.id.as_str().to_string())
            .collect();
        assert_eq!(got, vec!["x0_a", "x1_b"]);
    }

    #[test]
    fn clock_controls_timestamps() {
        use std::sync::atomic::{AtomicI64, Ordering};
        use std::sync::Arc;

        let tick = Arc::new(AtomicI64::new(1_000));
        let tick2 = tick.clone();
        let st = MemoryStore::with_clock(Box::new(move || {
            DateTime::from_timestamp(tick2.fetch_add(60, Ordering::SeqCst), 0).unwrap()
        }));
        let cancel = CancelToken::new();

        st.put_blob(&cancel, &bid("pa"), b"1", &PutOptions::default())
            .unwrap();
        st.put_blob(&cancel, &bid("pb"), b"2", &PutOptions::default())
            .unwrap();

        let a = st.get_metadata(&cancel, &bid("pa")).unwrap().timestamp;
        let b = st.get_metadata(&cancel, &bid("pb")).unwrap().timestamp;
        assert!(b > a);
    }
}
