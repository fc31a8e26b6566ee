use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{CaskError, Result};
use crate::storage::{BlobId, BlobStore, PutOptions, MAINTENANCE_LOCK_BLOB_ID};
use crate::trace::CancelToken;

/// A lock older than this is considered abandoned and broken automatically.
const STALE_LOCK_SECS: i64 = 6 * 60 * 60;

/// Contents of the maintenance lock blob.
#[derive(Debug, Serialize, Deserialize)]
struct LockHolder {
    hostname: String,
    pid: u32,
    time: String,
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".into())
}

fn lock_blob_id() -> BlobId {
    BlobId::new(MAINTENANCE_LOCK_BLOB_ID).expect("valid lock blob id")
}

/// Handle to the acquired repository-wide maintenance lock.
///
/// Released by deleting the lock blob; `release` reports failures, while
/// drop-without-release falls back to a best-effort delete so the lock is
/// freed on every exit path.
pub struct MaintenanceLockGuard {
    store: Arc<dyn BlobStore>,
    released: bool,
}

impl MaintenanceLockGuard {
    pub fn release(mut self, cancel: &CancelToken) -> Result<()> {
        self.released = true;
        self.store.delete_blob(cancel, &lock_blob_id())
    }
}

impl Drop for MaintenanceLockGuard {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.store.delete_blob(&CancelToken::new(), &lock_blob_id()) {
                warn!("failed to release maintenance lock: {e}");
            }
        }
    }
}

/// Acquire the repository-wide maintenance lock (`cask.maintenance`).
///
/// Only one maintainer may hold it at a time; contention returns `Locked`
/// naming the current holder. A stale lock (> 6 h) is broken and re-acquired.
pub fn acquire_maintenance_lock(
    store: Arc<dyn BlobStore>,
    cancel: &CancelToken,
) -> Result<MaintenanceLockGuard> {
    let id = lock_blob_id();
    let holder = LockHolder {
        hostname: hostname(),
        pid: std::process::id(),
        time: Utc::now().to_rfc3339(),
    };
    let data = serde_json::to_vec(&holder)
        .map_err(|e| CaskError::Other(format!("lock serialize: {e}")))?;
    let opts = PutOptions {
        do_not_recreate: true,
        ..Default::default()
    };

    for attempt in 0..2 {
        match store.put_blob(cancel, &id, &data, &opts) {
            Ok(()) => {
                debug!(host = %holder.hostname, pid = holder.pid, "acquired maintenance lock");
                return Ok(MaintenanceLockGuard {
                    store,
                    released: false,
                });
            }
            Err(CaskError::BlobAlreadyExists(_)) => {
                if attempt == 0 && break_stale_lock(&*store, cancel)? {
                    continue;
                }
                return Err(CaskError::Locked(describe_holder(&*store, cancel)));
            }
            Err(e) => return Err(e),
        }
    }
    Err(CaskError::Locked(describe_holder(&*store, cancel)))
}

/// Run `f` while holding the maintenance lock, releasing it on every path.
pub fn with_maintenance_lock<T>(
    store: Arc<dyn BlobStore>,
    cancel: &CancelToken,
    f: impl FnOnce() -> Result<T>,
) -> Result<T> {
    let guard = acquire_maintenance_lock(store, cancel)?;
    let result = f();
    // Release even when `f` failed; keep the original error if both fail.
    let release_result = guard.release(&CancelToken::new());
    match (result, release_result) {
        (Ok(v), Ok(())) => Ok(v),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), _) => Err(e),
    }
}

/// Delete the lock blob when its holder entry is older than the stale
/// threshold. Returns whether a lock was broken.
fn break_stale_lock(store: &dyn BlobStore, cancel: &CancelToken) -> Result<bool> {
    let id = lock_blob_id();
    let data = match store.get_blob(cancel, &id, 0, None) {
        Ok(d) => d,
        // Holder vanished between the failed put and now.
        Err(CaskError::BlobNotFound(_)) => return Ok(true),
        Err(e) => return Err(e),
    };

    let holder: LockHolder = match serde_json::from_slice(&data) {
        Ok(h) => h,
        Err(_) => return Ok(false),
    };
    let acquired = match chrono::DateTime::parse_from_rfc3339(&holder.time) {
        Ok(t) => t.with_timezone(&Utc),
        Err(_) => return Ok(false),
    };

    if Utc::now().signed_duration_since(acquired) > Duration::seconds(STALE_LOCK_SECS) {
        warn!(host = %holder.hostname, pid = holder.pid, "breaking stale maintenance lock");
        store.delete_blob(cancel, &id)?;
        return Ok(true);
    }
    Ok(false)
}

fn describe_holder(store: &dyn BlobStore, cancel: &CancelToken) -> String {
    match store.get_blob(cancel, &lock_blob_id(), 0, None) {
        Ok(data) => match serde_json::from_slice::<LockHolder>(&data) {
            Ok(h) => format!("{}:{}", h.hostname, h.pid),
            Err(_) => "unknown".into(),
        },
        Err(_) => "unknown".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory_store::MemoryStore;

    #[test]
    fn lock_is_exclusive() {
        let store: Arc<dyn BlobStore> = Arc::new(MemoryStore::new());
        let cancel = CancelToken::new();

        let guard = acquire_maintenance_lock(store.clone(), &cancel).unwrap();
        assert!(matches!(
            acquire_maintenance_lock(store.clone(), &cancel),
            Err(CaskError::Locked(_))
        ));

        guard.release(&cancel).unwrap();
        acquire_maintenance_lock(store, &cancel)
            .unwrap()
            .release(&cancel)
            .unwrap();
    }

    #[test]
    fn drop_releases_lock() {
        let store: Arc<dyn BlobStore> = Arc::new(MemoryStore::new());
        let cancel = CancelToken::new();
        {
            let _guard = acquire_maintenance_lock(store.clone(), &cancel).unwrap();
        }
        acquire_maintenance_lock(store, &cancel)
            .unwrap()
            .release(&cancel)
            .unwrap();
    }

    #[test]
    fn stale_lock_is_broken() {
        let store: Arc<dyn BlobStore> = Arc::new(MemoryStore::new());
        let cancel = CancelToken::new();

        let stale = LockHolder {
            hostname: "elsewhere".into(),
            pid: 12345,
            time: (Utc::now() - Duration::seconds(STALE_LOCK_SECS + 60)).to_rfc3339(),
        };
        store
            .put_blob(
                &cancel,
                &lock_blob_id(),
                &serde_json::to_vec(&stale).unwrap(),
                &PutOptions::default(),
            )
            .unwrap();

        acquire_maintenance_lock(store, &cancel)
            .unwrap()
            .release(&cancel)
            .unwrap();
    }

    #[test]
    fn with_lock_releases_on_error() {
        let store: Arc<dyn BlobStore> = Arc::new(MemoryStore::new());
        let cancel = CancelToken::new();

        let result: Result<()> = with_maintenance_lock(store.clone(), &cancel, || {
            Err(CaskError::Other("boom".into()))
        });
        assert!(result.is_err());

        // The failing closure must not leave the lock behind.
        acquire_maintenance_lock(store, &cancel)
            .unwrap()
            .release(&cancel)
            .unwrap();
    }
}
