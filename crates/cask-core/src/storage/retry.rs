use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;
use crate::storage::{BlobId, BlobMetadata, BlobStore, PutOptions};
use crate::trace::CancelToken;

/// Retry configuration for the blob-store retry wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = no retries).
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    /// Initial delay between retries in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

fn default_max_retries() -> usize {
    10
}

fn default_retry_delay_ms() -> u64 {
    100
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

/// Decorator that retries transient failures of the wrapped store with
/// exponential backoff + jitter.
///
/// `BlobNotFound`, `BlobAlreadyExists`, `InvalidRange` and `Cancelled` are
/// never retried; fatal errors propagate unchanged.
pub struct RetryingStore {
    inner: Arc<dyn BlobStore>,
    config: RetryConfig,
}

impl RetryingStore {
    pub fn new(inner: Arc<dyn BlobStore>, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    fn retry_call<T>(
        &self,
        cancel: &CancelToken,
        op_name: &str,
        f: impl Fn() -> Result<T>,
    ) -> Result<T> {
        let mut delay_ms = self.config.retry_delay_ms;
        let mut last_err = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let jitter = rand::random::<u64>() % delay_ms.max(1);
                std::thread::sleep(Duration::from_millis(delay_ms + jitter));
                delay_ms = (delay_ms * 2).min(self.config.retry_max_delay_ms);
            }
            cancel.check()?;
            match f() {
                Ok(val) => return Ok(val),
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    warn!(
                        "{op_name}: transient error (attempt {}/{}), retrying: {e}",
                        attempt + 1,
                        self.config.max_retries,
                    );
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap())
    }
}

impl BlobStore for RetryingStore {
    fn get_blob(
        &self,
        cancel: &CancelToken,
        id: &BlobId,
        offset: u64,
        length: Option<u64>,
    ) -> Result<Vec<u8>> {
        self.retry_call(cancel, "get-blob", || {
            self.inner.get_blob(cancel, id, offset, length)
        })
    }

    fn get_metadata(&self, cancel: &CancelToken, id: &BlobId) -> Result<BlobMetadata> {
        self.retry_call(cancel, "get-metadata", || self.inner.get_metadata(cancel, id))
    }

    fn put_blob(
        &self,
        cancel: &CancelToken,
        id: &BlobId,
        data: &[u8],
        opts: &PutOptions,
    ) -> Result<()> {
        self.retry_call(cancel, "put-blob", || {
            self.inner.put_blob(cancel, id, data, opts)
        })
    }

    fn delete_blob(&self, cancel: &CancelToken, id: &BlobId) -> Result<()> {
        self.retry_call(cancel, "delete-blob", || self.inner.delete_blob(cancel, id))
    }

    fn extend_blob_retention(
        &self,
        cancel: &CancelToken,
        id: &BlobId,
        period: Duration,
    ) -> Result<()> {
        self.retry_call(cancel, "extend-retention", || {
            self.inner.extend_blob_retention(cancel, id, period)
        })
    }

    fn list_blobs(
        &self,
        cancel: &CancelToken,
        prefix: &str,
        callback: &mut dyn FnMut(&BlobMetadata) -> Result<()>,
    ) -> Result<()> {
        // Listing is not retried as a whole: the callback may have observed
        // part of the result already. Transient failures surface to the
        // caller, which re-lists from scratch.
        cancel.check()?;
        self.inner.list_blobs(cancel, prefix, callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CaskError;
    use crate::storage::memory_store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Store that fails each operation a fixed number of times first.
    struct FlakyStore {
        inner: MemoryStore,
        failures_left: AtomicUsize,
    }

    impl FlakyStore {
        fn new(failures: usize) -> Self {
            Self {
                inner: MemoryStore::new(),
                failures_left: AtomicUsize::new(failures),
            }
        }

        fn maybe_fail(&self) -> Result<()> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(CaskError::Transient("injected".into()));
            }
            Ok(())
        }
    }

    impl BlobStore for FlakyStore {
        fn get_blob(
            &self,
            cancel: &CancelToken,
            id: &BlobId,
            offset: u64,
            length: Option<u64>,
        ) -> Result<Vec<u8>> {
            self.maybe_fail()?;
            self.inner.get_blob(cancel, id, offset, length)
        }

        fn get_metadata(&self, cancel: &CancelToken, id: &BlobId) -> Result<BlobMetadata> {
            self.maybe_fail()?;
            self.inner.get_metadata(cancel, id)
        }

        fn put_blob(
            &self,
            cancel: &CancelToken,
            id: &BlobId,
            data: &[u8],
            opts: &PutOptions,
        ) -> Result<()> {
            self.maybe_fail()?;
            self.inner.put_blob(cancel, id, data, opts)
        }

        fn delete_blob(&self, cancel: &CancelToken, id: &BlobId) -> Result<()> {
            self.maybe_fail()?;
            self.inner.delete_blob(cancel, id)
        }

        fn list_blobs(
            &self,
            cancel: &CancelToken,
            prefix: &str,
            callback: &mut dyn FnMut(&BlobMetadata) -> Result<()>,
        ) -> Result<()> {
            self.inner.list_blobs(cancel, prefix, callback)
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_retries: 5,
            retry_delay_ms: 1,
            retry_max_delay_ms: 2,
        }
    }

    fn bid(s: &str) -> BlobId {
        BlobId::new(s).unwrap()
    }

    #[test]
    fn transient_errors_are_retried() {
        let st = RetryingStore::new(Arc::new(FlakyStore::new(3)), fast_retry());
        let cancel = CancelToken::new();
        st.put_blob(&cancel, &bid("pa"), b"data", &PutOptions::default())
            .unwrap();
        assert_eq!(st.get_blob(&cancel, &bid("pa"), 0, None).unwrap(), b"data");
    }

    #[test]
    fn retries_are_bounded() {
        let st = RetryingStore::new(Arc::new(FlakyStore::new(100)), fast_retry());
        let cancel = CancelToken::new();
        assert!(matches!(
            st.put_blob(&cancel, &bid("pa"), b"data", &PutOptions::default()),
            Err(CaskError::Transient(_))
        ));
    }

    #[test]
    fn not_found_is_not_retried() {
        let flaky = Arc::new(FlakyStore::new(0));
        let st = RetryingStore::new(flaky.clone(), fast_retry());
        let cancel = CancelToken::new();
        assert!(matches!(
            st.get_blob(&cancel, &bid("pmissing"), 0, None),
            Err(CaskError::BlobNotFound(_))
        ));
        // No failures consumed: the error path never looped.
        assert_eq!(flaky.failures_left.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn already_exists_is_not_retried() {
        let st = RetryingStore::new(Arc::new(FlakyStore::new(0)), fast_retry());
        let cancel = CancelToken::new();
        let opts = PutOptions {
            do_not_recreate: true,
            ..Default::default()
        };
        st.put_blob(&cancel, &bid("n5"), b"v", &opts).unwrap();
        assert!(matches!(
            st.put_blob(&cancel, &bid("n5"), b"v", &opts),
            Err(CaskError::BlobAlreadyExists(_))
        ));
    }

    #[test]
    fn cancellation_stops_retrying() {
        let st = RetryingStore::new(Arc::new(FlakyStore::new(100)), fast_retry());
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(matches!(
            st.get_metadata(&cancel, &bid("pa")),
            Err(CaskError::Cancelled)
        ));
    }
}
