use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::format::{FormatProvider, MutableParameters};
use crate::index::epoch::Clock;
use crate::repo::{WriteManager, WriteManagerOptions};
use crate::storage::memory_store::MemoryStore;
use crate::storage::retry::RetryConfig;
use crate::storage::BlobStore;
use crate::trace::CancelToken;

/// Deterministic time source: starts at 2000-01-01 and advances one second
/// per observation, so every timestamp-sensitive code path sees strictly
/// increasing time without sleeping.
#[derive(Clone)]
pub struct TestClock {
    seconds: Arc<AtomicI64>,
}

impl TestClock {
    const BASE: i64 = 946_684_800; // 2000-01-01T00:00:00Z

    pub fn new() -> Self {
        Self {
            seconds: Arc::new(AtomicI64::new(Self::BASE)),
        }
    }

    pub fn clock(&self) -> Clock {
        let seconds = self.seconds.clone();
        Arc::new(move || {
            DateTime::<Utc>::from_timestamp(seconds.fetch_add(1, Ordering::SeqCst), 0).unwrap()
        })
    }

    pub fn advance_secs(&self, secs: i64) {
        self.seconds.fetch_add(secs, Ordering::SeqCst);
    }

    pub fn now(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(self.seconds.load(Ordering::SeqCst), 0).unwrap()
    }
}

/// A repository over an in-memory store with a deterministic clock.
pub struct TestRepo {
    pub store: Arc<MemoryStore>,
    pub format: Arc<FormatProvider>,
    pub manager: WriteManager,
    pub clock: TestClock,
    pub cancel: CancelToken,
}

pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_retries: 2,
        retry_delay_ms: 1,
        retry_max_delay_ms: 2,
    }
}

/// Parameters sized for tests: small packs, plus whatever the caller tweaks.
pub fn small_params() -> MutableParameters {
    MutableParameters {
        max_pack_size: 1024 * 1024,
        ..Default::default()
    }
}

pub fn test_repo() -> TestRepo {
    test_repo_with_params(small_params())
}

pub fn test_repo_with_params(params: MutableParameters) -> TestRepo {
    let clock = TestClock::new();
    let store = Arc::new(MemoryStore::with_clock({
        let c = clock.clock();
        Box::new(move || c())
    }));
    let format =
        Arc::new(FormatProvider::with_master_key(params, [1u8; 32], [2u8; 32]).unwrap());
    let cancel = CancelToken::new();

    let manager = WriteManager::open(
        &cancel,
        store.clone() as Arc<dyn BlobStore>,
        format.clone(),
        WriteManagerOptions {
            retry: fast_retry(),
            clock: Some(clock.clock()),
        },
    )
    .unwrap();

    TestRepo {
        store,
        format,
        manager,
        clock,
        cancel,
    }
}

impl TestRepo {
    /// Open a second manager over the same store, as another process would.
    pub fn reopen(&self) -> WriteManager {
        WriteManager::open(
            &self.cancel,
            self.store.clone() as Arc<dyn BlobStore>,
            self.format.clone(),
            WriteManagerOptions {
                retry: fast_retry(),
                clock: Some(self.clock.clock()),
            },
        )
        .unwrap()
    }
}
