pub mod compact;
pub mod markers;
pub mod verify;

pub use compact::{compact_indexes, drop_deleted_contents, CompactIndexesStats, CompactOptions};
pub use markers::{cleanup_markers, CleanupMarkersStats};
pub use verify::verify_content_to_pack_mapping;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::error::{CaskError, Result};
use crate::storage::{BlobId, BlobMetadata, BlobStore, PutOptions, WATERMARK_PREFIX};
use crate::trace::CancelToken;

/// Default minimum age a blob must reach before maintenance may physically
/// delete it, masking list-after-write inconsistency for in-flight readers.
pub const DEFAULT_SAFETY_MARGIN_SECS: i64 = 4 * 3600;

/// Safety parameters governing maintenance deletions.
#[derive(Debug, Clone)]
pub struct SafetyParameters {
    /// Bypass the eventual-consistency safety window entirely.
    pub disable_eventual_consistency_safety: bool,
    /// Minimum blob age before deletion when safety is enabled.
    pub safety_margin: Duration,
}

impl SafetyParameters {
    /// Full safety: conservative margin, suitable for production stores.
    pub fn full() -> Self {
        Self {
            disable_eventual_consistency_safety: false,
            safety_margin: Duration::seconds(DEFAULT_SAFETY_MARGIN_SECS),
        }
    }

    /// No safety: immediate deletions. Only for strongly-consistent stores
    /// and tests.
    pub fn none() -> Self {
        Self {
            disable_eventual_consistency_safety: true,
            safety_margin: Duration::zero(),
        }
    }
}

impl Default for SafetyParameters {
    fn default() -> Self {
        Self::full()
    }
}

impl SafetyParameters {
    /// Whether a blob with `timestamp` may be deleted at `now`.
    pub(crate) fn allows_deletion(&self, now: DateTime<Utc>, timestamp: DateTime<Utc>) -> bool {
        self.disable_eventual_consistency_safety || now - timestamp >= self.safety_margin
    }
}

/// The watermark blob ID recording a deferred deletion of `target`.
pub(crate) fn watermark_id(target: &BlobId) -> BlobId {
    BlobId::new(format!("{WATERMARK_PREFIX}{target}")).expect("valid watermark id")
}

/// The target named by a watermark blob, if it parses.
pub(crate) fn watermark_target(watermark: &BlobId) -> Option<BlobId> {
    let rest = watermark.as_str().strip_prefix(WATERMARK_PREFIX)?;
    BlobId::new(rest).ok()
}

/// Delete a blob subject to the safety window. A blob still inside the
/// window is left in place with a `w<target>` watermark recording the
/// pending removal; a later maintenance pass completes it.
///
/// Returns `true` when the blob was deleted now, `false` when deferred.
pub(crate) fn delete_with_safety(
    store: &dyn BlobStore,
    cancel: &CancelToken,
    now: DateTime<Utc>,
    meta: &BlobMetadata,
    safety: &SafetyParameters,
) -> Result<bool> {
    if safety.allows_deletion(now, meta.timestamp) {
        store.delete_blob(cancel, &meta.id)?;
        debug!(blob = %meta.id, "deleted superseded blob");
        return Ok(true);
    }

    match store.put_blob(
        cancel,
        &watermark_id(&meta.id),
        &[],
        &PutOptions {
            do_not_recreate: true,
            ..Default::default()
        },
    ) {
        Ok(()) | Err(CaskError::BlobAlreadyExists(_)) => {
            debug!(blob = %meta.id, "deletion deferred inside safety window");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}
