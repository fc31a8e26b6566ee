use tracing::{debug, info};

use super::{watermark_target, SafetyParameters};
use crate::error::{CaskError, Result};
use crate::repo::lock::with_maintenance_lock;
use crate::repo::WriteManager;
use crate::storage::{list_all_blobs, BlobStore, WATERMARK_PREFIX};
use crate::trace::{CancelToken, TraceContext};

/// Counters reported by marker cleanup.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupMarkersStats {
    pub deleted_epoch_marker_blob_count: usize,
    pub deleted_watermark_blob_count: usize,
}

impl CleanupMarkersStats {
    pub fn summary(&self) -> String {
        format!(
            "Cleaned up {} epoch markers and {} deletion watermarks",
            self.deleted_epoch_marker_blob_count, self.deleted_watermark_blob_count
        )
    }
}

/// Remove epoch markers that have aged out of the retention horizon and
/// deletion watermarks whose targets have been collected; watermarked
/// targets that have passed the safety window are collected here too.
pub fn cleanup_markers(
    manager: &WriteManager,
    cancel: &CancelToken,
    safety: &SafetyParameters,
) -> Result<CleanupMarkersStats> {
    with_maintenance_lock(manager.store().clone(), cancel, || {
        cleanup_locked(manager, cancel, safety)
    })
}

fn cleanup_locked(
    manager: &WriteManager,
    cancel: &CancelToken,
    safety: &SafetyParameters,
) -> Result<CleanupMarkersStats> {
    let trace = TraceContext::new("cleanup-markers");
    let _span = trace.span().entered();

    let store = manager.store();
    let epochs = manager.index_manager().epochs();
    let mut stats = CleanupMarkersStats::default();

    // Epoch markers below the retention horizon.
    let current = epochs.current_epoch(cancel)?;
    let horizon = current.saturating_sub(epochs.params().retain_epoch_markers);
    for (epoch, meta) in epochs.list_markers(cancel)? {
        cancel.check()?;
        if epoch < horizon {
            store.delete_blob(cancel, &meta.id)?;
            stats.deleted_epoch_marker_blob_count += 1;
            debug!(epoch, "removed epoch marker");
        }
    }

    // Watermarks: complete deferred deletions whose targets are old enough,
    // and drop watermarks whose targets are already gone.
    let now = manager.now();
    for wm_meta in list_all_blobs(&**store, cancel, WATERMARK_PREFIX)? {
        cancel.check()?;
        let Some(target) = watermark_target(&wm_meta.id) else {
            continue;
        };

        match store.get_metadata(cancel, &target) {
            Err(CaskError::BlobNotFound(_)) => {
                store.delete_blob(cancel, &wm_meta.id)?;
                stats.deleted_watermark_blob_count += 1;
                debug!(watermark = %wm_meta.id, "removed watermark for collected blob");
            }
            Ok(target_meta) => {
                if safety.allows_deletion(now, target_meta.timestamp) {
                    store.delete_blob(cancel, &target)?;
                    store.delete_blob(cancel, &wm_meta.id)?;
                    stats.deleted_watermark_blob_count += 1;
                    debug!(target = %target, "completed deferred deletion");
                }
            }
            Err(e) => return Err(e),
        }
    }

    info!("{}", stats.summary());
    Ok(stats)
}
