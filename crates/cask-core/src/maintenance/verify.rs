use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::{debug, warn};

use crate::error::{CaskError, Result};
use crate::repo::lock::with_maintenance_lock;
use crate::repo::{IterateOptions, WriteManager};
use crate::stats::CountersMap;
use crate::storage::{BlobId, BlobStore, PACK_BLOB_PREFIXES};
use crate::trace::{CancelToken, TraceContext};

/// Unique missing packs tolerated before verification short-circuits.
pub const MISSING_PACK_THRESHOLD: u32 = 1000;

/// Check the consistency of the content-index → pack mapping: every index
/// entry (including tombstones) must reference a pack blob that still
/// exists.
///
/// Fails with `MissingPacks` when dangling entries are found, or with
/// `TooManyMissingPacks` after more than [`MISSING_PACK_THRESHOLD`] unique
/// missing packs.
pub fn verify_content_to_pack_mapping(manager: &WriteManager, cancel: &CancelToken) -> Result<()> {
    with_maintenance_lock(manager.store().clone(), cancel, || {
        verify_locked(manager, cancel)
    })
}

fn verify_locked(manager: &WriteManager, cancel: &CancelToken) -> Result<()> {
    let trace = TraceContext::new("verify-content-to-pack-mapping");
    let _span = trace.span().entered();

    let existing_packs = pack_set_from_storage(&**manager.store(), cancel)?;

    let missing_pack_count = AtomicU32::new(0);
    let missing_packs: CountersMap<BlobId> = CountersMap::new();

    let result = manager.iterate_contents(
        IterateOptions {
            include_deleted: true,
        },
        &mut |info| {
            if existing_packs.contains(&info.pack_blob_id) {
                return Ok(());
            }

            debug!(content = %info.content_id, "dangling content");

            // Each unique missing pack counts toward the threshold once.
            if missing_packs.increment(info.pack_blob_id.clone()) {
                return Ok(());
            }

            debug!(pack = %info.pack_blob_id, "missing pack");
            let unique = missing_pack_count.fetch_add(1, Ordering::SeqCst) + 1;
            if unique > MISSING_PACK_THRESHOLD {
                return Err(CaskError::TooManyMissingPacks(MISSING_PACK_THRESHOLD));
            }
            Ok(())
        },
    );

    result?;
    report_missing_packs(missing_pack_count.load(Ordering::SeqCst), &missing_packs)
}

/// The set of pack blob IDs currently present in the store.
fn pack_set_from_storage(
    store: &dyn BlobStore,
    cancel: &CancelToken,
) -> Result<HashSet<BlobId>> {
    let mut existing = HashSet::new();
    for prefix in PACK_BLOB_PREFIXES {
        store.list_blobs(cancel, prefix, &mut |meta| {
            existing.insert(meta.id.clone());
            Ok(())
        })?;
    }
    Ok(existing)
}

fn report_missing_packs(unique_missing: u32, missing_packs: &CountersMap<BlobId>) -> Result<()> {
    if unique_missing == 0 {
        return Ok(());
    }

    let mut dangling_contents: u64 = 0;
    let mut pack_count: u32 = 0;
    missing_packs.range(|pack_id, content_ref_count| {
        pack_count += 1;
        dangling_contents += u64::from(content_ref_count);
        warn!(pack = %pack_id, contents = content_ref_count, "missing pack blob");
        true
    });

    warn!(
        "there are at least {dangling_contents} dangling contents and at least {pack_count} missing pack blobs"
    );
    Err(CaskError::MissingPacks {
        missing_packs: pack_count,
        dangling_contents,
    })
}
