use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::{delete_with_safety, SafetyParameters};
use crate::error::Result;
use crate::index::epoch::{select_read_set, IndexBlobInfo};
use crate::index::{merge_entry, ContentInfo};
use crate::repo::lock::with_maintenance_lock;
use crate::repo::WriteManager;
use crate::trace::{CancelToken, TraceContext};

/// Options for [`compact_indexes`].
#[derive(Debug, Clone)]
pub struct CompactOptions {
    /// Merge every settled epoch into one snapshot.
    pub all_indexes: bool,
    /// Specific epochs to compact when `all_indexes` is false.
    pub epochs: Vec<u64>,
    /// Drop tombstones older than this cutoff.
    pub drop_deleted_before: Option<DateTime<Utc>>,
    pub safety: SafetyParameters,
}

impl Default for CompactOptions {
    fn default() -> Self {
        Self {
            all_indexes: false,
            epochs: Vec::new(),
            drop_deleted_before: None,
            safety: SafetyParameters::full(),
        }
    }
}

/// Counters reported by index compaction.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CompactIndexesStats {
    pub epochs_compacted: usize,
    pub index_blobs_read: u64,
    pub entries_written: u64,
    pub dropped_deleted_entries: u64,
    pub superseded_blobs_deleted: u64,
    pub deletions_deferred: u64,
}

/// Compact index blobs: merge the selected epochs by the read-path rules,
/// drop expired tombstones, write one compaction snapshot, then delete the
/// superseded blobs subject to the safety window.
///
/// Only settled epochs are touched: epochs whose successor marker is old
/// enough that no live writer can still emit index blobs into them. With
/// `all_indexes` the current epoch is advanced first so that everything
/// written so far becomes compactable.
pub fn compact_indexes(
    manager: &WriteManager,
    cancel: &CancelToken,
    opts: &CompactOptions,
) -> Result<CompactIndexesStats> {
    with_maintenance_lock(manager.store().clone(), cancel, || {
        compact_locked(manager, cancel, opts)
    })
}

/// Rewrite indexes while dropping tombstones older than `drop_deleted_before`.
pub fn drop_deleted_contents(
    manager: &WriteManager,
    cancel: &CancelToken,
    drop_deleted_before: DateTime<Utc>,
    safety: SafetyParameters,
) -> Result<CompactIndexesStats> {
    compact_indexes(
        manager,
        cancel,
        &CompactOptions {
            all_indexes: true,
            epochs: Vec::new(),
            drop_deleted_before: Some(drop_deleted_before),
            safety,
        },
    )
}

fn compact_locked(
    manager: &WriteManager,
    cancel: &CancelToken,
    opts: &CompactOptions,
) -> Result<CompactIndexesStats> {
    let trace = TraceContext::new("compact-indexes");
    let _span = trace.span().entered();

    let index = manager.index_manager();
    let epochs = index.epochs();
    let mut stats = CompactIndexesStats::default();

    if opts.all_indexes {
        // Push live writers into a fresh epoch so every existing index blob
        // belongs to an epoch that can settle.
        let current = epochs.current_epoch(cancel)?;
        epochs.advance(cancel, current)?;
    }

    let current = epochs.current_epoch(cancel)?;
    let all_blobs = epochs.list_index_blobs(cancel)?;

    // Merging an epoch away is only allowed once it has aged past the
    // retention horizon, unless the safety escape hatch is set.
    let retain = epochs.params().retain_epochs;
    let retained = |e: u64| {
        opts.all_indexes
            && !opts.safety.disable_eventual_consistency_safety
            && e + retain >= current
    };

    let selected: Vec<u64> = {
        let mut present: Vec<u64> = all_blobs.iter().map(|b| b.epoch).collect();
        present.sort_unstable();
        present.dedup();
        present
            .into_iter()
            .filter(|&e| e < current)
            .filter(|&e| opts.all_indexes || opts.epochs.contains(&e))
            .filter(|&e| !retained(e))
            .filter(|&e| epoch_is_settled(manager, cancel, e, &opts.safety).unwrap_or(false))
            .collect()
    };
    if selected.is_empty() {
        debug!("no settled epochs eligible for compaction");
        return Ok(stats);
    }

    if opts.all_indexes {
        // One snapshot covering every selected epoch, written into the
        // highest of them; older epochs are thereby dropped wholesale once
        // their leftover blobs pass the safety window.
        let target_epoch = *selected.last().unwrap();
        let group: Vec<IndexBlobInfo> = all_blobs
            .iter()
            .filter(|b| selected.contains(&b.epoch))
            .cloned()
            .collect();
        compact_group(manager, cancel, opts, target_epoch, group, &mut stats)?;
    } else {
        for &epoch in &selected {
            let group: Vec<IndexBlobInfo> = all_blobs
                .iter()
                .filter(|b| b.epoch == epoch)
                .cloned()
                .collect();
            compact_group(manager, cancel, opts, epoch, group, &mut stats)?;
        }
    }

    // Pick up the rewritten view.
    index.load(cancel)?;

    info!(
        epochs = stats.epochs_compacted,
        written = stats.entries_written,
        dropped = stats.dropped_deleted_entries,
        deleted_blobs = stats.superseded_blobs_deleted,
        deferred = stats.deletions_deferred,
        "index compaction finished"
    );
    Ok(stats)
}

/// Merge one group of index blobs into a snapshot at `target_epoch` and
/// retire the originals.
fn compact_group(
    manager: &WriteManager,
    cancel: &CancelToken,
    opts: &CompactOptions,
    target_epoch: u64,
    group: Vec<IndexBlobInfo>,
    stats: &mut CompactIndexesStats,
) -> Result<()> {
    let index = manager.index_manager();

    // Already fully compacted and nothing left to retire: skip re-writing
    // the same snapshot on every maintenance run.
    if group.len() == 1 && group[0].compacted && opts.drop_deleted_before.is_none() {
        return Ok(());
    }

    let read_set = select_read_set(group.clone());
    let mut merged: BTreeMap<_, ContentInfo> = BTreeMap::new();
    for blob in &read_set {
        cancel.check()?;
        for entry in index.read_index_blob(cancel, &blob.metadata.id)? {
            merge_entry(&mut merged, entry);
        }
        stats.index_blobs_read += 1;
    }

    let cutoff = opts.drop_deleted_before.map(|t| t.timestamp());
    let entries: Vec<ContentInfo> = merged
        .into_values()
        .filter(|e| {
            let expired = e.deleted && cutoff.is_some_and(|c| e.timestamp_seconds < c);
            if expired {
                stats.dropped_deleted_entries += 1;
            }
            !expired
        })
        .collect();

    let payload = index.seal_index_payload(&entries)?;
    let snapshot_id = index
        .epochs()
        .write_compacted_blob(cancel, target_epoch, &payload)?;
    stats.entries_written += entries.len() as u64;
    stats.epochs_compacted += 1;
    debug!(epoch = target_epoch, snapshot = %snapshot_id, entries = entries.len(), "wrote compaction snapshot");

    // The snapshot supersedes every blob in the group; delete them once the
    // safety window allows.
    let now = manager.now();
    for blob in &group {
        if blob.metadata.id == snapshot_id {
            continue;
        }
        if delete_with_safety(
            &**manager.store(),
            cancel,
            now,
            &blob.metadata,
            &opts.safety,
        )? {
            stats.superseded_blobs_deleted += 1;
        } else {
            stats.deletions_deferred += 1;
        }
    }
    Ok(())
}

/// An epoch is settled once its successor marker has been visible for longer
/// than the safety margin, so no writer can still believe it is current.
fn epoch_is_settled(
    manager: &WriteManager,
    cancel: &CancelToken,
    epoch: u64,
    safety: &SafetyParameters,
) -> Result<bool> {
    if safety.disable_eventual_consistency_safety {
        return Ok(true);
    }
    let markers = manager.index_manager().epochs().list_markers(cancel)?;
    Ok(markers
        .iter()
        .any(|(e, meta)| *e == epoch + 1 && safety.allows_deletion(manager.now(), meta.timestamp)))
}
