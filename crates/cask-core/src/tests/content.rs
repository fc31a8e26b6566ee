use std::sync::Arc;

use crate::compress::Compression;
use crate::crypto::NONCE_SIZE;
use crate::error::CaskError;
use crate::storage::{list_all_blobs, BlobStore};
use crate::testutil::test_repo;
use crate::trace::CancelToken;

#[test]
fn dedupe_returns_one_id_and_one_pack() {
    let repo = test_repo();
    let m = &repo.manager;

    let id1 = m
        .write_content(&repo.cancel, b"hello", None, Compression::None)
        .unwrap();
    let id2 = m
        .write_content(&repo.cancel, b"hello", None, Compression::None)
        .unwrap();
    let id3 = m
        .write_content(&repo.cancel, b"hello", None, Compression::None)
        .unwrap();
    assert_eq!(id1, id2);
    assert_eq!(id2, id3);

    m.flush(&repo.cancel).unwrap();

    let packs = list_all_blobs(&*repo.store, &repo.cancel, "p").unwrap();
    assert_eq!(packs.len(), 1, "three identical writes produce one pack");

    // One entry whose ciphertext is plaintext + AEAD tag.
    let info = m.content_info(&id1).unwrap();
    assert_eq!(info.length as usize, b"hello".len() + 16);
    assert!(!info.deleted);
    assert_eq!(info.pack_offset, 0);
}

#[test]
fn prefix_buckets_split_packs() {
    let repo = test_repo();
    let m = &repo.manager;

    let plain = m
        .write_content(&repo.cancel, b"hello", None, Compression::None)
        .unwrap();
    let bucketed = m
        .write_content(&repo.cancel, b"hello", Some('k'), Compression::None)
        .unwrap();
    assert_ne!(plain, bucketed);

    m.flush(&repo.cancel).unwrap();

    let p_packs = list_all_blobs(&*repo.store, &repo.cancel, "p").unwrap();
    let q_packs = list_all_blobs(&*repo.store, &repo.cancel, "q").unwrap();
    assert_eq!(p_packs.len(), 1);
    assert_eq!(q_packs.len(), 1);

    assert!(m.content_info(&plain).unwrap().pack_blob_id.has_prefix("p"));
    assert!(m
        .content_info(&bucketed)
        .unwrap()
        .pack_blob_id
        .has_prefix("q"));
}

#[test]
fn roundtrip_before_and_after_flush() {
    let repo = test_repo();
    let m = &repo.manager;

    let id = m
        .write_content(&repo.cancel, b"some data", None, Compression::None)
        .unwrap();
    // Still buffered in the pending pack.
    assert_eq!(m.get_content(&repo.cancel, &id).unwrap(), b"some data");

    m.flush(&repo.cancel).unwrap();
    assert_eq!(m.get_content(&repo.cancel, &id).unwrap(), b"some data");
}

#[test]
fn roundtrip_with_compression_hints() {
    let repo = test_repo();
    let m = &repo.manager;
    let payload = vec![42u8; 64 * 1024];

    for (prefix, hint) in [
        (None, Compression::Zstd { level: 3 }),
        (Some('m'), Compression::Lz4),
    ] {
        let id = m
            .write_content(&repo.cancel, &payload, prefix, hint)
            .unwrap();
        m.flush(&repo.cancel).unwrap();

        let info = m.content_info(&id).unwrap();
        assert!(info.compressed);
        assert!(
            (info.length as usize) < payload.len(),
            "repetitive payload should shrink"
        );
        assert_eq!(m.get_content(&repo.cancel, &id).unwrap(), payload);
    }
}

#[test]
fn get_missing_content() {
    let repo = test_repo();
    let id = repo.format.content_id(None, b"never written").unwrap();
    assert!(matches!(
        repo.manager.get_content(&repo.cancel, &id),
        Err(CaskError::ContentNotFound(_))
    ));
    assert!(matches!(
        repo.manager.content_info(&id),
        Err(CaskError::ContentNotFound(_))
    ));
}

#[test]
fn delete_writes_tombstone_and_keeps_payload() {
    let repo = test_repo();
    let m = &repo.manager;

    let id = m
        .write_content(&repo.cancel, b"doomed", None, Compression::None)
        .unwrap();
    m.flush(&repo.cancel).unwrap();
    let live_ts = m.content_info(&id).unwrap().timestamp_seconds;

    m.delete_content(&repo.cancel, &id).unwrap();
    assert!(matches!(
        m.get_content(&repo.cancel, &id),
        Err(CaskError::ContentDeleted(_))
    ));
    // The pack is untouched; the payload is still readable on request.
    assert_eq!(
        m.get_content_including_deleted(&repo.cancel, &id).unwrap(),
        b"doomed"
    );

    let info = m.content_info(&id).unwrap();
    assert!(info.deleted);
    assert!(info.timestamp_seconds > live_ts);

    // Deleting again is a no-op.
    m.delete_content(&repo.cancel, &id).unwrap();

    // The tombstone survives a flush and a reopen.
    m.flush(&repo.cancel).unwrap();
    let other = repo.reopen();
    assert!(matches!(
        other.get_content(&repo.cancel, &id),
        Err(CaskError::ContentDeleted(_))
    ));
}

#[test]
fn delete_of_unflushed_content() {
    let repo = test_repo();
    let m = &repo.manager;

    let id = m
        .write_content(&repo.cancel, b"pending", None, Compression::None)
        .unwrap();
    m.delete_content(&repo.cancel, &id).unwrap();
    assert!(matches!(
        m.get_content(&repo.cancel, &id),
        Err(CaskError::ContentDeleted(_))
    ));
    assert_eq!(
        m.get_content_including_deleted(&repo.cancel, &id).unwrap(),
        b"pending"
    );

    m.flush(&repo.cancel).unwrap();
    let other = repo.reopen();
    assert!(matches!(
        other.get_content(&repo.cancel, &id),
        Err(CaskError::ContentDeleted(_))
    ));
}

#[test]
fn delete_then_rewrite_resurrects() {
    let repo = test_repo();
    let m = &repo.manager;

    let id = m
        .write_content(&repo.cancel, b"phoenix", None, Compression::None)
        .unwrap();
    m.flush(&repo.cancel).unwrap();

    m.delete_content(&repo.cancel, &id).unwrap();
    m.flush(&repo.cancel).unwrap();

    let id2 = m
        .write_content(&repo.cancel, b"phoenix", None, Compression::None)
        .unwrap();
    assert_eq!(id, id2);
    assert_eq!(m.get_content(&repo.cancel, &id).unwrap(), b"phoenix");

    m.flush(&repo.cancel).unwrap();
    let other = repo.reopen();
    assert_eq!(other.get_content(&repo.cancel, &id).unwrap(), b"phoenix");
}

#[test]
fn delete_then_rewrite_without_flush_between() {
    let repo = test_repo();
    let m = &repo.manager;

    let id = m
        .write_content(&repo.cancel, b"phoenix", None, Compression::None)
        .unwrap();
    m.delete_content(&repo.cancel, &id).unwrap();
    let id2 = m
        .write_content(&repo.cancel, b"phoenix", None, Compression::None)
        .unwrap();
    assert_eq!(id, id2);
    assert_eq!(m.get_content(&repo.cancel, &id).unwrap(), b"phoenix");
}

#[test]
fn flush_makes_contents_visible_to_new_readers() {
    let repo = test_repo();
    let m = &repo.manager;

    let unflushed = m
        .write_content(&repo.cancel, b"not yet durable", None, Compression::None)
        .unwrap();

    // A reader opened before our flush does not see the content.
    let early = repo.reopen();
    assert!(matches!(
        early.get_content(&repo.cancel, &unflushed),
        Err(CaskError::ContentNotFound(_))
    ));

    m.flush(&repo.cancel).unwrap();

    // A reader opened after the flush does.
    let late = repo.reopen();
    assert_eq!(
        late.get_content(&repo.cancel, &unflushed).unwrap(),
        b"not yet durable"
    );

    // The early reader catches up on refresh.
    early.refresh(&repo.cancel).unwrap();
    assert_eq!(
        early.get_content(&repo.cancel, &unflushed).unwrap(),
        b"not yet durable"
    );
}

#[test]
fn large_content_seals_pack_immediately() {
    let mut params = crate::testutil::small_params();
    params.max_pack_size = 64;
    let repo = crate::testutil::test_repo_with_params(params);
    let m = &repo.manager;

    let a = m
        .write_content(&repo.cancel, &[1u8; 100], None, Compression::None)
        .unwrap();
    let b = m
        .write_content(&repo.cancel, &[2u8; 100], None, Compression::None)
        .unwrap();

    // Each oversized content went to its own pack, already uploaded.
    let packs = list_all_blobs(&*repo.store, &repo.cancel, "p").unwrap();
    assert_eq!(packs.len(), 2);

    // Readable before the index flush.
    assert_eq!(m.get_content(&repo.cancel, &a).unwrap(), [1u8; 100]);
    assert_eq!(m.get_content(&repo.cancel, &b).unwrap(), [2u8; 100]);

    m.flush(&repo.cancel).unwrap();
    assert_eq!(m.get_content(&repo.cancel, &a).unwrap(), [1u8; 100]);
}

#[test]
fn concurrent_writers_dedupe_to_one_pack_entry() {
    let repo = Arc::new(test_repo());

    let ids: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let repo = repo.clone();
                scope.spawn(move || {
                    repo.manager
                        .write_content(&repo.cancel, b"contended", None, Compression::None)
                        .unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert!(ids.windows(2).all(|w| w[0] == w[1]));

    repo.manager.flush(&repo.cancel).unwrap();
    let packs = list_all_blobs(&*repo.store, &repo.cancel, "p").unwrap();
    assert_eq!(packs.len(), 1);

    // Exactly one copy of the ciphertext in the pack: the pack holds one
    // content plus the footer envelope.
    let info = repo.manager.content_info(&ids[0]).unwrap();
    let pack = repo
        .store
        .get_blob(&repo.cancel, &info.pack_blob_id, 0, None)
        .unwrap();
    let one_content = info.length as usize;
    assert!(
        pack.len() < one_content * 2 + NONCE_SIZE + 200,
        "pack holds a single ciphertext copy, got {} bytes",
        pack.len()
    );
}

#[test]
fn iterate_contents_honors_include_deleted() {
    let repo = test_repo();
    let m = &repo.manager;

    let keep = m
        .write_content(&repo.cancel, b"keep", None, Compression::None)
        .unwrap();
    let gone = m
        .write_content(&repo.cancel, b"drop", None, Compression::None)
        .unwrap();
    m.flush(&repo.cancel).unwrap();
    m.delete_content(&repo.cancel, &gone).unwrap();
    m.flush(&repo.cancel).unwrap();

    let mut live = Vec::new();
    m.iterate_contents(Default::default(), &mut |info| {
        live.push(info.content_id);
        Ok(())
    })
    .unwrap();
    assert_eq!(live, vec![keep]);

    let mut all = Vec::new();
    m.iterate_contents(
        crate::repo::IterateOptions {
            include_deleted: true,
        },
        &mut |info| {
            all.push((info.content_id, info.deleted));
            Ok(())
        },
    )
    .unwrap();
    assert_eq!(all.len(), 2);
    assert!(all.contains(&(keep, false)));
    assert!(all.contains(&(gone, true)));
}

#[test]
fn cancelled_operations_fail_fast() {
    let repo = test_repo();
    let cancel = CancelToken::new();
    cancel.cancel();

    assert!(matches!(
        repo.manager
            .write_content(&cancel, b"x", None, Compression::None),
        Err(CaskError::Cancelled)
    ));
    assert!(matches!(
        repo.manager.flush(&cancel),
        Err(CaskError::Cancelled)
    ));
}
