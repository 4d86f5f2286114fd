//! The seven consistency checks and their repair routines.

mod common;

use chunkloom::errors::ErrorKind;
use chunkloom::model::{Chunk, EmbeddingRow, NewChunk, TagPair, new_chunk_id};
use chunkloom::monitor::CheckKind;
use chunkloom::storage::StorageBackend;

use common::harness;

#[tokio::test]
async fn clean_store_reports_nothing() {
    let h = harness();
    let root = h.pipeline.submit("A.\nB.", None).await.unwrap();
    h.wait_terminal(root.id).await;

    for report in h.consistency.run_all().await.unwrap() {
        assert_eq!(report.count, 0, "unexpected divergence in {}", report.check);
    }
}

#[tokio::test]
async fn orphaned_chunk_is_detected_and_reparented() {
    let h = harness();
    let root = h.store.create_chunk(NewChunk::text("doc")).await.unwrap();
    let child = h
        .store
        .create_chunk(NewChunk::child_of("child", root.id))
        .await
        .unwrap();

    // Corrupt the store behind the service's back: point the child at a
    // parent that does not exist.
    let mut corrupted = child.clone();
    corrupted.parent_id = Some(new_chunk_id());
    h.backend.put_chunk(&corrupted).await.unwrap();

    let report = h
        .consistency
        .run_check(CheckKind::OrphanedChunks)
        .await
        .unwrap();
    assert_eq!(report.count, 1);
    assert_eq!(report.samples, vec![child.id.to_string()]);

    let outcome = h.consistency.repair(CheckKind::OrphanedChunks).await.unwrap();
    assert_eq!(outcome.repaired, 1);

    // Reparented to its recorded page root.
    let fixed = h.store.get_chunk(child.id).await.unwrap();
    assert_eq!(fixed.parent_id, Some(root.id));
    let recheck = h
        .consistency
        .run_check(CheckKind::OrphanedChunks)
        .await
        .unwrap();
    assert_eq!(recheck.count, 0);
}

#[tokio::test]
async fn parent_cycle_is_detected_but_not_auto_repaired() {
    let h = harness();
    let a = h.store.create_chunk(NewChunk::text("a")).await.unwrap();
    let b = h
        .store
        .create_chunk(NewChunk::child_of("b", a.id))
        .await
        .unwrap();

    // Forge a cycle directly in the backend.
    let mut forged = h.store.get_chunk(a.id).await.unwrap();
    forged.parent_id = Some(b.id);
    h.backend.put_chunk(&forged).await.unwrap();
    h.cache.flush();

    let report = h.consistency.run_check(CheckKind::ParentCycles).await.unwrap();
    assert_eq!(report.count, 2);

    let err = h.consistency.repair(CheckKind::ParentCycles).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn dangling_template_ref_is_nulled_out() {
    let h = harness();
    let chunk = h.store.create_chunk(NewChunk::text("instance")).await.unwrap();
    let mut forged = chunk.clone();
    forged.template_ref = Some(new_chunk_id());
    h.backend.put_chunk(&forged).await.unwrap();
    h.cache.flush();

    let report = h
        .consistency
        .run_check(CheckKind::DanglingTemplateRefs)
        .await
        .unwrap();
    assert_eq!(report.count, 1);

    h.consistency
        .repair(CheckKind::DanglingTemplateRefs)
        .await
        .unwrap();
    assert!(h.store.get_chunk(chunk.id).await.unwrap().template_ref.is_none());
}

#[tokio::test]
async fn tag_mirror_divergence_is_reported_and_rewritten() {
    let h = harness();
    let chunk = h.store.create_chunk(NewChunk::text("note")).await.unwrap();
    let tag = h
        .store
        .create_chunk(NewChunk {
            is_tag: true,
            ..NewChunk::text("orphan-tag")
        })
        .await
        .unwrap();

    // Insert an index row without updating the denormalized mirror.
    h.backend
        .upsert_tag_relation(TagPair {
            source_chunk_id: chunk.id,
            tag_chunk_id: tag.id,
        })
        .await
        .unwrap();

    let report = h
        .consistency
        .run_check(CheckKind::TagMirrorDivergence)
        .await
        .unwrap();
    assert_eq!(report.count, 1);

    let outcome = h
        .consistency
        .repair(CheckKind::TagMirrorDivergence)
        .await
        .unwrap();
    assert_eq!(outcome.repaired, 1);

    let fixed = h.store.get_chunk(chunk.id).await.unwrap();
    assert!(fixed.tags.contains(&tag.id));

    let recheck = h
        .consistency
        .run_check(CheckKind::TagMirrorDivergence)
        .await
        .unwrap();
    assert_eq!(recheck.count, 0);
}

#[tokio::test]
async fn orphaned_embedding_is_deleted() {
    let h = harness();
    let ghost = new_chunk_id();
    h.backend
        .upsert_embedding(&EmbeddingRow::new(ghost, "mock-embedder", vec![0.0; 32]))
        .await
        .unwrap();

    let report = h
        .consistency
        .run_check(CheckKind::OrphanedEmbeddings)
        .await
        .unwrap();
    assert_eq!(report.count, 1);

    h.consistency
        .repair(CheckKind::OrphanedEmbeddings)
        .await
        .unwrap();
    assert!(h.backend.list_embedding_keys().await.unwrap().is_empty());
}

#[tokio::test]
async fn missing_embedding_is_reported_then_backfilled() {
    let h = harness();
    let chunk = h.store.create_chunk(NewChunk::text("unembedded")).await.unwrap();

    let report = h
        .consistency
        .run_check(CheckKind::MissingEmbeddings)
        .await
        .unwrap();
    assert_eq!(report.count, 1);
    assert_eq!(report.samples, vec![chunk.id.to_string()]);

    let outcome = h
        .consistency
        .repair(CheckKind::MissingEmbeddings)
        .await
        .unwrap();
    assert_eq!(outcome.repaired, 1);

    let recheck = h
        .consistency
        .run_check(CheckKind::MissingEmbeddings)
        .await
        .unwrap();
    assert_eq!(recheck.count, 0);
}

#[tokio::test]
async fn templates_and_slots_do_not_demand_embeddings() {
    let h = harness();
    h.store
        .create_template("Addr", &["name".into()])
        .await
        .unwrap();

    let report = h
        .consistency
        .run_check(CheckKind::MissingEmbeddings)
        .await
        .unwrap();
    assert_eq!(report.count, 0);
}

#[tokio::test]
async fn closure_break_is_detected() {
    let h = harness();
    let root = h.store.create_chunk(NewChunk::text("doc")).await.unwrap();
    let child = h
        .store
        .create_chunk(NewChunk::child_of("child", root.id))
        .await
        .unwrap();

    // Drop the child's root-to-child closure row behind the service.
    h.backend
        .delete_closure_rows(&[(root.id, child.id)])
        .await
        .unwrap();

    let report = h
        .consistency
        .run_check(CheckKind::ClosureIntegrity)
        .await
        .unwrap();
    assert_eq!(report.count, 1);
    assert_eq!(report.samples, vec![child.id.to_string()]);
}

#[tokio::test]
async fn mirror_only_tag_is_cleared_by_repair() {
    let h = harness();
    let source = h.store.create_chunk(NewChunk::text("s")).await.unwrap();
    let tag = h
        .store
        .create_chunk(NewChunk {
            is_tag: true,
            ..NewChunk::text("t")
        })
        .await
        .unwrap();

    // Mirror lists a tag the index does not have.
    let mut forged: Chunk = source.clone();
    forged.tags.insert(tag.id);
    h.backend.put_chunk(&forged).await.unwrap();
    h.cache.flush();

    assert_eq!(
        h.consistency
            .run_check(CheckKind::TagMirrorDivergence)
            .await
            .unwrap()
            .count,
        1
    );
    h.consistency
        .repair(CheckKind::TagMirrorDivergence)
        .await
        .unwrap();
    assert!(h.store.get_chunk(source.id).await.unwrap().tags.is_empty());
}
