//! Search behaviors: semantic ordering, thresholds, filters, tag set
//! queries, graph traversal, lexical search, and hybrid weighting.

mod common;

use chunkloom::clients::EmbeddingProvider;
use chunkloom::errors::ErrorKind;
use chunkloom::model::{EmbeddingRow, NewChunk};
use chunkloom::search::{
    ChunkQuery, GraphQuery, HybridQuery, SearchFilter, SemanticQuery, TagOperator, TagQuery,
};
use chunkloom::store::TagRef;
use chunkloom::storage::StorageBackend;

use common::harness;

#[tokio::test]
async fn semantic_search_ranks_the_matching_chunk_first() {
    let h = harness();
    let root = h.pipeline.submit("A.\nB.\nC.", Some("T")).await.unwrap();
    h.wait_terminal(root.id).await;

    let results = h
        .search
        .semantic(&SemanticQuery {
            query: "B".into(),
            limit: 10,
            min_similarity: 0.0,
            filter: SearchFilter::default(),
        })
        .await
        .unwrap();

    assert!(!results.is_empty());
    assert_eq!(results[0].chunk.content, "B.");
    for pair in results.windows(2) {
        assert!(pair[0].similarity >= pair[1].similarity);
    }
}

#[tokio::test]
async fn semantic_threshold_above_max_yields_empty_not_error() {
    let h = harness();
    let root = h.pipeline.submit("A.\nB.", None).await.unwrap();
    h.wait_terminal(root.id).await;

    let results = h
        .search
        .semantic(&SemanticQuery {
            query: "B".into(),
            limit: 10,
            min_similarity: 1.5,
            filter: SearchFilter::default(),
        })
        .await
        .unwrap();
    assert!(results.is_empty());
}

#[tokio::test]
async fn semantic_filter_restricts_to_one_page() {
    let h = harness();
    let doc_a = h.pipeline.submit("shared term alpha", None).await.unwrap();
    let doc_b = h.pipeline.submit("shared term beta", None).await.unwrap();
    h.wait_terminal(doc_a.id).await;
    h.wait_terminal(doc_b.id).await;

    let results = h
        .search
        .semantic(&SemanticQuery {
            query: "shared term".into(),
            limit: 10,
            min_similarity: 0.0,
            filter: SearchFilter {
                page_id: Some(doc_a.id),
                ..SearchFilter::default()
            },
        })
        .await
        .unwrap();

    assert!(!results.is_empty());
    for result in &results {
        let page = result.chunk.page_ref.unwrap_or(result.chunk.id);
        assert_eq!(page, doc_a.id);
    }
}

#[tokio::test]
async fn empty_query_is_a_validation_error() {
    let h = harness();
    let err = h
        .search
        .semantic(&SemanticQuery {
            query: "  ".into(),
            limit: 10,
            min_similarity: 0.0,
            filter: SearchFilter::default(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn tag_search_intersects_and_unions() {
    let h = harness();
    let both = h.store.create_chunk(NewChunk::text("both")).await.unwrap();
    let only_red = h.store.create_chunk(NewChunk::text("red one")).await.unwrap();
    h.store
        .add_tag(both.id, TagRef::Content("red".into()))
        .await
        .unwrap();
    h.store
        .add_tag(both.id, TagRef::Content("blue".into()))
        .await
        .unwrap();
    h.store
        .add_tag(only_red.id, TagRef::Content("red".into()))
        .await
        .unwrap();

    let anded = h
        .search
        .tags(&TagQuery {
            tags: vec!["red".into(), "blue".into()],
            operator: TagOperator::And,
        })
        .await
        .unwrap();
    assert_eq!(anded.len(), 1);
    assert_eq!(anded[0].id, both.id);

    let ored = h
        .search
        .tags(&TagQuery {
            tags: vec!["red".into(), "blue".into()],
            operator: TagOperator::Or,
        })
        .await
        .unwrap();
    assert_eq!(ored.len(), 2);
}

#[tokio::test]
async fn unknown_tag_empties_an_intersection() {
    let h = harness();
    let chunk = h.store.create_chunk(NewChunk::text("x")).await.unwrap();
    h.store
        .add_tag(chunk.id, TagRef::Content("known".into()))
        .await
        .unwrap();

    let result = h
        .search
        .tags(&TagQuery {
            tags: vec!["known".into(), "never-used".into()],
            operator: TagOperator::And,
        })
        .await
        .unwrap();
    assert!(result.is_empty());
}

#[tokio::test]
async fn graph_search_caps_depth_and_respects_relation_filter() {
    let h = harness();
    let root = h
        .pipeline
        .submit("Ada met Babbage.\nBabbage met Faraday.", None)
        .await
        .unwrap();
    h.wait_terminal(root.id).await;

    let filtered = h
        .search
        .graph(&GraphQuery {
            entity: "Ada".into(),
            max_depth: 99, // capped to 5 internally
            limit: 50,
            relation_types: vec!["mentioned_with".into()],
        })
        .await
        .unwrap();
    assert!(filtered.nodes.iter().any(|n| n.name == "Ada"));

    let none = h
        .search
        .graph(&GraphQuery {
            entity: "Ada".into(),
            max_depth: 2,
            limit: 50,
            relation_types: vec!["no_such_relation".into()],
        })
        .await
        .unwrap();
    assert_eq!(none.edges.len(), 0);
}

#[tokio::test]
async fn lexical_chunk_search_matches_substrings() {
    let h = harness();
    h.store
        .create_chunk(NewChunk::text("the quick brown fox"))
        .await
        .unwrap();
    h.store
        .create_chunk(NewChunk::text("the lazy dog"))
        .await
        .unwrap();

    let (chunks, total) = h
        .search
        .chunks(&ChunkQuery {
            query: "BROWN".into(),
            filter: SearchFilter::default(),
            limit: 10,
            offset: 0,
        })
        .await
        .unwrap();
    assert_eq!(total, 1);
    assert!(chunks[0].content.contains("brown"));
}

#[tokio::test]
async fn hybrid_ranking_obeys_the_weights() {
    let h = harness();
    // Semantic-only match: planted embedding equals the query's embedding
    // but the content shares nothing lexically with the query.
    let semantic_chunk = h
        .store
        .create_chunk(NewChunk::text("zzz qqq"))
        .await
        .unwrap();
    let query_vector = h.embedder.embed_one("ember").await.unwrap();
    h.backend
        .upsert_embedding(&EmbeddingRow::new(
            semantic_chunk.id,
            h.embedder.model_name(),
            query_vector,
        ))
        .await
        .unwrap();

    // Lexical-only match: content contains the query, embedding is far off.
    let lexical_chunk = h
        .store
        .create_chunk(NewChunk::text("remember the ember"))
        .await
        .unwrap();
    let far_vector = h.embedder.embed_one("xyxyxy").await.unwrap();
    h.backend
        .upsert_embedding(&EmbeddingRow::new(
            lexical_chunk.id,
            h.embedder.model_name(),
            far_vector,
        ))
        .await
        .unwrap();

    let run = |semantic_weight: f32, lexical_weight: f32| {
        let search = &h.search;
        async move {
            search
                .hybrid(&HybridQuery {
                    query: "ember".into(),
                    limit: 10,
                    semantic_weight,
                    lexical_weight,
                })
                .await
                .unwrap()
        }
    };

    let semantic_first = run(1.0, 0.0).await;
    assert_eq!(semantic_first[0].chunk.id, semantic_chunk.id);
    assert!(semantic_first[0].semantic_score > 0.99);

    let lexical_first = run(0.0, 1.0).await;
    assert_eq!(lexical_first[0].chunk.id, lexical_chunk.id);
    assert!(lexical_first[0].lexical_score > 0.99);

    // With both weights active the combined score decides.
    let semantic_heavy = run(0.7, 0.3).await;
    assert_eq!(semantic_heavy[0].chunk.id, semantic_chunk.id);
    let lexical_heavy = run(0.3, 0.7).await;
    assert_eq!(lexical_heavy[0].chunk.id, lexical_chunk.id);

    for hit in &semantic_heavy {
        let expected = 0.7 * hit.semantic_score + 0.3 * hit.lexical_score;
        assert!((hit.combined_score - expected).abs() < 1e-5);
    }
}

#[tokio::test]
async fn negative_weights_are_rejected() {
    let h = harness();
    let err = h
        .search
        .hybrid(&HybridQuery {
            query: "x".into(),
            limit: 10,
            semantic_weight: -0.1,
            lexical_weight: 1.0,
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn hybrid_ties_break_on_smaller_chunk_id() {
    let h = harness();
    let a = h.store.create_chunk(NewChunk::text("tie alpha")).await.unwrap();
    let b = h.store.create_chunk(NewChunk::text("tie beta")).await.unwrap();
    let vector = h.embedder.embed_one("tiebreak").await.unwrap();
    for id in [a.id, b.id] {
        h.backend
            .upsert_embedding(&EmbeddingRow::new(
                id,
                h.embedder.model_name(),
                vector.clone(),
            ))
            .await
            .unwrap();
    }

    let hits = h
        .search
        .hybrid(&HybridQuery {
            query: "tiebreak".into(),
            limit: 2,
            semantic_weight: 1.0,
            lexical_weight: 0.0,
        })
        .await
        .unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].combined_score, hits[1].combined_score);
    assert!(hits[0].chunk.id < hits[1].chunk.id);
}
