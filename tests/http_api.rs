//! HTTP round-trips over a real listener: endpoint shapes, status codes,
//! pagination, the error body, and the end-to-end scenarios.

mod common;

use std::time::Duration;

use serde_json::{Value, json};

use common::{harness, spawn_server};

async fn poll_indexed(client: &reqwest::Client, base: &str, id: &str) -> Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let body: Value = client
            .get(format!("{base}/api/v1/texts/{id}"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        match body["text"]["status"].as_str() {
            Some("indexed") => return body,
            Some("failed") => panic!("ingest failed: {body}"),
            _ => {}
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "document {id} never indexed"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn ingest_scenario_three_paragraphs() {
    let h = harness();
    let (base, _server) = spawn_server(h.app_state()).await;
    let client = reqwest::Client::new();

    let created = client
        .post(format!("{base}/api/v1/texts"))
        .json(&json!({ "content": "A.\nB.\nC.", "title": "T" }))
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), 201);
    let created: Value = created.json().await.unwrap();
    assert_eq!(created["status"], "processing");
    assert_eq!(created["title"], "T");
    let id = created["id"].as_str().unwrap().to_string();

    let body = poll_indexed(&client, &base, &id).await;
    let chunks = body["chunks"].as_array().unwrap();
    assert_eq!(chunks.len(), 3);
    for (i, chunk) in chunks.iter().enumerate() {
        assert_eq!(chunk["indent_level"], 1);
        assert_eq!(chunk["sequence_number"], i as i64 + 1);
    }
}

#[tokio::test]
async fn semantic_search_scenario_returns_ordered_results() {
    let h = harness();
    let (base, _server) = spawn_server(h.app_state()).await;
    let client = reqwest::Client::new();

    let created: Value = client
        .post(format!("{base}/api/v1/texts"))
        .json(&json!({ "content": "A.\nB.\nC.", "title": "T" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    poll_indexed(&client, &base, created["id"].as_str().unwrap()).await;

    let response: Value = client
        .post(format!("{base}/api/v1/search/semantic"))
        .json(&json!({ "query": "B", "limit": 10, "min_similarity": 0.0 }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let results = response["results"].as_array().unwrap();
    assert!(!results.is_empty());
    assert_eq!(results[0]["chunk"]["content"], "B.");
}

#[tokio::test]
async fn template_scenario_create_instantiate_and_update_slot() {
    let h = harness();
    let (base, _server) = spawn_server(h.app_state()).await;
    let client = reqwest::Client::new();

    let template: Value = client
        .post(format!("{base}/api/v1/templates"))
        .json(&json!({ "template_name": "Addr", "slot_names": ["name", "city"] }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let template_id = template["template"]["id"].as_str().unwrap().to_string();
    assert_eq!(template["slots"].as_array().unwrap().len(), 2);

    let instance: Value = client
        .post(format!("{base}/api/v1/templates/{template_id}/instances"))
        .json(&json!({
            "instance_name": "home",
            "slot_values": { "name": "Ada", "city": "London" },
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let instance_id = instance["instance"]["id"].as_str().unwrap().to_string();
    assert_eq!(instance["instance"]["template_ref"], template["template"]["id"]);
    let slots = instance["slots"].as_array().unwrap();
    let value_of = |name: &str| {
        slots
            .iter()
            .find(|s| s["content"] == name)
            .map(|s| s["slot_value"].clone())
            .unwrap()
    };
    assert_eq!(value_of("name"), "Ada");
    assert_eq!(value_of("city"), "London");

    let updated: Value = client
        .put(format!("{base}/api/v1/instances/{instance_id}/slots"))
        .json(&json!({ "slot_name": "city", "value": "Paris" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(updated["slot_value"], "Paris");
    assert_eq!(updated["content"], "city");

    // The untouched slot keeps its value.
    let chunks: Value = client
        .get(format!("{base}/api/v1/chunks/{instance_id}/children"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let name_slot = chunks["chunks"]
        .as_array()
        .unwrap()
        .iter()
        .find(|c| c["content"] == "name")
        .unwrap();
    assert_eq!(name_slot["slot_value"], "Ada");
}

#[tokio::test]
async fn cycle_prevention_scenario_returns_409_and_keeps_the_tree() {
    let h = harness();
    let (base, _server) = spawn_server(h.app_state()).await;
    let client = reqwest::Client::new();

    let a: Value = client
        .post(format!("{base}/api/v1/chunks"))
        .json(&json!({ "content": "A" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let a_id = a["id"].as_str().unwrap().to_string();
    let b: Value = client
        .post(format!("{base}/api/v1/chunks"))
        .json(&json!({ "content": "B", "parent_id": a_id }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let b_id = b["id"].as_str().unwrap().to_string();

    let response = client
        .post(format!("{base}/api/v1/chunks/{a_id}/move"))
        .json(&json!({ "new_parent_id": b_id, "new_position": 1 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);
    let error: Value = response.json().await.unwrap();
    assert_eq!(error["error"], "conflict");
    assert_eq!(error["code"], "conflict");
    assert!(error["timestamp"].is_string());

    let b_after: Value = client
        .get(format!("{base}/api/v1/chunks/{b_id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(b_after["parent_id"], a["id"]);
}

#[tokio::test]
async fn missing_text_returns_404_with_error_body() {
    let h = harness();
    let (base, _server) = spawn_server(h.app_state()).await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!(
            "{base}/api/v1/texts/{}",
            chunkloom::model::new_chunk_id()
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "not_found");
    assert_eq!(body["code"], "not_found");
    assert!(body["message"].is_string());
}

#[tokio::test]
async fn pagination_envelope_wraps_texts() {
    let h = harness();
    let (base, _server) = spawn_server(h.app_state()).await;
    let client = reqwest::Client::new();

    for i in 0..3 {
        client
            .post(format!("{base}/api/v1/texts"))
            .json(&json!({ "content": format!("doc {i}") }))
            .send()
            .await
            .unwrap();
    }

    let body: Value = client
        .get(format!("{base}/api/v1/texts?page=1&page_size=2"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["texts"].as_array().unwrap().len(), 2);
    assert_eq!(body["pagination"]["page"], 1);
    assert_eq!(body["pagination"]["page_size"], 2);
    assert_eq!(body["pagination"]["total"], 3);
}

#[tokio::test]
async fn structure_round_trip_and_replacement() {
    let h = harness();
    let (base, _server) = spawn_server(h.app_state()).await;
    let client = reqwest::Client::new();

    let created: Value = client
        .post(format!("{base}/api/v1/texts"))
        .json(&json!({ "content": "one\ntwo" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = created["id"].as_str().unwrap().to_string();
    poll_indexed(&client, &base, &id).await;

    let tree: Value = client
        .get(format!("{base}/api/v1/texts/{id}/structure"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let children = tree["children"].as_array().unwrap();
    assert_eq!(children.len(), 2);

    // Reverse the two children and add a new nested node.
    let replacement = json!({
        "id": tree["id"],
        "content": tree["content"],
        "children": [
            {
                "id": children[1]["id"],
                "content": children[1]["content"],
                "children": [ { "content": "brand new" } ],
            },
            { "id": children[0]["id"], "content": children[0]["content"] },
        ],
    });
    let replaced: Value = client
        .put(format!("{base}/api/v1/texts/{id}/structure"))
        .json(&replacement)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let new_children = replaced["children"].as_array().unwrap();
    assert_eq!(new_children.len(), 2);
    assert_eq!(new_children[0]["id"], children[1]["id"]);
    assert_eq!(new_children[1]["id"], children[0]["id"]);
    assert_eq!(new_children[0]["children"][0]["content"], "brand new");
}

#[tokio::test]
async fn delete_text_cascades_and_returns_204() {
    let h = harness();
    let (base, _server) = spawn_server(h.app_state()).await;
    let client = reqwest::Client::new();

    let created: Value = client
        .post(format!("{base}/api/v1/texts"))
        .json(&json!({ "content": "a\nb" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = created["id"].as_str().unwrap().to_string();
    poll_indexed(&client, &base, &id).await;

    let deleted = client
        .delete(format!("{base}/api/v1/texts/{id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), 204);

    let gone = client
        .get(format!("{base}/api/v1/texts/{id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(gone.status(), 404);
}

#[tokio::test]
async fn tag_endpoints_add_list_remove() {
    let h = harness();
    let (base, _server) = spawn_server(h.app_state()).await;
    let client = reqwest::Client::new();

    let chunk: Value = client
        .post(format!("{base}/api/v1/chunks"))
        .json(&json!({ "content": "taggable" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let chunk_id = chunk["id"].as_str().unwrap().to_string();

    let tagged = client
        .post(format!("{base}/api/v1/chunks/{chunk_id}/tags"))
        .json(&json!({ "tag_content": "project" }))
        .send()
        .await
        .unwrap();
    assert_eq!(tagged.status(), 201);
    let tagged: Value = tagged.json().await.unwrap();
    let tag_id = tagged["tags"][0].as_str().unwrap().to_string();

    let listed: Value = client
        .get(format!("{base}/api/v1/chunks/{chunk_id}/tags"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed["tags"][0]["content"], "project");

    let search: Value = client
        .post(format!("{base}/api/v1/search/tags"))
        .json(&json!({ "tags": ["project"], "operator": "AND" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(search["count"], 1);

    let removed = client
        .delete(format!("{base}/api/v1/chunks/{chunk_id}/tags/{tag_id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(removed.status(), 200);
    let removed: Value = removed.json().await.unwrap();
    assert!(removed["tags"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn health_metrics_and_cache_endpoints_respond() {
    let h = harness();
    let (base, _server) = spawn_server(h.app_state()).await;
    let client = reqwest::Client::new();

    let health = client.get(format!("{base}/health")).send().await.unwrap();
    assert_eq!(health.status(), 200);
    let health: Value = health.json().await.unwrap();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["components"]["database"]["status"], "healthy");

    let metrics: Value = client
        .get(format!("{base}/metrics"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(metrics["enabled"], true);
    assert!(metrics["operations"].is_array());

    let stats = client
        .get(format!("{base}/cache/stats"))
        .send()
        .await
        .unwrap();
    assert_eq!(stats.status(), 200);

    let cleared: Value = client
        .post(format!("{base}/cache/clear"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(cleared["cleared"], true);
}

#[tokio::test]
async fn consistency_endpoints_check_and_repair() {
    let h = harness();
    let (base, _server) = spawn_server(h.app_state()).await;
    let client = reqwest::Client::new();

    // A chunk with no embedding shows up in the missing_embeddings check.
    client
        .post(format!("{base}/api/v1/chunks"))
        .json(&json!({ "content": "needs embedding" }))
        .send()
        .await
        .unwrap();

    let checks: Value = client
        .post(format!("{base}/consistency/check"))
        .json(&json!({ "check": "missing_embeddings" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(checks["reports"][0]["count"], 1);

    let repair: Value = client
        .post(format!("{base}/consistency/repair"))
        .json(&json!({ "check": "missing_embeddings" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(repair["repaired"], 1);

    let unknown = client
        .post(format!("{base}/consistency/repair"))
        .json(&json!({ "check": "nonsense" }))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown.status(), 400);
}

#[tokio::test]
async fn batch_endpoints_create_and_update() {
    let h = harness();
    let (base, _server) = spawn_server(h.app_state()).await;
    let client = reqwest::Client::new();

    let root_id = chunkloom::model::new_chunk_id();
    let created = client
        .post(format!("{base}/api/v1/chunks/batch"))
        .json(&json!([
            { "id": root_id, "content": "root" },
            { "content": "child", "parent_id": root_id, "sequence_number": 1 },
        ]))
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), 201);
    let created: Value = created.json().await.unwrap();
    let child_id = created["chunks"][1]["id"].as_str().unwrap().to_string();

    let updated: Value = client
        .put(format!("{base}/api/v1/chunks/batch"))
        .json(&json!([
            { "chunk_id": child_id, "content": "child edited" },
        ]))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(updated["chunks"][0]["content"], "child edited");
}

#[tokio::test]
async fn hybrid_endpoint_reports_all_three_scores() {
    let h = harness();
    let (base, _server) = spawn_server(h.app_state()).await;
    let client = reqwest::Client::new();

    let created: Value = client
        .post(format!("{base}/api/v1/texts"))
        .json(&json!({ "content": "amber ember" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    poll_indexed(&client, &base, created["id"].as_str().unwrap()).await;

    let response: Value = client
        .post(format!("{base}/api/v1/search/hybrid"))
        .json(&json!({
            "query": "ember",
            "limit": 5,
            "semantic_weight": 0.5,
            "lexical_weight": 0.5,
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let results = response["results"].as_array().unwrap();
    assert!(!results.is_empty());
    for hit in results {
        assert!(hit["semantic_score"].is_number());
        assert!(hit["lexical_score"].is_number());
        assert!(hit["combined_score"].is_number());
    }
}
