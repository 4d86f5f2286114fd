//! REST adapter over the storage engine's HTTPS/JSON surface.
//!
//! Stateless: every call authenticates with the configured API key,
//! serializes native values (dense vectors included) into the engine's
//! wire format, translates engine status codes into the core taxonomy,
//! and retries transient failures with exponential backoff.

use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use url::Url;
use uuid::Uuid;

use async_trait::async_trait;

use crate::errors::CoreError;
use crate::model::{
    Chunk, ChunkId, ChunkPatch, ClosureRow, EmbeddingRow, GraphEdge, GraphNode, JournalEntry,
    Subgraph, TagPair,
};

use super::retry::RetryPolicy;
use super::{ChunkFilter, StorageBackend, VectorFilter, VectorHit};

pub struct RestBackend {
    client: reqwest::Client,
    base: Url,
    api_key: String,
    retry: RetryPolicy,
}

impl RestBackend {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, CoreError> {
        let base = Url::parse(base_url)
            .map_err(|e| CoreError::internal(format!("invalid STORAGE_URL '{base_url}': {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CoreError::internal(format!("failed to build storage client: {e}")))?;
        Ok(RestBackend {
            client,
            base,
            api_key: api_key.to_string(),
            retry: RetryPolicy::storage(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, CoreError> {
        self.base
            .join(path)
            .map_err(|e| CoreError::internal(format!("bad storage path '{path}': {e}")))
    }

    /// One attempt: send, translate transport and status failures.
    async fn attempt<B: Serialize>(
        &self,
        method: Method,
        url: Url,
        body: Option<&B>,
    ) -> Result<Option<serde_json::Value>, CoreError> {
        let mut request = self
            .client
            .request(method, url)
            .bearer_auth(&self.api_key)
            .header("accept", "application/json");
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(translate_transport)?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if status.is_success() {
            if status == StatusCode::NO_CONTENT {
                return Ok(Some(serde_json::Value::Null));
            }
            let value = response
                .json::<serde_json::Value>()
                .await
                .map_err(|e| CoreError::storage(format!("malformed engine response: {e}"), false))?;
            return Ok(Some(value));
        }

        let detail = response.text().await.unwrap_or_default();
        Err(translate_status(status, &detail))
    }

    /// Retrying call. Returns `None` for 404 so `get`-style operations can
    /// surface absence instead of an error.
    async fn call<B: Serialize, R: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Option<R>, CoreError> {
        let url = self.endpoint(path)?;
        let value = self
            .retry
            .run(path, CoreError::is_retryable, || {
                self.attempt(method.clone(), url.clone(), body)
            })
            .await?;
        match value {
            None => Ok(None),
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| CoreError::storage(format!("engine payload mismatch: {e}"), false)),
        }
    }

    async fn expect<B: Serialize, R: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<R, CoreError> {
        self.call(method, path, body)
            .await?
            .ok_or_else(|| CoreError::storage(format!("engine returned 404 for {path}"), false))
    }
}

fn translate_transport(err: reqwest::Error) -> CoreError {
    if err.is_timeout() {
        // Engine timeouts count as transient: the retry loop owns them.
        CoreError::storage(format!("storage engine timeout: {err}"), true)
    } else if err.is_connect() {
        CoreError::storage(format!("storage engine unreachable: {err}"), true)
    } else {
        CoreError::storage(format!("storage transport failure: {err}"), false)
    }
}

fn translate_status(status: StatusCode, detail: &str) -> CoreError {
    let detail = if detail.is_empty() {
        "(no body)"
    } else {
        detail
    };
    match status {
        StatusCode::CONFLICT => CoreError::conflict(format!("engine conflict: {detail}")),
        StatusCode::TOO_MANY_REQUESTS => {
            CoreError::storage(format!("engine rate limit: {detail}"), true)
        }
        s if s.is_server_error() => {
            CoreError::storage(format!("engine {s}: {detail}"), true)
        }
        s => CoreError::storage(format!("engine rejected call ({s}): {detail}"), false),
    }
}

#[async_trait]
impl StorageBackend for RestBackend {
    async fn get_chunk(&self, id: ChunkId) -> Result<Option<Chunk>, CoreError> {
        self.call::<(), Chunk>(Method::GET, &format!("v1/chunks/{id}"), None)
            .await
    }

    async fn put_chunk(&self, chunk: &Chunk) -> Result<(), CoreError> {
        self.expect::<Chunk, serde_json::Value>(
            Method::PUT,
            &format!("v1/chunks/{}", chunk.id),
            Some(chunk),
        )
        .await?;
        Ok(())
    }

    async fn patch_chunk(&self, id: ChunkId, patch: &ChunkPatch) -> Result<Chunk, CoreError> {
        self.call::<ChunkPatch, Chunk>(Method::PATCH, &format!("v1/chunks/{id}"), Some(patch))
            .await?
            .ok_or_else(|| CoreError::not_found("chunk", id))
    }

    async fn delete_chunk(&self, id: ChunkId) -> Result<bool, CoreError> {
        let existed = self
            .call::<(), serde_json::Value>(Method::DELETE, &format!("v1/chunks/{id}"), None)
            .await?;
        Ok(existed.is_some())
    }

    async fn scan_chunks(&self, filter: &ChunkFilter) -> Result<Vec<Chunk>, CoreError> {
        #[derive(serde::Deserialize)]
        struct ScanResponse {
            chunks: Vec<Chunk>,
        }
        let resp: ScanResponse = self
            .expect(Method::POST, "v1/chunks/scan", Some(filter))
            .await?;
        Ok(resp.chunks)
    }

    async fn count_chunks(&self, filter: &ChunkFilter) -> Result<usize, CoreError> {
        #[derive(serde::Deserialize)]
        struct CountResponse {
            count: usize,
        }
        let resp: CountResponse = self
            .expect(Method::POST, "v1/chunks/count", Some(filter))
            .await?;
        Ok(resp.count)
    }

    async fn closure_of(&self, id: ChunkId) -> Result<Vec<ClosureRow>, CoreError> {
        #[derive(serde::Deserialize)]
        struct RowsResponse {
            rows: Vec<ClosureRow>,
        }
        let resp: RowsResponse = self
            .expect::<(), _>(
                Method::GET,
                &format!("v1/closure/{id}?direction=descendants"),
                None,
            )
            .await?;
        Ok(resp.rows)
    }

    async fn ancestors_of(&self, id: ChunkId) -> Result<Vec<ClosureRow>, CoreError> {
        #[derive(serde::Deserialize)]
        struct RowsResponse {
            rows: Vec<ClosureRow>,
        }
        let resp: RowsResponse = self
            .expect::<(), _>(
                Method::GET,
                &format!("v1/closure/{id}?direction=ancestors"),
                None,
            )
            .await?;
        Ok(resp.rows)
    }

    async fn insert_closure_rows(&self, rows: &[ClosureRow]) -> Result<(), CoreError> {
        self.expect::<_, serde_json::Value>(
            Method::POST,
            "v1/closure/rows",
            Some(&json!({ "rows": rows })),
        )
        .await?;
        Ok(())
    }

    async fn delete_closure_rows(&self, pairs: &[(ChunkId, ChunkId)]) -> Result<(), CoreError> {
        self.expect::<_, serde_json::Value>(
            Method::POST,
            "v1/closure/delete",
            Some(&json!({ "pairs": pairs })),
        )
        .await?;
        Ok(())
    }

    async fn delete_closure_for(&self, id: ChunkId) -> Result<(), CoreError> {
        self.call::<(), serde_json::Value>(Method::DELETE, &format!("v1/closure/{id}"), None)
            .await?;
        Ok(())
    }

    async fn nearest_neighbors(
        &self,
        vector: &[f32],
        k: usize,
        filter: &VectorFilter,
    ) -> Result<Vec<VectorHit>, CoreError> {
        #[derive(serde::Deserialize)]
        struct SearchResponse {
            hits: Vec<VectorHit>,
        }
        let resp: SearchResponse = self
            .expect(
                Method::POST,
                "v1/vectors/search",
                Some(&json!({ "vector": vector, "k": k, "filter": filter })),
            )
            .await?;
        Ok(resp.hits)
    }

    async fn graph_traverse(
        &self,
        start: &str,
        max_depth: u32,
        relation_filter: &[String],
        limit: usize,
    ) -> Result<Subgraph, CoreError> {
        self.expect(
            Method::POST,
            "v1/graph/traverse",
            Some(&json!({
                "start": start,
                "max_depth": max_depth,
                "relations": relation_filter,
                "limit": limit,
            })),
        )
        .await
    }

    async fn upsert_graph_node(&self, node: &GraphNode) -> Result<(), CoreError> {
        self.expect::<GraphNode, serde_json::Value>(
            Method::PUT,
            &format!("v1/graph/nodes/{}", node.id),
            Some(node),
        )
        .await?;
        Ok(())
    }

    async fn upsert_graph_edge(&self, edge: &GraphEdge) -> Result<(), CoreError> {
        self.expect::<GraphEdge, serde_json::Value>(
            Method::PUT,
            &format!("v1/graph/edges/{}", edge.id),
            Some(edge),
        )
        .await?;
        Ok(())
    }

    async fn nodes_for_chunk(&self, chunk_id: ChunkId) -> Result<Vec<GraphNode>, CoreError> {
        #[derive(serde::Deserialize)]
        struct NodesResponse {
            nodes: Vec<GraphNode>,
        }
        let resp: NodesResponse = self
            .expect::<(), _>(
                Method::GET,
                &format!("v1/graph/chunks/{chunk_id}/nodes"),
                None,
            )
            .await?;
        Ok(resp.nodes)
    }

    async fn delete_graph_for_chunk(&self, chunk_id: ChunkId) -> Result<(), CoreError> {
        self.call::<(), serde_json::Value>(
            Method::DELETE,
            &format!("v1/graph/chunks/{chunk_id}"),
            None,
        )
        .await?;
        Ok(())
    }

    async fn upsert_tag_relation(&self, pair: TagPair) -> Result<(), CoreError> {
        self.expect::<TagPair, serde_json::Value>(Method::PUT, "v1/tags", Some(&pair))
            .await?;
        Ok(())
    }

    async fn delete_tag_relation(&self, pair: TagPair) -> Result<(), CoreError> {
        self.expect::<TagPair, serde_json::Value>(Method::POST, "v1/tags/delete", Some(&pair))
            .await?;
        Ok(())
    }

    async fn tags_of_chunk(&self, id: ChunkId) -> Result<Vec<ChunkId>, CoreError> {
        #[derive(serde::Deserialize)]
        struct IdsResponse {
            ids: Vec<ChunkId>,
        }
        let resp: IdsResponse = self
            .expect::<(), _>(Method::GET, &format!("v1/tags/of/{id}"), None)
            .await?;
        Ok(resp.ids)
    }

    async fn chunks_with_tag(&self, tag_id: ChunkId) -> Result<Vec<ChunkId>, CoreError> {
        #[derive(serde::Deserialize)]
        struct IdsResponse {
            ids: Vec<ChunkId>,
        }
        let resp: IdsResponse = self
            .expect::<(), _>(Method::GET, &format!("v1/tags/with/{tag_id}"), None)
            .await?;
        Ok(resp.ids)
    }

    async fn delete_tag_relations_for(&self, id: ChunkId) -> Result<(), CoreError> {
        self.call::<(), serde_json::Value>(Method::DELETE, &format!("v1/tags/chunks/{id}"), None)
            .await?;
        Ok(())
    }

    async fn list_tag_pairs(&self) -> Result<Vec<TagPair>, CoreError> {
        #[derive(serde::Deserialize)]
        struct PairsResponse {
            pairs: Vec<TagPair>,
        }
        let resp: PairsResponse = self.expect::<(), _>(Method::GET, "v1/tags", None).await?;
        Ok(resp.pairs)
    }

    async fn upsert_embedding(&self, row: &EmbeddingRow) -> Result<(), CoreError> {
        self.expect::<EmbeddingRow, serde_json::Value>(Method::PUT, "v1/embeddings", Some(row))
            .await?;
        Ok(())
    }

    async fn get_embedding(
        &self,
        chunk_id: ChunkId,
        model_name: &str,
    ) -> Result<Option<EmbeddingRow>, CoreError> {
        self.call::<(), EmbeddingRow>(
            Method::GET,
            &format!("v1/embeddings/{chunk_id}/{model_name}"),
            None,
        )
        .await
    }

    async fn delete_embeddings_for(&self, chunk_id: ChunkId) -> Result<(), CoreError> {
        self.call::<(), serde_json::Value>(
            Method::DELETE,
            &format!("v1/embeddings/chunks/{chunk_id}"),
            None,
        )
        .await?;
        Ok(())
    }

    async fn list_embedding_keys(&self) -> Result<Vec<(ChunkId, String)>, CoreError> {
        #[derive(serde::Deserialize)]
        struct KeysResponse {
            keys: Vec<(ChunkId, String)>,
        }
        let resp: KeysResponse = self
            .expect::<(), _>(Method::GET, "v1/embeddings/keys", None)
            .await?;
        Ok(resp.keys)
    }

    async fn put_journal(&self, entry: &JournalEntry) -> Result<(), CoreError> {
        self.expect::<JournalEntry, serde_json::Value>(
            Method::PUT,
            &format!("v1/journal/{}", entry.id),
            Some(entry),
        )
        .await?;
        Ok(())
    }

    async fn delete_journal(&self, id: Uuid) -> Result<(), CoreError> {
        self.call::<(), serde_json::Value>(Method::DELETE, &format!("v1/journal/{id}"), None)
            .await?;
        Ok(())
    }

    async fn list_open_journals(&self) -> Result<Vec<JournalEntry>, CoreError> {
        #[derive(serde::Deserialize)]
        struct OpenResponse {
            entries: Vec<JournalEntry>,
        }
        let resp: OpenResponse = self
            .expect::<(), _>(Method::GET, "v1/journal/open", None)
            .await?;
        Ok(resp.entries)
    }

    async fn ping(&self) -> Result<(), CoreError> {
        self.expect::<(), serde_json::Value>(Method::GET, "v1/health", None)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn backend(server: &MockServer) -> RestBackend {
        RestBackend::new(&server.base_url(), "test-key", Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn get_chunk_sends_bearer_auth_and_maps_404_to_none() {
        let server = MockServer::start();
        let id = uuid::Uuid::new_v4();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path(format!("/v1/chunks/{id}"))
                .header("authorization", "Bearer test-key");
            then.status(404);
        });

        let result = backend(&server).get_chunk(id).await.unwrap();
        mock.assert();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn transient_5xx_is_retried_until_exhaustion() {
        let server = MockServer::start();
        let fail = server.mock(|when, then| {
            when.method(POST).path("/v1/chunks/count");
            then.status(503).body("warming up");
        });

        let mut b = backend(&server);
        b.retry = RetryPolicy {
            base: Duration::from_millis(1),
            cap: Duration::from_millis(2),
            jitter: 0.0,
            max_attempts: 4,
        };

        let err = b.count_chunks(&ChunkFilter::default()).await.unwrap_err();
        assert_eq!(fail.hits(), 4);
        assert!(matches!(
            err,
            CoreError::ExternalStorage { retryable: true, .. }
        ));
    }

    #[tokio::test]
    async fn conflict_status_maps_to_conflict_kind() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(PUT).path_contains("/v1/chunks/");
            then.status(409).body("duplicate sequence");
        });

        let chunk = Chunk::from_new(crate::model::NewChunk::text("x"), None, 0, None);
        let err = backend(&server).put_chunk(&chunk).await.unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn client_error_is_not_retried() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/v1/chunks/scan");
            then.status(400).body("bad filter");
        });

        let err = backend(&server)
            .scan_chunks(&ChunkFilter::default())
            .await
            .unwrap_err();
        assert_eq!(mock.hits(), 1);
        assert!(matches!(err, CoreError::ExternalStorage { retryable: false, .. }));
    }
}
