//! LLM chunker and entity-extractor client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::errors::CoreError;
use crate::model::JsonMap;
use crate::storage::RetryPolicy;

/// Chunking rules sent with every chunking request. The model must return
/// one semantic unit per chunk and preserve bullet indentation.
const CHUNKING_SYSTEM_PROMPT: &str = "Split the text into semantic chunks. \
Each chunk is one semantic unit (a sentence, bullet point, or short \
paragraph). Preserve the order of the source text exactly. Report each \
chunk's indentation level, where 0 is top level and nested bullets \
increase the level by one. Never merge, reorder, or reword content.";

const EXTRACTION_SYSTEM_PROMPT: &str = "Extract named entities and the \
relationships between them from the text. For each entity report a name, \
a type, and any salient properties. For each relationship report the \
source entity, target entity, and a short relationship label.";

/// One unit from the chunker: content plus its indentation level,
/// in source order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSpan {
    pub content: String,
    pub indent_level: u32,
}

#[async_trait]
pub trait Chunker: Send + Sync {
    /// Decomposes one text body into an ordered list of spans. The
    /// client never reorders what the model returns.
    async fn chunk_text(&self, text: &str) -> Result<Vec<ChunkSpan>, CoreError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub name: String,
    pub entity_type: String,
    #[serde(default)]
    pub properties: JsonMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRelation {
    /// Entity names, resolved against the same outcome's entity list.
    pub source: String,
    pub target: String,
    pub relationship: String,
    #[serde(default)]
    pub properties: JsonMap,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionOutcome {
    pub entities: Vec<ExtractedEntity>,
    pub relations: Vec<ExtractedRelation>,
}

#[async_trait]
pub trait EntityExtractor: Send + Sync {
    async fn extract(&self, content: &str) -> Result<ExtractionOutcome, CoreError>;
}

// ── HTTP client ────────────────────────────────────────────────────────

pub struct HttpLlmClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    retry: RetryPolicy,
}

impl HttpLlmClient {
    pub fn new(endpoint: &str, api_key: &str, timeout: Duration) -> Result<Self, CoreError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CoreError::internal(format!("failed to build llm client: {e}")))?;
        Ok(HttpLlmClient {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            retry: RetryPolicy::external_ai(),
        })
    }

    async fn post<Req: Serialize, Resp: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &Req,
    ) -> Result<Resp, CoreError> {
        let url = format!("{}{path}", self.endpoint);
        self.retry
            .run(path, CallError::is_transient, || async {
                let response = self
                    .client
                    .post(&url)
                    .bearer_auth(&self.api_key)
                    .json(body)
                    .send()
                    .await
                    .map_err(|e| {
                        if e.is_timeout() {
                            CallError::Fatal(CoreError::deadline(format!("llm call {path}")))
                        } else {
                            CallError::Transient(format!("llm transport failure: {e}"))
                        }
                    })?;
                let status = response.status();
                if status.is_success() {
                    return response.json::<Resp>().await.map_err(|e| {
                        CallError::Fatal(CoreError::llm(format!("malformed llm response: {e}")))
                    });
                }
                let detail = response.text().await.unwrap_or_default();
                if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                    Err(CallError::Transient(format!("llm {status}: {detail}")))
                } else {
                    Err(CallError::Fatal(CoreError::llm(format!(
                        "llm rejected call ({status}): {detail}"
                    ))))
                }
            })
            .await
            .map_err(|err| err.into_llm_error())
    }
}

/// Internal classification for the retry loop: transient failures stay in
/// the loop, fatal ones leave immediately with their final kind.
pub(crate) enum CallError {
    Transient(String),
    Fatal(CoreError),
}

impl CallError {
    pub(crate) fn is_transient(&self) -> bool {
        matches!(self, CallError::Transient(_))
    }

    fn into_llm_error(self) -> CoreError {
        match self {
            CallError::Transient(message) => CoreError::llm(message),
            CallError::Fatal(err) => err,
        }
    }

    pub(crate) fn into_embedding_error(self) -> CoreError {
        match self {
            CallError::Transient(message) => CoreError::embedding(message),
            CallError::Fatal(err) => err,
        }
    }
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallError::Transient(message) => write!(f, "transient: {message}"),
            CallError::Fatal(err) => write!(f, "{err}"),
        }
    }
}

#[derive(Serialize)]
struct ChunkRequest<'a> {
    system: &'static str,
    text: &'a str,
}

#[derive(Deserialize)]
struct ChunkResponse {
    chunks: Vec<ChunkSpan>,
}

#[async_trait]
impl Chunker for HttpLlmClient {
    async fn chunk_text(&self, text: &str) -> Result<Vec<ChunkSpan>, CoreError> {
        let request = ChunkRequest {
            system: CHUNKING_SYSTEM_PROMPT,
            text,
        };
        let response: ChunkResponse = self.post("/v1/chunk", &request).await?;
        Ok(response.chunks)
    }
}

#[derive(Serialize)]
struct ExtractRequest<'a> {
    system: &'static str,
    text: &'a str,
}

#[async_trait]
impl EntityExtractor for HttpLlmClient {
    async fn extract(&self, content: &str) -> Result<ExtractionOutcome, CoreError> {
        let request = ExtractRequest {
            system: EXTRACTION_SYSTEM_PROMPT,
            text: content,
        };
        self.post("/v1/extract", &request).await
    }
}

// ── Mock client ────────────────────────────────────────────────────────

/// Deterministic chunker and extractor for tests and keyless local runs.
///
/// Chunking: each non-empty line becomes one span; two leading spaces per
/// indentation level. Extraction: capitalized words become entities of
/// type `term`; consecutive entities within a line are related by
/// `mentioned_with`.
#[derive(Debug, Default, Clone)]
pub struct MockLlmClient;

impl MockLlmClient {
    pub fn new() -> Self {
        MockLlmClient
    }
}

#[async_trait]
impl Chunker for MockLlmClient {
    async fn chunk_text(&self, text: &str) -> Result<Vec<ChunkSpan>, CoreError> {
        let spans = text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                let leading = line.len() - line.trim_start().len();
                ChunkSpan {
                    content: line.trim().to_string(),
                    indent_level: (leading / 2) as u32,
                }
            })
            .collect();
        Ok(spans)
    }
}

#[async_trait]
impl EntityExtractor for MockLlmClient {
    async fn extract(&self, content: &str) -> Result<ExtractionOutcome, CoreError> {
        let mut entities: Vec<ExtractedEntity> = Vec::new();
        let mut relations = Vec::new();

        for line in content.lines() {
            let line_entities: Vec<String> = line
                .split(|c: char| !c.is_alphanumeric())
                .filter(|w| w.len() > 1 && w.chars().next().is_some_and(|c| c.is_uppercase()))
                .map(|w| w.to_string())
                .collect();
            for pair in line_entities.windows(2) {
                relations.push(ExtractedRelation {
                    source: pair[0].clone(),
                    target: pair[1].clone(),
                    relationship: "mentioned_with".to_string(),
                    properties: JsonMap::new(),
                });
            }
            for name in line_entities {
                if !entities.iter().any(|e| e.name == name) {
                    entities.push(ExtractedEntity {
                        name,
                        entity_type: "term".to_string(),
                        properties: JsonMap::new(),
                    });
                }
            }
        }

        Ok(ExtractionOutcome {
            entities,
            relations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[tokio::test]
    async fn mock_chunker_splits_lines_and_reads_indentation() {
        let spans = MockLlmClient::new()
            .chunk_text("A.\n  - nested\nC.")
            .await
            .unwrap();
        assert_eq!(spans.len(), 3);
        assert_eq!(spans[0].content, "A.");
        assert_eq!(spans[0].indent_level, 0);
        assert_eq!(spans[1].content, "- nested");
        assert_eq!(spans[1].indent_level, 1);
        assert_eq!(spans[2].content, "C.");
    }

    #[tokio::test]
    async fn mock_extractor_relates_consecutive_entities() {
        let outcome = MockLlmClient::new()
            .extract("Ada met Babbage in London.")
            .await
            .unwrap();
        let names: Vec<&str> = outcome.entities.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["Ada", "Babbage", "London"]);
        assert_eq!(outcome.relations.len(), 2);
        assert_eq!(outcome.relations[0].source, "Ada");
        assert_eq!(outcome.relations[0].target, "Babbage");
    }

    #[tokio::test]
    async fn http_chunker_parses_ordered_spans() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST)
                .path("/v1/chunk")
                .header("authorization", "Bearer key");
            then.status(200).json_body(serde_json::json!({
                "chunks": [
                    {"content": "first", "indent_level": 0},
                    {"content": "second", "indent_level": 1},
                ]
            }));
        });

        let client =
            HttpLlmClient::new(&server.base_url(), "key", Duration::from_secs(2)).unwrap();
        let spans = client.chunk_text("whatever").await.unwrap();
        assert_eq!(spans[0].content, "first");
        assert_eq!(spans[1].indent_level, 1);
    }

    #[tokio::test]
    async fn http_client_retries_429_and_surfaces_llm_failure() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/v1/chunk");
            then.status(429).body("slow down");
        });

        let mut client =
            HttpLlmClient::new(&server.base_url(), "key", Duration::from_secs(2)).unwrap();
        client.retry = RetryPolicy {
            base: Duration::from_millis(1),
            cap: Duration::from_millis(2),
            jitter: 0.0,
            max_attempts: 3,
        };

        let err = client.chunk_text("text").await.unwrap_err();
        assert_eq!(mock.hits(), 3);
        assert!(matches!(err, CoreError::ExternalLlm { .. }));
    }

    #[tokio::test]
    async fn http_client_does_not_retry_4xx() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/v1/extract");
            then.status(400).body("prompt too long");
        });

        let client =
            HttpLlmClient::new(&server.base_url(), "key", Duration::from_secs(2)).unwrap();
        let err = client.extract("text").await.unwrap_err();
        assert_eq!(mock.hits(), 1);
        assert!(matches!(err, CoreError::ExternalLlm { .. }));
    }
}
