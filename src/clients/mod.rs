//! Clients for the external AI services: the LLM chunker / entity
//! extractor and the embedding generator.
//!
//! Both retry on HTTP 429/5xx with exponential backoff and surface a typed
//! error once the attempt budget is spent. Deterministic mock
//! implementations back the test suites and keyless local runs.

mod embedding;
mod llm;

pub use embedding::{EmbeddingProvider, HttpEmbeddingProvider, MockEmbeddingProvider};
pub use llm::{
    ChunkSpan, Chunker, EntityExtractor, ExtractedEntity, ExtractedRelation, ExtractionOutcome,
    HttpLlmClient, MockLlmClient,
};
