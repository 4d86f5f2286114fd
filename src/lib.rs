//! # Chunkloom: a semantic content server
//!
//! Clients submit free-form text; the server decomposes it into a
//! hierarchy of semantic chunks, computes dense vector embeddings,
//! extracts knowledge-graph entities and relationships, and persists all
//! three representations through one storage backend. Retrieval runs by
//! id, hierarchy, tag set, vector similarity, graph traversal, or a
//! weighted hybrid of vector and lexical scores, served over an
//! in-process cache.
//!
//! ```text
//! POST /texts ──► ingest::IngestPipeline ──► clients::Chunker (LLM)
//!                       │                        │
//!                       │   chunks ◄─────────────┘
//!                       ├─► store::ChunkStore ──► storage::StorageBackend
//!                       ├─► clients::EmbeddingProvider ──► embeddings
//!                       └─► clients::EntityExtractor ──► graph nodes/edges
//!
//! /search/* ──► search::SearchEngine ──► cache::QueryCache
//!                       │ (miss)
//!                       └─► storage::StorageBackend (vector / graph / scan)
//!
//! monitor::ConsistencyMonitor reconciles chunks ↔ tags ↔ closure ↔ embeddings
//! monitor::PerfMonitor records latency histograms and raises alerts
//! ```
//!
//! The unified data model lives in [`model`]: every page, paragraph, tag,
//! template, and slot is one [`model::Chunk`] distinguished by capability
//! flags, with hierarchy materialized in a closure table.

pub mod cache;
pub mod clients;
pub mod config;
pub mod errors;
pub mod http;
pub mod ingest;
pub mod model;
pub mod monitor;
pub mod search;
pub mod storage;
pub mod store;
pub mod telemetry;

pub use errors::{CoreError, ErrorKind};
pub use model::{Chunk, ChunkId};
