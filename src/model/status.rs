use serde::{Deserialize, Serialize};

use super::chunk::{Chunk, JsonMap};

/// Ingest pipeline state, persisted into the document root's
/// `metadata.status` so a crashed process can resume from the last
/// checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Received,
    Chunking,
    Embedding,
    GraphExtracting,
    Indexed,
    Failed,
}

impl IngestStatus {
    pub const METADATA_KEY: &'static str = "status";

    /// Whether the pipeline still has work to do for this document.
    pub fn is_pending(self) -> bool {
        !matches!(self, IngestStatus::Indexed | IngestStatus::Failed)
    }

    /// The coarse status exposed over the API: anything still moving is
    /// reported as `processing`.
    pub fn api_label(self) -> &'static str {
        match self {
            IngestStatus::Indexed => "indexed",
            IngestStatus::Failed => "failed",
            _ => "processing",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            IngestStatus::Received => "received",
            IngestStatus::Chunking => "chunking",
            IngestStatus::Embedding => "embedding",
            IngestStatus::GraphExtracting => "graph_extracting",
            IngestStatus::Indexed => "indexed",
            IngestStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "received" => Some(IngestStatus::Received),
            "chunking" => Some(IngestStatus::Chunking),
            "embedding" => Some(IngestStatus::Embedding),
            "graph_extracting" => Some(IngestStatus::GraphExtracting),
            "indexed" => Some(IngestStatus::Indexed),
            "failed" => Some(IngestStatus::Failed),
            _ => None,
        }
    }

    /// Reads the checkpoint from a root chunk's metadata.
    pub fn of(chunk: &Chunk) -> Option<Self> {
        chunk
            .metadata
            .get(Self::METADATA_KEY)
            .and_then(|v| v.as_str())
            .and_then(Self::parse)
    }

    /// Writes the checkpoint into a metadata map.
    pub fn write_to(self, metadata: &mut JsonMap) {
        metadata.insert(
            Self::METADATA_KEY.to_string(),
            serde_json::Value::String(self.as_str().to_string()),
        );
    }
}

impl std::fmt::Display for IngestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewChunk;

    #[test]
    fn status_round_trips_through_metadata() {
        let mut chunk = Chunk::from_new(NewChunk::text("doc"), None, 0, None);
        IngestStatus::Embedding.write_to(&mut chunk.metadata);
        assert_eq!(IngestStatus::of(&chunk), Some(IngestStatus::Embedding));
    }

    #[test]
    fn intermediate_states_report_processing() {
        assert_eq!(IngestStatus::Chunking.api_label(), "processing");
        assert_eq!(IngestStatus::Indexed.api_label(), "indexed");
        assert_eq!(IngestStatus::Failed.api_label(), "failed");
    }

    #[test]
    fn pending_excludes_terminal_states() {
        assert!(IngestStatus::Received.is_pending());
        assert!(IngestStatus::GraphExtracting.is_pending());
        assert!(!IngestStatus::Indexed.is_pending());
        assert!(!IngestStatus::Failed.is_pending());
    }
}
