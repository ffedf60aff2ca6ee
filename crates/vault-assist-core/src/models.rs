//! Core data models shared by the indexer, retriever, and orchestrator.
//!
//! A [`Chunk`] is the unit of indexing: a contiguous fragment of one
//! markdown document that never spans a heading boundary. Chunks are
//! persisted as the lighter [`ChunkRecord`]; derived fields (lowercased
//! text, offsets) are recomputed when a record is loaded.

use serde::{Deserialize, Serialize};

/// A fragment of one document, scored and injected into prompts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Stable identifier: `"{file}#{ordinal}"`.
    pub id: String,
    /// Vault-relative path of the owning document.
    pub file: String,
    /// Outline path of enclosing headings, outermost first.
    pub headings: Vec<String>,
    /// Raw chunk text (heading lines excluded).
    pub content: String,
    /// Lowercased copy of `content`, used for scoring.
    pub content_lower: String,
    /// Document modification time (milliseconds since the Unix epoch).
    pub updated: i64,
    /// Byte offset of the first accumulated line within the document.
    pub start: usize,
    /// Byte offset one past the last accumulated line.
    pub end: usize,
}

impl Chunk {
    /// Build a chunk and derive its identifier and lowercased text.
    pub fn new(
        file: &str,
        ordinal: usize,
        headings: Vec<String>,
        content: String,
        updated: i64,
        start: usize,
        end: usize,
    ) -> Self {
        Self {
            id: chunk_id(file, ordinal),
            file: file.to_string(),
            headings,
            content_lower: content.to_lowercase(),
            content,
            updated,
            start,
            end,
        }
    }

    /// Rehydrate a chunk from its persisted record.
    ///
    /// Offsets are not persisted; `start` is supplied by the caller (the
    /// running offset across the document's records) and `end` follows
    /// from the content length.
    pub fn from_record(record: ChunkRecord, start: usize) -> Self {
        let end = start + record.content.len();
        Self {
            id: record.id,
            file: record.file,
            headings: record.headings,
            content_lower: record.content.to_lowercase(),
            content: record.content,
            updated: record.updated,
            start,
            end,
        }
    }

    /// The persisted form of this chunk.
    pub fn to_record(&self) -> ChunkRecord {
        ChunkRecord {
            id: self.id.clone(),
            file: self.file.clone(),
            headings: self.headings.clone(),
            content: self.content.clone(),
            updated: self.updated,
        }
    }

    /// Human-readable location, e.g. `Notes/B.md > Todo > Groceries`.
    pub fn location(&self) -> String {
        let mut parts = Vec::with_capacity(self.headings.len() + 1);
        parts.push(self.file.as_str());
        parts.extend(self.headings.iter().map(String::as_str));
        parts.join(" > ")
    }

    /// Whether `offset` falls inside this chunk's byte range.
    pub fn contains_offset(&self, offset: usize) -> bool {
        offset >= self.start && offset <= self.end
    }
}

/// Format a chunk identifier from its document path and ordinal.
pub fn chunk_id(file: &str, ordinal: usize) -> String {
    format!("{}#{}", file, ordinal)
}

/// Lightweight persisted form of a [`Chunk`].
///
/// This is the element type of the on-disk index snapshot: a JSON array
/// of `{id, file, headings, content, updated}` objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: String,
    pub file: String,
    #[serde(default)]
    pub headings: Vec<String>,
    pub content: String,
    #[serde(default)]
    pub updated: i64,
}

/// Provenance class of a chunk included in a prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkSource {
    /// From the document currently open in the editor.
    Active,
    /// From index-wide relevance scoring.
    Retrieved,
    /// Explicitly named by the user.
    Mention,
}

impl ChunkSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkSource::Active => "active",
            ChunkSource::Retrieved => "retrieved",
            ChunkSource::Mention => "mention",
        }
    }
}

impl std::fmt::Display for ChunkSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scored reference to a chunk, constructed per request.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedChunk {
    pub chunk: Chunk,
    pub score: u32,
    pub source: ChunkSource,
}

/// Per-request retrieval bundle: the three provenance lists plus the
/// assembled prompt block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RagContext {
    pub active: Vec<RetrievedChunk>,
    pub retrieved: Vec<RetrievedChunk>,
    pub mentions: Vec<RetrievedChunk>,
    /// Assembled context block; empty when no chunk survived sanitizing.
    pub prompt: String,
}

impl RagContext {
    /// True when nothing usable made it into the prompt.
    pub fn has_context(&self) -> bool {
        !self.prompt.is_empty()
    }

    /// All included chunks in prompt order (active, retrieved, mentions).
    pub fn chunks(&self) -> impl Iterator<Item = &RetrievedChunk> {
        self.active
            .iter()
            .chain(self.retrieved.iter())
            .chain(self.mentions.iter())
    }

    pub fn len(&self) -> usize {
        self.active.len() + self.retrieved.len() + self.mentions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_joins_file_and_headings() {
        let chunk = Chunk::new(
            "Notes/B.md",
            0,
            vec!["Todo".into(), "Groceries".into()],
            "milk".into(),
            0,
            0,
            4,
        );
        assert_eq!(chunk.location(), "Notes/B.md > Todo > Groceries");
        assert_eq!(chunk.id, "Notes/B.md#0");
    }

    #[test]
    fn record_drops_derived_fields() {
        let chunk = Chunk::new("a.md", 3, vec![], "Hello World".into(), 42, 10, 21);
        let json = serde_json::to_value(chunk.to_record()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "id": "a.md#3",
                "file": "a.md",
                "headings": [],
                "content": "Hello World",
                "updated": 42
            })
        );

        let back = Chunk::from_record(chunk.to_record(), 10);
        assert_eq!(back.content_lower, "hello world");
        assert_eq!(back.end, 21);
    }
}
