//! In-memory chunk store.
//!
//! The [`ChunkStore`] exclusively owns every [`Chunk`] in the index. It is
//! a plain data structure: the indexer mutates it, the retriever reads it.
//! Chunks are kept in insertion order, which doubles as the tie-breaker
//! for equal retrieval scores.
//!
//! Every mutation of one document's chunks happens inside a single
//! `&mut self` call, so a reader holding a shared borrow (or a read lock
//! in the application) observes either the old or the new chunk list for
//! a path, never a mix.
//!
//! # Snapshot format
//!
//! [`ChunkStore::to_snapshot`] produces a JSON array of [`ChunkRecord`]s;
//! [`ChunkStore::from_snapshot`] rebuilds derived fields on load.

use std::collections::HashSet;

use crate::models::{Chunk, ChunkRecord};

/// Ordered, in-memory collection of chunks for the whole vault.
#[derive(Debug, Clone, Default)]
pub struct ChunkStore {
    chunks: Vec<Chunk>,
}

impl ChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from chunks already in the desired order.
    pub fn from_chunks(chunks: Vec<Chunk>) -> Self {
        Self { chunks }
    }

    /// Replace the entire contents (full rebuild).
    pub fn replace_all(&mut self, chunks: Vec<Chunk>) {
        self.chunks = chunks;
    }

    /// Replace all chunks of one document.
    ///
    /// Old chunks for `file` are dropped and the new ones appended, so an
    /// updated document moves to the end of the insertion order.
    pub fn replace_file(&mut self, file: &str, chunks: Vec<Chunk>) {
        self.chunks.retain(|c| c.file != file);
        self.chunks.extend(chunks);
    }

    /// Insert a document's chunks only when the store has none for it.
    ///
    /// Returns `true` if the chunks were merged.
    pub fn merge_file(&mut self, file: &str, chunks: Vec<Chunk>) -> bool {
        if self.contains_file(file) {
            return false;
        }
        self.chunks.extend(chunks);
        true
    }

    /// Remove all chunks of one document, returning how many were removed.
    pub fn remove_file(&mut self, file: &str) -> usize {
        let before = self.chunks.len();
        self.chunks.retain(|c| c.file != file);
        before - self.chunks.len()
    }

    /// Drop every chunk whose document fails `keep`, returning the number
    /// of chunks removed.
    pub fn prune<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(&str) -> bool,
    {
        let before = self.chunks.len();
        self.chunks.retain(|c| keep(&c.file));
        before - self.chunks.len()
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Chunks belonging to `file`, in document order.
    pub fn chunks_for(&self, file: &str) -> Vec<&Chunk> {
        self.chunks.iter().filter(|c| c.file == file).collect()
    }

    pub fn contains_file(&self, file: &str) -> bool {
        self.chunks.iter().any(|c| c.file == file)
    }

    /// Distinct document paths in first-seen order.
    pub fn files(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.chunks
            .iter()
            .filter(|c| seen.insert(c.file.as_str()))
            .map(|c| c.file.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Lightweight records for persistence, in store order.
    pub fn to_records(&self) -> Vec<ChunkRecord> {
        self.chunks.iter().map(Chunk::to_record).collect()
    }

    /// Rebuild a store from persisted records.
    ///
    /// Offsets are recomputed as running byte positions within each
    /// document, which is exact for the order chunks were written in.
    pub fn from_records(records: Vec<ChunkRecord>) -> Self {
        let mut offsets: std::collections::HashMap<String, usize> = Default::default();
        let chunks = records
            .into_iter()
            .map(|record| {
                let start = offsets.entry(record.file.clone()).or_insert(0);
                let chunk = Chunk::from_record(record, *start);
                *start = chunk.end + 1;
                chunk
            })
            .collect();
        Self { chunks }
    }

    /// Serialize the store as a JSON snapshot.
    pub fn to_snapshot(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.to_records())
    }

    /// Parse a JSON snapshot.
    pub fn from_snapshot(json: &str) -> serde_json::Result<Self> {
        let records: Vec<ChunkRecord> = serde_json::from_str(json)?;
        Ok(Self::from_records(records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{chunk_markdown, DEFAULT_CHUNK_SIZE};

    fn doc(file: &str, text: &str) -> Vec<Chunk> {
        chunk_markdown(file, text, 1, DEFAULT_CHUNK_SIZE)
    }

    #[test]
    fn replace_file_swaps_only_that_document() {
        let mut store = ChunkStore::new();
        store.replace_all([doc("a.md", "# A\none"), doc("b.md", "# B\ntwo")].concat());

        store.replace_file("a.md", doc("a.md", "# A\nthree\n# A2\nfour"));

        assert_eq!(store.files(), vec!["b.md", "a.md"]);
        assert_eq!(store.chunks_for("a.md").len(), 2);
        assert_eq!(store.chunks_for("b.md")[0].content, "two");
    }

    #[test]
    fn remove_and_prune() {
        let mut store = ChunkStore::from_chunks([doc("a.md", "x"), doc("skip/b.md", "y")].concat());
        assert_eq!(store.prune(|f| !f.starts_with("skip/")), 1);
        assert_eq!(store.remove_file("a.md"), 1);
        assert_eq!(store.remove_file("a.md"), 0);
        assert!(store.is_empty());
    }

    #[test]
    fn merge_file_does_not_duplicate() {
        let mut store = ChunkStore::new();
        assert!(store.merge_file("a.md", doc("a.md", "x")));
        assert!(!store.merge_file("a.md", doc("a.md", "x")));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn snapshot_round_trip_recomputes_derived_fields() {
        let store = ChunkStore::from_chunks(doc("n.md", "# H\nHello THERE"));
        let json = store.to_snapshot().unwrap();
        assert!(!json.contains("content_lower"));

        let loaded = ChunkStore::from_snapshot(&json).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.chunks()[0].content_lower, "hello there");
        assert_eq!(loaded.chunks()[0].headings, vec!["H".to_string()]);
    }

    #[test]
    fn corrupt_snapshot_is_an_error() {
        assert!(ChunkStore::from_snapshot("{not json").is_err());
    }
}
