//! Heading-aware markdown chunker.
//!
//! Splits a markdown document into [`Chunk`]s that never cross a heading
//! boundary. Each chunk carries the outline path of the headings that
//! enclose it, so a retrieved fragment can be annotated as
//! `file > heading > subheading` when it is injected into a prompt.
//!
//! # Algorithm
//!
//! 1. Scan the document line by line, tracking byte offsets.
//! 2. A heading line (`#` to `######` followed by whitespace) flushes the
//!    accumulating chunk, truncates the outline stack to `level - 1`, and
//!    pushes the new title. Heading lines are not part of any chunk body.
//! 3. Every other line accumulates into the current chunk. Once the
//!    accumulated text exceeds the soft size bound, the chunk is flushed.
//! 4. Whitespace-only chunks are discarded.
//!
//! Lines inside fenced code blocks are never treated as headings.
//!
//! # Example
//!
//! ```rust
//! use vault_assist_core::chunk::{chunk_markdown, DEFAULT_CHUNK_SIZE};
//!
//! let chunks = chunk_markdown("Notes/B.md", "## Todo\nTODO buy milk\n", 0, DEFAULT_CHUNK_SIZE);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].headings, vec!["Todo".to_string()]);
//! assert_eq!(chunks[0].content, "TODO buy milk");
//! ```

use crate::models::Chunk;

/// Soft upper bound on accumulated chunk text, in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 800;

/// Split `text` into heading-scoped chunks.
///
/// Deterministic: identical input always yields identical ids, outline
/// paths, content, and offsets.
pub fn chunk_markdown(file: &str, text: &str, updated: i64, max_chars: usize) -> Vec<Chunk> {
    let mut builder = ChunkBuilder::new(file, updated, max_chars.max(1));
    let mut offset = 0usize;
    let mut fence: Option<&str> = None;

    for raw_line in text.split_inclusive('\n') {
        let line = raw_line.trim_end_matches(['\n', '\r']);
        let line_start = offset;
        offset += raw_line.len();

        if fence.is_none() {
            if let Some((level, title)) = parse_heading(line) {
                builder.flush();
                builder.headings.truncate(level - 1);
                builder.headings.push(title);
                continue;
            }
        }

        if let Some(marker) = fence_marker(line) {
            fence = match fence {
                Some(open) if open == marker => None,
                Some(open) => Some(open),
                None => Some(marker),
            };
        }

        builder.push_line(line, line_start);
    }

    builder.flush();
    builder.chunks
}

/// Parse a markdown ATX heading, returning `(level, title)`.
///
/// Requires whitespace after the hashes so that tags such as `#project`
/// are not mistaken for headings. Closing hashes are stripped.
pub fn parse_heading(line: &str) -> Option<(usize, String)> {
    let trimmed = line.trim_start();
    if line.len() - trimmed.len() > 3 {
        return None;
    }
    let level = trimmed.chars().take_while(|c| *c == '#').count();
    if level == 0 || level > 6 {
        return None;
    }
    let rest = &trimmed[level..];
    if !rest.is_empty() && !rest.starts_with([' ', '\t']) {
        return None;
    }
    let title = rest.trim().trim_end_matches('#').trim_end().to_string();
    Some((level, title))
}

fn fence_marker(line: &str) -> Option<&'static str> {
    let trimmed = line.trim_start();
    if trimmed.starts_with("```") {
        Some("```")
    } else if trimmed.starts_with("~~~") {
        Some("~~~")
    } else {
        None
    }
}

struct ChunkBuilder<'a> {
    file: &'a str,
    updated: i64,
    max_chars: usize,
    headings: Vec<String>,
    buf: String,
    start: Option<usize>,
    end: usize,
    chunks: Vec<Chunk>,
}

impl<'a> ChunkBuilder<'a> {
    fn new(file: &'a str, updated: i64, max_chars: usize) -> Self {
        Self {
            file,
            updated,
            max_chars,
            headings: Vec::new(),
            buf: String::new(),
            start: None,
            end: 0,
            chunks: Vec::new(),
        }
    }

    fn push_line(&mut self, line: &str, line_start: usize) {
        if self.start.is_none() {
            self.start = Some(line_start);
        }
        self.buf.push_str(line);
        self.buf.push('\n');
        self.end = line_start + line.len();

        if self.buf.len() > self.max_chars {
            self.flush();
        }
    }

    fn flush(&mut self) {
        let start = self.start.take();
        let content = self.buf.trim();
        if let Some(start) = start {
            if !content.is_empty() {
                let ordinal = self.chunks.len();
                self.chunks.push(Chunk::new(
                    self.file,
                    ordinal,
                    self.headings.clone(),
                    content.to_string(),
                    self.updated,
                    start,
                    self.end,
                ));
            }
        }
        self.buf.clear();
    }
}
