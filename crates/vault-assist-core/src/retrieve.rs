//! Retrieval: scoring, mention resolution, and prompt assembly.
//!
//! Everything here is synchronous and allocation-light so it can run on
//! every send without a perceptible pause. The only document text read is
//! what the caller hands in (the active editor buffer); all other chunks
//! come from the already-loaded [`ChunkStore`].
//!
//! # Scoring
//!
//! 1. Tokenize the query into distinct lowercase alphanumeric runs of at
//!    least three characters.
//! 2. `score = 5 × Σ occurrences(token, chunk text)
//!            + 10 × |{token : token ⊂ some heading}|`.
//! 3. Drop chunks scoring 0 and chunks from documents already in the
//!    active set.
//! 4. Stable sort by score (descending); ties keep store insertion order.
//! 5. Truncate to `max_context - |active|`.

use std::collections::HashSet;

use crate::chunk::chunk_markdown;
use crate::models::{Chunk, ChunkSource, RagContext, RetrievedChunk};
use crate::sanitize::sanitize_chunk_text;
use crate::store::ChunkStore;

/// Points per occurrence of a query token in the chunk body.
pub const BODY_WEIGHT: u32 = 5;
/// Points per query token found in the chunk's outline path.
pub const HEADING_WEIGHT: u32 = 10;
/// Fixed score assigned to explicitly mentioned documents.
pub const MENTION_SCORE: u32 = 1_000;
/// Default total chunk budget per request.
pub const DEFAULT_MAX_CONTEXT: usize = 4;

const MIN_TOKEN_CHARS: usize = 3;

/// The document currently open in the editor, with unsaved text.
#[derive(Debug, Clone, Copy)]
pub struct ActiveDocument<'a> {
    pub path: &'a str,
    pub text: &'a str,
    /// Cursor position as a byte offset into `text`, if an editor has focus.
    pub cursor: Option<usize>,
    pub updated: i64,
}

/// Inputs for [`build_context`].
#[derive(Debug, Clone)]
pub struct ContextRequest<'a> {
    pub query: &'a str,
    pub active: Option<ActiveDocument<'a>>,
    /// First chunk of each mentioned document, in mention order.
    pub mentions: Vec<Chunk>,
    /// Total chunk budget for active + retrieved (clamped to at least 1).
    pub max_context: usize,
    /// Soft chunk size used when chunking the active document.
    pub chunk_size: usize,
}

/// Split a query into distinct lowercase alphanumeric tokens (≥ 3 chars).
pub fn tokenize_query(query: &str) -> Vec<String> {
    let lower = query.to_lowercase();
    let mut seen = HashSet::new();
    lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= MIN_TOKEN_CHARS)
        .filter(|t| seen.insert(*t))
        .map(str::to_string)
        .collect()
}

/// Score one chunk against pre-tokenized query terms.
pub fn score_chunk(chunk: &Chunk, tokens: &[String]) -> u32 {
    let mut body_hits = 0u32;
    let mut heading_hits = 0u32;
    for token in tokens {
        body_hits += chunk.content_lower.matches(token.as_str()).count() as u32;
        if chunk
            .headings
            .iter()
            .any(|h| h.to_lowercase().contains(token.as_str()))
        {
            heading_hits += 1;
        }
    }
    BODY_WEIGHT * body_hits + HEADING_WEIGHT * heading_hits
}

/// Rank store chunks for `query`, skipping documents in `exclude_files`.
pub fn rank_chunks(
    store: &ChunkStore,
    query: &str,
    exclude_files: &HashSet<&str>,
    limit: usize,
) -> Vec<RetrievedChunk> {
    if limit == 0 {
        return Vec::new();
    }
    let tokens = tokenize_query(query);
    if tokens.is_empty() {
        return Vec::new();
    }

    let mut scored: Vec<(u32, &Chunk)> = store
        .chunks()
        .iter()
        .filter(|c| !exclude_files.contains(c.file.as_str()))
        .map(|c| (score_chunk(c, &tokens), c))
        .filter(|(score, _)| *score > 0)
        .collect();

    // sort_by is stable: equal scores keep insertion order
    scored.sort_by(|a, b| b.0.cmp(&a.0));
    scored.truncate(limit);

    scored
        .into_iter()
        .map(|(score, chunk)| RetrievedChunk {
            chunk: chunk.clone(),
            score,
            source: ChunkSource::Retrieved,
        })
        .collect()
}

/// Chunk the active document fresh and order it cursor-first.
///
/// The chunk containing the cursor comes first, followed by the remaining
/// chunks in document order. Chunks that sanitize to nothing (pure embed
/// markup) are skipped.
pub fn active_chunks(doc: &ActiveDocument<'_>, chunk_size: usize) -> Vec<Chunk> {
    let chunks: Vec<Chunk> = chunk_markdown(doc.path, doc.text, doc.updated, chunk_size)
        .into_iter()
        .filter(|c| !sanitize_chunk_text(&c.content).is_empty())
        .collect();

    let cursor_idx = doc
        .cursor
        .and_then(|offset| chunks.iter().position(|c| c.contains_offset(offset)));

    match cursor_idx {
        Some(idx) => {
            let mut ordered = Vec::with_capacity(chunks.len());
            let mut rest = chunks;
            ordered.push(rest.remove(idx));
            ordered.extend(rest);
            ordered
        }
        None => chunks,
    }
}

/// Outcome of resolving user-named documents against the vault.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MentionResolution {
    /// `(mention, resolved path)` pairs in mention order, deduplicated by path.
    pub resolved: Vec<(String, String)>,
    /// Mentions that matched no document.
    pub missing: Vec<String>,
}

/// Display name of a document: its file name without the extension.
pub fn document_name(path: &str) -> &str {
    let base = path.rsplit('/').next().unwrap_or(path);
    match base.rfind('.') {
        Some(dot) if dot > 0 => &base[..dot],
        _ => base,
    }
}

/// Resolve mentions to document paths.
///
/// Resolution order, all case-insensitive: exact name (or exact path),
/// then substring of the name, then substring of the path. Within a tier
/// the first document in `documents` order wins.
pub fn resolve_mentions<S: AsRef<str>>(mentions: &[String], documents: &[S]) -> MentionResolution {
    let docs: Vec<(&str, String, String)> = documents
        .iter()
        .map(|d| {
            let path = d.as_ref();
            (path, document_name(path).to_lowercase(), path.to_lowercase())
        })
        .collect();

    let mut out = MentionResolution::default();
    let mut seen_paths = HashSet::new();

    for mention in mentions {
        let needle = mention.trim().to_lowercase();
        if needle.is_empty() {
            continue;
        }
        let needle_path = needle.trim_end_matches(".md");

        let hit = docs
            .iter()
            .find(|(_, name, path)| {
                *name == needle || path == &needle || path.trim_end_matches(".md") == needle_path
            })
            .or_else(|| docs.iter().find(|(_, name, _)| name.contains(&needle)))
            .or_else(|| docs.iter().find(|(_, _, path)| path.contains(&needle)));

        match hit {
            Some((path, _, _)) => {
                if seen_paths.insert(*path) {
                    out.resolved.push((mention.clone(), path.to_string()));
                }
            }
            None => out.missing.push(mention.clone()),
        }
    }
    out
}

/// Produce the full retrieval bundle for one request.
pub fn build_context(store: &ChunkStore, request: &ContextRequest<'_>) -> RagContext {
    let budget = request.max_context.max(1);

    let active: Vec<RetrievedChunk> = request
        .active
        .as_ref()
        .map(|doc| active_chunks(doc, request.chunk_size))
        .unwrap_or_default()
        .into_iter()
        .take(budget)
        .map(|chunk| RetrievedChunk {
            chunk,
            score: 0,
            source: ChunkSource::Active,
        })
        .collect();

    let exclude: HashSet<&str> = active.iter().map(|r| r.chunk.file.as_str()).collect();
    let retrieved = rank_chunks(
        store,
        request.query,
        &exclude,
        budget.saturating_sub(active.len()),
    );

    let mentions: Vec<RetrievedChunk> = request
        .mentions
        .iter()
        .map(|chunk| RetrievedChunk {
            chunk: chunk.clone(),
            score: MENTION_SCORE,
            source: ChunkSource::Mention,
        })
        .collect();

    let prompt = assemble_prompt(&active, &retrieved, &mentions);
    RagContext {
        active,
        retrieved,
        mentions,
        prompt,
    }
}

/// Header line that introduces the context block in a prompt.
pub const CONTEXT_HEADER: &str =
    "The following excerpts from the user's notes may be relevant. Cite the note path when you use them.";

/// Render included chunks as one prompt block.
///
/// Chunks whose sanitized text is empty are silently dropped. Returns an
/// empty string when nothing survives.
pub fn assemble_prompt(
    active: &[RetrievedChunk],
    retrieved: &[RetrievedChunk],
    mentions: &[RetrievedChunk],
) -> String {
    let sections: Vec<String> = active
        .iter()
        .chain(retrieved)
        .chain(mentions)
        .filter_map(|rc| {
            let text = sanitize_chunk_text(&rc.chunk.content);
            if text.is_empty() {
                return None;
            }
            Some(format!(
                "[{}] {}\n{}",
                rc.source,
                rc.chunk.location(),
                text
            ))
        })
        .collect();

    if sections.is_empty() {
        return String::new();
    }
    format!("{}\n\n{}", CONTEXT_HEADER, sections.join("\n\n---\n\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::DEFAULT_CHUNK_SIZE;
    use pretty_assertions::assert_eq;

    fn store_of(docs: &[(&str, &str)]) -> ChunkStore {
        let chunks = docs
            .iter()
            .flat_map(|(path, text)| chunk_markdown(path, text, 0, DEFAULT_CHUNK_SIZE))
            .collect();
        ChunkStore::from_chunks(chunks)
    }

    fn request(query: &str) -> ContextRequest<'_> {
        ContextRequest {
            query,
            active: None,
            mentions: vec![],
            max_context: DEFAULT_MAX_CONTEXT,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    #[test]
    fn tokenizer_keeps_long_alnum_runs() {
        assert_eq!(
            tokenize_query("To-do: fix the API v2, api!"),
            vec!["fix".to_string(), "the".to_string(), "api".to_string()]
        );
    }

    #[test]
    fn end_to_end_todo_scenario() {
        let store = store_of(&[
            ("Notes/A.md", "# Intro\nHello world"),
            ("Notes/B.md", "## Todo\nTODO buy milk"),
        ]);
        let ctx = build_context(&store, &request("todo"));

        assert!(ctx.active.is_empty());
        assert!(ctx.mentions.is_empty());
        assert_eq!(ctx.retrieved.len(), 1);
        assert_eq!(ctx.retrieved[0].chunk.file, "Notes/B.md");
        assert_eq!(ctx.retrieved[0].chunk.headings, vec!["Todo".to_string()]);
        assert_eq!(ctx.retrieved[0].score, HEADING_WEIGHT + BODY_WEIGHT);
        assert!(ctx.prompt.contains("TODO buy milk"));
        assert!(ctx.prompt.contains("[retrieved] Notes/B.md > Todo"));
    }

    #[test]
    fn extra_occurrence_never_lowers_score() {
        let tokens = tokenize_query("milk");
        let one = Chunk::new("a.md", 0, vec![], "milk".into(), 0, 0, 4);
        let two = Chunk::new("a.md", 0, vec![], "milk and milk".into(), 0, 0, 13);
        assert!(score_chunk(&two, &tokens) >= score_chunk(&one, &tokens));
    }

    #[test]
    fn heading_match_outscores_body_match() {
        let tokens = tokenize_query("budget");
        let heading = Chunk::new("a.md", 0, vec!["Budget".into()], "numbers".into(), 0, 0, 7);
        let body = Chunk::new("b.md", 0, vec![], "budget".into(), 0, 0, 6);
        assert!(score_chunk(&heading, &tokens) > score_chunk(&body, &tokens));
    }

    #[test]
    fn ties_keep_insertion_order_and_respect_budget() {
        let store = store_of(&[
            ("1.md", "apple"),
            ("2.md", "apple"),
            ("3.md", "apple"),
            ("4.md", "apple apple"),
        ]);
        let mut req = request("apple");
        req.max_context = 3;
        let ctx = build_context(&store, &req);
        let files: Vec<&str> = ctx.retrieved.iter().map(|r| r.chunk.file.as_str()).collect();
        assert_eq!(files, vec!["4.md", "1.md", "2.md"]);
    }

    #[test]
    fn zero_budget_is_clamped_to_one() {
        let store = store_of(&[("1.md", "apple"), ("2.md", "apple")]);
        let mut req = request("apple");
        req.max_context = 0;
        assert_eq!(build_context(&store, &req).retrieved.len(), 1);
    }

    #[test]
    fn active_document_is_cursor_first_and_excluded_from_scoring() {
        let store = store_of(&[("open.md", "# One\napple"), ("other.md", "apple pie")]);
        let text = "# One\napple\n# Two\nbanana apple\n";
        let cursor = text.find("banana").unwrap();
        let mut req = request("apple");
        req.active = Some(ActiveDocument {
            path: "open.md",
            text,
            cursor: Some(cursor),
            updated: 0,
        });

        let ctx = build_context(&store, &req);
        let active_headings: Vec<&str> = ctx
            .active
            .iter()
            .map(|r| r.chunk.headings[0].as_str())
            .collect();
        assert_eq!(active_headings, vec!["Two", "One"]);
        assert_eq!(ctx.retrieved.len(), 1);
        assert_eq!(ctx.retrieved[0].chunk.file, "other.md");
    }

    #[test]
    fn embed_only_active_chunks_are_skipped() {
        let doc = ActiveDocument {
            path: "img.md",
            text: "# Pic\n![[photo.png]]\n# Words\nreal text",
            cursor: Some(8),
            updated: 0,
        };
        let chunks = active_chunks(&doc, DEFAULT_CHUNK_SIZE);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "real text");
    }

    #[test]
    fn mention_prefers_exact_name() {
        let docs = vec!["Meeting Notes.md".to_string(), "Meeting.md".to_string()];
        let res = resolve_mentions(&["meeting".to_string()], &docs);
        assert_eq!(
            res.resolved,
            vec![("meeting".to_string(), "Meeting.md".to_string())]
        );
    }

    #[test]
    fn mention_falls_back_to_name_then_path() {
        let docs = vec!["Projects/Alpha Plan.md", "Archive/2023/old.md"];
        let res = resolve_mentions(
            &["alpha".to_string(), "2023".to_string(), "nope".to_string()],
            &docs,
        );
        assert_eq!(
            res.resolved,
            vec![
                ("alpha".to_string(), "Projects/Alpha Plan.md".to_string()),
                ("2023".to_string(), "Archive/2023/old.md".to_string()),
            ]
        );
        assert_eq!(res.missing, vec!["nope".to_string()]);
    }

    #[test]
    fn mentions_come_last_with_fixed_score() {
        let store = store_of(&[("a.md", "apple")]);
        let mut req = request("apple");
        req.mentions = chunk_markdown("m.md", "# Ref\nsee this", 0, DEFAULT_CHUNK_SIZE);
        let ctx = build_context(&store, &req);
        assert_eq!(ctx.mentions[0].score, MENTION_SCORE);
        let a = ctx.prompt.find("[retrieved] a.md").unwrap();
        let m = ctx.prompt.find("[mention] m.md > Ref").unwrap();
        assert!(a < m);
    }

    #[test]
    fn no_surviving_chunks_means_empty_prompt() {
        let store = store_of(&[("a.md", "![[only.png]] apple")]);
        let mut ctx = build_context(&store, &request("zzz"));
        assert!(!ctx.has_context());

        let pic = Chunk::new("p.md", 0, vec![], "![[x.png]]".into(), 0, 0, 10);
        ctx.retrieved.push(RetrievedChunk {
            chunk: pic,
            score: 5,
            source: ChunkSource::Retrieved,
        });
        assert_eq!(assemble_prompt(&ctx.active, &ctx.retrieved, &ctx.mentions), "");
    }
}
