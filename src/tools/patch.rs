//! `apply_patch`: line-range replacement edits with backup and undo.
//!
//! Every edit addresses the document as it was *before* the patch: lines
//! `start_line..=end_line` (1-based) are replaced by `replacement`. An
//! insertion uses `end_line = start_line - 1`. Edits may not overlap.
//!
//! The preview shown at the consent prompt is bound to the pre-image it was
//! computed from: if the document changes before the call executes, the
//! patch is refused instead of applying an edit the user never saw.
//!
//! Before writing, the pre-image is pushed onto the [`PatchJournal`] under
//! the invocation's execution id; [`PatchJournal::undo`] restores it as
//! long as the document still holds the post-image.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use lru::LruCache;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use super::{ParamSpec, ParamType, RiskLevel, Tool, ToolArgs, ToolContext, ToolResult};
use crate::vault::{normalize_path, Vault};

/// Unchanged lines shown around each hunk.
const DIFF_CONTEXT: usize = 3;

/// Previews awaiting execution. Denied calls never execute, so old
/// entries fall out of the cache.
const PENDING_PREVIEWS: usize = 32;

fn fingerprint(text: &str) -> String {
    format!("{:x}", Sha256::digest(text.as_bytes()))
}

/// One edit in old-document coordinates (0-based).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineEdit {
    pub start: usize,
    pub remove: usize,
    pub insert: Vec<String>,
}

/// Result of planning a patch against a pre-image.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchPlan {
    pub path: String,
    pub before: String,
    pub after: String,
    pub diff: String,
    pub added: usize,
    pub removed: usize,
}

fn split_lines(text: &str) -> (Vec<String>, bool) {
    if text.is_empty() {
        return (Vec::new(), true);
    }
    let trailing = text.ends_with('\n');
    let body = text.strip_suffix('\n').unwrap_or(text);
    (body.split('\n').map(str::to_string).collect(), trailing)
}

fn join_lines(lines: &[String], trailing: bool) -> String {
    let mut out = lines.join("\n");
    if trailing && !lines.is_empty() {
        out.push('\n');
    }
    out
}

fn replacement_lines(replacement: &str) -> Vec<String> {
    if replacement.is_empty() {
        return Vec::new();
    }
    let body = replacement.strip_suffix('\n').unwrap_or(replacement);
    body.split('\n').map(str::to_string).collect()
}

/// Parse the `edits` argument against a document of `total` lines.
pub fn parse_edits(edits: &Value, total: usize) -> Result<Vec<LineEdit>> {
    let items = edits
        .as_array()
        .ok_or_else(|| anyhow!("edits must be an array"))?;
    if items.is_empty() {
        bail!("edits must not be empty");
    }

    let mut out = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let field = |name: &str| {
            item.get(name)
                .and_then(Value::as_u64)
                .map(|n| n as usize)
                .ok_or_else(|| anyhow!("edit {}: missing {}", i, name))
        };
        let start_line = field("start_line")?;
        let end_line = field("end_line")?;
        let replacement = item
            .get("replacement")
            .and_then(Value::as_str)
            .unwrap_or("");

        if start_line == 0 || start_line > total + 1 {
            bail!("edit {}: start_line {} out of range (1..={})", i, start_line, total + 1);
        }
        if end_line + 1 < start_line || end_line > total {
            bail!("edit {}: end_line {} out of range", i, end_line);
        }
        out.push(LineEdit {
            start: start_line - 1,
            remove: end_line + 1 - start_line,
            insert: replacement_lines(replacement),
        });
    }

    out.sort_by_key(|e| e.start);
    for pair in out.windows(2) {
        if pair[1].start < pair[0].start + pair[0].remove {
            bail!("edits overlap at line {}", pair[1].start + 1);
        }
    }
    Ok(out)
}

/// Drop lines an edit leaves unchanged at either end.
fn trim_edit(old: &[String], edit: LineEdit) -> LineEdit {
    let removed = &old[edit.start..edit.start + edit.remove];
    let prefix = removed
        .iter()
        .zip(&edit.insert)
        .take_while(|(a, b)| a == b)
        .count();
    let suffix = removed[prefix..]
        .iter()
        .rev()
        .zip(edit.insert[prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count();
    LineEdit {
        start: edit.start + prefix,
        remove: edit.remove - prefix - suffix,
        insert: edit.insert[prefix..edit.insert.len() - suffix].to_vec(),
    }
}

fn apply_edits(old: &[String], edits: &[LineEdit]) -> Vec<String> {
    let mut out = Vec::with_capacity(old.len());
    let mut cursor = 0;
    for edit in edits {
        out.extend_from_slice(&old[cursor..edit.start]);
        out.extend(edit.insert.iter().cloned());
        cursor = edit.start + edit.remove;
    }
    out.extend_from_slice(&old[cursor..]);
    out
}

fn hunk_range(start: usize, count: usize) -> String {
    if count == 0 {
        format!("{},0", start)
    } else {
        format!("{},{}", start + 1, count)
    }
}

/// Unified diff of `edits` (sorted, trimmed, non-empty) against `old`.
pub fn unified_diff(path: &str, old: &[String], edits: &[LineEdit]) -> String {
    let mut out = format!("--- a/{}\n+++ b/{}\n", path, path);
    let mut shift: isize = 0;
    let mut i = 0;

    while i < edits.len() {
        let mut j = i;
        while j + 1 < edits.len()
            && edits[j + 1].start <= edits[j].start + edits[j].remove + 2 * DIFF_CONTEXT
        {
            j += 1;
        }
        let group = &edits[i..=j];
        let hunk_start = group[0].start.saturating_sub(DIFF_CONTEXT);
        let last = &group[group.len() - 1];
        let hunk_end = (last.start + last.remove + DIFF_CONTEXT).min(old.len());

        let mut body = String::new();
        let mut cursor = hunk_start;
        let (mut added, mut removed) = (0, 0);
        for edit in group {
            for line in &old[cursor..edit.start] {
                body.push_str(&format!(" {}\n", line));
            }
            for line in &old[edit.start..edit.start + edit.remove] {
                body.push_str(&format!("-{}\n", line));
            }
            for line in &edit.insert {
                body.push_str(&format!("+{}\n", line));
            }
            cursor = edit.start + edit.remove;
            added += edit.insert.len();
            removed += edit.remove;
        }
        for line in &old[cursor..hunk_end] {
            body.push_str(&format!(" {}\n", line));
        }

        let old_count = hunk_end - hunk_start;
        let new_count = old_count - removed + added;
        let new_start = (hunk_start as isize + shift).max(0) as usize;
        out.push_str(&format!(
            "@@ -{} +{} @@\n",
            hunk_range(hunk_start, old_count),
            hunk_range(new_start, new_count)
        ));
        out.push_str(&body);

        shift += added as isize - removed as isize;
        i = j + 1;
    }
    out
}

/// Compute post-image and diff. Fails when the patch changes nothing.
pub fn plan_patch(path: &str, before: &str, edits: &Value) -> Result<PatchPlan> {
    let (old, trailing) = split_lines(before);
    let edits: Vec<LineEdit> = parse_edits(edits, old.len())?
        .into_iter()
        .map(|e| trim_edit(&old, e))
        .filter(|e| e.remove > 0 || !e.insert.is_empty())
        .collect();
    if edits.is_empty() {
        bail!("patch does not change {}", path);
    }

    let new_lines = apply_edits(&old, &edits);
    let after = join_lines(&new_lines, trailing);
    if after == before {
        bail!("patch does not change {}", path);
    }

    Ok(PatchPlan {
        path: path.to_string(),
        diff: unified_diff(path, &old, &edits),
        added: edits.iter().map(|e| e.insert.len()).sum(),
        removed: edits.iter().map(|e| e.remove).sum(),
        before: before.to_string(),
        after,
    })
}

// ═══════════════════════════════════════════════════════════════════════
// Journal
// ═══════════════════════════════════════════════════════════════════════

/// Pre-image backup of one applied patch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchRecord {
    pub execution_id: String,
    pub path: String,
    pub before: String,
    pub after: String,
    pub applied_at: DateTime<Utc>,
}

/// Bounded undo stack keyed by execution id, optionally persisted so an
/// undo can happen from a later process.
pub struct PatchJournal {
    depth: usize,
    path: Option<PathBuf>,
    entries: Mutex<VecDeque<PatchRecord>>,
}

impl PatchJournal {
    pub fn new(depth: usize) -> Self {
        Self {
            depth: depth.max(1),
            path: None,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Load from a JSON file. A missing or unreadable file starts empty.
    pub fn open(path: PathBuf, depth: usize) -> Self {
        let entries = match std::fs::read_to_string(&path) {
            Ok(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "patch journal unreadable; starting empty");
                VecDeque::new()
            }),
            Err(_) => VecDeque::new(),
        };
        Self {
            depth: depth.max(1),
            path: Some(path),
            entries: Mutex::new(entries),
        }
    }

    fn save(&self, entries: &VecDeque<PatchRecord>) {
        let Some(path) = &self.path else { return };
        let result = serde_json::to_string(entries)
            .map_err(anyhow::Error::from)
            .and_then(|json| {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
            });
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to persist patch journal");
        }
    }

    pub fn push(&self, record: PatchRecord) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.push_back(record);
        while entries.len() > self.depth {
            entries.pop_front();
        }
        self.save(&entries);
    }

    pub fn get(&self, execution_id: &str) -> Option<PatchRecord> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .find(|r| r.execution_id == execution_id)
            .cloned()
    }

    /// Records newest first.
    pub fn list(&self) -> Vec<PatchRecord> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.iter().rev().cloned().collect()
    }

    fn remove(&self, execution_id: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|r| r.execution_id != execution_id);
        self.save(&entries);
    }

    /// Restore the pre-image of a patch. Refuses when the document no
    /// longer holds the patch's post-image.
    pub async fn undo(&self, execution_id: &str, vault: &dyn Vault) -> Result<PatchRecord> {
        let record = self
            .get(execution_id)
            .ok_or_else(|| anyhow!("no undo record for execution {}", execution_id))?;
        let current = vault.read(&record.path).await?;
        if current != record.after {
            bail!(
                "{} changed since the patch was applied; refusing to undo",
                record.path
            );
        }
        vault.write(&record.path, &record.before).await?;
        self.remove(execution_id);
        Ok(record)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Tool
// ═══════════════════════════════════════════════════════════════════════

pub struct ApplyPatchTool {
    journal: Arc<PatchJournal>,
    /// Pre-image fingerprint per execution id, recorded by `preview`.
    previewed: Mutex<LruCache<String, String>>,
}

impl ApplyPatchTool {
    pub fn new(journal: Arc<PatchJournal>) -> Self {
        let capacity = NonZeroUsize::new(PENDING_PREVIEWS).unwrap_or(NonZeroUsize::MIN);
        Self {
            journal,
            previewed: Mutex::new(LruCache::new(capacity)),
        }
    }

    async fn plan(&self, args: &ToolArgs, ctx: &ToolContext) -> Result<PatchPlan> {
        let path = normalize_path(args.require_str("path")?)?;
        let edits = args
            .get("edits")
            .ok_or_else(|| anyhow!("missing required parameter: edits"))?;
        let before = ctx.vault.read(&path).await?;
        plan_patch(&path, &before, edits)
    }

    fn previews(&self) -> std::sync::MutexGuard<'_, LruCache<String, String>> {
        self.previewed.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Tool for ApplyPatchTool {
    fn name(&self) -> &str {
        "apply_patch"
    }

    fn description(&self) -> &str {
        "Edit a document by replacing line ranges. Each edit is {start_line, end_line, replacement} \
         against the original line numbers; use end_line = start_line - 1 to insert."
    }

    fn params(&self) -> Vec<ParamSpec> {
        vec![
            ParamSpec::required("path", ParamType::String, "Vault-relative path"),
            ParamSpec::required(
                "edits",
                ParamType::ObjectArray,
                "List of {start_line, end_line, replacement}",
            ),
        ]
    }

    fn risk(&self) -> RiskLevel {
        RiskLevel::High
    }

    fn can_bypass_consent(&self) -> bool {
        false
    }

    fn requires_preview(&self) -> bool {
        true
    }

    async fn preview(&self, args: &ToolArgs, ctx: &ToolContext) -> Result<Option<String>> {
        let plan = self.plan(args, ctx).await?;
        self.previews()
            .put(ctx.execution_id.clone(), fingerprint(&plan.before));
        Ok(Some(plan.diff))
    }

    async fn execute(&self, args: &ToolArgs, ctx: &ToolContext) -> Result<ToolResult> {
        let plan = self.plan(args, ctx).await?;
        let shown = self.previews().pop(&ctx.execution_id);
        if let Some(shown) = shown {
            if shown != fingerprint(&plan.before) {
                bail!(
                    "{} changed after the preview was shown; patch not applied",
                    plan.path
                );
            }
        }
        self.journal.push(PatchRecord {
            execution_id: ctx.execution_id.clone(),
            path: plan.path.clone(),
            before: plan.before.clone(),
            after: plan.after.clone(),
            applied_at: Utc::now(),
        });
        ctx.vault.write(&plan.path, &plan.after).await?;
        ctx.document_written(&plan.path).await;

        Ok(ToolResult::ok(json!({
            "path": plan.path,
            "diff": plan.diff,
            "added": plan.added,
            "removed": plan.removed,
            "undo_id": ctx.execution_id,
        }))
        .with_execution_id(ctx.execution_id.clone())
        .with_metadata("backup", json!(true)))
    }
}
