//! `grep`: regex content search across vault documents.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use serde_json::json;

use super::{ParamSpec, ParamType, RiskLevel, Tool, ToolArgs, ToolContext, ToolResult};
use crate::config::GrepConfig;
use crate::vault::normalize_path;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct GrepMatch {
    pub path: String,
    /// 1-based line number.
    pub line: usize,
    pub text: String,
    pub before: Vec<String>,
    pub after: Vec<String>,
}

pub struct GrepTool {
    settings: GrepConfig,
}

impl GrepTool {
    pub fn new(settings: GrepConfig) -> Self {
        Self { settings }
    }
}

pub fn build_regex(pattern: &str, case_sensitive: bool) -> Result<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(!case_sensitive)
        .size_limit(1 << 20)
        .build()
        .map_err(|e| anyhow!("invalid regex: {}", e))
}

/// Matching lines of one document with `context` lines either side.
/// Stops after `budget` matches.
pub fn grep_text(path: &str, text: &str, re: &Regex, context: usize, budget: usize) -> Vec<GrepMatch> {
    let lines: Vec<&str> = text.lines().collect();
    let mut out = Vec::new();
    for (idx, line) in lines.iter().enumerate() {
        if out.len() >= budget {
            break;
        }
        if !re.is_match(line) {
            continue;
        }
        let from = idx.saturating_sub(context);
        let to = (idx + 1 + context).min(lines.len());
        out.push(GrepMatch {
            path: path.to_string(),
            line: idx + 1,
            text: line.to_string(),
            before: lines[from..idx].iter().map(|s| s.to_string()).collect(),
            after: lines[idx + 1..to].iter().map(|s| s.to_string()).collect(),
        });
    }
    out
}

#[async_trait]
impl Tool for GrepTool {
    fn name(&self) -> &str {
        "grep"
    }

    fn description(&self) -> &str {
        "Search document contents with a regular expression. Returns matching lines with surrounding context."
    }

    fn params(&self) -> Vec<ParamSpec> {
        vec![
            ParamSpec::required("pattern", ParamType::String, "Regular expression"),
            ParamSpec::optional("files", ParamType::StringArray, "Restrict the search to these paths"),
            ParamSpec::optional("case_sensitive", ParamType::Boolean, "Match case exactly")
                .with_default(json!(false)),
            ParamSpec::optional("context_lines", ParamType::Integer, "Lines of context per match")
                .with_default(json!(self.settings.context_lines)),
            ParamSpec::optional("max_matches", ParamType::Integer, "Maximum number of matches")
                .with_default(json!(self.settings.max_matches)),
        ]
    }

    fn risk(&self) -> RiskLevel {
        RiskLevel::Safe
    }

    async fn execute(&self, args: &ToolArgs, ctx: &ToolContext) -> Result<ToolResult> {
        let re = build_regex(
            args.require_str("pattern")?,
            args.bool("case_sensitive").unwrap_or(false),
        )?;
        let context = args
            .usize("context_lines")
            .unwrap_or(self.settings.context_lines)
            .min(self.settings.context_lines.max(10));
        let budget = args
            .usize("max_matches")
            .unwrap_or(self.settings.max_matches)
            .clamp(1, self.settings.max_matches.max(1));

        let mut missing = Vec::new();
        let paths: Vec<String> = match args.strings("files") {
            Some(files) if !files.is_empty() => {
                let mut out = Vec::new();
                for file in files {
                    match normalize_path(&file) {
                        Ok(p) if ctx.vault.stat(&p).await?.is_some() => out.push(p),
                        _ => missing.push(file),
                    }
                }
                out
            }
            _ => ctx
                .vault
                .list_documents()?
                .into_iter()
                .map(|d| d.path)
                .collect(),
        };

        let mut matches = Vec::new();
        let mut truncated = false;
        for path in &paths {
            if ctx.cancel.is_cancelled() {
                bail!("cancelled");
            }
            let text = match ctx.vault.read(path).await {
                Ok(text) => text,
                Err(e) => {
                    tracing::debug!(path = %path, error = %e, "grep skipped unreadable file");
                    continue;
                }
            };
            let found = grep_text(path, &text, &re, context, budget - matches.len() + 1);
            matches.extend(found);
            if matches.len() > budget {
                matches.truncate(budget);
                truncated = true;
                break;
            }
        }

        Ok(ToolResult::ok(json!({
            "matches": matches,
            "count": matches.len(),
            "truncated": truncated,
            "missing": missing,
        })))
    }
}
