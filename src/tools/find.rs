//! `find`: locate vault files by glob or fuzzy name match.

use anyhow::{Context, Result};
use async_trait::async_trait;
use globset::GlobBuilder;
use nucleo_matcher::pattern::{CaseMatching, Normalization, Pattern};
use nucleo_matcher::{Matcher, Utf32String};
use serde::Serialize;
use serde_json::json;

use super::{ParamSpec, ParamType, RiskLevel, Tool, ToolArgs, ToolContext, ToolResult};
use crate::config::FindConfig;
use crate::vault::DocumentMeta;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FindMatch {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<u32>,
    pub size: u64,
    pub modified: i64,
}

pub struct FindTool {
    settings: FindConfig,
}

impl FindTool {
    pub fn new(settings: FindConfig) -> Self {
        Self { settings }
    }
}

fn looks_like_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '[', '{'])
}

/// Paths matching a glob. Patterns without `/` also match bare file names.
pub fn glob_matches(files: &[DocumentMeta], pattern: &str) -> Result<Vec<FindMatch>> {
    let matcher = GlobBuilder::new(pattern)
        .case_insensitive(true)
        .literal_separator(false)
        .build()
        .with_context(|| format!("invalid glob: {}", pattern))?
        .compile_matcher();
    let name_only = !pattern.contains('/');

    Ok(files
        .iter()
        .filter(|f| {
            matcher.is_match(&f.path)
                || (name_only && matcher.is_match(f.path.rsplit('/').next().unwrap_or(&f.path)))
        })
        .map(|f| FindMatch {
            path: f.path.clone(),
            score: None,
            size: f.size,
            modified: f.modified,
        })
        .collect())
}

/// Paths ranked by fuzzy score (best first, ties by path).
pub fn fuzzy_matches(files: &[DocumentMeta], query: &str) -> Vec<FindMatch> {
    let mut matcher = Matcher::new(nucleo_matcher::Config::DEFAULT.match_paths());
    let pattern = Pattern::parse(query, CaseMatching::Smart, Normalization::Smart);

    let mut scored: Vec<FindMatch> = files
        .iter()
        .filter_map(|f| {
            let haystack = Utf32String::from(f.path.as_str());
            pattern
                .score(haystack.slice(..), &mut matcher)
                .map(|score| FindMatch {
                    path: f.path.clone(),
                    score: Some(score),
                    size: f.size,
                    modified: f.modified,
                })
        })
        .collect();

    scored.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.path.cmp(&b.path)));
    scored
}

#[async_trait]
impl Tool for FindTool {
    fn name(&self) -> &str {
        "find"
    }

    fn description(&self) -> &str {
        "Find files in the vault by name or path. Accepts a glob (e.g. 'Projects/**/*.md') or a fuzzy name."
    }

    fn params(&self) -> Vec<ParamSpec> {
        vec![
            ParamSpec::required("pattern", ParamType::String, "Glob pattern or fuzzy file name"),
            ParamSpec::optional("mode", ParamType::String, "'glob', 'fuzzy' or 'auto'")
                .with_default(json!("auto")),
            ParamSpec::optional("limit", ParamType::Integer, "Maximum number of results")
                .with_default(json!(self.settings.max_results)),
            ParamSpec::optional(
                "include_all_files",
                ParamType::Boolean,
                "Include non-markdown files",
            )
            .with_default(json!(false)),
        ]
    }

    fn risk(&self) -> RiskLevel {
        RiskLevel::Safe
    }

    async fn execute(&self, args: &ToolArgs, ctx: &ToolContext) -> Result<ToolResult> {
        let pattern = args.require_str("pattern")?;
        let limit = args
            .usize("limit")
            .unwrap_or(self.settings.max_results)
            .clamp(1, self.settings.max_results.max(1));

        let files = if args.bool("include_all_files").unwrap_or(false) {
            ctx.vault.list_files()?
        } else {
            ctx.vault.list_documents()?
        };

        let use_glob = match args.str("mode").unwrap_or("auto") {
            "glob" => true,
            "fuzzy" => false,
            _ => looks_like_glob(pattern),
        };
        let mut matches = if use_glob {
            glob_matches(&files, pattern)?
        } else {
            fuzzy_matches(&files, pattern)
        };

        let total = matches.len();
        matches.truncate(limit);
        Ok(ToolResult::ok(json!({
            "mode": if use_glob { "glob" } else { "fuzzy" },
            "matches": matches,
            "total": total,
            "truncated": total > limit,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(paths: &[&str]) -> Vec<DocumentMeta> {
        paths
            .iter()
            .map(|p| DocumentMeta {
                path: p.to_string(),
                modified: 0,
                size: 1,
            })
            .collect()
    }

    #[test]
    fn glob_matches_paths_and_bare_names() {
        let all = files(&["Projects/alpha.md", "Projects/deep/beta.md", "gamma.txt"]);
        let hits: Vec<String> = glob_matches(&all, "Projects/**/*.md")
            .unwrap()
            .into_iter()
            .map(|m| m.path)
            .collect();
        assert_eq!(hits, vec!["Projects/alpha.md", "Projects/deep/beta.md"]);

        let by_name = glob_matches(&all, "BETA.*").unwrap();
        assert_eq!(by_name.len(), 1);
        assert!(glob_matches(&all, "[").is_err());
    }

    #[test]
    fn fuzzy_ranks_closer_names_first() {
        let all = files(&["Archive/meeting-old.md", "Meeting Notes.md", "Recipes.md"]);
        let hits = fuzzy_matches(&all, "meeting notes");
        assert_eq!(hits[0].path, "Meeting Notes.md");
        assert!(hits.iter().all(|m| m.path != "Recipes.md"));
    }

    #[test]
    fn auto_mode_detects_globs() {
        assert!(looks_like_glob("*.md"));
        assert!(!looks_like_glob("meeting"));
    }
}
