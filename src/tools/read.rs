//! `read`: whole or partial document read, bounded by line range and bytes.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::json;

use super::{ParamSpec, ParamType, Tool, ToolArgs, ToolContext, ToolResult};
use crate::config::ReadConfig;
use crate::vault::normalize_path;

pub struct ReadTool {
    settings: ReadConfig,
}

impl ReadTool {
    pub fn new(settings: ReadConfig) -> Self {
        Self { settings }
    }
}

#[derive(Debug, PartialEq)]
pub struct Excerpt {
    pub content: String,
    pub start_line: usize,
    pub end_line: usize,
    pub total_lines: usize,
    pub truncated: bool,
}

/// Select 1-based inclusive lines, then cap the result at `max_bytes`
/// (cut on a character boundary).
pub fn excerpt(
    text: &str,
    start: Option<usize>,
    end: Option<usize>,
    max_bytes: usize,
) -> Result<Excerpt> {
    let lines: Vec<&str> = text.lines().collect();
    let total = lines.len();
    let start_line = start.unwrap_or(1);
    if start_line == 0 {
        bail!("start_line is 1-based");
    }
    let end_line = end.unwrap_or(total).min(total);
    if total > 0 && start_line > total {
        bail!("start_line {} is past the end of the file ({} lines)", start_line, total);
    }
    if end.is_some() && end_line < start_line {
        bail!("end_line must be >= start_line");
    }

    let mut content = if total == 0 {
        String::new()
    } else {
        lines[start_line - 1..end_line].join("\n")
    };

    let mut truncated = false;
    if content.len() > max_bytes {
        let mut cut = max_bytes;
        while !content.is_char_boundary(cut) {
            cut -= 1;
        }
        content.truncate(cut);
        truncated = true;
    }

    Ok(Excerpt {
        content,
        start_line,
        end_line,
        total_lines: total,
        truncated,
    })
}

#[async_trait]
impl Tool for ReadTool {
    fn name(&self) -> &str {
        "read"
    }

    fn description(&self) -> &str {
        "Read a document from the vault, optionally limited to a line range."
    }

    fn params(&self) -> Vec<ParamSpec> {
        vec![
            ParamSpec::required("path", ParamType::String, "Vault-relative path"),
            ParamSpec::optional("start_line", ParamType::Integer, "First line (1-based)"),
            ParamSpec::optional("end_line", ParamType::Integer, "Last line (inclusive)"),
            ParamSpec::optional("max_bytes", ParamType::Integer, "Byte budget for the returned text"),
        ]
    }

    async fn execute(&self, args: &ToolArgs, ctx: &ToolContext) -> Result<ToolResult> {
        let path = normalize_path(args.require_str("path")?)?;
        let text = ctx.vault.read(&path).await?;
        let max_bytes = args
            .usize("max_bytes")
            .unwrap_or(self.settings.max_bytes)
            .min(self.settings.max_bytes);
        let ex = excerpt(&text, args.usize("start_line"), args.usize("end_line"), max_bytes)?;

        Ok(ToolResult::ok(json!({
            "path": path,
            "content": ex.content,
            "start_line": ex.start_line,
            "end_line": ex.end_line,
            "total_lines": ex.total_lines,
            "truncated": ex.truncated,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_line_ranges() {
        let text = "one\ntwo\nthree\nfour";
        let ex = excerpt(text, Some(2), Some(3), 1024).unwrap();
        assert_eq!(ex.content, "two\nthree");
        assert_eq!(ex.total_lines, 4);
        assert!(!ex.truncated);

        let tail = excerpt(text, Some(3), Some(99), 1024).unwrap();
        assert_eq!(tail.content, "three\nfour");
        assert_eq!(tail.end_line, 4);
    }

    #[test]
    fn rejects_bad_ranges() {
        assert!(excerpt("a\nb", Some(0), None, 10).is_err());
        assert!(excerpt("a\nb", Some(5), None, 10).is_err());
        assert!(excerpt("a\nb\nc", Some(3), Some(2), 10).is_err());
    }

    #[test]
    fn byte_budget_respects_char_boundaries() {
        let ex = excerpt("héllo", None, None, 2).unwrap();
        assert_eq!(ex.content, "h");
        assert!(ex.truncated);
    }
}
