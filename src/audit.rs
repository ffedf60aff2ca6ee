//! Append-only audit log of tool activity.
//!
//! Entries are JSON lines in `<state_dir>/audit/tool-log.jsonl`. Writes are
//! buffered and flushed once `batch_size` entries accumulate, on
//! [`AuditLogger::flush`], or when the logger is dropped. When the log
//! grows past `max_file_bytes` it is renamed with a timestamp suffix;
//! only the newest `max_rotated_files` rotations are kept.
//!
//! Privacy filters are applied before an entry is buffered:
//! `redact_params` replaces all parameters with a marker, and
//! `anonymize_paths` replaces only path- and URL-valued parameters.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::config::AuditConfig;

pub const AUDIT_DIR: &str = "audit";
pub const LOG_FILE: &str = "tool-log.jsonl";
const ROTATED_PREFIX: &str = "tool-log-";
const REDACTED: &str = "[redacted]";
const PATH_MARKER: &str = "[path]";
const URL_MARKER: &str = "[url]";
const PATH_KEYS: &[&str] = &["path", "paths", "file", "files", "from", "to", "folder"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    Executed,
    Denied,
    RateLimited,
    Cancelled,
    Undo,
}

/// One immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolExecutionLog {
    pub timestamp: DateTime<Utc>,
    pub kind: AuditKind,
    pub tool: String,
    pub execution_id: String,
    pub params: Value,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

fn looks_like_url(s: &str) -> bool {
    url::Url::parse(s)
        .map(|u| matches!(u.scheme(), "http" | "https"))
        .unwrap_or(false)
}

fn anonymize_value(key: Option<&str>, value: &Value) -> Value {
    match value {
        Value::String(s) if looks_like_url(s) => Value::String(URL_MARKER.into()),
        Value::String(s) => {
            let path_key = key.map(|k| PATH_KEYS.contains(&k)).unwrap_or(false);
            if path_key || s.contains('/') || s.ends_with(".md") {
                Value::String(PATH_MARKER.into())
            } else {
                value.clone()
            }
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| anonymize_value(key, v)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), anonymize_value(Some(k), v)))
                .collect::<Map<String, Value>>(),
        ),
        other => other.clone(),
    }
}

/// Apply the privacy toggles to a parameter payload.
pub fn sanitize_params(params: &Value, settings: &AuditConfig) -> Value {
    if settings.redact_params {
        return Value::String(REDACTED.into());
    }
    if settings.anonymize_paths {
        return anonymize_value(None, params);
    }
    params.clone()
}

pub struct AuditLogger {
    dir: PathBuf,
    settings: RwLock<AuditConfig>,
    buffer: Mutex<Vec<ToolExecutionLog>>,
}

impl AuditLogger {
    /// Open the log under `state_dir`, pruning entries past retention.
    pub fn open(state_dir: &Path, settings: AuditConfig) -> Self {
        let logger = Self {
            dir: state_dir.join(AUDIT_DIR),
            settings: RwLock::new(settings),
            buffer: Mutex::new(Vec::new()),
        };
        if logger.settings().enabled {
            if let Err(e) = logger.prune(Utc::now()) {
                warn!(error = %e, "failed to prune audit log");
            }
        }
        logger
    }

    fn settings(&self) -> AuditConfig {
        self.settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn update_settings(&self, settings: AuditConfig) {
        *self.settings.write().unwrap_or_else(|e| e.into_inner()) = settings;
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    /// Sanitize and buffer an entry; flush when the batch is full.
    pub fn record(&self, mut entry: ToolExecutionLog) {
        let settings = self.settings();
        if !settings.enabled {
            return;
        }
        entry.params = sanitize_params(&entry.params, &settings);
        if settings.redact_params || settings.anonymize_paths {
            if let Some(result) = entry.result.take() {
                entry.result = Some(sanitize_params(&result, &settings));
            }
        }

        let full = {
            let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
            buffer.push(entry);
            buffer.len() >= settings.batch_size.max(1)
        };
        if full {
            if let Err(e) = self.flush() {
                warn!(error = %e, "failed to flush audit log");
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Write buffered entries to disk. On failure the entries stay
    /// buffered for the next attempt.
    pub fn flush(&self) -> Result<()> {
        let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        if buffer.is_empty() {
            return Ok(());
        }
        let settings = self.settings();
        let mut lines = String::new();
        for entry in buffer.iter() {
            lines.push_str(&serde_json::to_string(entry)?);
            lines.push('\n');
        }

        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        self.rotate_if_needed(&settings)?;
        let path = self.log_path();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        file.write_all(lines.as_bytes())
            .with_context(|| format!("Failed to append to {}", path.display()))?;

        debug!(entries = buffer.len(), "audit batch flushed");
        buffer.clear();
        Ok(())
    }

    fn rotate_if_needed(&self, settings: &AuditConfig) -> Result<()> {
        let path = self.log_path();
        let size = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(_) => return Ok(()),
        };
        if size < settings.max_file_bytes {
            return Ok(());
        }

        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3f").to_string();
        let mut target = self.dir.join(format!("{}{}.jsonl", ROTATED_PREFIX, stamp));
        let mut n = 1;
        while target.exists() {
            target = self.dir.join(format!("{}{}-{}.jsonl", ROTATED_PREFIX, stamp, n));
            n += 1;
        }
        fs::rename(&path, &target)
            .with_context(|| format!("Failed to rotate {}", path.display()))?;
        debug!(to = %target.display(), "audit log rotated");

        let mut rotated = self.rotated_files()?;
        while rotated.len() > settings.max_rotated_files {
            let oldest = rotated.remove(0);
            fs::remove_file(&oldest)
                .with_context(|| format!("Failed to remove {}", oldest.display()))?;
        }
        Ok(())
    }

    /// Rotated log files, oldest first.
    pub fn rotated_files(&self) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(out),
        };
        for entry in entries {
            let path = entry?.path();
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if name.starts_with(ROTATED_PREFIX) && name.ends_with(".jsonl") {
                out.push(path);
            }
        }
        out.sort();
        Ok(out)
    }

    /// Drop entries older than the retention window from the live log.
    pub fn prune(&self, now: DateTime<Utc>) -> Result<usize> {
        let path = self.log_path();
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(_) => return Ok(0),
        };
        let Some(cutoff) = ChronoDuration::try_days(self.settings().retention_days)
            .and_then(|keep| now.checked_sub_signed(keep))
        else {
            return Ok(0);
        };

        let mut kept = String::new();
        let mut dropped = 0;
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<ToolExecutionLog>(line) {
                Ok(entry) if entry.timestamp < cutoff => dropped += 1,
                Ok(_) => {
                    kept.push_str(line);
                    kept.push('\n');
                }
                Err(_) => dropped += 1,
            }
        }
        if dropped > 0 {
            fs::write(&path, kept).with_context(|| format!("Failed to rewrite {}", path.display()))?;
            debug!(dropped, "audit entries pruned");
        }
        Ok(dropped)
    }

    /// Most recent entries (live log plus unflushed buffer), newest last.
    pub fn recent(&self, limit: usize) -> Result<Vec<ToolExecutionLog>> {
        let mut entries: Vec<ToolExecutionLog> = match fs::read_to_string(self.log_path()) {
            Ok(content) => content
                .lines()
                .filter_map(|l| serde_json::from_str(l).ok())
                .collect(),
            Err(_) => Vec::new(),
        };
        entries.extend(
            self.buffer
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .iter()
                .cloned(),
        );
        let skip = entries.len().saturating_sub(limit);
        Ok(entries.into_iter().skip(skip).collect())
    }
}

impl Drop for AuditLogger {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!(error = %e, "failed to flush audit log on shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn entry(tool: &str, at: DateTime<Utc>, params: Value) -> ToolExecutionLog {
        ToolExecutionLog {
            timestamp: at,
            kind: AuditKind::Executed,
            tool: tool.into(),
            execution_id: "e1".into(),
            params,
            success: true,
            result: None,
            error: None,
            duration_ms: 3,
        }
    }

    fn settings() -> AuditConfig {
        AuditConfig {
            batch_size: 2,
            ..AuditConfig::default()
        }
    }

    #[test]
    fn privacy_filters() {
        let params = json!({
            "path": "Notes/A.md",
            "url": "https://example.com/x",
            "pattern": "todo",
            "files": ["a.md", "b"],
        });
        let anon = sanitize_params(
            &params,
            &AuditConfig {
                anonymize_paths: true,
                ..AuditConfig::default()
            },
        );
        assert_eq!(anon["path"], "[path]");
        assert_eq!(anon["url"], "[url]");
        assert_eq!(anon["pattern"], "todo");
        assert_eq!(anon["files"], json!(["[path]", "[path]"]));

        let redacted = sanitize_params(
            &params,
            &AuditConfig {
                redact_params: true,
                ..AuditConfig::default()
            },
        );
        assert_eq!(redacted, json!("[redacted]"));
    }

    #[test]
    fn batches_until_threshold_then_flushes() {
        let tmp = TempDir::new().unwrap();
        let logger = AuditLogger::open(tmp.path(), settings());
        logger.record(entry("grep", Utc::now(), json!({})));
        assert_eq!(logger.pending(), 1);
        assert!(!logger.log_path().exists());

        logger.record(entry("find", Utc::now(), json!({})));
        assert_eq!(logger.pending(), 0);
        let content = fs::read_to_string(logger.log_path()).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    fn drop_flushes_pending_entries() {
        let tmp = TempDir::new().unwrap();
        {
            let logger = AuditLogger::open(tmp.path(), settings());
            logger.record(entry("grep", Utc::now(), json!({})));
        }
        let reopened = AuditLogger::open(tmp.path(), settings());
        assert_eq!(reopened.recent(10).unwrap().len(), 1);
    }

    #[test]
    fn prunes_entries_past_retention_on_open() {
        let tmp = TempDir::new().unwrap();
        {
            let logger = AuditLogger::open(tmp.path(), settings());
            logger.record(entry("old", Utc::now() - ChronoDuration::days(40), json!({})));
            logger.record(entry("new", Utc::now(), json!({})));
        }
        let logger = AuditLogger::open(tmp.path(), settings());
        let tools: Vec<String> = logger.recent(10).unwrap().into_iter().map(|e| e.tool).collect();
        assert_eq!(tools, vec!["new"]);
    }

    #[test]
    fn failed_flush_keeps_entries_for_retry() {
        let tmp = TempDir::new().unwrap();
        let logger = AuditLogger::open(tmp.path(), settings());
        // A file where the audit directory belongs makes every write fail.
        let blocker = tmp.path().join(AUDIT_DIR);
        fs::write(&blocker, "not a directory").unwrap();

        logger.record(entry("grep", Utc::now(), json!({})));
        logger.record(entry("find", Utc::now(), json!({})));
        assert!(logger.flush().is_err());
        assert_eq!(logger.pending(), 2);

        fs::remove_file(&blocker).unwrap();
        logger.flush().unwrap();
        assert_eq!(logger.pending(), 0);
        let tools: Vec<String> = logger.recent(10).unwrap().into_iter().map(|e| e.tool).collect();
        assert_eq!(tools, vec!["grep", "find"]);
    }

    #[test]
    fn huge_retention_prunes_nothing() {
        let tmp = TempDir::new().unwrap();
        {
            let logger = AuditLogger::open(tmp.path(), settings());
            logger.record(entry("old", Utc::now() - ChronoDuration::days(400), json!({})));
        }
        let logger = AuditLogger::open(
            tmp.path(),
            AuditConfig {
                retention_days: i64::MAX,
                ..settings()
            },
        );
        assert_eq!(logger.prune(Utc::now()).unwrap(), 0);
    }

    #[test]
    fn rotates_and_keeps_bounded_history() {
        let tmp = TempDir::new().unwrap();
        let logger = AuditLogger::open(
            tmp.path(),
            AuditConfig {
                batch_size: 1,
                max_file_bytes: 10,
                max_rotated_files: 2,
                ..AuditConfig::default()
            },
        );
        for _ in 0..5 {
            logger.record(entry("grep", Utc::now(), json!({})));
        }
        assert_eq!(logger.rotated_files().unwrap().len(), 2);
        assert_eq!(fs::read_to_string(logger.log_path()).unwrap().lines().count(), 1);
    }
}
