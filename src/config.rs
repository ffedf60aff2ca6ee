//! TOML configuration.
//!
//! Every section has defaults so a minimal file only needs the vault root:
//!
//! ```toml
//! [vault]
//! root = "/home/me/notes"
//! ```
//!
//! Stateful components never share a mutable settings object. Each one is
//! built from its own section and exposes an `update_settings` method for
//! hot reload.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::consent::ConsentMode;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub vault: VaultConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

impl Config {
    /// Absolute directory holding the index snapshot, audit log, and
    /// persisted consent modes.
    pub fn state_dir(&self) -> PathBuf {
        self.vault.root.join(&self.vault.state_dir)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct VaultConfig {
    pub root: PathBuf,
    /// Hidden folder (relative to `root`) for persisted state.
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    /// Folder prefixes whose documents are never indexed.
    #[serde(default)]
    pub exclude_folders: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

fn default_state_dir() -> String {
    ".vault-assist".to_string()
}
fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string(), "**/*.markdown".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_save_debounce_ms")]
    pub save_debounce_ms: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            chunk_size: default_chunk_size(),
            save_debounce_ms: default_save_debounce_ms(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_chunk_size() -> usize {
    vault_assist_core::chunk::DEFAULT_CHUNK_SIZE
}
fn default_save_debounce_ms() -> u64 {
    2_500
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_max_context")]
    pub max_context: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_context: default_max_context(),
        }
    }
}

fn default_max_context() -> usize {
    vault_assist_core::retrieve::DEFAULT_MAX_CONTEXT
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    /// `"openai"` (any OpenAI-compatible endpoint) or `"ollama"`.
    #[serde(default = "default_model_provider")]
    pub provider: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_model_name")]
    pub model: String,
    /// Environment variable holding the API key (OpenAI provider only).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default = "default_model_timeout_secs")]
    pub timeout_secs: u64,
    /// Retries for single-shot requests on 429/5xx or network errors.
    #[serde(default = "default_model_max_retries")]
    pub max_retries: u32,
    /// Abort a turn when no streamed token arrives for this long.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Safety ceiling on tool-call rounds per user message.
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: default_model_provider(),
            base_url: None,
            model: default_model_name(),
            api_key_env: default_api_key_env(),
            temperature: None,
            max_tokens: None,
            timeout_secs: default_model_timeout_secs(),
            max_retries: default_model_max_retries(),
            idle_timeout_secs: default_idle_timeout_secs(),
            max_tool_rounds: default_max_tool_rounds(),
            system_prompt: None,
        }
    }
}

fn default_model_provider() -> String {
    "ollama".to_string()
}
fn default_model_name() -> String {
    "llama3.1".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_model_timeout_secs() -> u64 {
    120
}
fn default_model_max_retries() -> u32 {
    3
}
fn default_idle_timeout_secs() -> u64 {
    25
}
fn default_max_tool_rounds() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct ToolsConfig {
    /// Tools offered to the model. Enablement is policy, not a property
    /// of the tool.
    #[serde(default = "default_enabled_tools")]
    pub enabled: Vec<String>,
    /// Auto-approves `safe` tools without prompting.
    #[serde(default)]
    pub developer_mode: bool,
    #[serde(default)]
    pub consent: HashMap<String, ConsentMode>,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub find: FindConfig,
    #[serde(default)]
    pub grep: GrepConfig,
    #[serde(default)]
    pub read: ReadConfig,
    #[serde(default)]
    pub patch: PatchConfig,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled_tools(),
            developer_mode: false,
            consent: HashMap::new(),
            rate_limit: RateLimitConfig::default(),
            find: FindConfig::default(),
            grep: GrepConfig::default(),
            read: ReadConfig::default(),
            patch: PatchConfig::default(),
        }
    }
}

fn default_enabled_tools() -> Vec<String> {
    ["find", "grep", "read", "apply_patch"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct RateLimitConfig {
    #[serde(default = "default_global_per_minute")]
    pub global_per_minute: u32,
    #[serde(default = "default_per_tool_per_minute")]
    pub per_tool_per_minute: u32,
    /// Per-tool overrides of `per_tool_per_minute`.
    #[serde(default)]
    pub overrides: HashMap<String, u32>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global_per_minute: default_global_per_minute(),
            per_tool_per_minute: default_per_tool_per_minute(),
            overrides: HashMap::new(),
        }
    }
}

impl RateLimitConfig {
    pub fn limit_for(&self, tool: &str) -> u32 {
        self.overrides
            .get(tool)
            .copied()
            .unwrap_or(self.per_tool_per_minute)
    }
}

fn default_global_per_minute() -> u32 {
    60
}
fn default_per_tool_per_minute() -> u32 {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct FindConfig {
    #[serde(default = "default_find_max_results")]
    pub max_results: usize,
}

impl Default for FindConfig {
    fn default() -> Self {
        Self {
            max_results: default_find_max_results(),
        }
    }
}

fn default_find_max_results() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct GrepConfig {
    #[serde(default = "default_grep_max_matches")]
    pub max_matches: usize,
    #[serde(default = "default_grep_context_lines")]
    pub context_lines: usize,
}

impl Default for GrepConfig {
    fn default() -> Self {
        Self {
            max_matches: default_grep_max_matches(),
            context_lines: default_grep_context_lines(),
        }
    }
}

fn default_grep_max_matches() -> usize {
    100
}
fn default_grep_context_lines() -> usize {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReadConfig {
    #[serde(default = "default_read_max_bytes")]
    pub max_bytes: usize,
}

impl Default for ReadConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_read_max_bytes(),
        }
    }
}

fn default_read_max_bytes() -> usize {
    64 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct PatchConfig {
    /// How many applied patches stay undoable.
    #[serde(default = "default_patch_undo_depth")]
    pub undo_depth: usize,
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self {
            undo_depth: default_patch_undo_depth(),
        }
    }
}

fn default_patch_undo_depth() -> usize {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebConfig {
    #[serde(default)]
    pub allowlist: Vec<String>,
    #[serde(default)]
    pub allow_all: bool,
    #[serde(default = "default_true")]
    pub https_only: bool,
    /// Rejects every network-class tool call.
    #[serde(default)]
    pub block_all: bool,
    #[serde(default = "default_true")]
    pub cache_enabled: bool,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    #[serde(default = "default_search_endpoint")]
    pub search_endpoint: String,
    #[serde(default = "default_search_max_results")]
    pub search_max_results: usize,
    #[serde(default = "default_fetch_max_bytes")]
    pub fetch_max_bytes: usize,
    #[serde(default = "default_web_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            allowlist: Vec::new(),
            allow_all: false,
            https_only: true,
            block_all: false,
            cache_enabled: true,
            cache_ttl_secs: default_cache_ttl_secs(),
            cache_capacity: default_cache_capacity(),
            search_endpoint: default_search_endpoint(),
            search_max_results: default_search_max_results(),
            fetch_max_bytes: default_fetch_max_bytes(),
            timeout_secs: default_web_timeout_secs(),
        }
    }
}

fn default_cache_ttl_secs() -> u64 {
    15 * 60
}
fn default_cache_capacity() -> usize {
    128
}
fn default_search_endpoint() -> String {
    "https://api.duckduckgo.com/".to_string()
}
fn default_search_max_results() -> usize {
    8
}
fn default_fetch_max_bytes() -> usize {
    200 * 1024
}
fn default_web_timeout_secs() -> u64 {
    20
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct AuditConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    /// Replace every parameter with a redaction marker.
    #[serde(default)]
    pub redact_params: bool,
    /// Replace only path- and URL-valued parameters.
    #[serde(default)]
    pub anonymize_paths: bool,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default = "default_max_rotated_files")]
    pub max_rotated_files: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_days: default_retention_days(),
            redact_params: false,
            anonymize_paths: false,
            max_file_bytes: default_max_file_bytes(),
            max_rotated_files: default_max_rotated_files(),
            batch_size: default_batch_size(),
        }
    }
}

/// Upper bound for `audit.retention_days` (100 years).
pub const MAX_RETENTION_DAYS: i64 = 36_500;

fn default_retention_days() -> i64 {
    30
}
fn default_max_file_bytes() -> u64 {
    1024 * 1024
}
fn default_max_rotated_files() -> usize {
    5
}
fn default_batch_size() -> usize {
    10
}

/// Parse and validate a config file.
///
/// A relative `vault.root` is resolved against the config file's directory.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config = parse_config(&content)?;

    if config.vault.root.is_relative() {
        if let Some(parent) = path.parent() {
            config.vault.root = parent.join(&config.vault.root);
        }
    }

    Ok(config)
}

/// Parse and validate config text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.index.chunk_size == 0 {
        bail!("index.chunk_size must be > 0");
    }

    if config.retrieval.max_context < 1 {
        bail!("retrieval.max_context must be >= 1");
    }

    let state = Path::new(&config.vault.state_dir);
    let mut components = state.components();
    let single_normal = matches!(
        (components.next(), components.next()),
        (Some(std::path::Component::Normal(_)), None)
    );
    if !single_normal {
        bail!("vault.state_dir must be a single folder name inside the vault");
    }

    match config.model.provider.as_str() {
        "openai" | "ollama" => {}
        other => bail!(
            "Unknown model provider: '{}'. Must be openai or ollama.",
            other
        ),
    }

    if config.model.max_tool_rounds == 0 {
        bail!("model.max_tool_rounds must be >= 1");
    }

    if config.model.idle_timeout_secs == 0 {
        bail!("model.idle_timeout_secs must be > 0");
    }

    if config.tools.rate_limit.global_per_minute == 0 {
        bail!("tools.rate_limit.global_per_minute must be > 0");
    }

    if !(1..=MAX_RETENTION_DAYS).contains(&config.audit.retention_days) {
        bail!(
            "audit.retention_days must be between 1 and {}",
            MAX_RETENTION_DAYS
        );
    }

    Ok(())
}
