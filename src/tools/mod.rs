//! Tool extension system.
//!
//! A [`Tool`] is a named capability the model may invoke. Tools arrive in
//! groups through a [`ToolProvider`] and live in the [`ToolRegistry`]:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 ToolRegistry                 │
//! │  ┌──────────────────────┐ ┌───────────────┐  │
//! │  │ builtin              │ │ other         │  │
//! │  │ find grep read       │ │ providers     │  │
//! │  │ apply_patch          │ │ (Rust)        │  │
//! │  │ web_search web_fetch │ │               │  │
//! │  └──────────────────────┘ └───────────────┘  │
//! └──────────────────────┬───────────────────────┘
//!                        ▼
//!        ToolDispatcher::dispatch() → ToolResult
//! ```
//!
//! Tools never see raw model output. Arguments are normalized once into
//! [`ToolArgs`] (see [`RawArguments::normalize`]) and checked against the
//! tool's [`ParamSpec`] list before `execute` runs.

pub mod fetch;
pub mod find;
pub mod grep;
pub mod patch;
pub mod read;
pub mod search;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::{ToolsConfig, WebConfig};
use crate::indexer::Indexer;
use crate::vault::Vault;

use self::fetch::{WebClient, WebFetchTool};
use self::find::FindTool;
use self::grep::GrepTool;
use self::patch::{ApplyPatchTool, PatchJournal};
use self::read::ReadTool;
use self::search::WebSearchTool;

// ═══════════════════════════════════════════════════════════════════════
// Descriptors
// ═══════════════════════════════════════════════════════════════════════

/// Static risk classification; governs default consent strictness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Safe,
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Safe => "safe",
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON type of a tool parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    Integer,
    Boolean,
    StringArray,
    ObjectArray,
}

impl ParamType {
    fn schema(&self) -> Value {
        match self {
            ParamType::String => serde_json::json!({ "type": "string" }),
            ParamType::Integer => serde_json::json!({ "type": "integer" }),
            ParamType::Boolean => serde_json::json!({ "type": "boolean" }),
            ParamType::StringArray => {
                serde_json::json!({ "type": "array", "items": { "type": "string" } })
            }
            ParamType::ObjectArray => {
                serde_json::json!({ "type": "array", "items": { "type": "object" } })
            }
        }
    }

    fn accepts(&self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::StringArray => value
                .as_array()
                .map(|a| a.iter().all(Value::is_string))
                .unwrap_or(false),
            ParamType::ObjectArray => value
                .as_array()
                .map(|a| a.iter().all(Value::is_object))
                .unwrap_or(false),
        }
    }
}

/// One entry of a tool's typed parameter list.
#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamType,
    pub description: &'static str,
    pub required: bool,
    pub default: Option<Value>,
}

impl ParamSpec {
    pub fn required(name: &'static str, kind: ParamType, description: &'static str) -> Self {
        Self {
            name,
            kind,
            description,
            required: true,
            default: None,
        }
    }

    pub fn optional(name: &'static str, kind: ParamType, description: &'static str) -> Self {
        Self {
            name,
            kind,
            description,
            required: false,
            default: None,
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

/// Build a JSON Schema object from a parameter list.
pub fn params_schema(params: &[ParamSpec]) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for param in params {
        let mut schema = param.kind.schema();
        if let Some(obj) = schema.as_object_mut() {
            obj.insert("description".into(), Value::String(param.description.into()));
            if let Some(default) = &param.default {
                obj.insert("default".into(), default.clone());
            }
        }
        properties.insert(param.name.to_string(), schema);
        if param.required {
            required.push(Value::String(param.name.to_string()));
        }
    }
    serde_json::json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

// ═══════════════════════════════════════════════════════════════════════
// Arguments
// ═══════════════════════════════════════════════════════════════════════

/// Tool-call arguments as the model sent them: a JSON-encoded string
/// (OpenAI) or an already-parsed object (Ollama).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawArguments {
    Object(Map<String, Value>),
    Text(String),
}

impl Default for RawArguments {
    fn default() -> Self {
        RawArguments::Object(Map::new())
    }
}

impl RawArguments {
    /// Resolve into a key-value map. Empty text is an empty map; text that
    /// decodes to a JSON string is decoded once more.
    pub fn normalize(&self) -> Result<ToolArgs> {
        match self {
            RawArguments::Object(map) => Ok(ToolArgs(map.clone())),
            RawArguments::Text(text) => {
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    return Ok(ToolArgs::default());
                }
                let value: Value = serde_json::from_str(trimmed)
                    .map_err(|e| anyhow!("arguments are not valid JSON: {}", e))?;
                match value {
                    Value::Object(map) => Ok(ToolArgs(map)),
                    Value::Null => Ok(ToolArgs::default()),
                    Value::String(inner) => RawArguments::Text(inner).normalize(),
                    _ => bail!("arguments must be a JSON object"),
                }
            }
        }
    }

    /// The JSON-string form, as OpenAI-compatible APIs expect it.
    pub fn to_json_string(&self) -> String {
        match self {
            RawArguments::Object(map) => Value::Object(map.clone()).to_string(),
            RawArguments::Text(text) => text.clone(),
        }
    }
}

/// Normalized tool arguments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolArgs(pub Map<String, Value>);

impl ToolArgs {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name).filter(|v| !v.is_null())
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn require_str(&self, name: &str) -> Result<&str> {
        match self.str(name) {
            Some(s) if !s.trim().is_empty() => Ok(s),
            _ => bail!("missing required parameter: {}", name),
        }
    }

    pub fn usize(&self, name: &str) -> Option<usize> {
        self.get(name).and_then(Value::as_u64).map(|n| n as usize)
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(Value::as_bool)
    }

    pub fn strings(&self, name: &str) -> Option<Vec<String>> {
        self.get(name).and_then(Value::as_array).map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    /// Check against a parameter list: required names present, types match,
    /// defaults filled in. Unknown keys are kept.
    pub fn validated(mut self, params: &[ParamSpec]) -> Result<Self> {
        for param in params {
            match self.get(param.name) {
                Some(value) => {
                    if !param.kind.accepts(value) {
                        bail!(
                            "parameter '{}' must be {}",
                            param.name,
                            param.kind.schema()["type"].as_str().unwrap_or("valid")
                        );
                    }
                }
                None if param.required => bail!("missing required parameter: {}", param.name),
                None => {
                    if let Some(default) = &param.default {
                        self.0.insert(param.name.to_string(), default.clone());
                    }
                }
            }
        }
        Ok(self)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Results
// ═══════════════════════════════════════════════════════════════════════

/// Outcome of one tool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl ToolResult {
    pub fn ok(result: Value) -> Self {
        Self {
            success: true,
            result,
            error: None,
            execution_id: None,
            metadata: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: Value::Null,
            error: Some(error.into()),
            execution_id: None,
            metadata: None,
        }
    }

    pub fn with_execution_id(mut self, id: impl Into<String>) -> Self {
        self.execution_id = Some(id.into());
        self
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata
            .get_or_insert_with(Map::new)
            .insert(key.to_string(), value);
        self
    }

    /// Content of the `tool` turn fed back to the model.
    pub fn to_message_content(&self) -> String {
        if self.success {
            match &self.result {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            }
        } else {
            serde_json::json!({
                "error": self.error.as_deref().unwrap_or("tool failed"),
            })
            .to_string()
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Tool trait
// ═══════════════════════════════════════════════════════════════════════

/// Shared handles a tool may use while executing.
#[derive(Clone)]
pub struct ToolContext {
    pub vault: Arc<dyn Vault>,
    pub indexer: Option<Arc<Indexer>>,
    /// Identifier of this invocation, for undo correlation.
    pub execution_id: String,
    pub cancel: CancellationToken,
}

impl ToolContext {
    /// Tell the index a document changed underneath it.
    pub async fn document_written(&self, path: &str) {
        if let Some(indexer) = &self.indexer {
            if let Err(e) = indexer.update_document(path).await {
                tracing::warn!(path = %path, error = %e, "index update after write failed");
            }
        }
    }
}

/// A capability the model may invoke.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name, used as the function name in model requests.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn params(&self) -> Vec<ParamSpec>;

    fn parameters_schema(&self) -> Value {
        params_schema(&self.params())
    }

    fn risk(&self) -> RiskLevel {
        RiskLevel::Low
    }

    /// Whether `always_allow` may skip the consent prompt for this tool.
    fn can_bypass_consent(&self) -> bool {
        true
    }

    /// Whether a preview must be attached to the consent prompt.
    fn requires_preview(&self) -> bool {
        false
    }

    /// Network-class tools are refused while network access is blocked.
    fn is_network(&self) -> bool {
        false
    }

    /// Human-readable preview (diff or summary) for the consent prompt.
    async fn preview(&self, _args: &ToolArgs, _ctx: &ToolContext) -> Result<Option<String>> {
        Ok(None)
    }

    async fn execute(&self, args: &ToolArgs, ctx: &ToolContext) -> Result<ToolResult>;
}

/// A named group of tools registered and unregistered together.
pub trait ToolProvider: Send + Sync {
    fn id(&self) -> &str;

    fn tools(&self) -> Vec<Arc<dyn Tool>>;
}

/// The six tools every assistant ships with.
pub struct BuiltinTools {
    tools: Vec<Arc<dyn Tool>>,
}

impl BuiltinTools {
    pub fn new(settings: &ToolsConfig, web: Arc<WebClient>, journal: Arc<PatchJournal>) -> Self {
        Self {
            tools: vec![
                Arc::new(FindTool::new(settings.find.clone())),
                Arc::new(GrepTool::new(settings.grep.clone())),
                Arc::new(ReadTool::new(settings.read.clone())),
                Arc::new(ApplyPatchTool::new(journal)),
                Arc::new(WebSearchTool::new(web.clone())),
                Arc::new(WebFetchTool::new(web)),
            ],
        }
    }

    /// Convenience constructor with a fresh web client and journal.
    pub fn from_config(tools: &ToolsConfig, web: &WebConfig) -> Result<(Self, Arc<PatchJournal>)> {
        let journal = Arc::new(PatchJournal::new(tools.patch.undo_depth));
        let client = Arc::new(WebClient::new(web.clone())?);
        Ok((Self::new(tools, client, journal.clone()), journal))
    }
}

impl ToolProvider for BuiltinTools {
    fn id(&self) -> &str {
        "builtin"
    }

    fn tools(&self) -> Vec<Arc<dyn Tool>> {
        self.tools.clone()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════

struct ProviderEntry {
    id: String,
    tools: Vec<Arc<dyn Tool>>,
}

/// Every registered tool, grouped by provider.
#[derive(Default)]
pub struct ToolRegistry {
    providers: Vec<ProviderEntry>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add all tools of a provider. Rejects the whole provider if its id or
    /// any tool name is already registered.
    pub fn register(&mut self, provider: &dyn ToolProvider) -> Result<()> {
        if self.providers.iter().any(|p| p.id == provider.id()) {
            bail!("tool provider already registered: {}", provider.id());
        }
        let tools = provider.tools();
        let mut names = HashSet::new();
        for tool in &tools {
            if !names.insert(tool.name().to_string()) || self.resolve(tool.name()).is_some() {
                bail!("tool name already registered: {}", tool.name());
            }
        }
        self.providers.push(ProviderEntry {
            id: provider.id().to_string(),
            tools,
        });
        Ok(())
    }

    /// Remove a provider and its tools. Unknown ids are ignored.
    pub fn unregister(&mut self, provider_id: &str) {
        self.providers.retain(|p| p.id != provider_id);
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.all().into_iter().find(|t| t.name() == name)
    }

    /// All registered tools in registration order.
    pub fn all(&self) -> Vec<Arc<dyn Tool>> {
        self.providers
            .iter()
            .flat_map(|p| p.tools.iter().cloned())
            .collect()
    }

    /// Registered tools whose name appears in `enabled`.
    pub fn list_available(&self, enabled: &[String]) -> Vec<Arc<dyn Tool>> {
        self.all()
            .into_iter()
            .filter(|t| enabled.iter().any(|e| e == t.name()))
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Minimal tool for registry and dispatcher tests.
    pub struct EchoTool {
        pub name: &'static str,
        pub risk: RiskLevel,
        pub bypass: bool,
        pub network: bool,
    }

    impl EchoTool {
        pub fn new(name: &'static str) -> Self {
            Self {
                name,
                risk: RiskLevel::Low,
                bypass: true,
                network: false,
            }
        }
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "Echo the arguments back"
        }
        fn params(&self) -> Vec<ParamSpec> {
            vec![ParamSpec::required("text", ParamType::String, "Text to echo")]
        }
        fn risk(&self) -> RiskLevel {
            self.risk
        }
        fn can_bypass_consent(&self) -> bool {
            self.bypass
        }
        fn is_network(&self) -> bool {
            self.network
        }
        async fn execute(&self, args: &ToolArgs, _ctx: &ToolContext) -> Result<ToolResult> {
            Ok(ToolResult::ok(Value::String(args.require_str("text")?.to_string())))
        }
    }

    pub struct StaticProvider {
        pub id: &'static str,
        pub tools: Vec<Arc<dyn Tool>>,
    }

    impl ToolProvider for StaticProvider {
        fn id(&self) -> &str {
            self.id
        }
        fn tools(&self) -> Vec<Arc<dyn Tool>> {
            self.tools.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn provider(id: &'static str, names: &[&'static str]) -> StaticProvider {
        StaticProvider {
            id,
            tools: names
                .iter()
                .map(|n| Arc::new(EchoTool::new(n)) as Arc<dyn Tool>)
                .collect(),
        }
    }

    #[test]
    fn register_rejects_collisions() {
        let mut registry = ToolRegistry::new();
        registry.register(&provider("a", &["one", "two"])).unwrap();
        let err = registry.register(&provider("b", &["two"])).unwrap_err();
        assert!(err.to_string().contains("two"));
        assert!(registry.register(&provider("a", &["three"])).is_err());
        assert_eq!(registry.all().len(), 2);
    }

    #[test]
    fn unregister_and_list_available() {
        let mut registry = ToolRegistry::new();
        registry.register(&provider("a", &["one", "two"])).unwrap();
        registry.register(&provider("b", &["three"])).unwrap();

        let enabled = vec!["two".to_string(), "three".to_string()];
        let names: Vec<String> = registry
            .list_available(&enabled)
            .iter()
            .map(|t| t.name().to_string())
            .collect();
        assert_eq!(names, vec!["two", "three"]);

        registry.unregister("b");
        registry.unregister("missing");
        assert!(registry.resolve("three").is_none());
        assert!(registry.resolve("one").is_some());
    }

    #[test]
    fn arguments_normalize_from_text_or_object() {
        let text = RawArguments::Text(r#"{"path":"A.md"}"#.into());
        assert_eq!(text.normalize().unwrap().str("path"), Some("A.md"));

        let double = RawArguments::Text(r#""{\"path\":\"B.md\"}""#.into());
        assert_eq!(double.normalize().unwrap().str("path"), Some("B.md"));

        let empty = RawArguments::Text("  ".into());
        assert!(empty.normalize().unwrap().0.is_empty());

        assert!(RawArguments::Text("[1,2]".into()).normalize().is_err());
        assert!(RawArguments::Text("{oops".into()).normalize().is_err());

        let parsed: RawArguments = serde_json::from_str(r#"{"q":"x"}"#).unwrap();
        assert!(matches!(parsed, RawArguments::Object(_)));
    }

    #[test]
    fn validation_fills_defaults_and_checks_types() {
        let params = vec![
            ParamSpec::required("pattern", ParamType::String, "p"),
            ParamSpec::optional("limit", ParamType::Integer, "l").with_default(serde_json::json!(5)),
        ];
        let args = RawArguments::Text(r#"{"pattern":"x"}"#.into())
            .normalize()
            .unwrap()
            .validated(&params)
            .unwrap();
        assert_eq!(args.usize("limit"), Some(5));

        let missing = ToolArgs::default().validated(&params).unwrap_err();
        assert!(missing.to_string().contains("missing required parameter: pattern"));

        let wrong = RawArguments::Text(r#"{"pattern":3}"#.into())
            .normalize()
            .unwrap()
            .validated(&params)
            .unwrap_err();
        assert!(wrong.to_string().contains("must be string"));
    }

    #[test]
    fn schema_lists_required_params() {
        let schema = EchoTool::new("echo").parameters_schema();
        assert_eq!(schema["required"], serde_json::json!(["text"]));
        assert_eq!(schema["properties"]["text"]["type"], "string");
    }

    #[test]
    fn failure_content_is_json_error() {
        let content = ToolResult::failure("nope").to_message_content();
        assert_eq!(content, r#"{"error":"nope"}"#);
        assert_eq!(ToolResult::ok(serde_json::json!("hi")).to_message_content(), "hi");
    }
}
