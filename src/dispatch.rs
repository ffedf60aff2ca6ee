//! Tool dispatcher: the gate every model-requested call passes through.
//!
//! ```text
//! ToolCall ─▶ normalize args ─▶ resolve ─▶ enabled? ─▶ network blocked?
//!          ─▶ validate ─▶ preview ─▶ consent ─▶ rate limit ─▶ execute ─▶ audit
//! ```
//!
//! Every outcome, including internal errors and panics inside a tool, is
//! returned as a [`ToolResult`]; nothing here fails the conversation.

use serde_json::{json, Value};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audit::{AuditKind, AuditLogger, ToolExecutionLog};
use crate::config::{ToolsConfig, WebConfig};
use crate::consent::{ConsentDecision, ConsentManager};
use crate::indexer::Indexer;
use crate::model::{ToolCall, ToolSchema};
use crate::rate_limit::RateLimiter;
use crate::tools::patch::PatchJournal;
use crate::tools::{Tool, ToolContext, ToolProvider, ToolRegistry, ToolResult};
use crate::vault::Vault;

/// Enablement and network policy read on every call.
#[derive(Debug, Clone, Default)]
pub struct DispatchPolicy {
    pub enabled: Vec<String>,
    pub block_network: bool,
}

impl DispatchPolicy {
    pub fn from_config(tools: &ToolsConfig, web: &WebConfig) -> Self {
        Self {
            enabled: tools.enabled.clone(),
            block_network: web.block_all,
        }
    }
}

pub struct ToolDispatcher {
    registry: RwLock<ToolRegistry>,
    policy: RwLock<DispatchPolicy>,
    consent: ConsentManager,
    limiter: RateLimiter,
    audit: Arc<AuditLogger>,
    journal: Arc<PatchJournal>,
    vault: Arc<dyn Vault>,
    indexer: Option<Arc<Indexer>>,
}

impl ToolDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: ToolRegistry,
        policy: DispatchPolicy,
        consent: ConsentManager,
        limiter: RateLimiter,
        audit: Arc<AuditLogger>,
        journal: Arc<PatchJournal>,
        vault: Arc<dyn Vault>,
        indexer: Option<Arc<Indexer>>,
    ) -> Self {
        Self {
            registry: RwLock::new(registry),
            policy: RwLock::new(policy),
            consent,
            limiter,
            audit,
            journal,
            vault,
            indexer,
        }
    }

    pub fn consent(&self) -> &ConsentManager {
        &self.consent
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    pub fn journal(&self) -> &PatchJournal {
        &self.journal
    }

    pub fn register_provider(&self, provider: &dyn ToolProvider) -> anyhow::Result<()> {
        self.registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .register(provider)
    }

    pub fn unregister_provider(&self, id: &str) {
        self.registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .unregister(id);
    }

    pub fn update_policy(&self, policy: DispatchPolicy) {
        *self.policy.write().unwrap_or_else(|e| e.into_inner()) = policy;
    }

    fn policy(&self) -> DispatchPolicy {
        self.policy
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn resolve(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .resolve(name)
    }

    /// Every registered tool (enabled or not).
    pub fn all_tools(&self) -> Vec<Arc<dyn Tool>> {
        self.registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .all()
    }

    /// Tools offered to the model under the current policy.
    pub fn available_tools(&self) -> Vec<Arc<dyn Tool>> {
        let policy = self.policy();
        self.registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .list_available(&policy.enabled)
            .into_iter()
            .filter(|t| !(policy.block_network && t.is_network()))
            .collect()
    }

    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.available_tools()
            .iter()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect()
    }

    fn audit_entry(
        &self,
        kind: AuditKind,
        tool: &str,
        execution_id: &str,
        params: Value,
        result: &ToolResult,
        started: Instant,
    ) {
        self.audit.record(ToolExecutionLog {
            timestamp: chrono::Utc::now(),
            kind,
            tool: tool.to_string(),
            execution_id: execution_id.to_string(),
            params,
            success: result.success,
            result: result.success.then(|| result.result.clone()),
            error: result.error.clone(),
            duration_ms: started.elapsed().as_millis() as u64,
        });
    }

    /// Run one model-requested call through every gate.
    pub async fn dispatch(&self, call: &ToolCall, cancel: &CancellationToken) -> ToolResult {
        let started = Instant::now();
        let name = call.name.as_str();

        let args = match call.arguments.normalize() {
            Ok(args) => args,
            Err(e) => return ToolResult::failure(format!("invalid arguments for {}: {}", name, e)),
        };
        let Some(tool) = self.resolve(name) else {
            return ToolResult::failure(format!("unknown tool: {}", name));
        };
        let policy = self.policy();
        if !policy.enabled.iter().any(|e| e == name) {
            return ToolResult::failure(format!("tool is disabled: {}", name));
        }
        if policy.block_network && tool.is_network() {
            return ToolResult::failure(format!("network access is blocked; {} unavailable", name));
        }
        let args = match args.validated(&tool.params()) {
            Ok(args) => args,
            Err(e) => return ToolResult::failure(e.to_string()),
        };

        let execution_id = uuid::Uuid::new_v4().to_string();
        let ctx = ToolContext {
            vault: self.vault.clone(),
            indexer: self.indexer.clone(),
            execution_id: execution_id.clone(),
            cancel: cancel.clone(),
        };

        let preview = if tool.requires_preview() {
            match tool.preview(&args, &ctx).await {
                Ok(preview) => preview,
                Err(e) => return ToolResult::failure(format!("{:#}", e)),
            }
        } else {
            None
        };

        if let ConsentDecision::Denied(reason) =
            self.consent.check(tool.as_ref(), &args, preview, cancel).await
        {
            info!(tool = %name, %reason, "tool call denied");
            let result = ToolResult::failure(format!("{}: {}", name, reason))
                .with_execution_id(execution_id.clone());
            self.audit_entry(AuditKind::Denied, name, &execution_id, args.to_value(), &result, started);
            return result;
        }

        if let Err(limited) = self.limiter.check_limit(name) {
            let result =
                ToolResult::failure(limited.to_string()).with_execution_id(execution_id.clone());
            self.audit_entry(AuditKind::RateLimited, name, &execution_id, args.to_value(), &result, started);
            return result;
        }

        debug!(tool = %name, execution_id = %execution_id, "executing tool");
        let params = args.to_value();
        let task_tool = tool.clone();
        let handle = tokio::spawn(async move { task_tool.execute(&args, &ctx).await });
        let abort = handle.abort_handle();
        let (kind, mut result) = tokio::select! {
            _ = cancel.cancelled() => {
                abort.abort();
                (AuditKind::Cancelled, ToolResult::failure("cancelled"))
            }
            joined = handle => match joined {
                Ok(Ok(result)) => (AuditKind::Executed, result),
                Ok(Err(e)) => (AuditKind::Executed, ToolResult::failure(format!("{:#}", e))),
                Err(e) if e.is_panic() => {
                    warn!(tool = %name, "tool panicked");
                    (
                        AuditKind::Executed,
                        ToolResult::failure(format!("{} failed unexpectedly", name)),
                    )
                }
                Err(_) => (AuditKind::Cancelled, ToolResult::failure("cancelled")),
            },
        };
        if result.execution_id.is_none() {
            result.execution_id = Some(execution_id.clone());
        }

        self.audit_entry(kind, name, &execution_id, params, &result, started);
        result
    }

    /// Restore the pre-image of an `apply_patch` execution.
    pub async fn undo(&self, execution_id: &str) -> ToolResult {
        let started = Instant::now();
        let result = match self.journal.undo(execution_id, self.vault.as_ref()).await {
            Ok(record) => {
                if let Some(indexer) = &self.indexer {
                    if let Err(e) = indexer.update_document(&record.path).await {
                        warn!(path = %record.path, error = %e, "index update after undo failed");
                    }
                }
                ToolResult::ok(json!({ "path": record.path, "restored": true }))
            }
            Err(e) => ToolResult::failure(format!("{:#}", e)),
        }
        .with_execution_id(execution_id);

        self.audit_entry(
            AuditKind::Undo,
            "apply_patch",
            execution_id,
            json!({ "execution_id": execution_id }),
            &result,
            started,
        );
        result
    }
}
