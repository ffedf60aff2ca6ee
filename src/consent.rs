//! Consent gate for tool invocations.
//!
//! Decision procedure for one invocation (first match wins):
//!
//! 1. mode `never_allow` → deny, no prompt
//! 2. developer mode and a `safe` tool → approve
//! 3. mode `always_allow` and the tool may bypass consent → approve
//! 4. mode `session_allow`, bypassable, already granted this session → approve
//! 5. otherwise prompt: allow once / for session / always / deny
//!
//! High-risk tools and tools that cannot bypass consent always reach the
//! prompt, and only "allow once" or "deny" are offered for them.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ToolsConfig;
use crate::tools::{RiskLevel, Tool, ToolArgs};

/// Persisted per-tool consent policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentMode {
    #[default]
    AlwaysAsk,
    SessionAllow,
    AlwaysAllow,
    NeverAllow,
}

/// An answer to the consent prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentChoice {
    AllowOnce,
    AllowSession,
    AlwaysAllow,
    Deny,
}

impl ConsentChoice {
    pub fn label(&self) -> &'static str {
        match self {
            ConsentChoice::AllowOnce => "Allow once",
            ConsentChoice::AllowSession => "Allow for this session",
            ConsentChoice::AlwaysAllow => "Always allow",
            ConsentChoice::Deny => "Deny",
        }
    }
}

/// What the prompter is asked to show.
#[derive(Debug, Clone)]
pub struct ConsentRequest {
    pub tool: String,
    pub description: String,
    pub risk: RiskLevel,
    pub args: ToolArgs,
    pub preview: Option<String>,
    pub choices: Vec<ConsentChoice>,
}

/// Interactive consent UI.
#[async_trait]
pub trait ConsentPrompter: Send + Sync {
    async fn prompt(&self, request: &ConsentRequest) -> Result<ConsentChoice>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsentDecision {
    Approved(Approval),
    Denied(Denial),
}

impl ConsentDecision {
    pub fn is_approved(&self) -> bool {
        matches!(self, ConsentDecision::Approved(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Approval {
    DeveloperMode,
    AlwaysAllow,
    Session,
    Prompt(ConsentChoice),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Denial {
    NeverAllow,
    UserDenied,
    Cancelled,
    PromptFailed(String),
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Denial::NeverAllow => f.write_str("tool is set to never allow"),
            Denial::UserDenied => f.write_str("user denied the tool call"),
            Denial::Cancelled => f.write_str("consent prompt cancelled"),
            Denial::PromptFailed(e) => write!(f, "consent prompt failed: {}", e),
        }
    }
}

pub struct ConsentManager {
    configured: RwLock<HashMap<String, ConsentMode>>,
    persisted: RwLock<HashMap<String, ConsentMode>>,
    developer_mode: AtomicBool,
    session: Mutex<HashSet<String>>,
    prompter: Arc<dyn ConsentPrompter>,
    store_path: Option<PathBuf>,
}

impl ConsentManager {
    /// `store_path` holds modes chosen interactively ("always") or set with
    /// [`ConsentManager::set_mode`]; they override configured modes.
    pub fn new(
        settings: &ToolsConfig,
        prompter: Arc<dyn ConsentPrompter>,
        store_path: Option<PathBuf>,
    ) -> Self {
        let persisted = store_path
            .as_ref()
            .map(|path| match std::fs::read_to_string(path) {
                Ok(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
                    warn!(path = %path.display(), error = %e, "consent store unreadable; ignoring");
                    HashMap::new()
                }),
                Err(_) => HashMap::new(),
            })
            .unwrap_or_default();

        Self {
            configured: RwLock::new(settings.consent.clone()),
            persisted: RwLock::new(persisted),
            developer_mode: AtomicBool::new(settings.developer_mode),
            session: Mutex::new(HashSet::new()),
            prompter,
            store_path,
        }
    }

    /// Replace configured modes and the developer flag. Session grants and
    /// persisted choices are kept.
    pub fn update_settings(&self, settings: &ToolsConfig) {
        *self.configured.write().unwrap_or_else(|e| e.into_inner()) = settings.consent.clone();
        self.developer_mode
            .store(settings.developer_mode, Ordering::SeqCst);
    }

    pub fn mode_for(&self, tool: &str) -> ConsentMode {
        if let Some(mode) = self
            .persisted
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(tool)
        {
            return *mode;
        }
        self.configured
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(tool)
            .copied()
            .unwrap_or_default()
    }

    /// Persist a mode for one tool.
    pub fn set_mode(&self, tool: &str, mode: ConsentMode) -> Result<()> {
        let snapshot = {
            let mut persisted = self.persisted.write().unwrap_or_else(|e| e.into_inner());
            persisted.insert(tool.to_string(), mode);
            persisted.clone()
        };
        if let Some(path) = &self.store_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let json = serde_json::to_string_pretty(&snapshot)?;
            std::fs::write(path, json)
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }
        Ok(())
    }

    /// Forget every session grant.
    pub fn clear_session(&self) {
        self.session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    fn has_session_grant(&self, tool: &str) -> bool {
        self.session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(tool)
    }

    /// Run the decision procedure, prompting when required. A cancelled
    /// token aborts a pending prompt with a denial.
    pub async fn check(
        &self,
        tool: &dyn Tool,
        args: &ToolArgs,
        preview: Option<String>,
        cancel: &CancellationToken,
    ) -> ConsentDecision {
        let name = tool.name();
        let mode = self.mode_for(name);
        let bypassable = tool.can_bypass_consent() && tool.risk() != RiskLevel::High;

        if mode == ConsentMode::NeverAllow {
            return ConsentDecision::Denied(Denial::NeverAllow);
        }
        if self.developer_mode.load(Ordering::SeqCst) && tool.risk() == RiskLevel::Safe {
            return ConsentDecision::Approved(Approval::DeveloperMode);
        }
        if bypassable && mode == ConsentMode::AlwaysAllow {
            return ConsentDecision::Approved(Approval::AlwaysAllow);
        }
        // Answering "allow for this session" puts the tool in session_allow
        // until the session is cleared, whatever its configured ask mode.
        if bypassable && self.has_session_grant(name) {
            return ConsentDecision::Approved(Approval::Session);
        }

        let choices = if bypassable {
            vec![
                ConsentChoice::AllowOnce,
                ConsentChoice::AllowSession,
                ConsentChoice::AlwaysAllow,
                ConsentChoice::Deny,
            ]
        } else {
            vec![ConsentChoice::AllowOnce, ConsentChoice::Deny]
        };
        let request = ConsentRequest {
            tool: name.to_string(),
            description: tool.description().to_string(),
            risk: tool.risk(),
            args: args.clone(),
            preview,
            choices,
        };

        let answer = tokio::select! {
            _ = cancel.cancelled() => return ConsentDecision::Denied(Denial::Cancelled),
            answer = self.prompter.prompt(&request) => answer,
        };
        let choice = match answer {
            Ok(choice) => choice,
            Err(e) => return ConsentDecision::Denied(Denial::PromptFailed(e.to_string())),
        };
        debug!(tool = %name, ?choice, "consent answered");

        match choice {
            ConsentChoice::Deny => ConsentDecision::Denied(Denial::UserDenied),
            ConsentChoice::AllowSession if bypassable => {
                self.session
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(name.to_string());
                ConsentDecision::Approved(Approval::Prompt(choice))
            }
            ConsentChoice::AlwaysAllow if bypassable => {
                if let Err(e) = self.set_mode(name, ConsentMode::AlwaysAllow) {
                    warn!(tool = %name, error = %e, "failed to persist consent mode");
                }
                ConsentDecision::Approved(Approval::Prompt(choice))
            }
            _ => ConsentDecision::Approved(Approval::Prompt(ConsentChoice::AllowOnce)),
        }
    }
}

/// Terminal prompt via `dialoguer`. Denies when stdin is not a terminal.
pub struct TerminalPrompter;

#[async_trait]
impl ConsentPrompter for TerminalPrompter {
    async fn prompt(&self, request: &ConsentRequest) -> Result<ConsentChoice> {
        if !atty::is(atty::Stream::Stdin) {
            warn!(tool = %request.tool, "no terminal for consent prompt; denying");
            return Ok(ConsentChoice::Deny);
        }
        let request = request.clone();
        tokio::task::spawn_blocking(move || {
            eprintln!();
            eprintln!("Tool request: {} (risk: {})", request.tool, request.risk);
            eprintln!("  {}", request.description);
            eprintln!("  arguments: {}", request.args.to_value());
            if let Some(preview) = &request.preview {
                eprintln!("{}", preview);
            }
            let labels: Vec<&str> = request.choices.iter().map(|c| c.label()).collect();
            let picked = dialoguer::Select::new()
                .with_prompt("Allow this tool call?")
                .items(&labels)
                .default(0)
                .interact_opt()?;
            Ok(picked
                .and_then(|i| request.choices.get(i).copied())
                .unwrap_or(ConsentChoice::Deny))
        })
        .await?
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::tools::testing::EchoTool;
    use tempfile::TempDir;

    fn settings(modes: &[(&str, ConsentMode)], developer_mode: bool) -> ToolsConfig {
        ToolsConfig {
            consent: modes.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            developer_mode,
            ..ToolsConfig::default()
        }
    }

    fn tool(name: &'static str, risk: RiskLevel, bypass: bool) -> EchoTool {
        EchoTool {
            risk,
            bypass,
            ..EchoTool::new(name)
        }
    }

    #[tokio::test]
    async fn always_allow_skips_prompt_only_when_bypassable() {
        let prompter = ScriptedPrompter::answering(&[ConsentChoice::AllowOnce]);
        let manager = ConsentManager::new(
            &settings(
                &[
                    ("open", ConsentMode::AlwaysAllow),
                    ("locked", ConsentMode::AlwaysAllow),
                ],
                false,
            ),
            prompter.clone(),
            None,
        );
        let cancel = CancellationToken::new();
        let args = ToolArgs::default();

        let open = tool("open", RiskLevel::Low, true);
        assert_eq!(
            manager.check(&open, &args, None, &cancel).await,
            ConsentDecision::Approved(Approval::AlwaysAllow)
        );
        assert_eq!(prompter.count(), 0);

        let locked = tool("locked", RiskLevel::Medium, false);
        assert!(manager.check(&locked, &args, None, &cancel).await.is_approved());
        assert_eq!(prompter.count(), 1);
        let request = prompter.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(request.choices, vec![ConsentChoice::AllowOnce, ConsentChoice::Deny]);
    }

    #[tokio::test]
    async fn never_allow_and_developer_mode() {
        let prompter = ScriptedPrompter::answering(&[]);
        let manager = ConsentManager::new(
            &settings(&[("blocked", ConsentMode::NeverAllow)], true),
            prompter.clone(),
            None,
        );
        let cancel = CancellationToken::new();
        let args = ToolArgs::default();

        let blocked = tool("blocked", RiskLevel::Safe, true);
        assert_eq!(
            manager.check(&blocked, &args, None, &cancel).await,
            ConsentDecision::Denied(Denial::NeverAllow)
        );
        let safe = tool("safe", RiskLevel::Safe, true);
        assert_eq!(
            manager.check(&safe, &args, None, &cancel).await,
            ConsentDecision::Approved(Approval::DeveloperMode)
        );
        let low = tool("low", RiskLevel::Low, true);
        assert_eq!(
            manager.check(&low, &args, None, &cancel).await,
            ConsentDecision::Denied(Denial::UserDenied)
        );
        assert_eq!(prompter.count(), 1);
    }

    #[tokio::test]
    async fn session_grant_is_remembered_by_name() {
        let prompter = ScriptedPrompter::answering(&[ConsentChoice::AllowSession]);
        let manager = ConsentManager::new(
            &settings(&[("grep", ConsentMode::SessionAllow)], false),
            prompter.clone(),
            None,
        );
        let cancel = CancellationToken::new();
        let grep = tool("grep", RiskLevel::Safe, true);

        assert!(manager.check(&grep, &ToolArgs::default(), None, &cancel).await.is_approved());
        assert_eq!(
            manager.check(&grep, &ToolArgs::default(), None, &cancel).await,
            ConsentDecision::Approved(Approval::Session)
        );
        assert_eq!(prompter.count(), 1);

        manager.clear_session();
        assert!(!manager.check(&grep, &ToolArgs::default(), None, &cancel).await.is_approved());
    }

    #[tokio::test]
    async fn session_answer_under_always_ask_stops_further_prompts() {
        let prompter =
            ScriptedPrompter::answering(&[ConsentChoice::AllowOnce, ConsentChoice::AllowSession]);
        let manager = ConsentManager::new(&ToolsConfig::default(), prompter.clone(), None);
        let cancel = CancellationToken::new();
        let read = tool("read", RiskLevel::Safe, true);
        assert_eq!(manager.mode_for("read"), ConsentMode::AlwaysAsk);

        // Allow-once grants nothing beyond this call.
        assert!(manager.check(&read, &ToolArgs::default(), None, &cancel).await.is_approved());
        assert!(manager.check(&read, &ToolArgs::default(), None, &cancel).await.is_approved());
        assert_eq!(prompter.count(), 2);

        assert_eq!(
            manager.check(&read, &ToolArgs::default(), None, &cancel).await,
            ConsentDecision::Approved(Approval::Session)
        );
        assert_eq!(prompter.count(), 2);
    }

    #[tokio::test]
    async fn always_answer_is_persisted() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("consent.json");
        let prompter = ScriptedPrompter::answering(&[ConsentChoice::AlwaysAllow]);
        let manager = ConsentManager::new(&ToolsConfig::default(), prompter, Some(path.clone()));
        let find = tool("find", RiskLevel::Safe, true);

        assert!(manager
            .check(&find, &ToolArgs::default(), None, &CancellationToken::new())
            .await
            .is_approved());

        let reloaded = ConsentManager::new(
            &ToolsConfig::default(),
            ScriptedPrompter::answering(&[]),
            Some(path),
        );
        assert_eq!(reloaded.mode_for("find"), ConsentMode::AlwaysAllow);
    }

    #[tokio::test]
    async fn cancellation_aborts_pending_prompt() {
        let manager = ConsentManager::new(&ToolsConfig::default(), Arc::new(HangingPrompter), None);
        let cancel = CancellationToken::new();
        let echo = tool("echo", RiskLevel::Low, true);

        let trigger = cancel.clone();
        tokio::spawn(async move { trigger.cancel() });
        assert_eq!(
            manager.check(&echo, &ToolArgs::default(), None, &cancel).await,
            ConsentDecision::Denied(Denial::Cancelled)
        );
    }
}
