//! Wiring: build every subsystem from one [`Config`].

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::audit::AuditLogger;
use crate::config::Config;
use crate::consent::{ConsentManager, ConsentPrompter};
use crate::dispatch::{DispatchPolicy, ToolDispatcher};
use crate::indexer::Indexer;
use crate::model::{create_model, ChatModel};
use crate::orchestrator::{Orchestrator, OrchestratorSettings};
use crate::rate_limit::RateLimiter;
use crate::tools::fetch::WebClient;
use crate::tools::patch::PatchJournal;
use crate::tools::{BuiltinTools, ToolRegistry};
use crate::vault::{FsVault, Vault};

pub const CONSENT_FILE: &str = "consent.json";
pub const JOURNAL_FILE: &str = "patch-journal.json";

/// Long-lived services shared by every command.
pub struct Assistant {
    pub config: Config,
    pub vault: Arc<dyn Vault>,
    pub indexer: Arc<Indexer>,
    pub dispatcher: Arc<ToolDispatcher>,
    pub web: Arc<WebClient>,
}

impl Assistant {
    /// Build services without touching the index. Call
    /// [`Indexer::load_or_rebuild`] before retrieving.
    pub fn open(config: Config, prompter: Arc<dyn ConsentPrompter>) -> Result<Self> {
        let state_dir = config.state_dir();
        let vault: Arc<dyn Vault> = Arc::new(FsVault::new(&config.vault)?);
        let indexer = Arc::new(Indexer::new(
            vault.clone(),
            config.index.clone(),
            config.vault.exclude_folders.clone(),
            &state_dir,
        ));

        let web = Arc::new(WebClient::new(config.web.clone())?);
        let journal = Arc::new(PatchJournal::open(
            state_dir.join(JOURNAL_FILE),
            config.tools.patch.undo_depth,
        ));
        let mut registry = ToolRegistry::new();
        registry.register(&BuiltinTools::new(&config.tools, web.clone(), journal.clone()))?;

        let consent = ConsentManager::new(&config.tools, prompter, Some(state_dir.join(CONSENT_FILE)));
        let audit = Arc::new(AuditLogger::open(&state_dir, config.audit.clone()));
        let dispatcher = Arc::new(ToolDispatcher::new(
            registry,
            DispatchPolicy::from_config(&config.tools, &config.web),
            consent,
            RateLimiter::new(config.tools.rate_limit.clone()),
            audit,
            journal,
            vault.clone(),
            Some(indexer.clone()),
        ));

        info!(root = %config.vault.root.display(), "assistant ready");
        Ok(Self {
            config,
            vault,
            indexer,
            dispatcher,
            web,
        })
    }

    pub fn state_dir(&self) -> PathBuf {
        self.config.state_dir()
    }

    /// A fresh conversation using the configured model.
    pub fn orchestrator(&self) -> Result<Orchestrator> {
        let model = create_model(&self.config.model)?;
        Ok(self.orchestrator_with(model))
    }

    pub fn orchestrator_with(&self, model: Arc<dyn ChatModel>) -> Orchestrator {
        Orchestrator::new(
            model,
            self.dispatcher.clone(),
            self.indexer.clone(),
            self.vault.clone(),
            OrchestratorSettings::from_config(&self.config),
        )
    }

    /// Push new settings into every running subsystem. Excluded folders
    /// that changed trigger a rebuild.
    pub async fn apply_settings(&mut self, config: Config) -> Result<()> {
        let exclusions_changed = config.vault.exclude_folders != self.config.vault.exclude_folders;
        self.indexer.update_settings(config.index.clone());
        self.web.update_settings(config.web.clone());
        self.dispatcher
            .update_policy(DispatchPolicy::from_config(&config.tools, &config.web));
        self.dispatcher.consent().update_settings(&config.tools);
        self.dispatcher
            .limiter()
            .update_settings(config.tools.rate_limit.clone());
        self.dispatcher.audit().update_settings(config.audit.clone());
        if exclusions_changed {
            self.indexer
                .set_exclusions(config.vault.exclude_folders.clone())
                .await?;
        }
        self.config = config;
        Ok(())
    }

    /// Persist pending index and audit state.
    pub fn shutdown(&self) -> Result<()> {
        self.indexer.flush()?;
        self.dispatcher.audit().flush()
    }
}
