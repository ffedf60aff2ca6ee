//! Conversation loop for one user message.
//!
//! ```text
//! mentions + active doc + query ─▶ RagContext ─▶ prompt
//!        │
//!        ▼
//!   stream model ──(tool calls?)──▶ dispatch sequentially ─▶ tool turns ─┐
//!        ▲                                                               │
//!        └──────────────── next round (≤ max_tool_rounds) ◀──────────────┘
//!        │
//!        ▼ no visible text?
//!   retry without tools ─▶ single-shot request ─▶ placeholder
//! ```
//!
//! One [`CancellationToken`] covers every suspension point of a turn: the
//! model stream, consent prompts, and tool execution. Completed tool
//! effects are not rolled back on cancel.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vault_assist_core::models::{Chunk, RagContext};
use vault_assist_core::retrieve::{build_context, resolve_mentions, ActiveDocument, ContextRequest};

use crate::config::Config;
use crate::dispatch::ToolDispatcher;
use crate::indexer::Indexer;
use crate::model::{ChatMessage, ChatModel, ChatRequest, StreamEvent, ToolCall};
use crate::tools::ToolResult;
use crate::vault::Vault;

pub const CANCELLED_PLACEHOLDER: &str = "[Response cancelled]";
pub const NO_RESPONSE_PLACEHOLDER: &str = "[No response from the model]";

const DEFAULT_SYSTEM_PROMPT: &str = "You are an assistant working inside the user's notes vault. \
Use the provided note excerpts and tools to answer. Cite note paths when you rely on them.";

const ANSWER_FROM_CONTEXT: &str = "Answer my previous message now using only the information already \
gathered in this conversation. Do not call any tools.";

/// Break placed between the text of successive model rounds in one turn.
fn round_separator(visible: &str) -> &'static str {
    if visible.trim().is_empty() || visible.ends_with("\n\n") {
        ""
    } else if visible.ends_with('\n') {
        "\n"
    } else {
        "\n\n"
    }
}

/// Transport and cancellation outcomes of one model call.
#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error("cancelled")]
    Cancelled,
    #[error("no response from the model for {0:?}")]
    IdleTimeout(Duration),
    #[error("model error: {0:#}")]
    Model(anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    Completed,
    /// The tool-round ceiling was reached.
    RoundLimit,
    /// Text came from the retry without tools.
    RetriedWithoutTools,
    /// Text came from the single-shot request.
    NonStreamingFallback,
    NoResponse,
    Cancelled,
    TimedOut,
    Failed,
}

/// The currently open document, with unsaved text.
#[derive(Debug, Clone)]
pub struct ActiveInput {
    pub path: String,
    pub text: String,
    pub cursor: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    pub message: String,
    pub mentions: Vec<String>,
    pub active: Option<ActiveInput>,
}

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// Final assistant text, or a placeholder.
    pub text: String,
    pub status: TurnStatus,
    pub context: RagContext,
    pub missing_mentions: Vec<String>,
    pub tool_calls: Vec<(ToolCall, ToolResult)>,
    pub rounds: usize,
}

/// UI hooks. All methods default to no-ops.
pub trait TurnObserver: Send + Sync {
    fn on_context(&self, _context: &RagContext, _missing: &[String]) {}
    fn on_delta(&self, _text: &str) {}
    fn on_tool_call(&self, _call: &ToolCall) {}
    fn on_tool_result(&self, _call: &ToolCall, _result: &ToolResult) {}
    fn on_notice(&self, _notice: &str) {}
}

pub struct NoopObserver;

impl TurnObserver for NoopObserver {}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_tool_rounds: usize,
    pub idle_timeout: Duration,
    pub max_context: usize,
    pub chunk_size: usize,
    pub system_prompt: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_tool_rounds: config.model.max_tool_rounds,
            idle_timeout: Duration::from_secs(config.model.idle_timeout_secs),
            max_context: config.retrieval.max_context,
            chunk_size: config.index.chunk_size,
            system_prompt: config
                .model
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            temperature: config.model.temperature,
            max_tokens: config.model.max_tokens,
        }
    }
}

/// Resolve `@` mentions through the vault and build the retrieval bundle.
/// Mentions that match nothing, or whose document cannot be read, are
/// returned as missing.
pub async fn gather_context(
    vault: &dyn Vault,
    indexer: &Indexer,
    request: &TurnRequest,
    max_context: usize,
    chunk_size: usize,
) -> (RagContext, Vec<String>) {
    let mut missing = Vec::new();
    let mut mention_chunks: Vec<Chunk> = Vec::new();

    if !request.mentions.is_empty() {
        let documents: Vec<String> = match vault.list_documents() {
            Ok(docs) => docs.into_iter().map(|d| d.path).collect(),
            Err(e) => {
                warn!(error = %e, "could not list documents for mentions");
                Vec::new()
            }
        };
        let resolution = resolve_mentions(&request.mentions, &documents);
        missing = resolution.missing;
        for (mention, path) in resolution.resolved {
            match indexer.ensure(&path).await {
                Ok(chunks) => match chunks.into_iter().next() {
                    Some(first) => mention_chunks.push(first),
                    None => debug!(path = %path, "mentioned document has no content"),
                },
                Err(e) => {
                    warn!(path = %path, error = %e, "could not load mentioned document");
                    missing.push(mention);
                }
            }
        }
    }

    let active = request.active.as_ref().map(|a| ActiveDocument {
        path: &a.path,
        text: &a.text,
        cursor: a.cursor,
        updated: chrono::Utc::now().timestamp_millis(),
    });
    let context = {
        let store = indexer.store();
        build_context(
            &store,
            &ContextRequest {
                query: &request.message,
                active,
                mentions: mention_chunks,
                max_context,
                chunk_size,
            },
        )
    };
    (context, missing)
}

pub struct Orchestrator {
    model: Arc<dyn ChatModel>,
    dispatcher: Arc<ToolDispatcher>,
    indexer: Arc<Indexer>,
    vault: Arc<dyn Vault>,
    settings: OrchestratorSettings,
    history: Vec<ChatMessage>,
}

impl Orchestrator {
    pub fn new(
        model: Arc<dyn ChatModel>,
        dispatcher: Arc<ToolDispatcher>,
        indexer: Arc<Indexer>,
        vault: Arc<dyn Vault>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            model,
            dispatcher,
            indexer,
            vault,
            settings,
            history: Vec::new(),
        }
    }

    pub fn update_settings(&mut self, settings: OrchestratorSettings) {
        self.settings = settings;
    }

    /// Finalized user/assistant exchanges so far.
    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    /// Resolve mentions and build the retrieval bundle for a request.
    pub async fn gather_context(&self, request: &TurnRequest) -> (RagContext, Vec<String>) {
        gather_context(
            self.vault.as_ref(),
            &self.indexer,
            request,
            self.settings.max_context,
            self.settings.chunk_size,
        )
        .await
    }

    fn chat_request(&self, messages: &[ChatMessage], with_tools: bool) -> ChatRequest {
        ChatRequest {
            messages: messages.to_vec(),
            tools: if with_tools {
                self.dispatcher.schemas()
            } else {
                Vec::new()
            },
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
        }
    }

    /// Stream one model response, forwarding deltas to the observer and
    /// appending them to `visible` so partial text survives an abort.
    async fn stream_once(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
        observer: &dyn TurnObserver,
        visible: &mut String,
    ) -> Result<ChatMessage, TurnError> {
        let idle = self.settings.idle_timeout;
        let opened = tokio::select! {
            _ = cancel.cancelled() => return Err(TurnError::Cancelled),
            opened = tokio::time::timeout(idle, self.model.stream(request)) => opened,
        };
        let mut stream = match opened {
            Err(_) => return Err(TurnError::IdleTimeout(idle)),
            Ok(result) => result.map_err(TurnError::Model)?,
        };

        let mut text = String::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TurnError::Cancelled),
                next = tokio::time::timeout(idle, stream.next()) => next,
            };
            match next {
                Err(_) => return Err(TurnError::IdleTimeout(idle)),
                Ok(None) => return Ok(ChatMessage::assistant(text)),
                Ok(Some(Err(e))) => return Err(TurnError::Model(e)),
                Ok(Some(Ok(StreamEvent::Delta(delta)))) => {
                    if text.is_empty() && !delta.is_empty() {
                        let separator = round_separator(visible);
                        if !separator.is_empty() {
                            observer.on_delta(separator);
                            visible.push_str(separator);
                        }
                    }
                    observer.on_delta(&delta);
                    visible.push_str(&delta);
                    text.push_str(&delta);
                }
                Ok(Some(Ok(StreamEvent::Done(mut message)))) => {
                    if message.content.is_empty() {
                        message.content = text;
                    } else if text.is_empty() {
                        let separator = round_separator(visible);
                        visible.push_str(separator);
                        visible.push_str(&message.content);
                    }
                    return Ok(message);
                }
            }
        }
    }

    /// Drive one user message to completion. Never fails: every outcome,
    /// including cancellation and transport errors, is a [`TurnOutcome`].
    pub async fn run_turn(
        &mut self,
        request: TurnRequest,
        cancel: CancellationToken,
        observer: &dyn TurnObserver,
    ) -> TurnOutcome {
        let (context, missing_mentions) = self.gather_context(&request).await;
        observer.on_context(&context, &missing_mentions);
        if !missing_mentions.is_empty() {
            observer.on_notice(&format!("Not found: {}", missing_mentions.join(", ")));
        }

        let mut system = self.settings.system_prompt.clone();
        if context.has_context() {
            system.push_str("\n\n");
            system.push_str(&context.prompt);
        }
        let mut messages = vec![ChatMessage::system(system)];
        messages.extend(self.history.iter().cloned());
        messages.push(ChatMessage::user(request.message.clone()));

        let mut outcome = TurnOutcome {
            text: String::new(),
            status: TurnStatus::Completed,
            context,
            missing_mentions,
            tool_calls: Vec::new(),
            rounds: 0,
        };
        let mut visible = String::new();

        loop {
            let chat = self.chat_request(&messages, true);
            let mut reply = match self.stream_once(&chat, &cancel, observer, &mut visible).await {
                Ok(reply) => reply,
                Err(e) => return self.abort_turn(outcome, visible, e, observer),
            };

            if reply.tool_calls.is_empty() {
                messages.push(reply);
                break;
            }
            if outcome.rounds >= self.settings.max_tool_rounds {
                info!(rounds = outcome.rounds, "tool round ceiling reached");
                observer.on_notice("Stopped after the maximum number of tool rounds.");
                outcome.status = TurnStatus::RoundLimit;
                reply.tool_calls.clear();
                messages.push(reply);
                break;
            }

            outcome.rounds += 1;
            let calls = reply.tool_calls.clone();
            messages.push(reply);
            for call in calls {
                if cancel.is_cancelled() {
                    return self.abort_turn(outcome, visible, TurnError::Cancelled, observer);
                }
                observer.on_tool_call(&call);
                let result = self.dispatcher.dispatch(&call, &cancel).await;
                observer.on_tool_result(&call, &result);
                if !result.success {
                    if let Some(error) = &result.error {
                        observer.on_notice(&format!("{}: {}", call.name, error));
                    }
                }
                messages.push(ChatMessage::tool(&call, result.to_message_content()));
                outcome.tool_calls.push((call, result));
            }
            if cancel.is_cancelled() {
                return self.abort_turn(outcome, visible, TurnError::Cancelled, observer);
            }
        }

        if visible.trim().is_empty() {
            match self.recover_empty(&mut messages, outcome.rounds > 0, &cancel, observer).await {
                Ok(Some((text, status))) => {
                    visible = text;
                    outcome.status = status;
                }
                Ok(None) => {
                    visible = NO_RESPONSE_PLACEHOLDER.to_string();
                    outcome.status = TurnStatus::NoResponse;
                }
                Err(e) => return self.abort_turn(outcome, String::new(), e, observer),
            }
        }

        self.history.push(ChatMessage::user(request.message));
        self.history.push(ChatMessage::assistant(visible.clone()));
        outcome.text = visible;
        outcome
    }

    /// Retry cascade for a turn that produced no visible text.
    async fn recover_empty(
        &self,
        messages: &mut Vec<ChatMessage>,
        used_tools: bool,
        cancel: &CancellationToken,
        observer: &dyn TurnObserver,
    ) -> Result<Option<(String, TurnStatus)>, TurnError> {
        if used_tools {
            debug!("empty answer after tool use; retrying without tools");
            messages.push(ChatMessage::user(ANSWER_FROM_CONTEXT));
            let chat = self.chat_request(messages, false);
            let reply = self.stream_once(&chat, cancel, observer, &mut String::new()).await?;
            if !reply.content.trim().is_empty() {
                return Ok(Some((reply.content, TurnStatus::RetriedWithoutTools)));
            }
        }

        debug!("empty answer; trying a single-shot request");
        let chat = self.chat_request(messages, false);
        let reply = tokio::select! {
            _ = cancel.cancelled() => return Err(TurnError::Cancelled),
            reply = self.model.complete(&chat) => reply.map_err(TurnError::Model)?,
        };
        if reply.content.trim().is_empty() {
            return Ok(None);
        }
        observer.on_delta(&reply.content);
        Ok(Some((reply.content, TurnStatus::NonStreamingFallback)))
    }

    /// Close a turn that ended in cancellation, timeout, or model error.
    /// History is left untouched.
    fn abort_turn(
        &self,
        mut outcome: TurnOutcome,
        partial: String,
        error: TurnError,
        observer: &dyn TurnObserver,
    ) -> TurnOutcome {
        let has_text = !partial.trim().is_empty();
        match &error {
            TurnError::Cancelled => {
                outcome.status = TurnStatus::Cancelled;
                outcome.text = if has_text {
                    partial
                } else {
                    CANCELLED_PLACEHOLDER.to_string()
                };
            }
            TurnError::IdleTimeout(_) => {
                warn!(error = %error, "model stream stalled");
                observer.on_notice(&error.to_string());
                outcome.status = TurnStatus::TimedOut;
                outcome.text = if has_text {
                    partial
                } else {
                    format!("[{}]", error)
                };
            }
            TurnError::Model(_) => {
                warn!(error = %error, "model request failed");
                observer.on_notice(&error.to_string());
                outcome.status = TurnStatus::Failed;
                outcome.text = if has_text {
                    partial
                } else {
                    format!("[{}]", error)
                };
            }
        }
        outcome
    }
}
