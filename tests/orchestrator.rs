use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use vault_assist::app::Assistant;
use vault_assist::audit::AuditKind;
use vault_assist::config::parse_config;
use vault_assist::consent::{ConsentChoice, ConsentPrompter, ConsentRequest};
use vault_assist::model::{
    ChatMessage, ChatModel, ChatRequest, EventStream, Role, StreamEvent, ToolCall,
};
use vault_assist::orchestrator::{
    TurnObserver, TurnRequest, TurnStatus, CANCELLED_PLACEHOLDER, NO_RESPONSE_PLACEHOLDER,
};
use vault_assist::tools::RawArguments;

// ---------------------------------------------------------------------------
// Doubles
// ---------------------------------------------------------------------------

enum Reply {
    Events(Vec<StreamEvent>),
    PartialThenHang(&'static str),
    Hang,
    Fail(&'static str),
}

fn text_reply(text: &str) -> Reply {
    Reply::Events(vec![
        StreamEvent::Delta(text.to_string()),
        StreamEvent::Done(ChatMessage::assistant("")),
    ])
}

fn empty_reply() -> Reply {
    Reply::Events(vec![StreamEvent::Done(ChatMessage::assistant(""))])
}

fn tool_call(id: &str, name: &str, args: Value) -> ToolCall {
    ToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments: RawArguments::Text(args.to_string()),
    }
}

fn tool_reply(preamble: &str, call: ToolCall) -> Reply {
    let mut events = Vec::new();
    if !preamble.is_empty() {
        events.push(StreamEvent::Delta(preamble.to_string()));
    }
    events.push(StreamEvent::Done(ChatMessage {
        tool_calls: vec![call],
        ..ChatMessage::assistant("")
    }));
    Reply::Events(events)
}

#[derive(Default)]
struct ScriptedModel {
    replies: Mutex<VecDeque<Reply>>,
    completions: Mutex<VecDeque<ChatMessage>>,
    requests: Mutex<Vec<ChatRequest>>,
    complete_calls: AtomicUsize,
}

impl ScriptedModel {
    fn new(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            ..Default::default()
        })
    }

    fn with_completion(self: Arc<Self>, text: &str) -> Arc<Self> {
        self.completions
            .lock()
            .unwrap()
            .push_back(ChatMessage::assistant(text));
        self
    }

    fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream(&self, request: &ChatRequest) -> Result<EventStream> {
        self.requests.lock().unwrap().push(request.clone());
        let reply = self.replies.lock().unwrap().pop_front().unwrap_or_else(empty_reply);
        Ok(match reply {
            Reply::Events(events) => stream::iter(events.into_iter().map(Ok)).boxed(),
            Reply::PartialThenHang(text) => {
                stream::iter(vec![Ok(StreamEvent::Delta(text.to_string()))])
                    .chain(stream::pending::<Result<StreamEvent>>())
                    .boxed()
            }
            Reply::Hang => stream::pending::<Result<StreamEvent>>().boxed(),
            Reply::Fail(msg) => return Err(anyhow!(msg)),
        })
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatMessage> {
        self.requests.lock().unwrap().push(request.clone());
        self.complete_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .completions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| ChatMessage::assistant("")))
    }
}

struct FixedPrompter {
    answer: ConsentChoice,
    prompts: AtomicUsize,
}

impl FixedPrompter {
    fn answering(answer: ConsentChoice) -> Arc<Self> {
        Arc::new(Self {
            answer,
            prompts: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ConsentPrompter for FixedPrompter {
    async fn prompt(&self, request: &ConsentRequest) -> Result<ConsentChoice> {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        assert!(request.choices.contains(&self.answer) || self.answer == ConsentChoice::Deny);
        Ok(self.answer)
    }
}

#[derive(Default)]
struct Recorder {
    deltas: Mutex<String>,
    notices: Mutex<Vec<String>>,
    tool_results: AtomicUsize,
}

impl TurnObserver for Recorder {
    fn on_delta(&self, text: &str) {
        self.deltas.lock().unwrap().push_str(text);
    }

    fn on_tool_result(&self, _call: &ToolCall, _result: &vault_assist::tools::ToolResult) {
        self.tool_results.fetch_add(1, Ordering::SeqCst);
    }

    fn on_notice(&self, notice: &str) {
        self.notices.lock().unwrap().push(notice.to_string());
    }
}

// ---------------------------------------------------------------------------
// Setup
// ---------------------------------------------------------------------------

const GROCERIES: &str = "# Todo\n- buy milk\n- eggs\n";

async fn setup(prompter: Arc<dyn ConsentPrompter>) -> (TempDir, Assistant) {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("Groceries.md"), GROCERIES).unwrap();
    fs::create_dir_all(tmp.path().join("Projects")).unwrap();
    fs::write(
        tmp.path().join("Projects/Plan.md"),
        "# Plan\nShip the release.\n",
    )
    .unwrap();

    let config = parse_config(&format!(
        r#"[vault]
root = {:?}

[model]
max_tool_rounds = 2
idle_timeout_secs = 25

[tools.consent]
find = "always_allow"
grep = "always_allow"
read = "always_allow"
"#,
        tmp.path().display().to_string()
    ))
    .unwrap();

    let assistant = Assistant::open(config, prompter).unwrap();
    assistant.indexer.rebuild().await.unwrap();
    (tmp, assistant)
}

fn ask(message: &str) -> TurnRequest {
    TurnRequest {
        message: message.to_string(),
        mentions: Vec::new(),
        active: None,
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn tool_round_feeds_result_back_to_the_model() {
    let (_tmp, assistant) = setup(FixedPrompter::answering(ConsentChoice::Deny)).await;
    let model = ScriptedModel::new(vec![
        tool_reply("", tool_call("c1", "grep", json!({ "pattern": "milk" }))),
        text_reply("You still need to buy milk."),
    ]);
    let mut orchestrator = assistant.orchestrator_with(model.clone());
    let recorder = Recorder::default();

    let outcome = orchestrator
        .run_turn(ask("what's on my todo list?"), CancellationToken::new(), &recorder)
        .await;

    assert_eq!(outcome.status, TurnStatus::Completed);
    assert_eq!(outcome.text, "You still need to buy milk.");
    assert_eq!(outcome.rounds, 1);
    assert_eq!(outcome.tool_calls.len(), 1);
    assert!(outcome.tool_calls[0].1.success);
    assert_eq!(recorder.tool_results.load(Ordering::SeqCst), 1);
    assert_eq!(*recorder.deltas.lock().unwrap(), "You still need to buy milk.");

    let requests = model.requests();
    assert_eq!(requests.len(), 2);
    let system = &requests[0].messages[0];
    assert_eq!(system.role, Role::System);
    assert!(system.content.contains("buy milk"));
    assert!(requests[0].tools.iter().any(|t| t.name == "grep"));

    let tool_turn = requests[1].messages.last().unwrap();
    assert_eq!(tool_turn.role, Role::Tool);
    assert_eq!(tool_turn.tool_call_id.as_deref(), Some("c1"));
    assert!(tool_turn.content.contains("Groceries.md"));

    // History keeps only the exchange, not the tool plumbing.
    let history = orchestrator.history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].content, "You still need to buy milk.");

    let audit = assistant.dispatcher.audit().recent(10).unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].kind, AuditKind::Executed);
    assert_eq!(audit[0].tool, "grep");
}

#[tokio::test]
async fn tool_rounds_stop_at_the_ceiling() {
    let (_tmp, assistant) = setup(FixedPrompter::answering(ConsentChoice::Deny)).await;
    let replies = (0..5)
        .map(|i| {
            tool_reply(
                "Checking.",
                tool_call(&format!("c{}", i), "find", json!({ "pattern": "*.md" })),
            )
        })
        .collect();
    let model = ScriptedModel::new(replies);
    let mut orchestrator = assistant.orchestrator_with(model.clone());
    let recorder = Recorder::default();

    let outcome = orchestrator
        .run_turn(ask("list my notes"), CancellationToken::new(), &recorder)
        .await;

    assert_eq!(outcome.status, TurnStatus::RoundLimit);
    assert_eq!(outcome.rounds, 2);
    assert_eq!(outcome.tool_calls.len(), 2);
    assert_eq!(model.requests().len(), 3);
    assert_eq!(outcome.text, "Checking.\n\nChecking.\n\nChecking.");
    assert!(!recorder.notices.lock().unwrap().is_empty());
}

#[tokio::test]
async fn text_from_successive_rounds_is_separated() {
    let (_tmp, assistant) = setup(FixedPrompter::answering(ConsentChoice::Deny)).await;
    let model = ScriptedModel::new(vec![
        tool_reply("Let me check your notes.", tool_call("c1", "grep", json!({ "pattern": "milk" }))),
        text_reply("You still need to buy milk."),
    ]);
    let mut orchestrator = assistant.orchestrator_with(model);
    let recorder = Recorder::default();

    let outcome = orchestrator
        .run_turn(ask("what's on my todo list?"), CancellationToken::new(), &recorder)
        .await;

    let expected = "Let me check your notes.\n\nYou still need to buy milk.";
    assert_eq!(outcome.status, TurnStatus::Completed);
    assert_eq!(outcome.text, expected);
    assert_eq!(*recorder.deltas.lock().unwrap(), expected);
    assert_eq!(orchestrator.history()[1].content, expected);
}

#[tokio::test]
async fn empty_answer_after_tools_retries_without_tools() {
    let (_tmp, assistant) = setup(FixedPrompter::answering(ConsentChoice::Deny)).await;
    let model = ScriptedModel::new(vec![
        tool_reply("", tool_call("c1", "grep", json!({ "pattern": "milk" }))),
        empty_reply(),
        text_reply("Milk and eggs."),
    ]);
    let mut orchestrator = assistant.orchestrator_with(model.clone());

    let outcome = orchestrator
        .run_turn(ask("todo?"), CancellationToken::new(), &Recorder::default())
        .await;

    assert_eq!(outcome.status, TurnStatus::RetriedWithoutTools);
    assert_eq!(outcome.text, "Milk and eggs.");
    let requests = model.requests();
    assert_eq!(requests.len(), 3);
    assert!(requests[2].tools.is_empty());
    assert_eq!(requests[2].messages.last().unwrap().role, Role::User);
    assert_eq!(model.complete_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cascade_falls_through_to_the_single_shot_request() {
    let (_tmp, assistant) = setup(FixedPrompter::answering(ConsentChoice::Deny)).await;
    let model = ScriptedModel::new(vec![
        tool_reply("", tool_call("c1", "grep", json!({ "pattern": "milk" }))),
        empty_reply(),
        empty_reply(),
    ])
    .with_completion("Buy milk.");
    let mut orchestrator = assistant.orchestrator_with(model.clone());

    let outcome = orchestrator
        .run_turn(ask("todo?"), CancellationToken::new(), &Recorder::default())
        .await;

    assert_eq!(outcome.status, TurnStatus::NonStreamingFallback);
    assert_eq!(outcome.text, "Buy milk.");
    assert_eq!(model.complete_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn silent_model_yields_the_no_response_placeholder() {
    let (_tmp, assistant) = setup(FixedPrompter::answering(ConsentChoice::Deny)).await;
    let model = ScriptedModel::new(vec![empty_reply()]);
    let mut orchestrator = assistant.orchestrator_with(model.clone());

    let outcome = orchestrator
        .run_turn(ask("hello"), CancellationToken::new(), &Recorder::default())
        .await;

    assert_eq!(outcome.status, TurnStatus::NoResponse);
    assert_eq!(outcome.text, NO_RESPONSE_PLACEHOLDER);
    // No tool round happened, so there is no retry-without-tools stream.
    assert_eq!(model.requests().len(), 2);
    assert_eq!(model.complete_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn model_errors_become_a_visible_placeholder() {
    let (_tmp, assistant) = setup(FixedPrompter::answering(ConsentChoice::Deny)).await;
    let model = ScriptedModel::new(vec![Reply::Fail("connection refused")]);
    let mut orchestrator = assistant.orchestrator_with(model);
    let recorder = Recorder::default();

    let outcome = orchestrator
        .run_turn(ask("hello"), CancellationToken::new(), &recorder)
        .await;

    assert_eq!(outcome.status, TurnStatus::Failed);
    assert!(outcome.text.contains("connection refused"));
    assert!(orchestrator.history().is_empty());
    assert_eq!(recorder.notices.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn stalled_stream_trips_the_idle_watchdog() {
    let (_tmp, assistant) = setup(FixedPrompter::answering(ConsentChoice::Deny)).await;
    let model = ScriptedModel::new(vec![Reply::Hang]);
    let mut orchestrator = assistant.orchestrator_with(model);

    let started = tokio::time::Instant::now();
    let outcome = orchestrator
        .run_turn(ask("hello"), CancellationToken::new(), &Recorder::default())
        .await;

    assert_eq!(outcome.status, TurnStatus::TimedOut);
    assert!(started.elapsed() >= Duration::from_secs(25));
    assert!(outcome.text.starts_with('['));
    assert!(orchestrator.history().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancellation_replaces_an_empty_answer_with_a_placeholder() {
    let (_tmp, assistant) = setup(FixedPrompter::answering(ConsentChoice::Deny)).await;
    let model = ScriptedModel::new(vec![Reply::Hang]);
    let mut orchestrator = assistant.orchestrator_with(model);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });
    let outcome = orchestrator
        .run_turn(ask("hello"), cancel, &Recorder::default())
        .await;

    assert_eq!(outcome.status, TurnStatus::Cancelled);
    assert_eq!(outcome.text, CANCELLED_PLACEHOLDER);
    assert!(orchestrator.history().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancellation_keeps_partial_text() {
    let (_tmp, assistant) = setup(FixedPrompter::answering(ConsentChoice::Deny)).await;
    let model = ScriptedModel::new(vec![Reply::PartialThenHang("You need to")]);
    let mut orchestrator = assistant.orchestrator_with(model);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });
    let outcome = orchestrator
        .run_turn(ask("todo?"), cancel, &Recorder::default())
        .await;

    assert_eq!(outcome.status, TurnStatus::Cancelled);
    assert_eq!(outcome.text, "You need to");
}

#[tokio::test]
async fn denied_patch_is_reported_and_the_turn_continues() {
    let prompter = FixedPrompter::answering(ConsentChoice::Deny);
    let (tmp, assistant) = setup(prompter.clone()).await;
    let model = ScriptedModel::new(vec![
        tool_reply(
            "",
            tool_call(
                "c1",
                "apply_patch",
                json!({
                    "path": "Groceries.md",
                    "edits": [{ "start_line": 2, "end_line": 2, "replacement": "- buy oat milk" }]
                }),
            ),
        ),
        text_reply("Understood, I left the note alone."),
    ]);
    let mut orchestrator = assistant.orchestrator_with(model);
    let recorder = Recorder::default();

    let outcome = orchestrator
        .run_turn(ask("switch to oat milk"), CancellationToken::new(), &recorder)
        .await;

    assert_eq!(outcome.status, TurnStatus::Completed);
    assert_eq!(prompter.prompts.load(Ordering::SeqCst), 1);
    let (_, result) = &outcome.tool_calls[0];
    assert!(!result.success);
    assert!(result.error.as_deref().unwrap_or("").contains("denied"));
    assert_eq!(fs::read_to_string(tmp.path().join("Groceries.md")).unwrap(), GROCERIES);
    assert_eq!(recorder.notices.lock().unwrap().len(), 1);

    let audit = assistant.dispatcher.audit().recent(10).unwrap();
    assert_eq!(audit[0].kind, AuditKind::Denied);
}

#[tokio::test]
async fn applied_patch_updates_the_index_and_can_be_undone() {
    let prompter = FixedPrompter::answering(ConsentChoice::AllowOnce);
    let (tmp, assistant) = setup(prompter.clone()).await;
    let model = ScriptedModel::new(vec![
        tool_reply(
            "",
            tool_call(
                "c1",
                "apply_patch",
                json!({
                    "path": "Groceries.md",
                    "edits": [{ "start_line": 2, "end_line": 2, "replacement": "- buy oat milk" }]
                }),
            ),
        ),
        text_reply("Done."),
    ]);
    let mut orchestrator = assistant.orchestrator_with(model);

    let outcome = orchestrator
        .run_turn(ask("switch to oat milk"), CancellationToken::new(), &Recorder::default())
        .await;

    let (_, result) = &outcome.tool_calls[0];
    assert!(result.success, "{:?}", result.error);
    let after = fs::read_to_string(tmp.path().join("Groceries.md")).unwrap();
    assert_eq!(after, "# Todo\n- buy oat milk\n- eggs\n");
    assert!(assistant
        .indexer
        .store()
        .chunks_for("Groceries.md")
        .iter()
        .any(|c| c.content.contains("oat milk")));

    let execution_id = result.execution_id.clone().unwrap();
    let undo = assistant.dispatcher.undo(&execution_id).await;
    assert!(undo.success, "{:?}", undo.error);
    assert_eq!(fs::read_to_string(tmp.path().join("Groceries.md")).unwrap(), GROCERIES);
    assert!(!assistant
        .indexer
        .store()
        .chunks_for("Groceries.md")
        .iter()
        .any(|c| c.content.contains("oat milk")));

    // The same patch cannot be undone twice.
    assert!(!assistant.dispatcher.undo(&execution_id).await.success);
}
