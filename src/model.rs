//! Language-model transport.
//!
//! The orchestrator talks to a [`ChatModel`]: an opaque chat channel that
//! either streams ([`ChatModel::stream`]) or answers in one shot
//! ([`ChatModel::complete`]). Two HTTP implementations are provided:
//!
//! - **[`OpenAiModel`]**: `POST {base}/chat/completions` with
//!   server-sent events. Tool-call arguments arrive as JSON strings split
//!   across deltas.
//! - **[`OllamaModel`]**: `POST {base}/api/chat` with newline-delimited
//!   JSON. Tool-call arguments arrive as objects.
//!
//! Single-shot requests retry 429/5xx and network errors with exponential
//! backoff (1s, 2s, 4s, ...). Streams are never retried.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ModelConfig;
use crate::tools::RawArguments;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: RawArguments,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    /// For `tool` messages: the call being answered.
    pub tool_call_id: Option<String>,
    /// For `tool` messages: the tool that produced the content.
    pub name: Option<String>,
}

impl ChatMessage {
    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    pub fn tool(call: &ToolCall, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(call.id.clone()),
            name: Some(call.name.clone()),
            ..Self::plain(Role::Tool, content)
        }
    }
}

/// Function definition offered to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSchema>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Incremental assistant text.
    Delta(String),
    /// Final structured message, possibly with tool calls.
    Done(ChatMessage),
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;

#[async_trait]
pub trait ChatModel: Send + Sync {
    fn name(&self) -> &str;

    /// Open a streaming response. Dropping the stream aborts the request.
    async fn stream(&self, request: &ChatRequest) -> Result<EventStream>;

    async fn complete(&self, request: &ChatRequest) -> Result<ChatMessage>;
}

/// Build the model named in config.
pub fn create_model(config: &ModelConfig) -> Result<Arc<dyn ChatModel>> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiModel::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaModel::new(config)?)),
        other => bail!("Unknown model provider: {}", other),
    }
}

fn tools_json(tools: &[ToolSchema]) -> Value {
    Value::Array(
        tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect(),
    )
}

// ═══════════════════════════════════════════════════════════════════════
// Stream decoding
// ═══════════════════════════════════════════════════════════════════════

/// Incremental decoder for one line-oriented streaming protocol.
pub trait StreamDecoder: Send + 'static {
    /// Handle one complete line, appending any text deltas to `out`.
    fn feed_line(&mut self, line: &str, out: &mut Vec<String>) -> Result<()>;

    fn is_done(&self) -> bool;

    fn finish(self) -> ChatMessage;
}

/// Split a byte stream into lines without breaking UTF-8 sequences.
#[derive(Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line).trim_end().to_string());
        }
        lines
    }

    pub fn take_rest(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).trim_end().to_string())
    }
}

struct DecodeState<S, D> {
    bytes: S,
    lines: LineBuffer,
    /// `None` once the terminal event (or an error) has been queued.
    decoder: Option<D>,
    pending: VecDeque<Result<StreamEvent>>,
}

impl<S, D: StreamDecoder> DecodeState<S, D> {
    /// Feed one line. Returns false once the stream has ended.
    fn feed(&mut self, line: &str) -> bool {
        let Some(decoder) = self.decoder.as_mut() else {
            return false;
        };
        let mut out = Vec::new();
        if let Err(e) = decoder.feed_line(line, &mut out) {
            self.pending.push_back(Err(e));
            self.decoder = None;
            return false;
        }
        self.pending
            .extend(out.into_iter().map(|delta| Ok(StreamEvent::Delta(delta))));
        if decoder.is_done() {
            self.finish();
            return false;
        }
        true
    }

    fn finish(&mut self) {
        if let Some(decoder) = self.decoder.take() {
            self.pending.push_back(Ok(StreamEvent::Done(decoder.finish())));
        }
    }
}

/// Decode a response body into events.
///
/// The body is only polled when the consumer polls, so dropping the
/// returned stream drops the body and closes the connection.
fn decode_stream<S, B, E, D>(bytes: S, decoder: D) -> EventStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
    D: StreamDecoder,
{
    let state = DecodeState {
        bytes,
        lines: LineBuffer::default(),
        decoder: Some(decoder),
        pending: VecDeque::new(),
    };
    Box::pin(futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((event, state));
            }
            state.decoder.as_ref()?;
            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    for line in state.lines.push(chunk.as_ref()) {
                        if !state.feed(&line) {
                            break;
                        }
                    }
                }
                Some(Err(e)) => {
                    state
                        .pending
                        .push_back(Err(anyhow!("model stream failed: {}", e)));
                    state.decoder = None;
                }
                None => {
                    if let Some(rest) = state.lines.take_rest() {
                        state.feed(&rest);
                    }
                    state.finish();
                }
            }
        }
    }))
}

async fn error_body(response: reqwest::Response) -> String {
    response.text().await.unwrap_or_default()
}

/// POST with retry/backoff.
///
/// - HTTP 429 or 5xx → retry with exponential backoff
/// - other 4xx → fail immediately
/// - network error → retry
async fn post_with_retry(
    client: &reqwest::Client,
    url: &str,
    api_key: Option<&str>,
    body: &Value,
    timeout: Duration,
    max_retries: u32,
) -> Result<Value> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        let mut req = client.post(url).json(body).timeout(timeout);
        if let Some(key) = api_key {
            req = req.bearer_auth(key);
        }

        match req.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(response.json().await?);
                }
                if status.as_u16() == 429 || status.is_server_error() {
                    last_err = Some(anyhow!("model API error {}: {}", status, error_body(response).await));
                    continue;
                }
                bail!("model API error {}: {}", status, error_body(response).await);
            }
            Err(e) => {
                last_err = Some(e.into());
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("model request failed after retries")))
}

// ═══════════════════════════════════════════════════════════════════════
// OpenAI-compatible
// ═══════════════════════════════════════════════════════════════════════

pub struct OpenAiModel {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    timeout: Duration,
    max_retries: u32,
}

impl OpenAiModel {
    /// Requires the API key variable unless a custom `base_url` is set.
    pub fn new(config: &ModelConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env).ok();
        if api_key.is_none() && config.base_url.is_none() {
            bail!("{} environment variable not set", config.api_key_env);
        }
        Ok(Self {
            client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(config.timeout_secs))
                .build()?,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string())
                .trim_end_matches('/')
                .to_string(),
            model: config.model.clone(),
            api_key,
            timeout: Duration::from_secs(config.timeout_secs),
            max_retries: config.max_retries,
        })
    }

    fn body(&self, request: &ChatRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": request.messages.iter().map(openai_message).collect::<Vec<_>>(),
            "stream": stream,
        });
        if !request.tools.is_empty() {
            body["tools"] = tools_json(&request.tools);
        }
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(n) = request.max_tokens {
            body["max_tokens"] = json!(n);
        }
        body
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

fn openai_message(m: &ChatMessage) -> Value {
    let mut v = json!({ "role": m.role, "content": m.content });
    if !m.tool_calls.is_empty() {
        v["tool_calls"] = Value::Array(
            m.tool_calls
                .iter()
                .map(|c| {
                    json!({
                        "id": c.id,
                        "type": "function",
                        "function": { "name": c.name, "arguments": c.arguments.to_json_string() },
                    })
                })
                .collect(),
        );
    }
    if let Some(id) = &m.tool_call_id {
        v["tool_call_id"] = json!(id);
    }
    v
}

/// Parse a non-streaming `choices[0].message`.
pub fn parse_openai_message(json: &Value) -> Result<ChatMessage> {
    let message = json
        .pointer("/choices/0/message")
        .ok_or_else(|| anyhow!("Invalid model response: missing choices[0].message"))?;
    let mut out = ChatMessage::assistant(
        message
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or(""),
    );
    if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
        for (i, call) in calls.iter().enumerate() {
            let function = &call["function"];
            out.tool_calls.push(ToolCall {
                id: call
                    .get("id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("call_{}", i)),
                name: function["name"].as_str().unwrap_or("").to_string(),
                arguments: raw_arguments(&function["arguments"]),
            });
        }
    }
    Ok(out)
}

fn raw_arguments(value: &Value) -> RawArguments {
    match value {
        Value::Object(map) => RawArguments::Object(map.clone()),
        Value::String(s) => RawArguments::Text(s.clone()),
        Value::Null => RawArguments::default(),
        other => RawArguments::Text(other.to_string()),
    }
}

#[derive(Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Server-sent-events decoder for chat completion chunks.
#[derive(Default)]
pub struct OpenAiDecoder {
    content: String,
    calls: Vec<PartialCall>,
    done: bool,
}

impl StreamDecoder for OpenAiDecoder {
    fn feed_line(&mut self, line: &str, out: &mut Vec<String>) -> Result<()> {
        let Some(data) = line.strip_prefix("data:") else {
            return Ok(());
        };
        let data = data.trim();
        if data == "[DONE]" {
            self.done = true;
            return Ok(());
        }
        let chunk: Value = serde_json::from_str(data)
            .map_err(|e| anyhow!("invalid stream chunk: {}", e))?;
        if let Some(err) = chunk.get("error") {
            bail!("model error: {}", err);
        }

        let delta = &chunk["choices"][0]["delta"];
        if let Some(text) = delta.get("content").and_then(Value::as_str) {
            if !text.is_empty() {
                self.content.push_str(text);
                out.push(text.to_string());
            }
        }
        if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
            for (pos, call) in calls.iter().enumerate() {
                let index = call
                    .get("index")
                    .and_then(Value::as_u64)
                    .map(|i| i as usize)
                    .unwrap_or(pos);
                while self.calls.len() <= index {
                    self.calls.push(PartialCall::default());
                }
                let slot = &mut self.calls[index];
                if let Some(id) = call.get("id").and_then(Value::as_str) {
                    slot.id = id.to_string();
                }
                if let Some(name) = call.pointer("/function/name").and_then(Value::as_str) {
                    slot.name.push_str(name);
                }
                if let Some(args) = call.pointer("/function/arguments").and_then(Value::as_str) {
                    slot.arguments.push_str(args);
                }
            }
        }
        Ok(())
    }

    fn is_done(&self) -> bool {
        self.done
    }

    fn finish(self) -> ChatMessage {
        let mut message = ChatMessage::assistant(self.content);
        message.tool_calls = self
            .calls
            .into_iter()
            .enumerate()
            .filter(|(_, c)| !c.name.is_empty())
            .map(|(i, c)| ToolCall {
                id: if c.id.is_empty() { format!("call_{}", i) } else { c.id },
                name: c.name,
                arguments: RawArguments::Text(c.arguments),
            })
            .collect();
        message
    }
}

#[async_trait]
impl ChatModel for OpenAiModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn stream(&self, request: &ChatRequest) -> Result<EventStream> {
        let mut req = self.client.post(self.url()).json(&self.body(request, true));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let response = req.send().await?;
        let status = response.status();
        if !status.is_success() {
            bail!("model API error {}: {}", status, error_body(response).await);
        }
        Ok(decode_stream(
            Box::pin(response.bytes_stream()),
            OpenAiDecoder::default(),
        ))
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatMessage> {
        let json = post_with_retry(
            &self.client,
            &self.url(),
            self.api_key.as_deref(),
            &self.body(request, false),
            self.timeout,
            self.max_retries,
        )
        .await?;
        parse_openai_message(&json)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Ollama
// ═══════════════════════════════════════════════════════════════════════

pub struct OllamaModel {
    client: reqwest::Client,
    base_url: String,
    model: String,
    timeout: Duration,
    max_retries: u32,
}

impl OllamaModel {
    pub fn new(config: &ModelConfig) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(config.timeout_secs))
                .build()?,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string())
                .trim_end_matches('/')
                .to_string(),
            model: config.model.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            max_retries: config.max_retries,
        })
    }

    fn body(&self, request: &ChatRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": request.messages.iter().map(ollama_message).collect::<Vec<_>>(),
            "stream": stream,
        });
        if !request.tools.is_empty() {
            body["tools"] = tools_json(&request.tools);
        }
        let mut options = serde_json::Map::new();
        if let Some(t) = request.temperature {
            options.insert("temperature".into(), json!(t));
        }
        if let Some(n) = request.max_tokens {
            options.insert("num_predict".into(), json!(n));
        }
        if !options.is_empty() {
            body["options"] = Value::Object(options);
        }
        body
    }

    fn url(&self) -> String {
        format!("{}/api/chat", self.base_url)
    }
}

fn ollama_message(m: &ChatMessage) -> Value {
    let mut v = json!({ "role": m.role, "content": m.content });
    if !m.tool_calls.is_empty() {
        v["tool_calls"] = Value::Array(
            m.tool_calls
                .iter()
                .map(|c| {
                    let args = c
                        .arguments
                        .normalize()
                        .map(|a| a.to_value())
                        .unwrap_or_else(|_| json!({}));
                    json!({ "function": { "name": c.name, "arguments": args } })
                })
                .collect(),
        );
    }
    if m.role == Role::Tool {
        if let Some(name) = &m.name {
            v["tool_name"] = json!(name);
        }
    }
    v
}

fn ollama_tool_calls(message: &Value, offset: usize) -> Vec<ToolCall> {
    message
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|calls| {
            calls
                .iter()
                .enumerate()
                .filter_map(|(i, call)| {
                    let name = call.pointer("/function/name")?.as_str()?.to_string();
                    Some(ToolCall {
                        id: format!("call_{}", offset + i),
                        name,
                        arguments: raw_arguments(&call["function"]["arguments"]),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Newline-delimited JSON decoder for `/api/chat`.
#[derive(Default)]
pub struct OllamaDecoder {
    content: String,
    calls: Vec<ToolCall>,
    done: bool,
}

impl StreamDecoder for OllamaDecoder {
    fn feed_line(&mut self, line: &str, out: &mut Vec<String>) -> Result<()> {
        if line.trim().is_empty() {
            return Ok(());
        }
        let chunk: Value =
            serde_json::from_str(line).map_err(|e| anyhow!("invalid stream chunk: {}", e))?;
        if let Some(err) = chunk.get("error") {
            bail!("model error: {}", err);
        }
        if let Some(message) = chunk.get("message") {
            if let Some(text) = message.get("content").and_then(Value::as_str) {
                if !text.is_empty() {
                    self.content.push_str(text);
                    out.push(text.to_string());
                }
            }
            let calls = ollama_tool_calls(message, self.calls.len());
            self.calls.extend(calls);
        }
        if chunk.get("done").and_then(Value::as_bool).unwrap_or(false) {
            self.done = true;
        }
        Ok(())
    }

    fn is_done(&self) -> bool {
        self.done
    }

    fn finish(self) -> ChatMessage {
        let mut message = ChatMessage::assistant(self.content);
        message.tool_calls = self.calls;
        message
    }
}

#[async_trait]
impl ChatModel for OllamaModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn stream(&self, request: &ChatRequest) -> Result<EventStream> {
        let response = self
            .client
            .post(self.url())
            .json(&self.body(request, true))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            bail!("model API error {}: {}", status, error_body(response).await);
        }
        Ok(decode_stream(
            Box::pin(response.bytes_stream()),
            OllamaDecoder::default(),
        ))
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatMessage> {
        let json = post_with_retry(
            &self.client,
            &self.url(),
            None,
            &self.body(request, false),
            self.timeout,
            self.max_retries,
        )
        .await?;
        let message = json
            .get("message")
            .ok_or_else(|| anyhow!("Invalid model response: missing message"))?;
        let mut out = ChatMessage::assistant(
            message
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or(""),
        );
        out.tool_calls = ollama_tool_calls(message, 0);
        Ok(out)
    }
}
