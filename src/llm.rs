//! Model-call contract and a scripted in-process model.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{FlowError, Result};
use crate::message::{Message, ToolCall};
use crate::tool::ToolDescription;

/// Sampling and transport options passed with every model call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallOptions {
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
    pub timeout_ms: u64,
    pub stop_sequences: Vec<String>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 1024,
            top_p: 1.0,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
            timeout_ms: 30_000,
            stop_sequences: Vec::new(),
        }
    }
}

impl CallOptions {
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_stop_sequence(mut self, stop: impl Into<String>) -> Self {
        self.stop_sequences.push(stop.into());
        self
    }

    /// `None` when `timeout_ms` is zero.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }
}

/// Result of a chat completion request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub usage: HashMap<String, f64>,
    /// Set when a provider failure was folded into a textual response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ModelResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn from_error(err: &FlowError) -> Self {
        let detail = match err {
            FlowError::Provider(message) => message.clone(),
            other => other.to_string(),
        };
        Self {
            content: format!("Error: {err}"),
            error: Some(detail),
            ..Self::default()
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Parses the outermost `{...}` span embedded in model output.
pub fn extract_json(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Minimal abstraction around a chat completion provider.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// `tools` is empty for the plain chat variant.
    async fn complete_chat(
        &self,
        messages: &[Message],
        tools: &[ToolDescription],
        options: &CallOptions,
    ) -> Result<ModelResponse>;

    /// Finite, ordered chunk sequence. Defaults to one chunk holding the full reply.
    async fn stream_chat(
        &self,
        messages: &[Message],
        options: &CallOptions,
    ) -> Result<ChunkStream> {
        let response = self.complete_chat(messages, &[], options).await?;
        Ok(Box::pin(tokio_stream::iter(vec![Ok(response.content)])))
    }
}

/// A call observed by [`StubModel`].
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub messages: Vec<Message>,
    pub tools: Vec<String>,
    pub options: CallOptions,
}

impl RecordedCall {
    /// Content of the last user message in the call.
    pub fn prompt(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == crate::message::Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or_default()
    }

    pub fn system(&self) -> Option<&str> {
        self.messages
            .iter()
            .find(|m| m.role == crate::message::Role::System)
            .map(|m| m.content.as_str())
    }
}

type Responder = Arc<dyn Fn(&[Message]) -> Result<String> + Send + Sync>;
type LatencyFn = Arc<dyn Fn(&[Message]) -> Duration + Send + Sync>;

/// Scripted model double.
///
/// Replies come from a FIFO queue first, then from an optional responder closure,
/// then from an optional fallback string. A scripted entry may be plain text or a
/// JSON directive:
///
/// * `{"action":"respond","content":"..."}`
/// * `{"action":"call_tool","name":"...","arguments":{...}}`
/// * `{"action":"fail","message":"..."}` (surfaces as a provider error)
#[derive(Default)]
pub struct StubModel {
    responses: Mutex<VecDeque<String>>,
    responder: Option<Responder>,
    fallback: Option<String>,
    latency: Option<LatencyFn>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl fmt::Debug for StubModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StubModel")
            .field("queued", &lock(&self.responses).len())
            .field("has_responder", &self.responder.is_some())
            .field("fallback", &self.fallback)
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum StubDirective {
    Respond {
        content: String,
    },
    CallTool {
        name: String,
        #[serde(default)]
        arguments: Value,
        #[serde(default)]
        content: String,
    },
    Fail {
        message: String,
    },
}

impl StubModel {
    pub fn new<S: Into<String>>(responses: impl IntoIterator<Item = S>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    pub fn from_fn(responder: impl Fn(&[Message]) -> Result<String> + Send + Sync + 'static) -> Self {
        Self {
            responder: Some(Arc::new(responder)),
            ..Self::default()
        }
    }

    pub fn with_fallback(mut self, fallback: impl Into<String>) -> Self {
        self.fallback = Some(fallback.into());
        self
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        self.with_latency_fn(move |_| latency)
    }

    pub fn with_latency_fn(
        mut self,
        latency: impl Fn(&[Message]) -> Duration + Send + Sync + 'static,
    ) -> Self {
        self.latency = Some(Arc::new(latency));
        self
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn push_response(&self, response: impl Into<String>) {
        lock(&self.responses).push_back(response.into());
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    pub fn last_call(&self) -> Option<RecordedCall> {
        lock(&self.calls).last().cloned()
    }

    fn next_raw(&self, messages: &[Message]) -> Result<String> {
        if let Some(raw) = lock(&self.responses).pop_front() {
            return Ok(raw);
        }
        if let Some(responder) = &self.responder {
            return responder(messages);
        }
        self.fallback
            .clone()
            .ok_or_else(|| FlowError::Provider("StubModel ran out of scripted responses".into()))
    }
}

fn word_count(text: &str) -> f64 {
    text.split_whitespace().count() as f64
}

#[async_trait]
impl LanguageModel for StubModel {
    async fn complete_chat(
        &self,
        messages: &[Message],
        tools: &[ToolDescription],
        options: &CallOptions,
    ) -> Result<ModelResponse> {
        lock(&self.calls).push(RecordedCall {
            messages: messages.to_vec(),
            tools: tools.iter().map(|t| t.name.clone()).collect(),
            options: options.clone(),
        });
        if let Some(latency) = &self.latency {
            tokio::time::sleep(latency(messages)).await;
        }

        let raw = self.next_raw(messages)?;
        let mut response = match serde_json::from_str::<StubDirective>(&raw) {
            Ok(StubDirective::Respond { content }) => ModelResponse::text(content),
            Ok(StubDirective::CallTool {
                name,
                arguments,
                content,
            }) => ModelResponse {
                content,
                tool_calls: vec![ToolCall::new(name, arguments).with_generated_id()],
                ..ModelResponse::default()
            },
            Ok(StubDirective::Fail { message }) => return Err(FlowError::Provider(message)),
            Err(_) => ModelResponse::text(raw),
        };

        let prompt_tokens: f64 = messages.iter().map(|m| word_count(&m.content)).sum();
        let completion_tokens = word_count(&response.content);
        response.usage.insert("prompt_tokens".into(), prompt_tokens);
        response
            .usage
            .insert("completion_tokens".into(), completion_tokens);
        response
            .usage
            .insert("total_tokens".into(), prompt_tokens + completion_tokens);
        Ok(response)
    }

    async fn stream_chat(
        &self,
        messages: &[Message],
        options: &CallOptions,
    ) -> Result<ChunkStream> {
        let response = self.complete_chat(messages, &[], options).await?;
        let chunks: Vec<Result<String>> = response
            .content
            .split_inclusive(' ')
            .map(|chunk| Ok(chunk.to_string()))
            .collect();
        Ok(Box::pin(tokio_stream::iter(chunks)))
    }
}
