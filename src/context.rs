use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context as TaskContext, Poll};

use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{FlowError, Result};
use crate::llm::{CallOptions, ChunkStream, LanguageModel, ModelResponse};
use crate::memory::{HistoryWindow, Memory, MemoryType};
use crate::message::{Message, ToolCall};
use crate::telemetry::{RetryPolicy, TelemetryCollector};
use crate::tool::{Tool, ToolDescription, ToolRegistry, ToolResult};

/// A context shared between an agent or workflow and its caller.
pub type SharedContext = Arc<Mutex<ModelContext>>;

/// Binds one model handle, one tool registry, one memory store and a system prompt.
pub struct ModelContext {
    model: Option<Arc<dyn LanguageModel>>,
    tools: Arc<ToolRegistry>,
    memory: Memory,
    system_prompt: String,
    options: CallOptions,
    retry: RetryPolicy,
    window: HistoryWindow,
    usage: Arc<StdMutex<HashMap<String, f64>>>,
    telemetry: Option<TelemetryCollector>,
}

impl fmt::Debug for ModelContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelContext")
            .field("has_model", &self.model.is_some())
            .field("tools", &self.tools.names())
            .field("history", &self.memory.messages().len())
            .field("system_prompt", &self.system_prompt)
            .finish()
    }
}

impl Default for ModelContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelContext {
    pub fn new() -> Self {
        Self {
            model: None,
            tools: Arc::new(ToolRegistry::new()),
            memory: Memory::new(),
            system_prompt: String::new(),
            options: CallOptions::default(),
            retry: RetryPolicy::none(),
            window: HistoryWindow::Full,
            usage: Arc::new(StdMutex::new(HashMap::new())),
            telemetry: None,
        }
    }

    pub fn with_model(mut self, model: Arc<dyn LanguageModel>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = Arc::new(tools);
        self
    }

    pub fn with_shared_tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_options(mut self, options: CallOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_history_window(mut self, window: HistoryWindow) -> Self {
        self.window = window;
        self
    }

    pub fn with_telemetry(mut self, telemetry: TelemetryCollector) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn into_shared(self) -> SharedContext {
        Arc::new(Mutex::new(self))
    }

    /// Independent context for a concurrent branch: same model and tools, fresh memory.
    /// Usage totals keep accumulating into the parent.
    pub fn fork(&self, system_prompt: Option<&str>) -> ModelContext {
        ModelContext {
            model: self.model.clone(),
            tools: Arc::clone(&self.tools),
            memory: Memory::new(),
            system_prompt: system_prompt
                .map(str::to_string)
                .unwrap_or_else(|| self.system_prompt.clone()),
            options: self.options.clone(),
            retry: self.retry.clone(),
            window: self.window,
            usage: Arc::clone(&self.usage),
            telemetry: self.telemetry.clone(),
        }
    }

    pub fn set_model(&mut self, model: Arc<dyn LanguageModel>) {
        self.model = Some(model);
    }

    pub fn has_model(&self) -> bool {
        self.model.is_some()
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        self.system_prompt = prompt.into();
    }

    pub fn options(&self) -> &CallOptions {
        &self.options
    }

    pub fn set_options(&mut self, options: CallOptions) {
        self.options = options;
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Registers into this context's registry. A registry shared with forks is copied first.
    pub fn register_tool<T: Tool + 'static>(&mut self, tool: T) -> Option<Arc<dyn Tool>> {
        Arc::make_mut(&mut self.tools).register(tool)
    }

    pub fn tool_descriptions(&self) -> Vec<ToolDescription> {
        self.tools.describe()
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn remember(&mut self, key: impl Into<String>, value: Value, memory_type: MemoryType) {
        self.memory.add(key, value, memory_type);
    }

    pub fn recall(&self, key: &str, memory_type: MemoryType) -> Option<&Value> {
        self.memory.get(key, memory_type)
    }

    pub fn forget(&mut self, key: &str, memory_type: MemoryType) -> Option<Value> {
        self.memory.remove(key, memory_type)
    }

    pub fn history(&self) -> &[Message] {
        self.memory.messages()
    }

    /// Forgets the conversation. Values stored with [`ModelContext::remember`] are kept.
    pub fn clear_history(&mut self) {
        self.memory.clear_messages();
    }

    pub fn usage(&self) -> HashMap<String, f64> {
        self.usage
            .lock()
            .map(|u| u.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub async fn chat(&mut self, message: impl Into<String>) -> Result<ModelResponse> {
        self.exchange(message.into(), false).await
    }

    /// Like [`ModelContext::chat`] but advertises the tool set. Requested tool calls
    /// are returned to the caller, not executed.
    pub async fn chat_with_tools(&mut self, message: impl Into<String>) -> Result<ModelResponse> {
        self.exchange(message.into(), true).await
    }

    /// Single call outside the conversation: memory is neither read nor written.
    pub async fn complete(
        &self,
        system_prompt: Option<&str>,
        prompt: &str,
        options: Option<&CallOptions>,
    ) -> Result<ModelResponse> {
        let model = self.require_model()?;
        let system = system_prompt.unwrap_or(&self.system_prompt);
        let mut messages = Vec::with_capacity(2);
        if !system.is_empty() {
            messages.push(Message::system(system));
        }
        messages.push(Message::user(prompt));
        let options = options.unwrap_or(&self.options);
        Ok(self.invoke(&model, &messages, &[], options).await)
    }

    pub fn execute_tool(&self, name: &str, params: &Value) -> Result<ToolResult> {
        let result = self.tools.execute(name, params)?;
        if let Some(telemetry) = &self.telemetry {
            telemetry.record(
                "tool_call",
                serde_json::json!({"tool": name, "success": result.success}),
            );
        }
        Ok(result)
    }

    /// Executes a model-requested call and records the result in the transcript.
    pub fn execute_tool_call(&mut self, call: &ToolCall) -> Result<ToolResult> {
        let result = self.execute_tool(&call.name, &call.arguments)?;
        self.memory.add_message(Message::tool(
            call.name.clone(),
            result.content.clone(),
            call.id.clone(),
        ));
        Ok(result)
    }

    /// Chunks arrive in order. The exchange is written to memory only when the
    /// stream is exhausted; a stream dropped early leaves memory untouched.
    pub async fn stream_chat(&mut self, message: impl Into<String>) -> Result<ChatStream<'_>> {
        let model = self.require_model()?;
        let prompt = message.into();
        let mut messages = self.build_messages();
        messages.push(Message::user(prompt.clone()));

        let inner = match self.options.timeout() {
            Some(limit) => tokio::time::timeout(limit, model.stream_chat(&messages, &self.options))
                .await
                .map_err(|_| FlowError::Timeout(format!("stream did not open within {limit:?}")))??,
            None => model.stream_chat(&messages, &self.options).await?,
        };

        Ok(ChatStream {
            context: self,
            inner,
            prompt: Some(prompt),
            collected: String::new(),
            finished: false,
        })
    }

    async fn exchange(&mut self, message: String, with_tools: bool) -> Result<ModelResponse> {
        let model = self.require_model()?;
        self.memory.add_message(Message::user(message));
        let messages = self.build_messages();
        let tools = if with_tools {
            self.tools.describe()
        } else {
            Vec::new()
        };

        let response = self.invoke(&model, &messages, &tools, &self.options).await;
        self.memory.add_message(
            Message::assistant(response.content.clone()).with_tool_calls(response.tool_calls.clone()),
        );
        Ok(response)
    }

    fn require_model(&self) -> Result<Arc<dyn LanguageModel>> {
        self.model
            .clone()
            .ok_or_else(|| FlowError::Configuration("no language model bound to context".into()))
    }

    fn build_messages(&self) -> Vec<Message> {
        let history = self.window.select(self.memory.messages());
        let mut messages = Vec::with_capacity(history.len() + 1);
        if !self.system_prompt.is_empty() {
            messages.push(Message::system(self.system_prompt.clone()));
        }
        messages.extend(history.iter().cloned());
        messages
    }

    /// Provider failures come back as a textual response with `error` set.
    async fn invoke(
        &self,
        model: &Arc<dyn LanguageModel>,
        messages: &[Message],
        tools: &[ToolDescription],
        options: &CallOptions,
    ) -> ModelResponse {
        debug!(messages = messages.len(), tools = tools.len(), "calling model");
        let outcome = self
            .retry
            .retry(
                |_| async move {
                    match options.timeout() {
                        Some(limit) => {
                            tokio::time::timeout(limit, model.complete_chat(messages, tools, options))
                                .await
                                .map_err(|_| {
                                    FlowError::Timeout(format!("model call exceeded {limit:?}"))
                                })?
                        }
                        None => model.complete_chat(messages, tools, options).await,
                    }
                },
                self.telemetry.as_ref(),
            )
            .await;

        match outcome {
            Ok(response) => {
                self.add_usage(&response.usage);
                response
            }
            Err(err) => {
                warn!(error = %err, "model call failed");
                if let Some(telemetry) = &self.telemetry {
                    telemetry.record_failure("model_call", err.to_string(), self.retry.max_retries);
                }
                ModelResponse::from_error(&err)
            }
        }
    }

    fn add_usage(&self, usage: &HashMap<String, f64>) {
        let mut totals = self
            .usage
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (key, value) in usage {
            *totals.entry(key.clone()).or_insert(0.0) += value;
        }
    }
}

/// Streamed reply bound to the context that requested it.
pub struct ChatStream<'a> {
    context: &'a mut ModelContext,
    inner: ChunkStream,
    prompt: Option<String>,
    collected: String,
    finished: bool,
}

impl ChatStream<'_> {
    /// Drains the stream and returns the full text.
    pub async fn collect_text(mut self) -> Result<String> {
        while let Some(chunk) = self.next().await {
            chunk?;
        }
        Ok(std::mem::take(&mut self.collected))
    }
}

impl Stream for ChatStream<'_> {
    type Item = Result<String>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.collected.push_str(&chunk);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => {
                this.finished = true;
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                this.finished = true;
                if let Some(prompt) = this.prompt.take() {
                    this.context.memory.add_message(Message::user(prompt));
                    this.context
                        .memory
                        .add_message(Message::assistant(this.collected.clone()));
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
