//! Workflow composition primitives.
//!
//! Each workflow composes single model calls over a [`SharedContext`] using a
//! fixed topology: a sequence ([`PromptChain`]), a branch ([`Router`]), a
//! fan-out/fan-in ([`Parallelization`]), a delegation ([`OrchestratorWorkers`])
//! or an iteration ([`EvaluatorOptimizer`]). Workflows keep no state between runs.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::{Captures, Regex};
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tracing::info;

use crate::context::SharedContext;
use crate::error::{FlowError, Result};
use crate::llm::CallOptions;
use crate::tool::Tool;

pub mod chain;
pub mod evaluator;
pub mod orchestrator;
pub mod parallel;
pub mod routing;

pub use chain::{ChainOutcome, ChainStep, PromptChain};
pub use evaluator::{Evaluation, EvaluatorOptimizer, EvaluatorOutcome};
pub use orchestrator::{Assignment, OrchestratorOutcome, OrchestratorWorkers, Worker};
pub use parallel::{majority_vote, BranchResult, Mode, ParallelTask, Parallelization};
pub use routing::{Route, RouteOutcome, Router};

#[async_trait]
pub trait Workflow: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, input: &str) -> Result<Value>;
}

/// Runs a workflow on a background task.
pub fn spawn_workflow(
    workflow: Arc<dyn Workflow>,
    input: impl Into<String>,
) -> JoinHandle<Result<Value>> {
    let input = input.into();
    tokio::spawn(async move { workflow.run(&input).await })
}

/// Single-method capability shared by route handlers, workers and delegated workflows.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, input: &str, context: &Value) -> Result<Value>;
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;

/// Wraps an async closure as a [`Handler`].
pub struct FunctionHandler<F>
where
    F: Fn(String, Value) -> HandlerFuture + Send + Sync,
{
    func: F,
}

impl<F> FunctionHandler<F>
where
    F: Fn(String, Value) -> HandlerFuture + Send + Sync,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F> Handler for FunctionHandler<F>
where
    F: Fn(String, Value) -> HandlerFuture + Send + Sync,
{
    async fn handle(&self, input: &str, context: &Value) -> Result<Value> {
        (self.func)(input.to_string(), context.clone()).await
    }
}

/// Builds a shared handler from an async closure.
pub fn handler_fn<F, Fut>(func: F) -> Arc<dyn Handler>
where
    F: Fn(String, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(FunctionHandler::new(move |input, context| {
        Box::pin(func(input, context)) as HandlerFuture
    }))
}

/// Wraps a synchronous closure as a [`Handler`].
pub struct SyncHandler {
    func: Box<dyn Fn(&str, &Value) -> Result<Value> + Send + Sync>,
}

impl SyncHandler {
    pub fn new(func: impl Fn(&str, &Value) -> Result<Value> + Send + Sync + 'static) -> Self {
        Self {
            func: Box::new(func),
        }
    }
}

#[async_trait]
impl Handler for SyncHandler {
    async fn handle(&self, input: &str, context: &Value) -> Result<Value> {
        (self.func)(input, context)
    }
}

/// A single model call with its own system prompt, run on a fork of the context.
pub struct PromptHandler {
    context: SharedContext,
    system_prompt: String,
    template: Option<String>,
    options: Option<CallOptions>,
}

impl PromptHandler {
    pub fn new(context: SharedContext, system_prompt: impl Into<String>) -> Self {
        Self {
            context,
            system_prompt: system_prompt.into(),
            template: None,
            options: None,
        }
    }

    /// Prompt template rendered with `{{input}}` and the handler context's fields.
    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    pub fn with_options(mut self, options: CallOptions) -> Self {
        self.options = Some(options);
        self
    }
}

#[async_trait]
impl Handler for PromptHandler {
    async fn handle(&self, input: &str, context: &Value) -> Result<Value> {
        let prompt = match &self.template {
            Some(template) => {
                let mut vars = context.as_object().cloned().unwrap_or_default();
                vars.insert("input".into(), Value::String(input.to_string()));
                render_template(template, &vars).0
            }
            None => input.to_string(),
        };
        let branch = self.context.lock().await.fork(Some(&self.system_prompt));
        let response = branch
            .complete(None, &prompt, self.options.as_ref())
            .await?;
        Ok(Value::String(response.content))
    }
}

/// Delegates to a nested workflow.
pub struct WorkflowHandler {
    workflow: Arc<dyn Workflow>,
}

impl WorkflowHandler {
    pub fn new(workflow: Arc<dyn Workflow>) -> Self {
        Self { workflow }
    }
}

#[async_trait]
impl Handler for WorkflowHandler {
    async fn handle(&self, input: &str, _context: &Value) -> Result<Value> {
        self.workflow.run(input).await
    }
}

/// Runs a tool with the handler context's fields plus the input under `input_key`.
pub struct ToolHandler {
    tool: Arc<dyn Tool>,
    input_key: String,
}

impl ToolHandler {
    pub fn new(tool: Arc<dyn Tool>, input_key: impl Into<String>) -> Self {
        Self {
            tool,
            input_key: input_key.into(),
        }
    }
}

#[async_trait]
impl Handler for ToolHandler {
    async fn handle(&self, input: &str, context: &Value) -> Result<Value> {
        let mut params = context.as_object().cloned().unwrap_or_default();
        params.insert(self.input_key.clone(), Value::String(input.to_string()));
        let result = self.tool.execute(&Value::Object(params));
        Ok(serde_json::to_value(result)?)
    }
}

pub type StepCallback = Arc<dyn Fn(&str, &Value) + Send + Sync>;

/// Per-workflow step reporting and step budget.
#[derive(Clone)]
pub struct StepLog {
    workflow: String,
    callback: Option<StepCallback>,
    max_steps: usize,
}

impl fmt::Debug for StepLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepLog")
            .field("workflow", &self.workflow)
            .field("has_callback", &self.callback.is_some())
            .field("max_steps", &self.max_steps)
            .finish()
    }
}

impl StepLog {
    pub const DEFAULT_MAX_STEPS: usize = 10;

    pub fn new(workflow: impl Into<String>) -> Self {
        Self {
            workflow: workflow.into(),
            callback: None,
            max_steps: Self::DEFAULT_MAX_STEPS,
        }
    }

    pub fn set_callback(&mut self, callback: StepCallback) {
        self.callback = Some(callback);
    }

    pub fn set_max_steps(&mut self, max_steps: usize) {
        self.max_steps = max_steps.max(1);
    }

    pub fn max_steps(&self) -> usize {
        self.max_steps
    }

    pub fn record(&self, step: &str, result: &Value) {
        info!(workflow = %self.workflow, step, "workflow step");
        if let Some(callback) = &self.callback {
            callback(step, result);
        }
    }

    pub fn ensure_within_budget(&self, planned: usize) -> Result<()> {
        if planned > self.max_steps {
            return Err(FlowError::Validation(format!(
                "{} has {planned} steps, more than the limit of {}",
                self.workflow, self.max_steps
            )));
        }
        Ok(())
    }
}

fn placeholder() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_.-]+)\s*\}\}").expect("placeholder pattern compiles")
    })
}

/// Replaces `{{key}}` with values from `vars`; strings are inserted raw.
/// Returns the rendered text and whether the template had any placeholder.
pub fn render_template(template: &str, vars: &Map<String, Value>) -> (String, bool) {
    let pattern = placeholder();
    if !pattern.is_match(template) {
        return (template.to_string(), false);
    }
    let rendered = pattern.replace_all(template, |caps: &Captures<'_>| {
        match vars.get(&caps[1]) {
            Some(Value::String(text)) => text.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        }
    });
    (rendered.into_owned(), true)
}

/// Text form of a step value: strings raw, objects by their first textual field.
pub(crate) fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        Value::Object(map) => ["response", "output", "content", "text", "input"]
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_str))
            .map(str::to_string)
            .unwrap_or_else(|| value.to_string()),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_placeholders() {
        let vars = json!({"topic": "rust", "count": 3}).as_object().cloned().unwrap();
        let (text, templated) = render_template("Write {{ count }} tips about {{topic}}.{{missing}}", &vars);
        assert!(templated);
        assert_eq!(text, "Write 3 tips about rust.");

        let (plain, templated) = render_template("Summarize this.", &vars);
        assert!(!templated);
        assert_eq!(plain, "Summarize this.");
    }

    #[test]
    fn step_budget_is_enforced() {
        let mut log = StepLog::new("chain");
        log.set_max_steps(2);
        assert!(log.ensure_within_budget(2).is_ok());
        assert!(matches!(
            log.ensure_within_budget(3),
            Err(FlowError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn handlers_share_one_interface() {
        let echo = handler_fn(|input, _| async move { Ok(json!({ "echo": input })) });
        let upper = SyncHandler::new(|input, _| Ok(Value::String(input.to_uppercase())));

        assert_eq!(echo.handle("hi", &Value::Null).await.unwrap(), json!({"echo": "hi"}));
        assert_eq!(upper.handle("hi", &Value::Null).await.unwrap(), json!("HI"));
    }

    #[tokio::test]
    async fn spawned_workflow_runs_in_background() {
        let model = crate::llm::StubModel::new(["summary"]).into_shared();
        let context = crate::context::ModelContext::new().with_model(model).into_shared();
        let chain: Arc<dyn Workflow> = Arc::new(
            PromptChain::new(context).with_step(ChainStep::new("summarize", "Summarize {{input}}")),
        );

        let result = spawn_workflow(chain, "the report").await.unwrap().unwrap();

        assert_eq!(result["final_output"]["response"], json!("summary"));
    }

    #[tokio::test]
    async fn tool_handler_passes_input_under_key() {
        let handler = ToolHandler::new(Arc::new(crate::toolkit::CalculatorTool::new()), "expression");

        let result = handler.handle("6 * 7", &json!({})).await.unwrap();

        assert_eq!(result["success"], json!(true));
        assert_eq!(result["content"], json!("42"));
    }

    #[test]
    fn value_text_prefers_response_field() {
        assert_eq!(value_text(&json!({"response": "ok", "name": "x"})), "ok");
        assert_eq!(value_text(&json!("plain")), "plain");
        assert_eq!(value_text(&json!(5)), "5");
    }
}
