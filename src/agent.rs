//! Agent state machine and the autonomous planning loop.
//!
//! An [`AutonomousAgent`] drives a [`ModelContext`](crate::context::ModelContext)
//! through one of several planning strategies. Callers interact with a running
//! agent through its [`AgentHandle`]: observing state, stopping the run, or
//! answering a pending approval request.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::context::SharedContext;
use crate::error::{FlowError, Result};
use crate::hooks::{AgentHook, ApprovalHandler};
use crate::llm::{extract_json, ModelResponse};
use crate::metrics::{MetricsTracker, RunGuard};
use crate::telemetry::TelemetryCollector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Ready,
    Running,
    Waiting,
    Completed,
    Failed,
    Stopped,
}

impl AgentState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AgentState::Completed | AgentState::Failed | AgentState::Stopped
        )
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AgentState::Ready => "ready",
            AgentState::Running => "running",
            AgentState::Waiting => "waiting",
            AgentState::Completed => "completed",
            AgentState::Failed => "failed",
            AgentState::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanningStrategy {
    ZeroShot,
    #[default]
    React,
    TreeOfThought,
    PlanAndExecute,
    Reflexion,
}

impl PlanningStrategy {
    /// The strategy actually executed. Tree-of-thought, plan-and-execute and
    /// reflexion have no algorithm of their own and run the REACT loop.
    pub fn effective(self) -> PlanningStrategy {
        match self {
            PlanningStrategy::ZeroShot => PlanningStrategy::ZeroShot,
            _ => PlanningStrategy::React,
        }
    }
}

#[derive(Clone)]
pub struct Options {
    pub max_iterations: usize,
    /// Consecutive failed steps (recoveries included) that end the loop early. Zero disables.
    pub max_consecutive_errors: usize,
    pub human_feedback_enabled: bool,
    pub approval: Option<Arc<dyn ApprovalHandler>>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_consecutive_errors: 3,
            human_feedback_enabled: true,
            approval: None,
        }
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("max_iterations", &self.max_iterations)
            .field("max_consecutive_errors", &self.max_consecutive_errors)
            .field("human_feedback_enabled", &self.human_feedback_enabled)
            .field("has_approval", &self.approval.is_some())
            .finish()
    }
}

impl Options {
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_max_consecutive_errors(mut self, max: usize) -> Self {
        self.max_consecutive_errors = max;
        self
    }

    pub fn with_human_feedback(mut self, enabled: bool) -> Self {
        self.human_feedback_enabled = enabled;
        self
    }

    pub fn with_approval(mut self, approval: impl ApprovalHandler + 'static) -> Self {
        self.approval = Some(Arc::new(approval));
        self
    }

    fn gating(&self) -> Option<Arc<dyn ApprovalHandler>> {
        if self.human_feedback_enabled {
            self.approval.clone()
        } else {
            None
        }
    }
}

impl From<&AgentConfig> for Options {
    fn from(config: &AgentConfig) -> Self {
        Self {
            max_iterations: config.max_iterations,
            max_consecutive_errors: config.max_consecutive_errors,
            human_feedback_enabled: config.human_feedback_enabled,
            approval: None,
        }
    }
}

/// One recorded unit of agent work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub description: String,
    pub status: String,
    pub result: Value,
    pub success: bool,
}

impl Step {
    fn pending(description: &str) -> Self {
        Self {
            description: description.to_string(),
            status: "Running".into(),
            result: Value::Null,
            success: false,
        }
    }

    pub fn answer(&self) -> Option<&Value> {
        self.result.get("answer").filter(|a| !a.is_null())
    }

    pub fn error(&self) -> Option<&str> {
        self.result.get("error").and_then(Value::as_str)
    }

    fn summary(&self) -> Value {
        json!({
            "description": self.description,
            "result": self.result,
            "success": self.success,
        })
    }
}

struct HandleState {
    state: watch::Sender<AgentState>,
    stop: AtomicBool,
    feedback: StdMutex<Option<oneshot::Sender<String>>>,
}

/// Cloneable control surface for an agent, usable while `run` is in flight.
#[derive(Clone)]
pub struct AgentHandle {
    inner: Arc<HandleState>,
}

impl fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentHandle")
            .field("state", &self.state())
            .field("stop_requested", &self.stop_requested())
            .finish()
    }
}

impl Default for AgentHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentHandle {
    pub fn new() -> Self {
        let (state, _) = watch::channel(AgentState::Ready);
        Self {
            inner: Arc::new(HandleState {
                state,
                stop: AtomicBool::new(false),
                feedback: StdMutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> AgentState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<AgentState> {
        self.inner.state.subscribe()
    }

    /// Waits until the agent reaches `target`.
    pub async fn wait_for(&self, target: AgentState) -> AgentState {
        let mut receiver = self.subscribe();
        let reached = match receiver.wait_for(|state| *state == target).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        reached
    }

    /// Requests a cooperative stop. A step parked on feedback is released and fails.
    /// The run loop moves the agent to `Stopped` once it notices the request.
    pub fn stop(&self) {
        self.inner.stop.store(true, Ordering::SeqCst);
        let pending = self.slot().take();
        if pending.is_some() {
            debug!("releasing pending feedback channel");
        }
        drop(pending);
        info!(state = %self.state(), "stop requested by caller");
    }

    pub fn stop_requested(&self) -> bool {
        self.inner.stop.load(Ordering::SeqCst)
    }

    /// Resolves a pending approval request. Returns `false` when nothing is waiting.
    pub fn provide_feedback(&self, feedback: impl Into<String>) -> bool {
        match self.slot().take() {
            Some(sender) => sender.send(feedback.into()).is_ok(),
            None => false,
        }
    }

    pub fn is_waiting_for_feedback(&self) -> bool {
        self.slot().is_some()
    }

    fn slot(&self) -> MutexGuard<'_, Option<oneshot::Sender<String>>> {
        self.inner
            .feedback
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: AgentState) -> AgentState {
        self.inner.state.send_replace(state)
    }

    fn reset(&self) {
        self.inner.stop.store(false, Ordering::SeqCst);
        self.slot().take();
    }

    fn open_feedback_channel(&self) -> Option<oneshot::Receiver<String>> {
        let mut slot = self.slot();
        if self.stop_requested() {
            return None;
        }
        let (sender, receiver) = oneshot::channel();
        *slot = Some(sender);
        Some(receiver)
    }

    fn close_feedback_channel(&self) {
        self.slot().take();
    }
}

/// Clears the feedback slot when a parked step is dropped mid-wait.
struct FeedbackSlotGuard<'a>(&'a AgentHandle);

impl Drop for FeedbackSlotGuard<'_> {
    fn drop(&mut self) {
        self.0.close_feedback_channel();
    }
}

#[async_trait]
pub trait Agent: Send {
    /// Returns the agent to `Ready` and clears the step log.
    fn init(&mut self);

    /// Runs a task to completion. Failures are reported as `{"error": ...}`, never raised.
    async fn run(&mut self, task: &str) -> Value;

    fn handle(&self) -> AgentHandle;

    fn state(&self) -> AgentState {
        self.handle().state()
    }

    fn stop(&self) {
        self.handle().stop();
    }

    fn provide_feedback(&self, feedback: &str) -> bool {
        self.handle().provide_feedback(feedback)
    }
}

/// Agent implementing the planning strategies over a shared model context.
pub struct AutonomousAgent {
    context: SharedContext,
    options: Options,
    strategy: PlanningStrategy,
    system_prompt: Option<String>,
    hooks: Vec<Arc<dyn AgentHook>>,
    handle: AgentHandle,
    steps: Vec<Step>,
    metrics: Option<MetricsTracker>,
    telemetry: Option<TelemetryCollector>,
    run: Option<RunGuard>,
}

impl AutonomousAgent {
    pub fn new(context: SharedContext) -> Self {
        Self {
            context,
            options: Options::default(),
            strategy: PlanningStrategy::default(),
            system_prompt: None,
            hooks: Vec::new(),
            handle: AgentHandle::new(),
            steps: Vec::new(),
            metrics: None,
            telemetry: None,
            run: None,
        }
    }

    pub fn with_options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    pub fn with_strategy(mut self, strategy: PlanningStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Replaces the context's system prompt at the start of each run.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn AgentHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsTracker) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_telemetry(mut self, telemetry: TelemetryCollector) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn set_strategy(&mut self, strategy: PlanningStrategy) {
        self.strategy = strategy;
    }

    pub fn strategy(&self) -> PlanningStrategy {
        self.strategy
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn context(&self) -> SharedContext {
        Arc::clone(&self.context)
    }

    /// Steps recorded during the latest run, in execution order.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    async fn transition(&self, to: AgentState) {
        let from = self.handle.set_state(to);
        if from == to {
            return;
        }
        debug!(%from, %to, "agent state change");
        for hook in &self.hooks {
            hook.on_state_change(from, to).await;
        }
    }

    async fn status(&self, status: &str) {
        info!(status, "agent status");
        for hook in &self.hooks {
            hook.on_status(status).await;
        }
    }

    async fn record_step(&mut self, step: Step) {
        if let Some(run) = self.run.as_mut() {
            run.record_step();
            if !step.success {
                run.record_failure();
            }
        }
        if let Some(telemetry) = &self.telemetry {
            telemetry.record(
                "agent_step",
                json!({"description": step.description, "success": step.success}),
            );
        }
        for hook in &self.hooks {
            hook.on_step(&step).await;
        }
        self.steps.push(step);
    }

    async fn chat(&mut self, prompt: String) -> Result<ModelResponse> {
        if let Some(run) = self.run.as_mut() {
            run.record_model_call();
        }
        let context = Arc::clone(&self.context);
        let mut ctx = context.lock().await;
        ctx.chat(prompt).await
    }

    async fn execute_task(&mut self, task: &str) -> Result<Value> {
        let effective = self.strategy.effective();
        if effective != self.strategy {
            debug!(requested = ?self.strategy, "strategy runs as react");
        }
        match effective {
            PlanningStrategy::ZeroShot => self.plan_zero_shot(task).await,
            _ => self.plan_react(task).await,
        }
    }

    async fn plan_zero_shot(&mut self, task: &str) -> Result<Value> {
        debug!("planning with zero-shot strategy");
        let response = self.chat(task.to_string()).await?;
        Ok(json!({ "answer": response.content, "steps": [] }))
    }

    async fn plan_react(&mut self, task: &str) -> Result<Value> {
        debug!("planning with react strategy");
        let mut context = json!({ "task": task });
        let mut answer: Option<Value> = None;
        let mut consecutive_errors = 0usize;
        let tools = self.context.lock().await.tool_descriptions();
        let tool_listing = if tools.is_empty() {
            String::new()
        } else {
            format!("\n\nAvailable tools:\n{}", pretty(&serde_json::to_value(&tools)?))
        };

        for iteration in 0..self.options.max_iterations {
            if self.handle.stop_requested() {
                info!(iteration, "stop requested, leaving loop");
                break;
            }

            let thinking = format!(
                "Task: {task}\n\nThink about what to do next. Current status:\n{}{tool_listing}",
                pretty(&json!({ "context": context }))
            );
            let next = self.chat(thinking).await?;
            let step = self.execute_step(&next.content, &context).await;
            context["last_step"] = step.summary();

            if let Some(found) = step.answer() {
                answer = Some(found.clone());
                break;
            }
            if step.success {
                consecutive_errors = 0;
                continue;
            }

            consecutive_errors += 1;
            if self.handle.stop_requested() {
                break;
            }

            warn!(iteration, error = step.error().unwrap_or_default(), "step failed, attempting recovery");
            let recovery_prompt = format!(
                "The previous step failed. Let's try to recover.\n\nTask: {task}\n\nFailed step: {}\n\nError: {}\n\nWhat should we do next to recover and continue the task?",
                step.description,
                step.error().unwrap_or("unknown error"),
            );
            let plan = self.chat(recovery_prompt).await?;
            let recovery = self.execute_step(&plan.content, &context).await;
            context["last_step"] = recovery.summary();

            if let Some(found) = recovery.answer() {
                answer = Some(found.clone());
                break;
            }
            if recovery.success {
                consecutive_errors = 0;
            } else {
                consecutive_errors += 1;
            }
            let limit = self.options.max_consecutive_errors;
            if limit > 0 && consecutive_errors >= limit {
                warn!(consecutive_errors, "too many consecutive failures, ending loop");
                break;
            }
        }

        let steps: Vec<Value> = self.steps.iter().map(Step::summary).collect();
        if self.handle.stop_requested() && answer.is_none() {
            return Ok(json!({ "answer": Value::Null, "steps": steps, "stopped": true }));
        }

        let answer = match answer {
            Some(answer) => answer,
            None => {
                let closing = format!(
                    "Task: {task}\n\nBased on all the steps taken so far, provide a final answer or solution to the task."
                );
                Value::String(self.chat(closing).await?.content)
            }
        };
        Ok(json!({ "answer": answer, "steps": steps }))
    }

    async fn execute_step(&mut self, description: &str, context: &Value) -> Step {
        debug!(step = description, "executing step");
        let mut step = Step::pending(description);
        match self.perform_step(description, context).await {
            Ok(result) => {
                step.result = result;
                step.success = true;
                step.status = "Completed".into();
            }
            Err(err) => {
                warn!(error = %err, "step failed");
                step.status = format!("Failed: {err}");
                step.result = json!({ "error": err.to_string() });
            }
        }
        self.record_step(step.clone()).await;
        step
    }

    async fn perform_step(&mut self, description: &str, context: &Value) -> Result<Value> {
        let mut feedback = String::new();
        if let Some(approval) = self.options.gating() {
            feedback = self
                .wait_for_feedback(approval, &format!("Step: {description}"), context)
                .await?;
        }

        let mut prompt = format!("Execute the following step: {description}");
        if context.as_object().is_some_and(|c| !c.is_empty()) {
            prompt.push_str("\n\nContext: ");
            prompt.push_str(&pretty(context));
        }
        if !feedback.is_empty() {
            info!(feedback = %feedback, "incorporating human feedback");
            prompt.push_str("\n\nHuman feedback: ");
            prompt.push_str(&feedback);
        }

        if let Some(run) = self.run.as_mut() {
            run.record_model_call();
        }
        let shared = Arc::clone(&self.context);
        let mut ctx = shared.lock().await;
        let response = ctx.chat_with_tools(prompt).await?;
        if let Some(err) = &response.error {
            return Err(FlowError::Provider(err.clone()));
        }

        let mut result = json!({ "output": response.content });
        if !feedback.is_empty() {
            result["human_feedback"] = Value::String(feedback);
        }
        if response.has_tool_calls() {
            let mut tool_results = Vec::with_capacity(response.tool_calls.len());
            for call in &response.tool_calls {
                if let Some(run) = self.run.as_mut() {
                    run.record_tool_call();
                }
                let outcome = ctx.execute_tool_call(call)?;
                tool_results.push(json!({
                    "id": call.id,
                    "name": call.name,
                    "success": outcome.success,
                    "result": outcome.content,
                    "data": outcome.data,
                }));
            }
            result["tool_results"] = Value::Array(tool_results);
        }
        if let Some(answer) = detect_answer(&response.content) {
            result["answer"] = answer;
        }
        Ok(result)
    }

    /// Parks the step until the approval predicate passes or feedback arrives.
    async fn wait_for_feedback(
        &self,
        approval: Arc<dyn ApprovalHandler>,
        message: &str,
        context: &Value,
    ) -> Result<String> {
        let Some(receiver) = self.handle.open_feedback_channel() else {
            return Err(FlowError::Cancelled("agent stopped before approval".into()));
        };
        let guard = FeedbackSlotGuard(&self.handle);
        self.transition(AgentState::Waiting).await;
        self.status("Waiting for human feedback").await;

        if approval.approve(message, context) {
            drop(guard);
            self.transition(AgentState::Running).await;
            return Ok(String::new());
        }

        let feedback = receiver
            .await
            .map_err(|_| FlowError::Cancelled("feedback channel closed without a reply".into()))?;
        drop(guard);
        self.transition(AgentState::Running).await;
        Ok(feedback)
    }
}

#[async_trait]
impl Agent for AutonomousAgent {
    fn init(&mut self) {
        self.handle.reset();
        self.handle.set_state(AgentState::Ready);
        self.steps.clear();
        info!("agent initialized");
    }

    async fn run(&mut self, task: &str) -> Value {
        info!(task, strategy = ?self.strategy, "running autonomous agent");
        self.handle.reset();
        self.steps.clear();
        if let Some(prompt) = &self.system_prompt {
            self.context.lock().await.set_system_prompt(prompt.clone());
        }
        self.run = self
            .metrics
            .as_ref()
            .map(|m| m.start_run(format!("{:?}", self.strategy.effective())));

        self.transition(AgentState::Running).await;
        self.status("Starting task execution").await;

        let outcome = self.execute_task(task).await;
        let run = self.run.take();
        match outcome {
            Ok(result) => {
                if self.handle.stop_requested() {
                    self.transition(AgentState::Stopped).await;
                    self.status("Task stopped by user").await;
                } else {
                    self.transition(AgentState::Completed).await;
                    self.status("Task completed successfully").await;
                }
                if let Some(run) = run {
                    run.finish(!self.handle.stop_requested());
                }
                result
            }
            Err(err) => {
                error!(error = %err, "agent run failed");
                self.transition(AgentState::Failed).await;
                self.status(&format!("Task failed: {err}")).await;
                if let Some(run) = run {
                    run.finish(false);
                }
                json!({ "error": err.to_string() })
            }
        }
    }

    fn handle(&self) -> AgentHandle {
        self.handle.clone()
    }
}

/// An explicit answer in a step reply: a JSON object with `answer`, or a `Final Answer:` line.
fn detect_answer(text: &str) -> Option<Value> {
    if let Some(Value::Object(map)) = extract_json(text) {
        if let Some(answer) = map.get("answer").filter(|a| !a.is_null()) {
            return Some(answer.clone());
        }
    }
    let lower = text.to_ascii_lowercase();
    let marker = "final answer:";
    lower.find(marker).map(|idx| {
        Value::String(text[idx + marker.len()..].trim().to_string())
    })
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ModelContext;
    use crate::llm::StubModel;
    use crate::tool::{FunctionTool, Parameter, ToolResult};
    use std::sync::atomic::AtomicUsize;

    fn agent_over(model: Arc<StubModel>) -> AutonomousAgent {
        let context = ModelContext::new()
            .with_model(model)
            .with_system_prompt("You are a careful agent.")
            .into_shared();
        AutonomousAgent::new(context)
    }

    #[test]
    fn aliases_resolve_to_react() {
        assert_eq!(PlanningStrategy::Reflexion.effective(), PlanningStrategy::React);
        assert_eq!(PlanningStrategy::TreeOfThought.effective(), PlanningStrategy::React);
        assert_eq!(PlanningStrategy::PlanAndExecute.effective(), PlanningStrategy::React);
        assert_eq!(PlanningStrategy::ZeroShot.effective(), PlanningStrategy::ZeroShot);
    }

    #[test]
    fn detects_answers() {
        assert_eq!(detect_answer(r#"{"answer": 42}"#), Some(json!(42)));
        assert_eq!(
            detect_answer("Reasoning...\nFinal Answer: Paris"),
            Some(json!("Paris"))
        );
        assert_eq!(detect_answer("keep going"), None);
    }

    #[tokio::test]
    async fn zero_shot_makes_one_call() {
        let model = StubModel::new(["4"]).into_shared();
        let mut agent = agent_over(model.clone()).with_strategy(PlanningStrategy::ZeroShot);

        let result = agent.run("What is 2 + 2?").await;

        assert_eq!(result, json!({"answer": "4", "steps": []}));
        assert_eq!(model.call_count(), 1);
        assert_eq!(agent.state(), AgentState::Completed);
    }

    #[tokio::test]
    async fn react_stops_on_explicit_answer() {
        let model = StubModel::new([
            "Look up the capital.",
            r#"{"answer": "Paris"}"#,
        ])
        .into_shared();
        let mut agent = agent_over(model.clone());

        let result = agent.run("Capital of France?").await;

        assert_eq!(result["answer"], json!("Paris"));
        assert_eq!(result["steps"].as_array().unwrap().len(), 1);
        assert_eq!(model.call_count(), 2);
    }

    #[tokio::test]
    async fn failed_step_triggers_one_recovery() {
        let model = StubModel::new([
            "Search the web.",
            r#"{"action":"call_tool","name":"web_search","arguments":{"q":"rust"}}"#,
            "Use the calculator instead.",
            r#"{"action":"call_tool","name":"calculator","arguments":{"expression":"6*7"}}"#,
            "Report the result.",
            "Final Answer: 42",
        ])
        .into_shared();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut agent = agent_over(model.clone());
        agent.context.lock().await.register_tool(
            FunctionTool::new("calculator", "Math")
                .with_parameter(Parameter::required("expression", "string", "expr"))
                .with_callback(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    ToolResult::ok("42")
                }),
        );

        let result = agent.run("Compute six times seven").await;

        let steps = agent.steps();
        assert_eq!(steps.len(), 3);
        assert!(!steps[0].success);
        assert!(steps[0].status.starts_with("Failed:"));
        assert!(steps[1].success);
        assert_eq!(steps[1].result["tool_results"][0]["name"], json!("calculator"));
        assert_eq!(steps[1].result["tool_results"][0]["result"], json!("42"));
        assert_eq!(result["answer"], json!("42"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(model.calls()[2].prompt().starts_with("The previous step failed."));
    }

    #[tokio::test]
    async fn missing_model_fails_the_run() {
        let mut agent = AutonomousAgent::new(ModelContext::new().into_shared());

        let result = agent.run("anything").await;

        assert!(result["error"].as_str().unwrap().contains("no language model"));
        assert_eq!(agent.state(), AgentState::Failed);
    }

    #[tokio::test]
    async fn approved_steps_do_not_wait() {
        let model = StubModel::new(["plan", r#"{"answer": "ok"}"#]).into_shared();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let log = seen.clone();
        let mut agent = agent_over(model).with_options(Options::default().with_approval(
            move |message: &str, _: &Value| {
                log.lock().unwrap().push(message.to_string());
                true
            },
        ));

        let result = agent.run("task").await;

        assert_eq!(result["answer"], json!("ok"));
        assert_eq!(seen.lock().unwrap().as_slice(), ["Step: plan"]);
        assert!(!agent.handle().is_waiting_for_feedback());
    }

    #[tokio::test]
    async fn disabled_feedback_skips_approval() {
        let model = StubModel::new(["plan", r#"{"answer": "ok"}"#]).into_shared();
        let mut agent = agent_over(model).with_options(
            Options::default()
                .with_human_feedback(false)
                .with_approval(|_: &str, _: &Value| -> bool { panic!("approval must not run") }),
        );
        assert_eq!(agent.run("task").await["answer"], json!("ok"));
    }

    #[tokio::test]
    async fn init_resets_state() {
        let model = StubModel::new(["4"]).into_shared();
        let mut agent = agent_over(model).with_strategy(PlanningStrategy::ZeroShot);
        agent.run("2+2").await;
        agent.init();
        assert_eq!(agent.state(), AgentState::Ready);
        assert!(agent.steps().is_empty());
    }
}
