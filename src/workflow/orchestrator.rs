use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::{value_text, Handler, StepLog, Workflow};
use crate::context::{ModelContext, SharedContext};
use crate::error::{FlowError, Result};
use crate::llm::extract_json;

const DEFAULT_ORCHESTRATOR_PROMPT: &str = "You are an orchestrator. Break the user's request into \
     subtasks and assign each one to the most suitable worker.";

pub type Synthesizer = Arc<dyn Fn(&str, &[Value]) -> Value + Send + Sync>;

/// A registered worker: a model call with its own system prompt, or a custom handler.
#[derive(Clone)]
pub struct Worker {
    pub name: String,
    pub description: String,
    pub system_prompt: String,
    handler: Option<Arc<dyn Handler>>,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("system_prompt", &self.system_prompt)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

impl Worker {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            system_prompt: system_prompt.into(),
            handler: None,
        }
    }

    /// The handler receives the subtask as input and `{input, worker, task}` as context.
    pub fn with_handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.handler = Some(handler);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub worker: String,
    pub task: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrchestratorOutcome {
    pub plan: Vec<Assignment>,
    /// False when the plan call failed or its reply could not be parsed; every worker got the raw input.
    pub planned: bool,
    pub results: Vec<Value>,
    pub output: Value,
}

enum Job {
    Unknown,
    Handler(Arc<dyn Handler>),
    Prompt(ModelContext),
}

pub struct OrchestratorWorkers {
    context: SharedContext,
    orchestrator_prompt: String,
    workers: Vec<Worker>,
    synthesizer: Option<Synthesizer>,
    max_assignments: usize,
    log: StepLog,
}

impl OrchestratorWorkers {
    pub const DEFAULT_MAX_ASSIGNMENTS: usize = 5;

    pub fn new(context: SharedContext) -> Self {
        Self {
            context,
            orchestrator_prompt: DEFAULT_ORCHESTRATOR_PROMPT.to_string(),
            workers: Vec::new(),
            synthesizer: None,
            max_assignments: Self::DEFAULT_MAX_ASSIGNMENTS,
            log: StepLog::new("orchestrator_workers"),
        }
    }

    pub fn with_orchestrator_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.orchestrator_prompt = prompt.into();
        self
    }

    /// Registers a worker. A worker with the same name is replaced.
    pub fn with_worker(mut self, worker: Worker) -> Self {
        self.register_worker(worker);
        self
    }

    pub fn register_worker(&mut self, worker: Worker) -> &mut Self {
        self.workers.retain(|w| w.name != worker.name);
        self.workers.push(worker);
        self
    }

    /// Receives the original input and the per-assignment results.
    pub fn with_synthesizer(
        mut self,
        synthesizer: impl Fn(&str, &[Value]) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.synthesizer = Some(Arc::new(synthesizer));
        self
    }

    pub fn with_max_assignments(mut self, max: usize) -> Self {
        self.max_assignments = max.max(1);
        self
    }

    pub fn with_step_callback(mut self, callback: impl Fn(&str, &Value) + Send + Sync + 'static) -> Self {
        self.log.set_callback(Arc::new(callback));
        self
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    pub fn workers_schema(&self) -> Value {
        let workers: Vec<Value> = self
            .workers
            .iter()
            .map(|w| json!({ "name": w.name, "description": w.description }))
            .collect();
        json!({ "workers": workers })
    }

    fn planner_prompt(&self) -> String {
        let mut prompt = self.orchestrator_prompt.clone();
        prompt.push_str("\n\nAvailable workers:\n");
        for worker in &self.workers {
            prompt.push_str(&format!("- {}: {}\n", worker.name, worker.description));
        }
        prompt.push_str(
            "\nRespond with JSON only, in the form \
             {\"subtasks\": [{\"worker\": \"<worker name>\", \"task\": \"<instructions>\"}]}",
        );
        prompt
    }

    fn fallback_plan(&self, input: &str) -> Vec<Assignment> {
        self.workers
            .iter()
            .map(|w| Assignment {
                worker: w.name.clone(),
                task: input.to_string(),
            })
            .collect()
    }

    pub async fn execute(&self, input: &str) -> Result<OrchestratorOutcome> {
        if self.workers.is_empty() {
            return Err(FlowError::Validation("no workers registered".into()));
        }

        let planner = self.context.lock().await.fork(None);
        let response = planner
            .complete(Some(&self.planner_prompt()), input, None)
            .await?;
        let parsed = match &response.error {
            Some(err) => {
                warn!(error = %err, "orchestrator plan call failed, assigning input to every worker");
                None
            }
            None => parse_plan(&response.content).or_else(|| {
                warn!("orchestrator plan unreadable, assigning input to every worker");
                None
            }),
        };
        let (mut plan, planned) = match parsed {
            Some(plan) => (plan, true),
            None => (self.fallback_plan(input), false),
        };
        if plan.len() > self.max_assignments {
            warn!(
                planned = plan.len(),
                limit = self.max_assignments,
                "dropping assignments over the limit"
            );
            plan.truncate(self.max_assignments);
        }
        self.log.record("plan", &json!({ "subtasks": plan, "planned": planned }));
        debug!(assignments = plan.len(), "dispatching workers");

        let jobs: Vec<Job> = {
            let parent = self.context.lock().await;
            plan.iter()
                .map(|a| match self.workers.iter().find(|w| w.name == a.worker) {
                    None => Job::Unknown,
                    Some(Worker {
                        handler: Some(handler),
                        ..
                    }) => Job::Handler(Arc::clone(handler)),
                    Some(worker) => Job::Prompt(parent.fork(Some(&worker.system_prompt))),
                })
                .collect()
        };

        let dispatch = plan.iter().zip(jobs).map(|(assignment, job)| async move {
            let output = match job {
                Job::Unknown => Err(format!("unknown worker `{}`", assignment.worker)),
                Job::Handler(handler) => {
                    let info = json!({
                        "input": input,
                        "worker": assignment.worker,
                        "task": assignment.task,
                    });
                    handler
                        .handle(&assignment.task, &info)
                        .await
                        .map_err(|e| e.to_string())
                }
                Job::Prompt(branch) => match branch.complete(None, &assignment.task, None).await {
                    Ok(response) => match response.error {
                        Some(err) => Err(err),
                        None => Ok(Value::String(response.content)),
                    },
                    Err(err) => Err(err.to_string()),
                },
            };
            match output {
                Ok(output) => json!({
                    "worker": assignment.worker,
                    "task": assignment.task,
                    "output": output,
                }),
                Err(error) => {
                    warn!(worker = %assignment.worker, error = %error, "worker failed");
                    json!({
                        "worker": assignment.worker,
                        "task": assignment.task,
                        "error": error,
                    })
                }
            }
        });
        let results = join_all(dispatch).await;
        for result in &results {
            let worker = result["worker"].as_str().unwrap_or_default();
            self.log.record(worker, result);
        }

        let output = match &self.synthesizer {
            Some(synthesize) => synthesize(input, &results),
            None => concatenate(&results),
        };
        info!(workers = results.len(), "orchestration finished");
        Ok(OrchestratorOutcome {
            plan,
            planned,
            results,
            output,
        })
    }
}

fn parse_plan(reply: &str) -> Option<Vec<Assignment>> {
    let parsed = extract_json(reply)?;
    let subtasks = parsed.get("subtasks")?.as_array()?;
    let plan: Vec<Assignment> = subtasks
        .iter()
        .filter_map(|entry| serde_json::from_value(entry.clone()).ok())
        .collect();
    (!plan.is_empty()).then_some(plan)
}

fn concatenate(results: &[Value]) -> Value {
    let text = results
        .iter()
        .map(|r| {
            let worker = r["worker"].as_str().unwrap_or_default();
            let body = match r.get("error").and_then(Value::as_str) {
                Some(error) => format!("Error: {error}"),
                None => value_text(&r["output"]),
            };
            format!("## {worker}\n{body}")
        })
        .collect::<Vec<_>>()
        .join("\n\n");
    Value::String(text)
}

#[async_trait]
impl Workflow for OrchestratorWorkers {
    fn name(&self) -> &str {
        "orchestrator_workers"
    }

    async fn run(&self, input: &str) -> Result<Value> {
        let outcome = self.execute(input).await?;
        Ok(serde_json::to_value(outcome)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::StubModel;
    use crate::message::Role;
    use crate::workflow::handler_fn;

    fn echo_workers(plan: &'static str) -> Arc<StubModel> {
        StubModel::from_fn(move |messages| {
            let system = messages
                .iter()
                .find(|m| m.role == Role::System)
                .map(|m| m.content.clone())
                .unwrap_or_default();
            if system.contains("Available workers") {
                return Ok(plan.to_string());
            }
            let prompt = &messages.last().map(|m| m.content.clone()).unwrap_or_default();
            Ok(format!("[{system}] {prompt}"))
        })
        .into_shared()
    }

    fn workflow(model: Arc<StubModel>) -> OrchestratorWorkers {
        OrchestratorWorkers::new(ModelContext::new().with_model(model).into_shared())
            .with_worker(Worker::new("researcher", "Finds facts", "research"))
            .with_worker(Worker::new("writer", "Writes prose", "write"))
    }

    #[tokio::test]
    async fn dispatches_planned_subtasks() {
        let model = echo_workers(
            r#"Plan: {"subtasks":[{"worker":"researcher","task":"find dates"},{"worker":"writer","task":"draft intro"}]}"#,
        );
        let outcome = workflow(model).execute("history essay").await.unwrap();

        assert!(outcome.planned);
        assert_eq!(outcome.results[0]["output"], json!("[research] find dates"));
        assert_eq!(outcome.results[1]["output"], json!("[write] draft intro"));
        let text = outcome.output.as_str().unwrap();
        assert!(text.starts_with("## researcher\n[research] find dates"));
        assert!(text.contains("## writer\n[write] draft intro"));
    }

    #[tokio::test]
    async fn unknown_worker_becomes_error_entry() {
        let model = echo_workers(
            r#"{"subtasks":[{"worker":"painter","task":"paint"},{"worker":"writer","task":"write"}]}"#,
        );
        let outcome = workflow(model).execute("x").await.unwrap();

        assert_eq!(outcome.results[0]["error"], json!("unknown worker `painter`"));
        assert_eq!(outcome.results[1]["output"], json!("[write] write"));
    }

    #[tokio::test]
    async fn failed_plan_call_falls_back_to_every_worker() {
        let model = StubModel::from_fn(|messages| {
            let planning = messages
                .iter()
                .any(|m| m.role == Role::System && m.content.contains("Available workers"));
            if planning {
                return Err(FlowError::Provider("overloaded".into()));
            }
            Ok("worker reply".to_string())
        })
        .into_shared();

        let outcome = workflow(model).execute("summarize tides").await.unwrap();

        assert!(!outcome.planned);
        assert_eq!(outcome.plan.len(), 2);
        assert!(outcome.plan.iter().all(|a| a.task == "summarize tides"));
        assert_eq!(outcome.results[0]["output"], json!("worker reply"));
        assert_eq!(outcome.results[1]["output"], json!("worker reply"));
    }

    #[tokio::test]
    async fn unreadable_plan_assigns_input_to_every_worker() {
        let model = echo_workers("I would ask both workers.");
        let outcome = workflow(model).execute("summarize tides").await.unwrap();

        assert!(!outcome.planned);
        assert_eq!(outcome.plan.len(), 2);
        assert!(outcome.plan.iter().all(|a| a.task == "summarize tides"));
    }

    #[tokio::test]
    async fn plan_is_capped_and_handlers_get_context() {
        let model = echo_workers(
            r#"{"subtasks":[{"worker":"calc","task":"1"},{"worker":"calc","task":"2"},{"worker":"calc","task":"3"}]}"#,
        );
        let orchestrator = OrchestratorWorkers::new(ModelContext::new().with_model(model).into_shared())
            .with_worker(
                Worker::new("calc", "Arithmetic", "").with_handler(handler_fn(|task, info| async move {
                    Ok(json!(format!("{}:{}", info["input"].as_str().unwrap_or_default(), task)))
                })),
            )
            .with_max_assignments(2)
            .with_synthesizer(|_, results| json!(results.len()));

        let outcome = orchestrator.execute("sum").await.unwrap();

        assert_eq!(outcome.plan.len(), 2);
        assert_eq!(outcome.results[1]["output"], json!("sum:2"));
        assert_eq!(outcome.output, json!(2));
    }

    #[test]
    fn schema_lists_workers() {
        let model = echo_workers("{}");
        let schema = workflow(model).workers_schema();
        assert_eq!(schema["workers"][1]["name"], json!("writer"));
    }
}
