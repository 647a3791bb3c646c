use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{value_text, StepLog, Workflow};
use crate::context::{ModelContext, SharedContext};
use crate::error::{FlowError, Result};
use crate::llm::CallOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Independent subtasks, one branch per registered task.
    #[default]
    Sectioning,
    /// A single task replicated for consensus, or several voters.
    Voting,
}

pub type PromptFn = Arc<dyn Fn(&str) -> String + Send + Sync>;
pub type ResultParser = Arc<dyn Fn(&str) -> Value + Send + Sync>;
pub type Aggregator = Arc<dyn Fn(&[BranchResult]) -> Value + Send + Sync>;
pub type Perturbation = Arc<dyn Fn(usize, &CallOptions) -> CallOptions + Send + Sync>;

#[derive(Clone)]
pub struct ParallelTask {
    pub name: String,
    pub system_prompt: String,
    prompt_fn: Option<PromptFn>,
    parser: Option<ResultParser>,
    options: Option<CallOptions>,
}

impl fmt::Debug for ParallelTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParallelTask")
            .field("name", &self.name)
            .field("system_prompt", &self.system_prompt)
            .field("has_prompt_fn", &self.prompt_fn.is_some())
            .field("has_parser", &self.parser.is_some())
            .finish()
    }
}

impl ParallelTask {
    pub fn new(name: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            system_prompt: system_prompt.into(),
            prompt_fn: None,
            parser: None,
            options: None,
        }
    }

    /// Builds the branch prompt from the workflow input. Defaults to the input itself.
    pub fn with_prompt(mut self, prompt_fn: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        self.prompt_fn = Some(Arc::new(prompt_fn));
        self
    }

    pub fn with_parser(mut self, parser: impl Fn(&str) -> Value + Send + Sync + 'static) -> Self {
        self.parser = Some(Arc::new(parser));
        self
    }

    pub fn with_options(mut self, options: CallOptions) -> Self {
        self.options = Some(options);
        self
    }

    fn prompt_for(&self, input: &str) -> String {
        match &self.prompt_fn {
            Some(build) => build(input),
            None => input.to_string(),
        }
    }
}

/// Outcome of one branch. A failed branch carries its error text.
#[derive(Debug, Clone, PartialEq)]
pub struct BranchResult {
    pub name: String,
    pub index: usize,
    pub output: std::result::Result<Value, String>,
}

impl BranchResult {
    pub fn is_ok(&self) -> bool {
        self.output.is_ok()
    }

    pub fn to_json(&self) -> Value {
        match &self.output {
            Ok(output) => json!({ "name": self.name, "index": self.index, "output": output }),
            Err(error) => json!({ "name": self.name, "index": self.index, "error": error }),
        }
    }
}

/// Most frequent value and its count. Strings compare trimmed; ties go to the first seen.
pub fn majority_vote(values: &[Value]) -> Option<(Value, usize)> {
    tally(values).into_iter().next()
}

fn tally(values: &[Value]) -> Vec<(Value, usize)> {
    let mut counts: Vec<(Value, usize)> = Vec::new();
    for value in values {
        let key = match value {
            Value::String(text) => Value::String(text.trim().to_string()),
            other => other.clone(),
        };
        match counts.iter_mut().find(|(seen, _)| *seen == key) {
            Some((_, count)) => *count += 1,
            None => counts.push((key, 1)),
        }
    }
    // stable sort keeps first-seen order among equal counts
    counts.sort_by(|a, b| b.1.cmp(&a.1));
    counts
}

struct BranchPlan {
    name: String,
    system_prompt: String,
    prompt: String,
    parser: Option<ResultParser>,
    options: Option<CallOptions>,
}

/// Fan-out/fan-in over independent model calls.
pub struct Parallelization {
    context: SharedContext,
    mode: Mode,
    tasks: Vec<ParallelTask>,
    aggregator: Option<Aggregator>,
    voting_threshold: f64,
    replicas: usize,
    perturbation: Perturbation,
    branch_timeout: Option<Duration>,
    log: StepLog,
}

impl Parallelization {
    pub const DEFAULT_REPLICAS: usize = 5;

    pub fn new(context: SharedContext, mode: Mode) -> Self {
        Self {
            context,
            mode,
            tasks: Vec::new(),
            aggregator: None,
            voting_threshold: 0.5,
            replicas: Self::DEFAULT_REPLICAS,
            perturbation: Arc::new(spread_temperature),
            branch_timeout: None,
            log: StepLog::new("parallelization"),
        }
    }

    pub fn with_task(mut self, task: ParallelTask) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn add_task(&mut self, task: ParallelTask) -> &mut Self {
        self.tasks.push(task);
        self
    }

    pub fn with_aggregator(
        mut self,
        aggregator: impl Fn(&[BranchResult]) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.aggregator = Some(Arc::new(aggregator));
        self
    }

    /// Share of votes the winner needs for `consensus`.
    pub fn with_voting_threshold(mut self, threshold: f64) -> Self {
        self.voting_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    /// Number of copies made of a lone voting task.
    pub fn with_replicas(mut self, replicas: usize) -> Self {
        self.replicas = replicas.max(1);
        self
    }

    pub fn with_perturbation(
        mut self,
        perturb: impl Fn(usize, &CallOptions) -> CallOptions + Send + Sync + 'static,
    ) -> Self {
        self.perturbation = Arc::new(perturb);
        self
    }

    pub fn with_branch_timeout(mut self, timeout: Duration) -> Self {
        self.branch_timeout = Some(timeout);
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.log.set_max_steps(max_steps);
        self
    }

    pub fn with_step_callback(mut self, callback: impl Fn(&str, &Value) + Send + Sync + 'static) -> Self {
        self.log.set_callback(Arc::new(callback));
        self
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    fn plan(&self, input: &str, base: &CallOptions) -> Vec<BranchPlan> {
        let to_plan = |task: &ParallelTask, name: String, options: Option<CallOptions>| BranchPlan {
            name,
            system_prompt: task.system_prompt.clone(),
            prompt: task.prompt_for(input),
            parser: task.parser.clone(),
            options,
        };

        match (self.mode, self.tasks.as_slice()) {
            (Mode::Voting, [task]) => {
                let base = task.options.clone().unwrap_or_else(|| base.clone());
                (0..self.replicas)
                    .map(|i| {
                        let options = (self.perturbation)(i, &base);
                        to_plan(task, format!("{}#{}", task.name, i + 1), Some(options))
                    })
                    .collect()
            }
            _ => self
                .tasks
                .iter()
                .map(|task| to_plan(task, task.name.clone(), task.options.clone()))
                .collect(),
        }
    }

    /// Runs every branch and returns their results in registration order.
    pub async fn run_branches(&self, input: &str) -> Result<Vec<BranchResult>> {
        if self.tasks.is_empty() {
            return Err(FlowError::Validation("parallelization has no tasks".into()));
        }

        let (plans, forks): (Vec<BranchPlan>, Vec<ModelContext>) = {
            let parent = self.context.lock().await;
            let plans = self.plan(input, parent.options());
            self.log.ensure_within_budget(plans.len())?;
            let forks = plans
                .iter()
                .map(|plan| {
                    if plan.system_prompt.is_empty() {
                        parent.fork(None)
                    } else {
                        parent.fork(Some(&plan.system_prompt))
                    }
                })
                .collect();
            (plans, forks)
        };
        debug!(branches = plans.len(), mode = ?self.mode, "fanning out");

        let timeout = self.branch_timeout;
        let branches = plans
            .into_iter()
            .zip(forks)
            .enumerate()
            .map(|(index, (plan, branch))| async move {
                let call = branch.complete(None, &plan.prompt, plan.options.as_ref());
                let outcome = match timeout {
                    Some(limit) => match tokio::time::timeout(limit, call).await {
                        Ok(result) => result,
                        Err(_) => Err(FlowError::Timeout(format!(
                            "branch `{}` exceeded {limit:?}",
                            plan.name
                        ))),
                    },
                    None => call.await,
                };
                let output = match outcome {
                    Ok(response) => match response.error {
                        Some(error) => Err(error),
                        None => Ok(match &plan.parser {
                            Some(parse) => parse(&response.content),
                            None => Value::String(response.content),
                        }),
                    },
                    Err(err) => Err(err.to_string()),
                };
                if let Err(error) = &output {
                    warn!(branch = %plan.name, error = %error, "branch failed");
                }
                BranchResult {
                    name: plan.name,
                    index,
                    output,
                }
            });

        let results = join_all(branches).await;
        for result in &results {
            self.log.record(&result.name, &result.to_json());
        }
        Ok(results)
    }

    pub fn aggregate(&self, results: &[BranchResult]) -> Value {
        match (&self.aggregator, self.mode) {
            (Some(aggregate), _) => aggregate(results),
            (None, Mode::Sectioning) => sections(results),
            (None, Mode::Voting) => vote(results, self.voting_threshold),
        }
    }
}

fn spread_temperature(index: usize, base: &CallOptions) -> CallOptions {
    let temperature = (base.temperature + 0.1 * index as f32).min(1.5);
    base.clone().with_temperature(temperature)
}

fn sections(results: &[BranchResult]) -> Value {
    let mut ordered: Vec<&BranchResult> = results.iter().collect();
    ordered.sort_by_key(|r| r.index);

    let combined = ordered
        .iter()
        .map(|r| {
            let body = match &r.output {
                Ok(output) => value_text(output),
                Err(error) => format!("Error: {error}"),
            };
            format!("## {}\n{}", r.name, body)
        })
        .collect::<Vec<_>>()
        .join("\n\n");
    let entries: Vec<Value> = ordered.iter().map(|r| r.to_json()).collect();
    json!({ "sections": entries, "combined": combined })
}

fn vote(results: &[BranchResult], threshold: f64) -> Value {
    let ballots: Vec<Value> = results
        .iter()
        .filter_map(|r| r.output.as_ref().ok().cloned())
        .collect();
    let failed = results.len() - ballots.len();
    let counts = tally(&ballots);
    let Some((winner, votes)) = counts.first().cloned() else {
        return json!({ "result": Value::Null, "votes": 0, "total": 0, "failed": failed, "consensus": false });
    };

    let total = ballots.len();
    let agreement = votes as f64 / total as f64;
    let consensus = agreement > threshold || (threshold >= 1.0 && votes == total);
    let breakdown: Vec<Value> = counts
        .iter()
        .map(|(value, count)| json!({ "value": value, "count": count }))
        .collect();
    json!({
        "result": winner,
        "votes": votes,
        "total": total,
        "failed": failed,
        "agreement": agreement,
        "consensus": consensus,
        "tally": breakdown,
    })
}

#[async_trait]
impl Workflow for Parallelization {
    fn name(&self) -> &str {
        "parallelization"
    }

    async fn run(&self, input: &str) -> Result<Value> {
        let results = self.run_branches(input).await?;
        Ok(self.aggregate(&results))
    }
}
