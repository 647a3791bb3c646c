use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::{StepLog, Workflow};
use crate::config::EvaluatorConfig;
use crate::context::{ModelContext, SharedContext};
use crate::error::{FlowError, Result};
use crate::llm::extract_json;

const DEFAULT_OPTIMIZER_PROMPT: &str = "You produce the best possible response to the user's \
     request. When feedback is provided, use it to improve your previous response.";
const DEFAULT_EVALUATOR_PROMPT: &str = "You critically assess responses and give honest, \
     specific feedback on how to improve them.";

/// Returns `None` to defer to the model for this iteration.
pub type OptimizerFn = Arc<dyn Fn(&str, Option<&Evaluation>) -> Option<String> + Send + Sync>;
/// Scores `(input, response)`. Returns `None` to defer to the model.
pub type EvaluatorFn = Arc<dyn Fn(&str, &str) -> Option<(f64, String)> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub iteration: usize,
    pub score: f64,
    pub feedback: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatorOutcome {
    pub final_response: String,
    pub iterations: usize,
    pub final_score: f64,
    pub evaluations: Vec<Evaluation>,
}

/// Produce, score, refine until the score clears the bar or the budget runs out.
pub struct EvaluatorOptimizer {
    context: SharedContext,
    optimizer_prompt: String,
    evaluator_prompt: String,
    criteria: Vec<String>,
    optimizer: Option<OptimizerFn>,
    evaluator: Option<EvaluatorFn>,
    max_iterations: usize,
    min_acceptable_score: f64,
    log: StepLog,
}

impl EvaluatorOptimizer {
    pub fn new(context: SharedContext) -> Self {
        let defaults = EvaluatorConfig::default();
        Self {
            context,
            optimizer_prompt: DEFAULT_OPTIMIZER_PROMPT.to_string(),
            evaluator_prompt: DEFAULT_EVALUATOR_PROMPT.to_string(),
            criteria: Vec::new(),
            optimizer: None,
            evaluator: None,
            max_iterations: defaults.max_iterations,
            min_acceptable_score: defaults.min_acceptable_score,
            log: StepLog::new("evaluator_optimizer"),
        }
    }

    pub fn with_config(self, config: &EvaluatorConfig) -> Self {
        self.with_max_iterations(config.max_iterations)
            .with_min_acceptable_score(config.min_acceptable_score)
    }

    pub fn with_optimizer_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.optimizer_prompt = prompt.into();
        self
    }

    pub fn with_evaluator_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.evaluator_prompt = prompt.into();
        self
    }

    pub fn with_criteria<S: Into<String>>(mut self, criteria: impl IntoIterator<Item = S>) -> Self {
        self.criteria = criteria.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_optimizer(
        mut self,
        optimizer: impl Fn(&str, Option<&Evaluation>) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.optimizer = Some(Arc::new(optimizer));
        self
    }

    pub fn with_evaluator(
        mut self,
        evaluator: impl Fn(&str, &str) -> Option<(f64, String)> + Send + Sync + 'static,
    ) -> Self {
        self.evaluator = Some(Arc::new(evaluator));
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    pub fn with_min_acceptable_score(mut self, score: f64) -> Self {
        self.min_acceptable_score = score;
        self
    }

    pub fn with_step_callback(mut self, callback: impl Fn(&str, &Value) + Send + Sync + 'static) -> Self {
        self.log.set_callback(Arc::new(callback));
        self
    }

    fn evaluator_system(&self) -> String {
        let mut prompt = self.evaluator_prompt.clone();
        if !self.criteria.is_empty() {
            prompt.push_str("\n\nEvaluation criteria:\n");
            for (i, criterion) in self.criteria.iter().enumerate() {
                prompt.push_str(&format!("{}. {}\n", i + 1, criterion));
            }
        }
        prompt.push_str(
            "\nRespond with JSON only: {\"score\": <number between 0 and 1>, \"feedback\": \"<how to improve>\"}",
        );
        prompt
    }

    async fn optimize(
        &self,
        branch: &ModelContext,
        input: &str,
        previous: Option<(&str, &Evaluation)>,
    ) -> Result<String> {
        if let Some(optimizer) = &self.optimizer {
            if let Some(response) = optimizer(input, previous.map(|(_, e)| e)) {
                return Ok(response);
            }
        }
        let prompt = match previous {
            None => input.to_string(),
            Some((response, evaluation)) => format!(
                "{input}\n\nPrevious response:\n{response}\n\nFeedback:\n{}\n\nImprove the response based on the feedback.",
                evaluation.feedback
            ),
        };
        let reply = branch
            .complete(Some(&self.optimizer_prompt), &prompt, None)
            .await?;
        match reply.error {
            Some(err) => Err(FlowError::Provider(err)),
            None => Ok(reply.content),
        }
    }

    async fn evaluate(&self, branch: &ModelContext, input: &str, response: &str) -> Result<(f64, String)> {
        if let Some(evaluator) = &self.evaluator {
            if let Some(verdict) = evaluator(input, response) {
                return Ok(verdict);
            }
        }
        let prompt = format!("Request:\n{input}\n\nResponse:\n{response}");
        let reply = branch
            .complete(Some(&self.evaluator_system()), &prompt, None)
            .await?;
        match reply.error {
            Some(err) => Err(FlowError::Provider(err)),
            None => Ok(parse_evaluation(&reply.content)),
        }
    }

    /// A failed model call costs its iteration a score of 0 and never aborts the run.
    /// When the optimizer fails, the previous candidate is kept.
    pub async fn execute(&self, input: &str) -> Result<EvaluatorOutcome> {
        let branch = self.context.lock().await.fork(None);
        let mut evaluations: Vec<Evaluation> = Vec::new();
        let mut response = String::new();
        let mut scored: Option<Evaluation> = None;

        for iteration in 1..=self.max_iterations {
            let previous = scored.as_ref().map(|e| (response.as_str(), e));
            let candidate = match self.optimize(&branch, input, previous).await {
                Ok(candidate) => candidate,
                Err(FlowError::Provider(err)) => {
                    warn!(iteration, error = %err, "optimizer call failed, keeping previous response");
                    let evaluation = Evaluation {
                        iteration,
                        score: 0.0,
                        feedback: format!("optimizer failed: {err}"),
                    };
                    self.log.record(
                        &format!("iteration_{iteration}"),
                        &json!({ "response": Value::Null, "evaluation": evaluation }),
                    );
                    evaluations.push(evaluation);
                    continue;
                }
                Err(other) => return Err(other),
            };
            let (score, feedback) = match self.evaluate(&branch, input, &candidate).await {
                Ok(verdict) => verdict,
                Err(FlowError::Provider(err)) => {
                    warn!(iteration, error = %err, "evaluator call failed, scoring 0");
                    (0.0, format!("evaluation failed: {err}"))
                }
                Err(other) => return Err(other),
            };
            debug!(iteration, score, "response evaluated");

            let evaluation = Evaluation {
                iteration,
                score,
                feedback,
            };
            self.log.record(
                &format!("iteration_{iteration}"),
                &json!({ "response": candidate, "evaluation": evaluation }),
            );
            response = candidate;
            scored = Some(evaluation.clone());
            evaluations.push(evaluation);
            if score >= self.min_acceptable_score {
                break;
            }
        }

        let final_score = scored.map(|e| e.score).unwrap_or_default();
        info!(
            iterations = evaluations.len(),
            final_score,
            accepted = final_score >= self.min_acceptable_score,
            "evaluator-optimizer finished"
        );
        Ok(EvaluatorOutcome {
            final_response: response,
            iterations: evaluations.len(),
            final_score,
            evaluations,
        })
    }
}

fn score_line() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)score\W{0,3}\s*([0-9]+(?:\.[0-9]+)?)").expect("score pattern compiles")
    })
}

/// Scores above 1 are read as out of 10, or out of 100 above 10.
fn normalize_score(raw: f64) -> f64 {
    let score = if raw > 10.0 {
        raw / 100.0
    } else if raw > 1.0 {
        raw / 10.0
    } else {
        raw
    };
    score.clamp(0.0, 1.0)
}

fn parse_evaluation(reply: &str) -> (f64, String) {
    if let Some(parsed) = extract_json(reply) {
        let score = match parsed.get("score") {
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        };
        if let Some(score) = score {
            let feedback = parsed
                .get("feedback")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            return (normalize_score(score), feedback);
        }
    }
    let score = score_line()
        .captures(reply)
        .and_then(|caps| caps[1].parse::<f64>().ok())
        .map(normalize_score)
        .unwrap_or(0.0);
    (score, reply.trim().to_string())
}

#[async_trait]
impl Workflow for EvaluatorOptimizer {
    fn name(&self) -> &str {
        "evaluator_optimizer"
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
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn parses_json_and_score_lines() {
        assert_eq!(
            parse_evaluation(r#"{"score": 0.75, "feedback": "tighten it"}"#),
            (0.75, "tighten it".to_string())
        );
        assert_eq!(parse_evaluation(r#"{"score": 8, "feedback": ""}"#).0, 0.8);
        assert_eq!(parse_evaluation("Score: 85\nSolid.").0, 0.85);
        assert_eq!(parse_evaluation("no number here").0, 0.0);
    }

    #[tokio::test]
    async fn refines_until_score_clears_bar() {
        let model = StubModel::new(["draft 1", "draft 2", "draft 3"]).into_shared();
        let context = ModelContext::new().with_model(model.clone()).into_shared();
        let scores = [0.5, 0.7, 0.9];
        let turn = AtomicUsize::new(0);
        let workflow = EvaluatorOptimizer::new(context)
            .with_min_acceptable_score(0.85)
            .with_evaluator(move |_, _| {
                let i = turn.fetch_add(1, Ordering::SeqCst);
                Some((scores[i], format!("feedback {}", i + 1)))
            });

        let outcome = workflow.execute("write a haiku").await.unwrap();

        assert_eq!(outcome.iterations, 3);
        assert_eq!(outcome.evaluations.len(), 3);
        assert!(outcome.final_score >= 0.85);
        assert_eq!(outcome.final_response, "draft 3");
        let second = &model.calls()[1];
        assert!(second.prompt().contains("Previous response:\ndraft 1"));
        assert!(second.prompt().contains("Feedback:\nfeedback 1"));
    }

    #[tokio::test]
    async fn provider_failure_costs_one_iteration() {
        let model = StubModel::new(["draft 1", r#"{"action":"fail","message":"overloaded"}"#])
            .with_fallback("draft 3")
            .into_shared();
        let context = ModelContext::new().with_model(model.clone()).into_shared();
        let workflow = EvaluatorOptimizer::new(context)
            .with_max_iterations(3)
            .with_min_acceptable_score(0.9)
            .with_evaluator(|_, response| Some((0.1, format!("weak: {response}"))));

        let outcome = workflow.execute("write a haiku").await.unwrap();

        assert_eq!(outcome.iterations, 3);
        let failed = &outcome.evaluations[1];
        assert_eq!(failed.score, 0.0);
        assert!(failed.feedback.contains("overloaded"));
        assert_eq!(outcome.final_response, "draft 3");
        assert_eq!(outcome.final_score, 0.1);
        // The retry after the failure still refines the last scored draft.
        let third = &model.calls()[2];
        assert!(third.prompt().contains("Previous response:\ndraft 1"));
        assert!(third.prompt().contains("Feedback:\nweak: draft 1"));
    }

    #[tokio::test]
    async fn evaluator_failure_scores_zero() {
        let model = StubModel::new(["only draft", r#"{"action":"fail","message":"timeout upstream"}"#])
            .into_shared();
        let context = ModelContext::new().with_model(model).into_shared();
        let workflow = EvaluatorOptimizer::new(context).with_max_iterations(1);

        let outcome = workflow.execute("q").await.unwrap();

        assert_eq!(outcome.final_response, "only draft");
        assert_eq!(outcome.final_score, 0.0);
        assert!(outcome.evaluations[0].feedback.starts_with("evaluation failed: timeout upstream"));
    }

    #[tokio::test]
    async fn stops_at_iteration_budget() {
        let model = StubModel::new(Vec::<String>::new())
            .with_fallback(r#"{"score": 0.2, "feedback": "weak"}"#)
            .into_shared();
        let context = ModelContext::new().with_model(model.clone()).into_shared();
        let workflow = EvaluatorOptimizer::new(context)
            .with_config(&EvaluatorConfig {
                max_iterations: 2,
                min_acceptable_score: 0.9,
            })
            .with_optimizer(|_, previous| Some(format!("attempt after {:?}", previous.map(|e| e.iteration))))
            .with_criteria(["Accuracy", "Brevity"]);

        let outcome = workflow.execute("q").await.unwrap();

        assert_eq!(outcome.iterations, 2);
        assert_eq!(outcome.final_response, "attempt after Some(1)");
        let system = model.calls()[0].system().unwrap_or_default().to_string();
        assert!(system.contains("1. Accuracy\n2. Brevity"));
        assert_eq!(model.call_count(), 2);
    }
}
