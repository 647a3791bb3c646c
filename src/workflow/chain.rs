use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use super::{render_template, value_text, StepLog, Workflow};
use crate::context::SharedContext;
use crate::error::{FlowError, Result};

pub type Validator = Arc<dyn Fn(&Value) -> bool + Send + Sync>;
pub type Transformer = Arc<dyn Fn(&Value) -> Value + Send + Sync>;
/// Returns `false` to skip the step.
pub type Gate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// One stage of a [`PromptChain`].
#[derive(Clone)]
pub struct ChainStep {
    pub name: String,
    pub prompt_template: String,
    system_prompt: Option<String>,
    validator: Option<Validator>,
    transformer: Option<Transformer>,
    gate: Option<Gate>,
    use_tools: bool,
}

impl fmt::Debug for ChainStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainStep")
            .field("name", &self.name)
            .field("prompt_template", &self.prompt_template)
            .field("system_prompt", &self.system_prompt)
            .field("has_validator", &self.validator.is_some())
            .field("has_transformer", &self.transformer.is_some())
            .field("has_gate", &self.gate.is_some())
            .field("use_tools", &self.use_tools)
            .finish()
    }
}

impl ChainStep {
    pub fn new(name: impl Into<String>, prompt_template: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prompt_template: prompt_template.into(),
            system_prompt: None,
            validator: None,
            transformer: None,
            gate: None,
            use_tools: false,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Receives `{name, prompt, response}`. Returning `false` aborts the chain.
    pub fn with_validator(mut self, validator: impl Fn(&Value) -> bool + Send + Sync + 'static) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Maps the step result to the context handed to the next step.
    pub fn with_transformer(
        mut self,
        transformer: impl Fn(&Value) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.transformer = Some(Arc::new(transformer));
        self
    }

    pub fn with_gate(mut self, gate: impl Fn(&Value) -> bool + Send + Sync + 'static) -> Self {
        self.gate = Some(Arc::new(gate));
        self
    }

    /// Advertises the context's tools and dispatches any calls the model makes.
    pub fn with_tools(mut self) -> Self {
        self.use_tools = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainOutcome {
    /// Results of the steps that ran, in order.
    pub steps: Vec<Value>,
    pub skipped: Vec<String>,
    pub final_output: Value,
}

impl ChainOutcome {
    pub fn final_text(&self) -> String {
        value_text(&self.final_output)
    }

    pub fn step(&self, name: &str) -> Option<&Value> {
        self.steps
            .iter()
            .find(|s| s.get("name").and_then(Value::as_str) == Some(name))
    }
}

/// Runs steps in order, each prompt rendered from the previous step's output.
pub struct PromptChain {
    context: SharedContext,
    steps: Vec<ChainStep>,
    log: StepLog,
}

impl PromptChain {
    pub fn new(context: SharedContext) -> Self {
        Self {
            context,
            steps: Vec::new(),
            log: StepLog::new("prompt_chain"),
        }
    }

    pub fn with_step(mut self, step: ChainStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn add_step(&mut self, step: ChainStep) -> &mut Self {
        self.steps.push(step);
        self
    }

    pub fn with_step_callback(mut self, callback: impl Fn(&str, &Value) + Send + Sync + 'static) -> Self {
        self.log.set_callback(Arc::new(callback));
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.log.set_max_steps(max_steps);
        self
    }

    pub fn steps(&self) -> &[ChainStep] {
        &self.steps
    }

    pub async fn execute(&self, input: &str) -> Result<ChainOutcome> {
        self.log.ensure_within_budget(self.steps.len())?;
        debug!(steps = self.steps.len(), "running prompt chain");

        let mut branch = self.context.lock().await.fork(None);
        let default_system = branch.system_prompt().to_string();
        let mut current = json!({ "input": input });
        let mut records = Vec::with_capacity(self.steps.len());
        let mut skipped = Vec::new();

        for step in &self.steps {
            if let Some(gate) = &step.gate {
                if !gate(&current) {
                    info!(step = %step.name, "gate closed, skipping step");
                    skipped.push(step.name.clone());
                    continue;
                }
            }

            let mut vars: Map<String, Value> = match &current {
                Value::Object(map) => map.clone(),
                _ => Map::new(),
            };
            vars.entry("input")
                .or_insert_with(|| Value::String(input.to_string()));
            vars.insert("previous".into(), Value::String(value_text(&current)));
            let (mut prompt, templated) = render_template(&step.prompt_template, &vars);
            if !templated {
                let text = value_text(&current);
                if !text.is_empty() {
                    prompt = format!("{prompt}\n\n{text}");
                }
            }

            let mut result = json!({ "name": step.name, "prompt": prompt });
            if step.use_tools {
                branch.set_system_prompt(
                    step.system_prompt.clone().unwrap_or_else(|| default_system.clone()),
                );
                let response = branch.chat_with_tools(prompt).await?;
                let mut calls = Vec::with_capacity(response.tool_calls.len());
                for call in &response.tool_calls {
                    let entry = match branch.execute_tool_call(call) {
                        Ok(outcome) => json!({
                            "name": call.name,
                            "arguments": call.arguments,
                            "success": outcome.success,
                            "result": outcome.content,
                        }),
                        Err(err) => {
                            warn!(step = %step.name, tool = %call.name, error = %err, "tool call failed");
                            json!({
                                "name": call.name,
                                "arguments": call.arguments,
                                "success": false,
                                "error": err.to_string(),
                            })
                        }
                    };
                    calls.push(entry);
                }
                result["response"] = Value::String(response.content);
                result["tool_calls"] = Value::Array(calls);
                if let Some(err) = response.error {
                    result["error"] = Value::String(err);
                }
            } else {
                let response = branch
                    .complete(step.system_prompt.as_deref(), &prompt, None)
                    .await?;
                result["response"] = Value::String(response.content);
                if let Some(err) = response.error {
                    result["error"] = Value::String(err);
                }
            }

            if let Some(validator) = &step.validator {
                if !validator(&result) {
                    error!(step = %step.name, "step validation failed");
                    return Err(FlowError::StepRejected {
                        step: step.name.clone(),
                    });
                }
            }

            self.log.record(&step.name, &result);
            current = match &step.transformer {
                Some(transform) => transform(&result),
                None => result.clone(),
            };
            records.push(result);
        }

        Ok(ChainOutcome {
            steps: records,
            skipped,
            final_output: current,
        })
    }
}

#[async_trait]
impl Workflow for PromptChain {
    fn name(&self) -> &str {
        "prompt_chain"
    }

    async fn run(&self, input: &str) -> Result<Value> {
        let outcome = self.execute(input).await?;
        Ok(serde_json::to_value(outcome)?)
    }
}
