use async_trait::async_trait;
use serde_json::Value;

use crate::agent::{AgentState, Step};

/// Synchronous approval predicate consulted before each agent step.
pub trait ApprovalHandler: Send + Sync {
    fn approve(&self, message: &str, context: &Value) -> bool;
}

impl<F> ApprovalHandler for F
where
    F: Fn(&str, &Value) -> bool + Send + Sync,
{
    fn approve(&self, message: &str, context: &Value) -> bool {
        self(message, context)
    }
}

/// Observer for agent runs. Every method defaults to a no-op.
#[async_trait]
pub trait AgentHook: Send + Sync {
    async fn on_state_change(&self, _from: AgentState, _to: AgentState) {}

    async fn on_step(&self, _step: &Step) {}

    async fn on_status(&self, _status: &str) {}
}
