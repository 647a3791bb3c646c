//! Agent and workflow orchestration over language models and tools.
//!
//! The crate provides:
//! - A language model abstraction (`LanguageModel`) with a scriptable `StubModel`.
//! - A tool interface (`Tool`, `FunctionTool` and `ToolRegistry`).
//! - A shared `ModelContext` holding the model, tools, memory and call options.
//! - An `AutonomousAgent` that drives a REACT loop with optional human approval.
//! - Workflow primitives in [`workflow`]: chaining, routing, parallelization,
//!   orchestrator-workers and evaluator-optimizer.

mod agent;
mod config;
mod context;
mod error;
mod hooks;
mod llm;
mod memory;
mod message;
mod metrics;
mod telemetry;
mod tool;
mod toolkit;
pub mod workflow;

pub use agent::{
    Agent, AgentHandle, AgentState, AutonomousAgent, Options as AgentOptions, PlanningStrategy,
    Step,
};
pub use config::{
    AgentConfig, AppConfig, ConfigLookup, EnvFile, EvaluatorConfig, LoggingConfig, ModelConfig,
};
pub use context::{ChatStream, ModelContext, SharedContext};
pub use error::{ErrorKind, FlowError, Result};
pub use hooks::{AgentHook, ApprovalHandler};
pub use llm::{extract_json, CallOptions, ChunkStream, LanguageModel, ModelResponse, RecordedCall, StubModel};
pub use memory::{ConversationMemory, HistoryWindow, Memory, MemoryHit, MemoryType};
pub use message::{Message, Role, ToolCall};
pub use metrics::{MetricsTracker, RunGuard, RunReport};
pub use telemetry::{init_tracing, FailureRecord, RetryPolicy, TelemetryCollector, TelemetryEvent};
pub use tool::{FunctionTool, Parameter, Tool, ToolCallback, ToolDescription, ToolRegistry, ToolResult};
pub use toolkit::{basic_toolkit, CalculatorTool, EchoTool, ReadFileTool, WriteFileTool};
pub use workflow::{Handler, Workflow};
