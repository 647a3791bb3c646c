use std::env;
use std::sync::Arc;

use sayr_flow::workflow::{ChainStep, PromptChain};
use sayr_flow::{
    basic_toolkit, init_tracing, Agent, AgentOptions, AgentState, AppConfig, AutonomousAgent,
    ModelContext, StubModel, Workflow,
};
use tracing::info;

#[tokio::main]
async fn main() -> sayr_flow::Result<()> {
    let path = env::args()
        .nth(1)
        .unwrap_or_else(|| concat!(env!("CARGO_MANIFEST_DIR"), "/config.toml").to_string());
    let config = AppConfig::from_env_or_file(&path)?;
    init_tracing(&config.logging);
    info!(config = %path, provider = %config.model.provider, "loaded configuration");

    let context = ModelContext::new()
        .with_model(config.build_model()?)
        .with_tools(basic_toolkit())
        .with_options(config.call.clone())
        .into_shared();

    let mut agent = AutonomousAgent::new(context)
        .with_options(AgentOptions::from(&config.agent))
        .with_strategy(config.agent.strategy);
    if let Some(prompt) = &config.agent.system_prompt {
        agent = agent.with_system_prompt(prompt.clone());
    }

    let result = agent.run("What is (12 + 30) * 2?").await;
    println!("{}", serde_json::to_string_pretty(&result)?);
    if agent.state() != AgentState::Completed {
        return Ok(());
    }

    // A two-step chain over its own scripted model.
    let writer = Arc::new(StubModel::new([
        "- ownership\n- borrowing",
        "Ownership gives every value one owner; borrowing lends access without moving it.",
    ]));
    let chain = PromptChain::new(ModelContext::new().with_model(writer).into_shared())
        .with_step(ChainStep::new("outline", "List the key ideas of {{input}}."))
        .with_step(ChainStep::new("explain", "Explain these ideas in one sentence:"));
    let outcome = chain.run("Rust memory safety").await?;
    println!("{}", serde_json::to_string_pretty(&outcome["final_output"])?);
    Ok(())
}
