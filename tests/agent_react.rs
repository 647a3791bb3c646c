//! End-to-end runs of the autonomous agent against a scripted model.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sayr_flow::{
    basic_toolkit, Agent, AgentHook, AgentOptions, AgentState, AutonomousAgent, CallOptions,
    LanguageModel, Message, ModelContext, ModelResponse, PlanningStrategy, StubModel, ToolCall,
    ToolDescription,
};
use serde_json::{json, Value};

fn agent_over(model: Arc<StubModel>, options: AgentOptions) -> AutonomousAgent {
    let context = ModelContext::new().with_model(model).into_shared();
    AutonomousAgent::new(context).with_options(options)
}

#[derive(Default)]
struct StateLog(Mutex<Vec<(AgentState, AgentState)>>);

#[async_trait]
impl AgentHook for StateLog {
    async fn on_state_change(&self, from: AgentState, to: AgentState) {
        self.0.lock().unwrap().push((from, to));
    }
}

#[tokio::test]
async fn react_without_answer_runs_budget_then_one_closing_call() {
    let model = StubModel::new(Vec::<String>::new())
        .with_fallback("Keep investigating.")
        .into_shared();
    let hook = Arc::new(StateLog::default());
    let mut agent = agent_over(model.clone(), AgentOptions::default().with_max_iterations(3))
        .with_hook(hook.clone());

    let result = agent.run("Find the tallest mountain").await;

    let prompts: Vec<String> = model.calls().iter().map(|c| c.prompt().to_string()).collect();
    let thinking = prompts.iter().filter(|p| p.contains("Think about what to do next")).count();
    let closing = prompts
        .iter()
        .filter(|p| p.contains("provide a final answer or solution to the task"))
        .count();
    assert_eq!(thinking, 3);
    assert_eq!(closing, 1);
    assert_eq!(model.call_count(), 7);
    assert!(prompts.last().unwrap().contains("provide a final answer"));

    assert_eq!(result["answer"], json!("Keep investigating."));
    assert_eq!(result["steps"].as_array().unwrap().len(), 3);
    assert_eq!(agent.state(), AgentState::Completed);
    assert_eq!(
        *hook.0.lock().unwrap(),
        vec![
            (AgentState::Ready, AgentState::Running),
            (AgentState::Running, AgentState::Completed)
        ]
    );
}

#[tokio::test]
async fn placeholder_strategies_run_the_react_loop() {
    for strategy in [
        PlanningStrategy::TreeOfThought,
        PlanningStrategy::PlanAndExecute,
        PlanningStrategy::Reflexion,
    ] {
        let model = StubModel::new(["Decide.", "Final Answer: yes"]).into_shared();
        let mut agent = agent_over(model.clone(), AgentOptions::default()).with_strategy(strategy);

        let result = agent.run("Should we ship?").await;

        assert_eq!(result["answer"], json!("yes"));
        assert!(model.calls()[0].prompt().starts_with("Task: Should we ship?"));
    }
}

#[tokio::test]
async fn consecutive_failures_end_the_loop_early() {
    let model = StubModel::new(Vec::<String>::new())
        .with_fallback(r#"{"action":"fail","message":"rate limited"}"#)
        .into_shared();
    let mut agent = agent_over(
        model.clone(),
        AgentOptions::default()
            .with_max_iterations(10)
            .with_max_consecutive_errors(2),
    );

    let result = agent.run("Anything").await;

    // thinking, failed step, recovery plan, failed recovery, closing
    assert_eq!(model.call_count(), 5);
    assert_eq!(agent.steps().len(), 2);
    assert!(agent.steps().iter().all(|s| !s.success));
    assert!(result.get("answer").is_some());
    assert_eq!(agent.state(), AgentState::Completed);
}

#[tokio::test]
async fn feedback_reaches_the_step_prompt() {
    let model = StubModel::new(["Draft the itinerary", r#"{"answer": "3 days in Kyoto"}"#]).into_shared();
    let mut agent = agent_over(
        model.clone(),
        AgentOptions::default().with_approval(|_: &str, _: &Value| false),
    );
    let handle = agent.handle();

    let run = tokio::spawn(async move {
        let result = agent.run("Plan a trip").await;
        (agent, result)
    });

    assert_eq!(handle.wait_for(AgentState::Waiting).await, AgentState::Waiting);
    assert!(handle.is_waiting_for_feedback());
    assert!(handle.provide_feedback("prefer trains"));

    let (agent, result) = run.await.unwrap();
    assert_eq!(result["answer"], json!("3 days in Kyoto"));
    assert!(model.calls()[1].prompt().ends_with("Human feedback: prefer trains"));
    assert_eq!(agent.steps()[0].result["human_feedback"], json!("prefer trains"));
    assert_eq!(agent.state(), AgentState::Completed);
    assert!(!handle.provide_feedback("too late"));
}

#[tokio::test]
async fn stop_while_waiting_ends_stopped() {
    let model = StubModel::new(["Book flights"]).into_shared();
    let hook = Arc::new(StateLog::default());
    let mut agent = agent_over(
        model.clone(),
        AgentOptions::default().with_approval(|_: &str, _: &Value| false),
    )
    .with_hook(hook.clone());
    let handle = agent.handle();

    let run = tokio::spawn(async move {
        let result = agent.run("Plan a trip").await;
        (agent, result)
    });

    handle.wait_for(AgentState::Waiting).await;
    handle.stop();

    let (agent, result) = run.await.unwrap();
    assert_eq!(agent.state(), AgentState::Stopped);
    assert_eq!(
        *hook.0.lock().unwrap(),
        vec![
            (AgentState::Ready, AgentState::Running),
            (AgentState::Running, AgentState::Waiting),
            (AgentState::Waiting, AgentState::Stopped)
        ]
    );
    assert_eq!(result["stopped"], json!(true));
    assert!(result["answer"].is_null());
    assert_eq!(model.call_count(), 1);
    let step = &agent.steps()[0];
    assert!(!step.success);
    assert!(step.status.contains("cancelled"));
    assert!(!handle.is_waiting_for_feedback());
}

#[tokio::test]
async fn unbound_model_reports_error_instead_of_raising() {
    let mut agent = AutonomousAgent::new(ModelContext::new().into_shared());

    let result = agent.run("Anything").await;

    assert!(result["error"].as_str().unwrap().starts_with("configuration error"));
    assert_eq!(agent.state(), AgentState::Failed);
}

#[tokio::test]
async fn thinking_prompt_lists_registered_tools() {
    let model = StubModel::new(["Use the calculator.", "Final Answer: 4"]).into_shared();
    let context = ModelContext::new()
        .with_model(model.clone())
        .with_tools(basic_toolkit())
        .into_shared();
    let mut agent = AutonomousAgent::new(context);

    agent.run("What is 2 + 2?").await;

    let thinking = model.calls()[0].prompt().to_string();
    assert!(thinking.contains("Available tools:"));
    assert!(thinking.contains("\"calculator\""));
    assert!(thinking.contains("\"expression\""));

    let bare = StubModel::new(["Decide.", "Final Answer: yes"]).into_shared();
    let mut agent = agent_over(bare.clone(), AgentOptions::default());
    agent.run("Should we ship?").await;
    assert!(!bare.calls()[0].prompt().contains("Available tools"));
}

/// Plans in plain chat, then asks for the calculator twice in one step.
struct TwoSums;

#[async_trait]
impl LanguageModel for TwoSums {
    async fn complete_chat(
        &self,
        _messages: &[Message],
        tools: &[ToolDescription],
        _options: &CallOptions,
    ) -> sayr_flow::Result<ModelResponse> {
        if tools.is_empty() {
            return Ok(ModelResponse::text("Add both pairs."));
        }
        Ok(ModelResponse {
            content: "Final Answer: 3 and 7".into(),
            tool_calls: vec![
                ToolCall::new("calculator", json!({"expression": "1 + 2"})).with_generated_id(),
                ToolCall::new("calculator", json!({"expression": "3 + 4"})).with_generated_id(),
            ],
            ..ModelResponse::default()
        })
    }
}

#[tokio::test]
async fn repeated_tool_calls_keep_every_result() {
    let context = ModelContext::new()
        .with_model(Arc::new(TwoSums))
        .with_tools(basic_toolkit())
        .into_shared();
    let mut agent = AutonomousAgent::new(context);

    let result = agent.run("Add 1 + 2 and 3 + 4").await;

    assert_eq!(result["answer"], json!("3 and 7"));
    let results = agent.steps()[0].result["tool_results"].as_array().unwrap().clone();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r["name"] == "calculator" && r["success"] == true));
    assert_eq!(results[0]["result"], json!("3"));
    assert_eq!(results[1]["result"], json!("7"));
    assert_ne!(results[0]["id"], results[1]["id"]);
}
