use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use sayr_flow::{
    Agent, AgentOptions, AppConfig, AutonomousAgent, ConfigLookup, EnvFile, ErrorKind, FlowError,
    FunctionTool, ModelContext, Parameter, PlanningStrategy, Tool, ToolRegistry, ToolResult,
};
use serde_json::json;

#[test]
fn missing_required_parameter_skips_callback() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let tool = FunctionTool::new("calculator", "Evaluate arithmetic")
        .with_parameter(Parameter::required("expression", "string", "Expression to evaluate"))
        .with_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            ToolResult::ok("never")
        });

    let result = tool.execute(&json!({}));

    assert!(!result.success);
    assert!(result.content.contains("expression"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn registry_lookup_errors_are_typed() {
    let registry = ToolRegistry::new();
    let err = registry.execute("web_search", &json!({})).unwrap_err();
    assert!(matches!(err, FlowError::ToolNotFound(ref name) if name == "web_search"));
    assert_eq!(err.kind(), ErrorKind::Lookup);
}

#[tokio::test]
async fn configured_stub_drives_an_agent() {
    let config = AppConfig::from_toml(
        r#"
        [model]
        provider = "stub"
        model = "scripted"
        script = ["{\"answer\": \"hello\"}"]

        [agent]
        strategy = "zero_shot"
        max_iterations = 4
        human_feedback_enabled = false

        [call]
        temperature = 0.2
        "#,
    )
    .unwrap();
    assert_eq!(config.agent.strategy, PlanningStrategy::ZeroShot);
    assert_eq!(config.evaluator.max_iterations, 5);

    let model = config.build_model().unwrap();
    let context = ModelContext::new()
        .with_model(model)
        .with_options(config.call.clone())
        .into_shared();
    let options = AgentOptions::from(&config.agent);
    assert_eq!(options.max_iterations, 4);
    let mut agent = AutonomousAgent::new(context)
        .with_options(options)
        .with_strategy(config.agent.strategy);

    let result = agent.run("Say hello").await;

    assert_eq!(result["answer"], json!("{\"answer\": \"hello\"}"));
}

#[test]
fn unknown_provider_is_configuration_error() {
    let config = AppConfig::from_toml("[model]\nprovider = \"acme\"\nmodel = \"x\"\n").unwrap();
    let err = config.build_model().err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[test]
fn env_file_feeds_api_key_lookup() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(".env");
    std::fs::write(&path, "# keys\nexport OPENAI_API_KEY=\"sk-test\"\nEMPTY=\n").unwrap();

    let env = EnvFile::from_path(&path).unwrap();
    let config = AppConfig::from_toml("[model]\nprovider = \"openai\"\nmodel = \"gpt\"\n").unwrap();

    assert_eq!(config.model.resolve_api_key(&env).as_deref(), Some("sk-test"));
    assert_eq!(env.get_or("SAYR_FLOW_SURELY_UNSET_KEY", "fallback"), "fallback");

    let mut overrides = HashMap::new();
    overrides.insert("OPENAI_API_KEY".to_string(), "sk-map".to_string());
    assert_eq!(config.model.resolve_api_key(&overrides).as_deref(), Some("sk-map"));
}
