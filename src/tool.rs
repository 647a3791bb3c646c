use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::error::{FlowError, Result};

/// One named argument a tool accepts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl Parameter {
    pub fn required(
        name: impl Into<String>,
        kind: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            kind: kind.into(),
            required: true,
            default: None,
        }
    }

    pub fn optional(
        name: impl Into<String>,
        kind: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            required: false,
            ..Self::required(name, kind, description)
        }
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

/// Outcome of a tool call. Ordinary failures are `success: false`, never an `Err`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub content: String,
    #[serde(default)]
    pub data: Value,
}

impl ToolResult {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            success: true,
            content: content.into(),
            data: Value::Null,
        }
    }

    pub fn ok_with_data(content: impl Into<String>, data: Value) -> Self {
        Self {
            success: true,
            content: content.into(),
            data,
        }
    }

    pub fn failure(content: impl Into<String>) -> Self {
        Self {
            success: false,
            content: content.into(),
            data: Value::Null,
        }
    }
}

/// Static description of a tool that can be embedded in prompts or sent to a model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDescription {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// A named capability with a parameter schema and a synchronous body.
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;

    fn parameters(&self) -> &[Parameter] {
        &[]
    }

    /// The bound callback. Only reached once [`Tool::validate`] has passed.
    fn invoke(&self, params: &Value) -> ToolResult;

    /// Returns the names of required parameters missing from `params`.
    fn validate(&self, params: &Value) -> std::result::Result<(), Vec<String>> {
        let missing: Vec<String> = self
            .parameters()
            .iter()
            .filter(|p| p.required && params.get(&p.name).is_none())
            .map(|p| p.name.clone())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(missing)
        }
    }

    fn execute(&self, params: &Value) -> ToolResult {
        match self.validate(params) {
            Ok(()) => self.invoke(params),
            Err(missing) => ToolResult {
                success: false,
                content: format!(
                    "Invalid parameters for `{}`: missing required {}",
                    self.name(),
                    missing.join(", ")
                ),
                data: json!({ "missing": missing }),
            },
        }
    }

    fn describe(&self) -> ToolDescription {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for param in self.parameters() {
            let mut schema = json!({
                "type": param.kind,
                "description": param.description,
            });
            if let Some(default) = &param.default {
                schema["default"] = default.clone();
            }
            properties.insert(param.name.clone(), schema);
            if param.required {
                required.push(Value::String(param.name.clone()));
            }
        }
        ToolDescription {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: json!({
                "type": "object",
                "properties": properties,
                "required": required,
            }),
        }
    }
}

pub type ToolCallback = Arc<dyn Fn(&Value) -> ToolResult + Send + Sync>;

/// A tool assembled from a name, a parameter list and a closure.
#[derive(Clone)]
pub struct FunctionTool {
    name: String,
    description: String,
    parameters: Vec<Parameter>,
    callback: Option<ToolCallback>,
}

impl fmt::Debug for FunctionTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionTool")
            .field("name", &self.name)
            .field("parameters", &self.parameters)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

impl FunctionTool {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Vec::new(),
            callback: None,
        }
    }

    pub fn with_parameter(mut self, parameter: Parameter) -> Self {
        self.parameters.retain(|p| p.name != parameter.name);
        self.parameters.push(parameter);
        self
    }

    pub fn with_callback(
        mut self,
        callback: impl Fn(&Value) -> ToolResult + Send + Sync + 'static,
    ) -> Self {
        self.callback = Some(Arc::new(callback));
        self
    }
}

impl Tool for FunctionTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    fn invoke(&self, params: &Value) -> ToolResult {
        match &self.callback {
            Some(callback) => callback(params),
            None => ToolResult::failure(format!(
                "No execution callback set for tool: {}",
                self.name
            )),
        }
    }
}

/// Name-to-tool map. Constructed explicitly and injected where needed.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Registers a tool, replacing (and returning) any tool with the same name.
    pub fn register<T: Tool + 'static>(&mut self, tool: T) -> Option<Arc<dyn Tool>> {
        self.register_arc(Arc::new(tool))
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) -> Option<Arc<dyn Tool>> {
        let name = tool.name().to_string();
        let previous = self.tools.insert(name.clone(), tool);
        if previous.is_some() {
            warn!(tool = %name, "replacing previously registered tool");
        }
        previous
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.remove(name)
    }

    pub fn clear(&mut self) {
        self.tools.clear();
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn describe(&self) -> Vec<ToolDescription> {
        let mut descriptions: Vec<ToolDescription> =
            self.tools.values().map(|tool| tool.describe()).collect();
        descriptions.sort_by(|a, b| a.name.cmp(&b.name));
        descriptions
    }

    pub fn execute(&self, name: &str, params: &Value) -> Result<ToolResult> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| FlowError::ToolNotFound(name.to_string()))?;
        debug!(tool = %name, "executing tool");
        Ok(tool.execute(params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn calculator(counter: Arc<AtomicUsize>) -> FunctionTool {
        FunctionTool::new("calculator", "Evaluates an arithmetic expression")
            .with_parameter(Parameter::required(
                "expression",
                "string",
                "Expression to evaluate",
            ))
            .with_callback(move |params| {
                counter.fetch_add(1, Ordering::SeqCst);
                ToolResult::ok(format!("evaluated {}", params["expression"]))
            })
    }

    #[test]
    fn missing_required_parameter_skips_callback() {
        let calls = Arc::new(AtomicUsize::new(0));
        let tool = calculator(calls.clone());

        let result = tool.execute(&json!({}));

        assert!(!result.success);
        assert!(result.content.contains("expression"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn valid_parameters_reach_callback() {
        let calls = Arc::new(AtomicUsize::new(0));
        let tool = calculator(calls.clone());

        let result = tool.execute(&json!({"expression": "2 + 2"}));

        assert!(result.success);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn tool_without_callback_fails_softly() {
        let tool = FunctionTool::new("noop", "Does nothing");
        let result = tool.execute(&json!({}));
        assert!(!result.success);
        assert!(result.content.contains("No execution callback"));
    }

    #[test]
    fn schema_lists_required_parameters() {
        let tool = FunctionTool::new("summarize", "Summarizes text")
            .with_parameter(Parameter::required("text", "string", "Text to summarize"))
            .with_parameter(
                Parameter::optional("max_length", "integer", "Word budget").with_default(json!(100)),
            );
        let schema = tool.describe();
        assert_eq!(schema.parameters["required"], json!(["text"]));
        assert_eq!(
            schema.parameters["properties"]["max_length"]["default"],
            json!(100)
        );
    }

    #[test]
    fn duplicate_registration_overwrites() {
        let mut registry = ToolRegistry::new();
        assert!(registry
            .register(FunctionTool::new("echo", "first"))
            .is_none());
        let previous = registry.register(FunctionTool::new("echo", "second"));

        assert_eq!(previous.map(|t| t.description().to_string()), Some("first".into()));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("echo").unwrap().description(), "second");
    }

    #[test]
    fn unknown_tool_is_lookup_error() {
        let registry = ToolRegistry::new();
        let err = registry.execute("missing", &json!({})).unwrap_err();
        assert!(matches!(err, FlowError::ToolNotFound(name) if name == "missing"));
    }

    #[test]
    fn returns_sorted_descriptions() {
        let mut registry = ToolRegistry::new();
        registry.register(FunctionTool::new("second", "Second tool"));
        registry.register(FunctionTool::new("a_first", "First tool"));

        let names: Vec<String> = registry.describe().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["a_first", "second"]);
    }
}
