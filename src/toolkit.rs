//! A small standard tool set.

use std::fs;

use serde_json::{json, Value};

use crate::tool::{Parameter, Tool, ToolRegistry, ToolResult};

pub fn basic_toolkit() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(ReadFileTool::new());
    registry.register(WriteFileTool::new());
    registry.register(EchoTool::new());
    registry.register(CalculatorTool::new());
    registry
}

fn str_param<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}

pub struct ReadFileTool {
    parameters: Vec<Parameter>,
}

impl ReadFileTool {
    pub fn new() -> Self {
        Self {
            parameters: vec![Parameter::required("path", "string", "Path of the file to read")],
        }
    }
}

impl Default for ReadFileTool {
    fn default() -> Self {
        Self::new()
    }
}

impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the contents of a UTF-8 file."
    }

    fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    fn invoke(&self, params: &Value) -> ToolResult {
        let Some(path) = str_param(params, "path") else {
            return ToolResult::failure("`path` must be a string");
        };
        match fs::read_to_string(path) {
            Ok(contents) => ToolResult::ok_with_data(
                contents.clone(),
                json!({ "path": path, "bytes": contents.len() }),
            ),
            Err(err) => ToolResult::failure(format!("failed to read {path}: {err}")),
        }
    }
}

pub struct WriteFileTool {
    parameters: Vec<Parameter>,
}

impl WriteFileTool {
    pub fn new() -> Self {
        Self {
            parameters: vec![
                Parameter::required("path", "string", "Path of the file to write"),
                Parameter::required("contents", "string", "Text to write"),
            ],
        }
    }
}

impl Default for WriteFileTool {
    fn default() -> Self {
        Self::new()
    }
}

impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write contents to a UTF-8 file, replacing it if present."
    }

    fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    fn invoke(&self, params: &Value) -> ToolResult {
        let (Some(path), Some(contents)) =
            (str_param(params, "path"), str_param(params, "contents"))
        else {
            return ToolResult::failure("`path` and `contents` must be strings");
        };
        match fs::write(path, contents) {
            Ok(()) => ToolResult::ok_with_data(
                format!("wrote {} bytes to {path}", contents.len()),
                json!({ "path": path, "bytes_written": contents.len() }),
            ),
            Err(err) => ToolResult::failure(format!("failed to write {path}: {err}")),
        }
    }
}

pub struct EchoTool {
    parameters: Vec<Parameter>,
}

impl EchoTool {
    pub fn new() -> Self {
        Self {
            parameters: vec![Parameter::optional("text", "string", "Text to echo back")],
        }
    }
}

impl Default for EchoTool {
    fn default() -> Self {
        Self::new()
    }
}

impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the provided payload back to the caller."
    }

    fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    fn invoke(&self, params: &Value) -> ToolResult {
        let content = match str_param(params, "text") {
            Some(text) => text.to_string(),
            None => params.to_string(),
        };
        ToolResult::ok_with_data(content, json!({ "echo": params }))
    }
}

/// Evaluates `+ - * /` expressions with parentheses and unary minus.
pub struct CalculatorTool {
    parameters: Vec<Parameter>,
}

impl CalculatorTool {
    pub fn new() -> Self {
        Self {
            parameters: vec![Parameter::required(
                "expression",
                "string",
                "Arithmetic expression, e.g. (2 + 3) * 4",
            )],
        }
    }
}

impl Default for CalculatorTool {
    fn default() -> Self {
        Self::new()
    }
}

impl Tool for CalculatorTool {
    fn name(&self) -> &str {
        "calculator"
    }

    fn description(&self) -> &str {
        "Evaluate an arithmetic expression."
    }

    fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    fn invoke(&self, params: &Value) -> ToolResult {
        let Some(expression) = str_param(params, "expression") else {
            return ToolResult::failure("`expression` must be a string");
        };
        match evaluate(expression) {
            Ok(value) => ToolResult::ok_with_data(
                value.to_string(),
                json!({ "expression": expression, "result": value }),
            ),
            Err(message) => ToolResult::failure(format!("cannot evaluate `{expression}`: {message}")),
        }
    }
}

fn evaluate(expression: &str) -> Result<f64, String> {
    let tokens: Vec<char> = expression.chars().filter(|c| !c.is_whitespace()).collect();
    let mut parser = ExprParser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let value = parser.expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(format!("unexpected `{}`", parser.tokens[parser.pos]));
    }
    Ok(value)
}

/// Bound on nested parentheses and unary minus signs.
const MAX_DEPTH: usize = 64;

struct ExprParser {
    tokens: Vec<char>,
    pos: usize,
    depth: usize,
}

impl ExprParser {
    fn peek(&self) -> Option<char> {
        self.tokens.get(self.pos).copied()
    }

    fn expr(&mut self) -> Result<f64, String> {
        let mut value = self.term()?;
        while let Some(op @ ('+' | '-')) = self.peek() {
            self.pos += 1;
            let rhs = self.term()?;
            value = if op == '+' { value + rhs } else { value - rhs };
        }
        Ok(value)
    }

    fn term(&mut self) -> Result<f64, String> {
        let mut value = self.factor()?;
        while let Some(op @ ('*' | '/')) = self.peek() {
            self.pos += 1;
            let rhs = self.factor()?;
            if op == '/' {
                if rhs == 0.0 {
                    return Err("division by zero".into());
                }
                value /= rhs;
            } else {
                value *= rhs;
            }
        }
        Ok(value)
    }

    fn nested<T>(&mut self, parse: impl FnOnce(&mut Self) -> Result<T, String>) -> Result<T, String> {
        if self.depth >= MAX_DEPTH {
            return Err(format!("expression nested deeper than {MAX_DEPTH} levels"));
        }
        self.depth += 1;
        let value = parse(self);
        self.depth -= 1;
        value
    }

    fn factor(&mut self) -> Result<f64, String> {
        match self.peek() {
            Some('-') => {
                self.pos += 1;
                Ok(-self.nested(Self::factor)?)
            }
            Some('(') => {
                self.pos += 1;
                let value = self.nested(Self::expr)?;
                if self.peek() != Some(')') {
                    return Err("missing `)`".into());
                }
                self.pos += 1;
                Ok(value)
            }
            Some(c) if c.is_ascii_digit() || c == '.' => {
                let start = self.pos;
                while matches!(self.peek(), Some(c) if c.is_ascii_digit() || c == '.') {
                    self.pos += 1;
                }
                let literal: String = self.tokens[start..self.pos].iter().collect();
                literal
                    .parse::<f64>()
                    .map_err(|_| format!("bad number `{literal}`"))
            }
            Some(c) => Err(format!("unexpected `{c}`")),
            None => Err("unexpected end of expression".into()),
        }
    }
}
