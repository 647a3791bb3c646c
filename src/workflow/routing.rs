use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::{Handler, StepLog, Workflow};
use crate::context::SharedContext;
use crate::error::{FlowError, Result};
use crate::llm::CallOptions;

const DEFAULT_ROUTER_PROMPT: &str =
    "You are a router. Classify the user's input into exactly one of the routes below.";

pub struct Route {
    pub name: String,
    pub description: String,
    handler: Arc<dyn Handler>,
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteOutcome {
    /// Name of the route that ran, or `default`.
    pub route: String,
    pub matched: bool,
    /// Classifier reply before normalisation.
    pub classification: String,
    pub output: Value,
}

/// One classifier call, then exact-match dispatch to a registered route.
pub struct Router {
    context: SharedContext,
    routes: Vec<Route>,
    default_route: Option<Arc<dyn Handler>>,
    router_prompt: String,
    options: Option<CallOptions>,
    log: StepLog,
}

impl Router {
    pub fn new(context: SharedContext) -> Self {
        Self {
            context,
            routes: Vec::new(),
            default_route: None,
            router_prompt: DEFAULT_ROUTER_PROMPT.to_string(),
            options: None,
            log: StepLog::new("routing"),
        }
    }

    pub fn with_router_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.router_prompt = prompt.into();
        self
    }

    /// Registers a route. A route with the same name is replaced.
    pub fn with_route(
        mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> Self {
        let name = name.into();
        self.routes.retain(|r| r.name != name);
        self.routes.push(Route {
            name,
            description: description.into(),
            handler,
        });
        self
    }

    pub fn with_default_route(mut self, handler: Arc<dyn Handler>) -> Self {
        self.default_route = Some(handler);
        self
    }

    pub fn with_options(mut self, options: CallOptions) -> Self {
        self.options = Some(options);
        self
    }

    pub fn with_step_callback(mut self, callback: impl Fn(&str, &Value) + Send + Sync + 'static) -> Self {
        self.log.set_callback(Arc::new(callback));
        self
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn routes_schema(&self) -> Value {
        let routes: Vec<Value> = self
            .routes
            .iter()
            .map(|r| json!({ "name": r.name, "description": r.description }))
            .collect();
        json!({ "routes": routes })
    }

    fn classifier_prompt(&self) -> String {
        let mut prompt = self.router_prompt.clone();
        prompt.push_str("\n\nAvailable routes:\n");
        for route in &self.routes {
            prompt.push_str(&format!("- {}: {}\n", route.name, route.description));
        }
        prompt.push_str("\nRespond with the route name only.");
        prompt
    }

    pub async fn execute(&self, input: &str) -> Result<RouteOutcome> {
        let branch = self.context.lock().await.fork(None);
        let system = self.classifier_prompt();
        let response = branch
            .complete(Some(&system), input, self.options.as_ref())
            .await?;
        if response.is_error() {
            warn!(error = ?response.error, "router call failed, using default route");
        }

        let classification = response.content;
        let selected = normalize(&classification);
        debug!(selected = %selected, "router classified input");

        let info = json!({ "classification": classification, "route": selected, "input": input });
        let (route, matched, handler) = match self.routes.iter().find(|r| r.name == selected) {
            Some(route) => (route.name.clone(), true, Arc::clone(&route.handler)),
            None => match &self.default_route {
                Some(handler) => {
                    info!(selected = %selected, "no route matched, using default");
                    ("default".to_string(), false, Arc::clone(handler))
                }
                None => return Err(FlowError::UnknownRoute(selected)),
            },
        };

        let output = handler.handle(input, &info).await?;
        self.log.record(&route, &output);
        Ok(RouteOutcome {
            route,
            matched,
            classification,
            output,
        })
    }
}

fn normalize(raw: &str) -> String {
    raw.trim()
        .trim_matches(|c: char| matches!(c, '"' | '\'' | '`'))
        .trim()
        .to_string()
}

#[async_trait]
impl Workflow for Router {
    fn name(&self) -> &str {
        "routing"
    }

    async fn run(&self, input: &str) -> Result<Value> {
        let outcome = self.execute(input).await?;
        Ok(serde_json::to_value(outcome)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ModelContext;
    use crate::llm::StubModel;
    use crate::workflow::{handler_fn, PromptHandler};

    #[test]
    fn strips_quotes_and_backticks() {
        assert_eq!(normalize("  `billing`\n"), "billing");
        assert_eq!(normalize("\"support\""), "support");
        assert_eq!(normalize("billing please"), "billing please");
    }

    #[tokio::test]
    async fn unmatched_without_default_is_lookup_error() {
        let model = StubModel::new(["weather"]).into_shared();
        let router = Router::new(ModelContext::new().with_model(model).into_shared())
            .with_route("billing", "Invoices", handler_fn(|_, _| async { Ok(json!("bill")) }));

        let err = router.execute("Will it rain?").await.unwrap_err();
        assert!(matches!(err, FlowError::UnknownRoute(name) if name == "weather"));
    }

    #[tokio::test]
    async fn classifier_sees_route_listing() {
        let model = StubModel::new(["'billing'", "Your invoice is attached."]).into_shared();
        let context = ModelContext::new().with_model(model.clone()).into_shared();
        let router = Router::new(context.clone())
            .with_route(
                "billing",
                "Questions about invoices",
                Arc::new(PromptHandler::new(context, "You are a billing specialist.")),
            )
            .with_route("support", "Technical problems", handler_fn(|_, _| async { Ok(json!("support")) }));

        let outcome = router.execute("Where is my invoice?").await.unwrap();

        assert_eq!(outcome.route, "billing");
        assert_eq!(outcome.output, json!("Your invoice is attached."));
        let calls = model.calls();
        assert!(calls[0].system().unwrap().contains("- billing: Questions about invoices"));
        assert_eq!(calls[1].system(), Some("You are a billing specialist."));
    }
}
