use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::sleep;
use tracing::warn;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{FlowError, Result};

/// Installs a global tracing subscriber.
///
/// Filter priority: `RUST_LOG` > `config.level` > `info`. A second call is a no-op.
pub fn init_tracing(config: &LoggingConfig) {
    let level = if config.level.trim().is_empty() {
        "info"
    } else {
        config.level.as_str()
    };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{level},sayr_flow={level}")));

    if config.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_current_span(true))
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false))
            .try_init()
            .ok();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub kind: String,
    pub timestamp: SystemTime,
    pub detail: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub context: String,
    pub error: String,
    pub attempt: u32,
}

/// In-process sink for agent and workflow events.
#[derive(Default, Clone, Debug)]
pub struct TelemetryCollector {
    events: Arc<Mutex<Vec<TelemetryEvent>>>,
    failures: Arc<Mutex<Vec<FailureRecord>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl TelemetryCollector {
    pub fn record(&self, kind: impl Into<String>, detail: Value) {
        lock(&self.events).push(TelemetryEvent {
            kind: kind.into(),
            timestamp: SystemTime::now(),
            detail,
        });
    }

    pub fn record_failure(
        &self,
        context: impl Into<String>,
        error: impl Into<String>,
        attempt: u32,
    ) {
        lock(&self.failures).push(FailureRecord {
            context: context.into(),
            error: error.into(),
            attempt,
        });
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        lock(&self.events).clone()
    }

    pub fn drain(&self) -> (Vec<TelemetryEvent>, Vec<FailureRecord>) {
        let events = std::mem::take(&mut *lock(&self.events));
        let failures = std::mem::take(&mut *lock(&self.failures));
        (events, failures)
    }
}

/// Linear backoff retry for provider calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff: Duration::ZERO,
        }
    }

    pub fn default_external_call() -> Self {
        Self {
            max_retries: 3,
            backoff: Duration::from_millis(200),
        }
    }

    pub async fn retry<F, Fut, T>(
        &self,
        mut f: F,
        telemetry: Option<&TelemetryCollector>,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        for attempt in 0..=self.max_retries {
            match f(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if let Some(t) = telemetry {
                        t.record_failure("retry", err.to_string(), attempt);
                    }
                    if attempt == self.max_retries {
                        return Err(err);
                    }
                    warn!(attempt, error = %err, "retrying after failure");
                    sleep(self.backoff * (attempt + 1)).await;
                }
            }
        }
        Err(FlowError::Protocol("retry exhausted".into()))
    }
}
