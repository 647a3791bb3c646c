use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sysinfo::System;

/// Counters collected over one agent or workflow run.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RunReport {
    pub label: String,
    pub duration: Duration,
    pub peak_memory_bytes: u64,
    pub steps: usize,
    pub model_calls: usize,
    pub tool_calls: usize,
    pub failures: usize,
    pub success: bool,
}

impl RunReport {
    pub fn success_rate(reports: &[Self]) -> f32 {
        if reports.is_empty() {
            return 0.0;
        }
        let successes = reports.iter().filter(|r| r.success).count();
        successes as f32 / reports.len() as f32
    }
}

#[derive(Default, Clone, Debug)]
pub struct MetricsTracker {
    reports: Arc<Mutex<Vec<RunReport>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MetricsTracker {
    pub fn start_run(&self, label: impl Into<String>) -> RunGuard {
        RunGuard {
            label: label.into(),
            start: Instant::now(),
            steps: 0,
            model_calls: 0,
            tool_calls: 0,
            failures: 0,
            metrics: self.clone(),
        }
    }

    pub fn reports(&self) -> Vec<RunReport> {
        lock(&self.reports).clone()
    }
}

pub struct RunGuard {
    label: String,
    start: Instant,
    steps: usize,
    model_calls: usize,
    tool_calls: usize,
    failures: usize,
    metrics: MetricsTracker,
}

impl RunGuard {
    pub fn record_step(&mut self) {
        self.steps += 1;
    }

    pub fn record_model_call(&mut self) {
        self.model_calls += 1;
    }

    pub fn record_tool_call(&mut self) {
        self.tool_calls += 1;
    }

    pub fn record_failure(&mut self) {
        self.failures += 1;
    }

    pub fn finish(self, success: bool) -> RunReport {
        let mut system = System::new();
        system.refresh_memory();
        let report = RunReport {
            label: self.label,
            duration: self.start.elapsed(),
            peak_memory_bytes: system.used_memory(),
            steps: self.steps,
            model_calls: self.model_calls,
            tool_calls: self.tool_calls,
            failures: self.failures,
            success,
        };
        lock(&self.metrics.reports).push(report.clone());
        report
    }
}
