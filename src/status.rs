//! Build progress reporting, decoupled from the builder so tests can swap
//! in a silent double instead of asserting on log output.

/// Outcome of one finished edge, passed to `edge_finished`.
#[derive(Debug, Clone)]
pub struct EdgeResult {
    pub success: bool,
    pub output: String,
}

/// Collaborator interface the builder drives as it works through the plan.
pub trait StatusSink: Send + Sync {
    fn plan_has_total(&self, total: usize);
    fn edge_started(&self, edge_description: &str, running: usize, total: usize);
    fn edge_finished(&self, edge_description: &str, result: &EdgeResult);
    fn build_started(&self);
    fn build_finished(&self, failures: usize);
    fn info(&self, message: &str);
    fn warning(&self, message: &str);
    fn error(&self, message: &str);
}

/// Default sink: structured log events via `tracing`, one span per edge.
#[derive(Default)]
pub struct TracingStatus;

impl TracingStatus {
    pub fn new() -> Self {
        Self
    }
}

impl StatusSink for TracingStatus {
    fn plan_has_total(&self, total: usize) {
        tracing::info!(total, "plan ready");
    }

    fn edge_started(&self, edge_description: &str, running: usize, total: usize) {
        tracing::info!(running, total, "[{running}/{total}] {edge_description}");
    }

    fn edge_finished(&self, edge_description: &str, result: &EdgeResult) {
        if result.success {
            tracing::debug!(edge = edge_description, "finished");
        } else {
            tracing::error!(edge = edge_description, output = %result.output, "FAILED");
        }
    }

    fn build_started(&self) {
        tracing::info!("build started");
    }

    fn build_finished(&self, failures: usize) {
        if failures == 0 {
            tracing::info!("build finished");
        } else {
            tracing::error!(failures, "build finished with failures");
        }
    }

    fn info(&self, message: &str) {
        tracing::info!("{message}");
    }

    fn warning(&self, message: &str) {
        tracing::warn!("{message}");
    }

    fn error(&self, message: &str) {
        tracing::error!("{message}");
    }
}

/// A no-op sink for tests that don't care about progress reporting.
#[derive(Default)]
pub struct NullStatus;

impl NullStatus {
    pub fn new() -> Self {
        Self
    }
}

impl StatusSink for NullStatus {
    fn plan_has_total(&self, _total: usize) {}
    fn edge_started(&self, _edge_description: &str, _running: usize, _total: usize) {}
    fn edge_finished(&self, _edge_description: &str, _result: &EdgeResult) {}
    fn build_started(&self) {}
    fn build_finished(&self, _failures: usize) {}
    fn info(&self, _message: &str) {}
    fn warning(&self, _message: &str) {}
    fn error(&self, _message: &str) {}
}

/// A recording sink for tests that need to assert on what was reported.
#[cfg(test)]
pub struct RecordingStatus {
    pub events: std::sync::Mutex<Vec<String>>,
}

#[cfg(test)]
impl RecordingStatus {
    pub fn new() -> Self {
        Self { events: std::sync::Mutex::new(Vec::new()) }
    }
}

#[cfg(test)]
impl StatusSink for RecordingStatus {
    fn plan_has_total(&self, total: usize) {
        self.events.lock().unwrap().push(format!("plan:{total}"));
    }

    fn edge_started(&self, edge_description: &str, running: usize, total: usize) {
        self.events.lock().unwrap().push(format!("start:{running}/{total}:{edge_description}"));
    }

    fn edge_finished(&self, edge_description: &str, result: &EdgeResult) {
        self.events.lock().unwrap().push(format!("finish:{}:{edge_description}", result.success));
    }

    fn build_started(&self) {
        self.events.lock().unwrap().push("build_started".to_string());
    }

    fn build_finished(&self, failures: usize) {
        self.events.lock().unwrap().push(format!("build_finished:{failures}"));
    }

    fn info(&self, message: &str) {
        self.events.lock().unwrap().push(format!("info:{message}"));
    }

    fn warning(&self, message: &str) {
        self.events.lock().unwrap().push(format!("warning:{message}"));
    }

    fn error(&self, message: &str) {
        self.events.lock().unwrap().push(format!("error:{message}"));
    }
}
