use prometheus::{
    histogram_opts, opts, Encoder, Histogram, IntCounterVec, Registry, TextEncoder,
};

use crate::executor::ExecutionResult;
use crate::Result;

/// How a `/alert` request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Ok,
    Unauthorized,
    BadRequest,
    TemplateError,
    CommandFailed,
}

impl RequestOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestOutcome::Ok => "ok",
            RequestOutcome::Unauthorized => "unauthorized",
            RequestOutcome::BadRequest => "bad_request",
            RequestOutcome::TemplateError => "template_error",
            RequestOutcome::CommandFailed => "command_failed",
        }
    }
}

/// Prometheus collectors, registered on a registry owned by this value.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    requests_total: IntCounterVec,
    executions_total: IntCounterVec,
    execution_duration: Histogram,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            opts!("alert_exec_requests_total", "Total number of alert webhook requests."),
            &["outcome"],
        )?;
        let executions_total = IntCounterVec::new(
            opts!("alert_exec_executions_total", "Total number of command executions."),
            &["result"],
        )?;
        let execution_duration = Histogram::with_opts(histogram_opts!(
            "alert_exec_execution_duration_seconds",
            "Wall-clock duration of command executions.",
            vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
        ))?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(executions_total.clone()))?;
        registry.register(Box::new(execution_duration.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            executions_total,
            execution_duration,
        })
    }

    pub fn record_request(&self, outcome: RequestOutcome) {
        self.requests_total
            .with_label_values(&[outcome.as_str()])
            .inc();
    }

    pub fn record_execution(&self, result: &ExecutionResult) {
        let label = if result.timed_out {
            "timeout"
        } else if result.exit_code == 0 {
            "success"
        } else {
            "failure"
        };
        self.executions_total.with_label_values(&[label]).inc();
        self.execution_duration
            .observe(result.duration.as_secs_f64());
    }

    /// Text exposition of everything registered.
    pub fn gather(&self) -> Result<String> {
        let mut buffer = vec![];
        let encoder = TextEncoder::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| prometheus::Error::Msg(format!("metrics are not UTF-8: {e}")).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_counters_are_exposed() {
        let metrics = Metrics::new().unwrap();
        metrics.record_request(RequestOutcome::Ok);
        metrics.record_request(RequestOutcome::Ok);
        metrics.record_request(RequestOutcome::Unauthorized);

        let text = metrics.gather().unwrap();
        assert!(text.contains(r#"alert_exec_requests_total{outcome="ok"} 2"#));
        assert!(text.contains(r#"alert_exec_requests_total{outcome="unauthorized"} 1"#));
    }

    #[test]
    fn test_separate_instances_do_not_share_state() {
        let first = Metrics::new().unwrap();
        let second = Metrics::new().unwrap();
        first.record_request(RequestOutcome::BadRequest);

        assert!(!second.gather().unwrap().contains("bad_request"));
    }
}
