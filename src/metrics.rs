// Process-wide Prometheus metrics

//! One [`Metrics`] instance is built at startup and shared by the HTTP
//! layer, the execution engine, the store manager and the audit trail.
//! Exposed in Prometheus text format on `GET /metrics`.

use prometheus::{
    Encoder, Gauge, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// HTTP request duration, labeled by method, matched route and status
    pub http_request_duration: HistogramVec,
    /// Execution lifecycle counters, labeled by outcome
    pub executions_started: IntCounter,
    pub executions_completed: IntCounter,
    pub executions_failed: IntCounter,
    pub executions_cancelled: IntCounter,
    /// Agent invocation duration, labeled by agent kind
    pub agent_invocation_duration: HistogramVec,
    /// Retries per agent kind
    pub agent_retries: IntCounterVec,
    /// Connection pool utilization, 0.0 - 1.0
    pub pool_utilization: Gauge,
    pub audit_events_total: IntCounter,
    /// Rate limited requests per endpoint group
    pub rate_limited_total: IntCounterVec,
}

impl Metrics {
    pub fn new() -> crate::Result<Self> {
        let registry = Registry::new();

        let http_request_duration = HistogramVec::new(
            HistogramOpts::new(
                "flowforge_http_request_duration_seconds",
                "HTTP request duration in seconds",
            ),
            &["method", "route", "status"],
        )
        .map_err(internal)?;
        let executions_started = IntCounter::with_opts(Opts::new(
            "flowforge_executions_started_total",
            "Workflow executions started",
        ))
        .map_err(internal)?;
        let executions_completed = IntCounter::with_opts(Opts::new(
            "flowforge_executions_completed_total",
            "Workflow executions completed successfully",
        ))
        .map_err(internal)?;
        let executions_failed = IntCounter::with_opts(Opts::new(
            "flowforge_executions_failed_total",
            "Workflow executions that ended in failure",
        ))
        .map_err(internal)?;
        let executions_cancelled = IntCounter::with_opts(Opts::new(
            "flowforge_executions_cancelled_total",
            "Workflow executions cancelled by a signal",
        ))
        .map_err(internal)?;
        let agent_invocation_duration = HistogramVec::new(
            HistogramOpts::new(
                "flowforge_agent_invocation_duration_seconds",
                "Agent invocation duration in seconds",
            ),
            &["kind"],
        )
        .map_err(internal)?;
        let agent_retries = IntCounterVec::new(
            Opts::new("flowforge_agent_retries_total", "Agent invocation retries"),
            &["kind"],
        )
        .map_err(internal)?;
        let pool_utilization = Gauge::with_opts(Opts::new(
            "flowforge_store_pool_utilization",
            "Fraction of store connections in use",
        ))
        .map_err(internal)?;
        let audit_events_total = IntCounter::with_opts(Opts::new(
            "flowforge_audit_events_total",
            "Audit events recorded",
        ))
        .map_err(internal)?;
        let rate_limited_total = IntCounterVec::new(
            Opts::new(
                "flowforge_rate_limited_total",
                "Requests rejected by the rate limiter",
            ),
            &["endpoint_group"],
        )
        .map_err(internal)?;

        for collector in [
            Box::new(http_request_duration.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(executions_started.clone()),
            Box::new(executions_completed.clone()),
            Box::new(executions_failed.clone()),
            Box::new(executions_cancelled.clone()),
            Box::new(agent_invocation_duration.clone()),
            Box::new(agent_retries.clone()),
            Box::new(pool_utilization.clone()),
            Box::new(audit_events_total.clone()),
            Box::new(rate_limited_total.clone()),
        ] {
            registry.register(collector).map_err(internal)?;
        }

        Ok(Self {
            registry,
            http_request_duration,
            executions_started,
            executions_completed,
            executions_failed,
            executions_cancelled,
            agent_invocation_duration,
            agent_retries,
            pool_utilization,
            audit_events_total,
            rate_limited_total,
        })
    }

    /// Render the registry in Prometheus text exposition format
    pub fn render(&self) -> crate::Result<String> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(internal)?;
        String::from_utf8(buffer)
            .map_err(|e| crate::FlowForgeError::Internal(format!("metrics encoding: {}", e)))
    }
}

fn internal(err: prometheus::Error) -> crate::FlowForgeError {
    crate::FlowForgeError::Internal(format!("metrics registry: {}", err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_registered_families() {
        let metrics = Metrics::new().unwrap();
        metrics.executions_started.inc();
        metrics
            .agent_invocation_duration
            .with_label_values(&["aggregator"])
            .observe(0.05);
        let text = metrics.render().unwrap();
        assert!(text.contains("flowforge_executions_started_total 1"));
        assert!(text.contains("flowforge_agent_invocation_duration_seconds"));
    }
}
