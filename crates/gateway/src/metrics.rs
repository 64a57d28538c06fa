use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

/// Process metrics. Owned by `AppState`; each instance has its own registry.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    http_requests_total: IntCounterVec,
    http_request_duration_seconds: HistogramVec,
    uploads_total: IntCounterVec,
    integrity_check_failures_total: IntCounterVec,
    evaluations_total: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let http_requests_total = IntCounterVec::new(
            Opts::new("evintake_http_requests_total", "HTTP request count."),
            &["route", "method", "status"],
        )?;
        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "evintake_http_request_duration_seconds",
                "HTTP request duration in seconds.",
            )
            .buckets(vec![
                0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
            ]),
            &["route", "method", "outcome"],
        )?;
        let uploads_total = IntCounterVec::new(
            Opts::new(
                "evintake_evidence_uploads_total",
                "Evidence upload outcomes by result code.",
            ),
            &["code"],
        )?;
        let integrity_check_failures_total = IntCounterVec::new(
            Opts::new(
                "evintake_integrity_check_failures_total",
                "Failed integrity sub-checks by check name.",
            ),
            &["check"],
        )?;
        let evaluations_total = IntCounterVec::new(
            Opts::new(
                "evintake_evaluations_total",
                "Completed evaluations by overall recommendation.",
            ),
            &["recommendation"],
        )?;

        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(http_request_duration_seconds.clone()))?;
        registry.register(Box::new(uploads_total.clone()))?;
        registry.register(Box::new(integrity_check_failures_total.clone()))?;
        registry.register(Box::new(evaluations_total.clone()))?;

        Ok(Self {
            registry,
            http_requests_total,
            http_request_duration_seconds,
            uploads_total,
            integrity_check_failures_total,
            evaluations_total,
        })
    }

    pub fn observe_http_request(&self, route: &str, method: &str, status: u16, duration: Duration) {
        let status_str = status.to_string();
        self.http_requests_total
            .with_label_values(&[route, method, status_str.as_str()])
            .inc();

        let outcome = if (200..400).contains(&status) {
            "success"
        } else {
            "error"
        };
        self.http_request_duration_seconds
            .with_label_values(&[route, method, outcome])
            .observe(duration.as_secs_f64());
    }

    /// `code` is `created`, `idempotent_replay`, or the rejection code.
    pub fn observe_upload(&self, code: &str) {
        self.uploads_total.with_label_values(&[code]).inc();
    }

    pub fn observe_integrity_failures(&self, checks: &[&str]) {
        for check in checks {
            self.integrity_check_failures_total
                .with_label_values(&[check])
                .inc();
        }
    }

    pub fn observe_evaluation(&self, recommendation: &str) {
        self.evaluations_total
            .with_label_values(&[recommendation])
            .inc();
    }

    pub fn render(&self) -> Result<(Vec<u8>, String), prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok((buffer, encoder.format_type().to_string()))
    }
}
