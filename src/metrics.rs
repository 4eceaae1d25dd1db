//! Prometheus metrics for provider calls and inbound requests, served as
//! text on `GET /metrics`.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `federator_external_calls_total` | Counter | `provider`, `outcome` |
//! | `federator_external_call_duration_seconds` | Histogram | `provider` |
//! | `federator_http_requests_total` | Counter | `route`, `status` |
//! | `federator_http_request_duration_seconds` | Histogram | `route` |

use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::time::Duration;
use thiserror::Error;

/// Label values are cut to this many bytes.
pub const MAX_LABEL_VALUE_LEN: usize = 64;

pub const TEXT_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

const CALL_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to register metric: {0}")]
    Registration(#[from] prometheus::Error),

    #[error("failed to encode metrics: {0}")]
    Encoding(String),
}

/// A private registry with every federator metric registered on it.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    external_calls_total: IntCounterVec,
    external_call_duration: HistogramVec,
    http_requests_total: IntCounterVec,
    http_request_duration: HistogramVec,
}

impl Metrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let external_calls_total = IntCounterVec::new(
            Opts::new("federator_external_calls_total", "Provider calls by outcome"),
            &["provider", "outcome"],
        )?;
        registry.register(Box::new(external_calls_total.clone()))?;

        let external_call_duration = HistogramVec::new(
            HistogramOpts::new(
                "federator_external_call_duration_seconds",
                "Provider call latency, timeouts included",
            )
            .buckets(CALL_BUCKETS.to_vec()),
            &["provider"],
        )?;
        registry.register(Box::new(external_call_duration.clone()))?;

        let http_requests_total = IntCounterVec::new(
            Opts::new("federator_http_requests_total", "Inbound requests by route and status"),
            &["route", "status"],
        )?;
        registry.register(Box::new(http_requests_total.clone()))?;

        let http_request_duration = HistogramVec::new(
            HistogramOpts::new("federator_http_request_duration_seconds", "Inbound request latency")
                .buckets(CALL_BUCKETS.to_vec()),
            &["route"],
        )?;
        registry.register(Box::new(http_request_duration.clone()))?;

        Ok(Metrics {
            registry,
            external_calls_total,
            external_call_duration,
            http_requests_total,
            http_request_duration,
        })
    }

    /// `outcome` is `success` or the provider error code.
    pub fn record_external_call(&self, provider: &str, outcome: &str, elapsed: Duration) {
        let provider = truncate_label(provider);
        self.external_calls_total
            .with_label_values(&[provider, truncate_label(outcome)])
            .inc();
        self.external_call_duration
            .with_label_values(&[provider])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_request(&self, route: &str, status: u16, elapsed: Duration) {
        let route = truncate_label(route);
        let status = status.to_string();
        self.http_requests_total
            .with_label_values(&[route, status.as_str()])
            .inc();
        self.http_request_duration
            .with_label_values(&[route])
            .observe(elapsed.as_secs_f64());
    }

    pub fn external_call_count(&self, provider: &str, outcome: &str) -> u64 {
        self.external_calls_total
            .with_label_values(&[truncate_label(provider), truncate_label(outcome)])
            .get()
    }

    pub fn request_count(&self, route: &str, status: u16) -> u64 {
        let status = status.to_string();
        self.http_requests_total
            .with_label_values(&[truncate_label(route), status.as_str()])
            .get()
    }

    /// Prometheus text exposition format.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| MetricsError::Encoding(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::Encoding(e.to_string()))
    }
}

/// Cuts on a char boundary at or before `MAX_LABEL_VALUE_LEN` bytes.
fn truncate_label(value: &str) -> &str {
    if value.len() <= MAX_LABEL_VALUE_LEN {
        return value;
    }
    let end = value
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|&i| i <= MAX_LABEL_VALUE_LEN)
        .last()
        .unwrap_or(0);
    &value[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn counts_external_calls_per_provider_and_outcome() {
        let metrics = Metrics::new().unwrap();

        metrics.record_external_call("rgdf", "success", Duration::from_millis(12));
        metrics.record_external_call("rgdf", "success", Duration::from_millis(30));
        metrics.record_external_call("drp", "PROVIDER_TIMEOUT", Duration::from_secs(10));

        assert_eq!(metrics.external_call_count("rgdf", "success"), 2);
        assert_eq!(metrics.external_call_count("drp", "PROVIDER_TIMEOUT"), 1);
        assert_eq!(metrics.external_call_count("drp", "success"), 0);
    }

    #[test]
    fn encodes_text_exposition() {
        let metrics = Metrics::new().unwrap();
        metrics.record_external_call("rgdf", "success", Duration::from_millis(5));
        metrics.record_request("/graphql", 200, Duration::from_millis(40));

        let text = metrics.encode_text().unwrap();
        assert!(text.contains(r#"federator_external_calls_total{outcome="success",provider="rgdf"} 1"#), "{}", text);
        assert!(text.contains(r#"federator_external_call_duration_seconds_count{provider="rgdf"} 1"#));
        assert!(text.contains(r#"federator_http_requests_total{route="/graphql",status="200"} 1"#));
        assert_eq!(metrics.request_count("/graphql", 200), 1);
    }

    #[test]
    fn registries_are_independent() {
        let first = Metrics::new().unwrap();
        let second = Metrics::new().unwrap();
        first.record_request("/health", 200, Duration::ZERO);
        assert_eq!(second.request_count("/health", 200), 0);
    }

    #[test]
    fn truncates_long_labels_on_char_boundaries() {
        let long = "é".repeat(MAX_LABEL_VALUE_LEN);
        let cut = truncate_label(&long);
        assert!(cut.len() <= MAX_LABEL_VALUE_LEN);
        assert!(long.starts_with(cut));
        assert_eq!(truncate_label("rgdf"), "rgdf");
    }
}
