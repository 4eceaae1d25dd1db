use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::AuditError;
use crate::{RequestContext, TRACE_ID_HEADER};

pub const SERVICE_NAME: &str = "exchange-federator";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventName {
    PolicyCheck,
    ConsentCheck,
    DataFetch,
    OrchestrationCompleted,
}

impl AuditEventName {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventName::PolicyCheck => "POLICY_CHECK",
            AuditEventName::ConsentCheck => "CONSENT_CHECK",
            AuditEventName::DataFetch => "DATA_FETCH",
            AuditEventName::OrchestrationCompleted => "ORCHESTRATION_COMPLETED",
        }
    }

    fn target(&self) -> (&'static str, &'static str) {
        match self {
            AuditEventName::PolicyCheck => ("SERVICE", "policy-decision-point"),
            AuditEventName::ConsentCheck => ("SERVICE", "consent-engine"),
            AuditEventName::DataFetch => ("PROVIDER", "provider"),
            AuditEventName::OrchestrationCompleted => ("SERVICE", SERVICE_NAME),
        }
    }
}

impl fmt::Display for AuditEventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audit record. Carries field names and outcomes, never field values.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub trace_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_name: AuditEventName,
    pub event_type: String,
    pub status: String,
    pub actor_type: String,
    pub actor_service_name: String,
    pub actor_user_id: String,
    pub target_type: String,
    pub target_service_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_resource: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_resource_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_metadata: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_metadata: Option<Value>,
}

impl AuditEvent {
    pub fn new(ctx: &RequestContext, event_name: AuditEventName, status: impl Into<String>) -> Self {
        let (target_type, target_service_name) = event_name.target();
        AuditEvent {
            trace_id: ctx.trace_id.clone(),
            timestamp: Utc::now(),
            event_name,
            event_type: "DATA_EXCHANGE".to_string(),
            status: status.into(),
            actor_type: "SERVICE".to_string(),
            actor_service_name: SERVICE_NAME.to_string(),
            actor_user_id: ctx.consumer_id.clone(),
            target_type: target_type.to_string(),
            target_service_name: target_service_name.to_string(),
            target_resource: None,
            target_resource_id: None,
            requested_data: None,
            response_metadata: None,
            event_metadata: None,
        }
    }

    pub fn target_service(mut self, name: impl Into<String>) -> Self {
        self.target_service_name = name.into();
        self
    }

    pub fn resource(mut self, resource: impl Into<String>, id: Option<String>) -> Self {
        self.target_resource = Some(resource.into());
        self.target_resource_id = id;
        self
    }

    pub fn requested(mut self, data: Value) -> Self {
        self.requested_data = Some(data);
        self
    }

    pub fn response(mut self, metadata: Value) -> Self {
        self.response_metadata = Some(metadata);
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.event_metadata = Some(metadata);
        self
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn send(&self, event: &AuditEvent) -> Result<(), AuditError>;
}

/// `POST {base_url}/api/audit-logs`.
pub struct HttpAuditSink {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpAuditSink {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        HttpAuditSink {
            client: reqwest::Client::new(),
            url: format!("{}/api/audit-logs", base_url.trim_end_matches('/')),
            timeout,
        }
    }
}

#[async_trait]
impl AuditSink for HttpAuditSink {
    async fn send(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let response = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .header(TRACE_ID_HEADER, &event.trace_id)
            .json(event)
            .send()
            .await
            .map_err(|e| AuditError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(AuditError::Rejected(response.status().as_u16()));
        }
        Ok(())
    }
}

#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

/// Fire-and-forget delivery of audit events. Each event is sent from its own
/// task, so a cancelled request still gets audited.
#[derive(Clone)]
pub struct AuditEmitter {
    sink: Option<Arc<dyn AuditSink>>,
    in_flight: Arc<InFlight>,
}

impl AuditEmitter {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        AuditEmitter {
            sink: Some(sink),
            in_flight: Arc::default(),
        }
    }

    pub fn disabled() -> Self {
        AuditEmitter {
            sink: None,
            in_flight: Arc::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    pub fn emit(&self, event: AuditEvent) {
        let Some(sink) = self.sink.clone() else {
            return;
        };
        let in_flight = self.in_flight.clone();
        in_flight.count.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            match sink.send(&event).await {
                Ok(()) => debug!(trace_id = %event.trace_id, event = %event.event_name, "Audit event delivered"),
                Err(e) => warn!(
                    trace_id = %event.trace_id,
                    event = %event.event_name,
                    error = %e,
                    "Failed to deliver audit event"
                ),
            }
            if in_flight.count.fetch_sub(1, Ordering::SeqCst) == 1 {
                in_flight.idle.notify_waiters();
            }
        });
    }

    /// Resolves once every event emitted so far has been delivered or dropped.
    pub async fn drain(&self) {
        loop {
            let idle = self.in_flight.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.in_flight.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct SlowSink {
        delivered: Mutex<Vec<AuditEvent>>,
        fail: bool,
    }

    #[async_trait]
    impl AuditSink for SlowSink {
        async fn send(&self, event: &AuditEvent) -> Result<(), AuditError> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail {
                return Err(AuditError::Rejected(500));
            }
            self.delivered.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    fn ctx() -> RequestContext {
        RequestContext::new(Some("trace-9".into()), "consumer-1", Some("app-1".into()))
    }

    #[test]
    fn serializes_camel_case_payload() {
        let mut event = AuditEvent::new(&ctx(), AuditEventName::PolicyCheck, "SUCCESS")
            .requested(json!({"fields": ["person.name"]}));
        event.timestamp = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "traceId": "trace-9",
                "timestamp": "2024-01-01T00:00:00Z",
                "eventName": "POLICY_CHECK",
                "eventType": "DATA_EXCHANGE",
                "status": "SUCCESS",
                "actorType": "SERVICE",
                "actorServiceName": "exchange-federator",
                "actorUserId": "consumer-1",
                "targetType": "SERVICE",
                "targetServiceName": "policy-decision-point",
                "requestedData": {"fields": ["person.name"]}
            })
        );
    }

    #[tokio::test]
    async fn drain_waits_for_in_flight_events() {
        let sink = Arc::new(SlowSink::default());
        let emitter = AuditEmitter::new(sink.clone());
        for name in [AuditEventName::PolicyCheck, AuditEventName::OrchestrationCompleted] {
            emitter.emit(AuditEvent::new(&ctx(), name, "SUCCESS"));
        }

        emitter.drain().await;
        let delivered = sink.delivered.lock().unwrap();
        assert_eq!(delivered.len(), 2);
        assert!(delivered.iter().all(|e| e.trace_id == "trace-9"));
    }

    #[tokio::test]
    async fn delivery_failures_are_swallowed() {
        let sink = Arc::new(SlowSink {
            fail: true,
            ..SlowSink::default()
        });
        let emitter = AuditEmitter::new(sink);
        emitter.emit(AuditEvent::new(&ctx(), AuditEventName::DataFetch, "FAILURE"));
        emitter.drain().await;
    }

    #[tokio::test]
    async fn disabled_emitter_drops_events() {
        let emitter = AuditEmitter::disabled();
        assert!(!emitter.is_enabled());
        emitter.emit(AuditEvent::new(&ctx(), AuditEventName::DataFetch, "SUCCESS"));
        emitter.drain().await;
    }
}
