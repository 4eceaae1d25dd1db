use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::RequestContext;
use crate::consent::{ConsentEngine, ConsentSpec, ConsentStatus, ConsentTicket};
use crate::error::GateError;
use crate::field_resolver::ProviderLevelFieldRecord;
use crate::policy::{PdpRequest, PolicyDecision, PolicyDecisionPoint, RequiredField};

/// Clears a request with the policy decision point and, when asked to,
/// the consent engine. Fails closed: any failure to get an answer is an error,
/// never an allow.
pub struct PolicyConsentGate {
    pdp: Arc<dyn PolicyDecisionPoint>,
    consent: Option<Arc<dyn ConsentEngine>>,
    pdp_timeout: Duration,
    consent_timeout: Duration,
}

impl PolicyConsentGate {
    pub fn new(
        pdp: Arc<dyn PolicyDecisionPoint>,
        consent: Option<Arc<dyn ConsentEngine>>,
        pdp_timeout: Duration,
        consent_timeout: Duration,
    ) -> Self {
        PolicyConsentGate {
            pdp,
            consent,
            pdp_timeout,
            consent_timeout,
        }
    }

    pub async fn evaluate(
        &self,
        ctx: &RequestContext,
        owner_id: Option<&str>,
        records: &[ProviderLevelFieldRecord],
    ) -> Result<PolicyDecision, GateError> {
        let request = PdpRequest {
            consumer_id: ctx.consumer_id.clone(),
            app_id: ctx.app_id.clone(),
            request_id: ctx.trace_id.clone(),
            owner_id: owner_id.map(str::to_string),
            required_fields: required_fields(records),
            timestamp: Utc::now(),
        };

        let response = bounded(
            self.pdp_timeout,
            self.pdp.decide(ctx, &request),
            GateError::PdpTimeout,
        )
        .await
        .inspect_err(|e| warn!(trace_id = %ctx.trace_id, error = %e, "Policy evaluation failed"))?;

        let decision = PolicyDecision::try_from(response)?;
        info!(
            trace_id = %ctx.trace_id,
            outcome = decision.outcome(),
            fields = request.required_fields.len(),
            "Policy decision"
        );
        Ok(decision)
    }

    pub async fn initiate_consent(
        &self,
        ctx: &RequestContext,
        spec: &ConsentSpec,
    ) -> Result<ConsentTicket, GateError> {
        let engine = self.consent.as_ref().ok_or(GateError::ConsentNotConfigured)?;
        let ticket = bounded(
            self.consent_timeout,
            engine.create_consent(ctx, spec),
            GateError::ConsentTimeout,
        )
        .await?;
        info!(trace_id = %ctx.trace_id, consent_id = %ticket.consent_id, "Consent pending");
        Ok(ticket)
    }

    pub async fn poll_consent_status(
        &self,
        ctx: &RequestContext,
        consent_id: &str,
    ) -> Result<ConsentStatus, GateError> {
        let engine = self.consent.as_ref().ok_or(GateError::ConsentNotConfigured)?;
        let status = bounded(
            self.consent_timeout,
            engine.consent_status(ctx, consent_id),
            GateError::ConsentTimeout,
        )
        .await?;
        info!(trace_id = %ctx.trace_id, consent_id = %consent_id, status = %status, "Consent status");
        Ok(status)
    }
}

async fn bounded<T, F>(
    limit: Duration,
    call: F,
    on_timeout: fn(u64) -> GateError,
) -> Result<T, GateError>
where
    F: Future<Output = Result<T, GateError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(on_timeout(limit.as_millis() as u64)),
    }
}

fn required_fields(records: &[ProviderLevelFieldRecord]) -> Vec<RequiredField> {
    let mut fields: Vec<RequiredField> = Vec::new();
    for record in records {
        if fields.iter().any(|f| f.field_name == record.unified_path) {
            continue;
        }
        fields.push(RequiredField {
            provider_key: record.provider_key.clone(),
            schema_id: record.provider_schema_id.clone(),
            field_name: record.unified_path.clone(),
        });
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field_resolver::FieldRole;
    use crate::policy::PdpResponse;
    use crate::sdl::DirectiveMetadata;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ScriptedPdp {
        reply: Result<PdpResponse, GateError>,
        delay: Duration,
        seen: Mutex<Vec<PdpRequest>>,
    }

    #[async_trait]
    impl PolicyDecisionPoint for ScriptedPdp {
        async fn decide(&self, _ctx: &RequestContext, request: &PdpRequest) -> Result<PdpResponse, GateError> {
            self.seen.lock().unwrap().push(request.clone());
            tokio::time::sleep(self.delay).await;
            self.reply.clone()
        }
    }

    fn gate(reply: Result<PdpResponse, GateError>, delay: Duration) -> (PolicyConsentGate, Arc<ScriptedPdp>) {
        let pdp = Arc::new(ScriptedPdp {
            reply,
            delay,
            seen: Mutex::new(Vec::new()),
        });
        let gate = PolicyConsentGate::new(
            pdp.clone(),
            None,
            Duration::from_millis(50),
            Duration::from_millis(50),
        );
        (gate, pdp)
    }

    fn record(path: &str) -> ProviderLevelFieldRecord {
        ProviderLevelFieldRecord {
            provider_schema_id: Some("rgdf-v1".into()),
            provider_key: "rgdf".into(),
            provider_field: "getPersonInfo.fullName".into(),
            unified_path: path.into(),
            response_path: vec!["person".into(), "name".into()],
            role: FieldRole::Leaf,
            metadata: DirectiveMetadata::default(),
        }
    }

    fn ctx() -> RequestContext {
        RequestContext::new(Some("trace-1".into()), "consumer-1", Some("app-1".into()))
    }

    #[tokio::test]
    async fn sends_deduplicated_fields_with_identity() {
        let allow = PdpResponse {
            allow: true,
            consent_required: false,
            consent_required_fields: Vec::new(),
        };
        let (gate, pdp) = gate(Ok(allow), Duration::ZERO);

        let decision = gate
            .evaluate(&ctx(), Some("1990"), &[record("person.name"), record("person.name")])
            .await
            .unwrap();
        assert!(decision.allow);

        let seen = pdp.seen.lock().unwrap();
        assert_eq!(seen[0].consumer_id, "consumer-1");
        assert_eq!(seen[0].app_id, "app-1");
        assert_eq!(seen[0].request_id, "trace-1");
        assert_eq!(seen[0].owner_id.as_deref(), Some("1990"));
        assert_eq!(seen[0].required_fields.len(), 1);
        assert_eq!(seen[0].required_fields[0].schema_id.as_deref(), Some("rgdf-v1"));
    }

    #[tokio::test]
    async fn pdp_timeout_fails_closed() {
        let allow = PdpResponse {
            allow: true,
            consent_required: false,
            consent_required_fields: Vec::new(),
        };
        let (gate, _) = gate(Ok(allow), Duration::from_millis(500));
        let err = gate.evaluate(&ctx(), None, &[record("person.name")]).await.unwrap_err();
        assert_eq!(err, GateError::PdpTimeout(50));
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn pdp_transport_error_fails_closed() {
        let (gate, _) = gate(Err(GateError::PdpUnavailable("refused".into())), Duration::ZERO);
        assert!(matches!(
            gate.evaluate(&ctx(), None, &[record("person.name")]).await,
            Err(GateError::PdpUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn consent_calls_require_an_engine() {
        let (gate, _) = gate(Err(GateError::PdpUnavailable("unused".into())), Duration::ZERO);
        assert_eq!(
            gate.poll_consent_status(&ctx(), "c-1").await.unwrap_err(),
            GateError::ConsentNotConfigured
        );
    }
}
