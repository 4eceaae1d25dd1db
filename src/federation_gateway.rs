use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::argument_translator::ArgumentTranslator;
use crate::audit::{AuditEmitter, AuditEvent, AuditEventName};
use crate::consent::{ConsentEvent, ConsentSpec, ConsentState, ConsentStatus, DataField, InvalidTransition};
use crate::error::{ClientError, FederationError};
use crate::field_resolver::{FieldResolver, ProviderLevelFieldRecord, Resolution};
use crate::gate::PolicyConsentGate;
use crate::policy::PolicyDecision;
use crate::query_executor::{ProviderExecutor, ProviderResult};
use crate::query_planner::{QueryPlan, QueryPlanner, SelectionPlanner};
use crate::response_merger::{FederatedResponse, merge};
use crate::schema_store::{SchemaStore, UnifiedSchema};
use crate::{GraphQLRequest, RequestContext};

impl From<InvalidTransition> for FederationError {
    fn from(err: InvalidTransition) -> Self {
        FederationError::Internal(err.to_string())
    }
}

/// How a federated request ended, short of an error.
#[derive(Clone, Debug, PartialEq)]
pub enum FederationOutcome {
    Completed(FederatedResponse),
    /// Nothing was fetched; the data owner has to approve first.
    ConsentPending {
        consent_id: String,
        portal_url: String,
        fields: Vec<String>,
    },
    Denied {
        reason: String,
    },
    Rejected {
        consent_id: String,
        status: ConsentStatus,
    },
}

impl FederationOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            FederationOutcome::Completed(response) => response.status(),
            FederationOutcome::ConsentPending { .. } => "CONSENT_PENDING",
            FederationOutcome::Denied { .. } => "DENIED",
            FederationOutcome::Rejected { .. } => "REJECTED",
        }
    }
}

/// Consent-request details that come from configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsentOptions {
    pub purpose: String,
    pub redirect_url: String,
    pub owner_type: String,
}

impl Default for ConsentOptions {
    fn default() -> Self {
        ConsentOptions {
            purpose: "data-exchange".to_string(),
            redirect_url: String::new(),
            owner_type: "citizen".to_string(),
        }
    }
}

/// Plans, gates, fans out and merges one federated query.
pub struct FederationGateway {
    store: Arc<dyn SchemaStore>,
    planner: Arc<dyn QueryPlanner>,
    resolver: FieldResolver,
    translator: Arc<ArgumentTranslator>,
    gate: Arc<PolicyConsentGate>,
    executor: Arc<ProviderExecutor>,
    audit: AuditEmitter,
    consent: ConsentOptions,
    request_timeout: Option<Duration>,
}

impl FederationGateway {
    pub fn new(
        store: Arc<dyn SchemaStore>,
        translator: Arc<ArgumentTranslator>,
        gate: Arc<PolicyConsentGate>,
        executor: Arc<ProviderExecutor>,
        audit: AuditEmitter,
    ) -> Self {
        FederationGateway {
            store,
            planner: Arc::new(SelectionPlanner::new()),
            resolver: FieldResolver::new(),
            translator,
            gate,
            executor,
            audit,
            consent: ConsentOptions::default(),
            request_timeout: None,
        }
    }

    /// Bounds planning, gating and execution of every request.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn with_consent_options(mut self, consent: ConsentOptions) -> Self {
        self.consent = consent;
        self
    }

    pub fn with_planner(mut self, planner: Arc<dyn QueryPlanner>) -> Self {
        self.planner = planner;
        self
    }

    pub fn store(&self) -> &Arc<dyn SchemaStore> {
        &self.store
    }

    pub fn audit(&self) -> &AuditEmitter {
        &self.audit
    }

    #[instrument(skip_all, fields(trace_id = %ctx.trace_id, consumer_id = %ctx.consumer_id))]
    pub async fn federate(
        &self,
        ctx: &RequestContext,
        request: &GraphQLRequest,
    ) -> Result<FederationOutcome, FederationError> {
        let result = self.bounded(self.federate_inner(ctx, request)).await;
        self.finish(ctx, &result);
        result
    }

    /// Resumes a request parked on consent. Only an approved consent gets
    /// the request executed; every other status rejects it.
    #[instrument(skip_all, fields(trace_id = %ctx.trace_id, consent_id = %consent_id))]
    pub async fn complete_consent(
        &self,
        ctx: &RequestContext,
        consent_id: &str,
        request: &GraphQLRequest,
    ) -> Result<FederationOutcome, FederationError> {
        let result = self
            .bounded(self.complete_consent_inner(ctx, consent_id, request))
            .await;
        self.finish(ctx, &result);
        result
    }

    /// Dropping `work` on expiry cancels any in-flight provider calls.
    async fn bounded<F>(&self, work: F) -> Result<FederationOutcome, FederationError>
    where
        F: Future<Output = Result<FederationOutcome, FederationError>>,
    {
        let Some(limit) = self.request_timeout else {
            return work.await;
        };
        tokio::time::timeout(limit, work)
            .await
            .unwrap_or_else(|_| Err(FederationError::RequestTimeout(limit.as_millis() as u64)))
    }

    async fn federate_inner(
        &self,
        ctx: &RequestContext,
        request: &GraphQLRequest,
    ) -> Result<FederationOutcome, FederationError> {
        let (_schema, plan, resolution) = self.prepare(request).await?;
        let owner_id = self.translator.owner_id(&plan.arguments);
        let decision = self.evaluate(ctx, owner_id.as_deref(), &resolution).await?;

        if !decision.allow {
            return Ok(FederationOutcome::Denied {
                reason: "access denied by policy".to_string(),
            });
        }

        if decision.consent_required {
            let state = ConsentState::Evaluated.next(ConsentEvent::Initiated)?;
            let owner_id = owner_id.ok_or_else(|| {
                ClientError::MissingArgument("data owner identifier for consent".to_string())
            })?;
            let spec = ConsentSpec {
                app_id: ctx.app_id.clone(),
                data_fields: vec![DataField {
                    owner_type: self.consent.owner_type.clone(),
                    owner_id,
                    fields: decision.consent_required_fields.clone(),
                }],
                purpose: self.consent.purpose.clone(),
                session_id: ctx.trace_id.clone(),
                redirect_url: self.consent.redirect_url.clone(),
            };

            let ticket = self.gate.initiate_consent(ctx, &spec).await.inspect_err(|e| {
                self.audit.emit(
                    AuditEvent::new(ctx, AuditEventName::ConsentCheck, "FAILURE")
                        .requested(json!({ "fields": decision.consent_required_fields }))
                        .metadata(json!({ "error": e.to_string(), "code": e.code() })),
                );
            })?;
            self.audit.emit(
                AuditEvent::new(ctx, AuditEventName::ConsentCheck, "PENDING")
                    .resource("consent", Some(ticket.consent_id.clone()))
                    .requested(json!({ "fields": decision.consent_required_fields }))
                    .metadata(json!({ "state": state })),
            );

            return Ok(FederationOutcome::ConsentPending {
                consent_id: ticket.consent_id,
                portal_url: ticket.redirect_url,
                fields: decision.consent_required_fields,
            });
        }

        let response = self.execute(ctx, &plan, &resolution).await;
        Ok(FederationOutcome::Completed(response))
    }

    async fn complete_consent_inner(
        &self,
        ctx: &RequestContext,
        consent_id: &str,
        request: &GraphQLRequest,
    ) -> Result<FederationOutcome, FederationError> {
        let status = self
            .gate
            .poll_consent_status(ctx, consent_id)
            .await
            .inspect_err(|e| {
                self.audit.emit(
                    AuditEvent::new(ctx, AuditEventName::ConsentCheck, "FAILURE")
                        .resource("consent", Some(consent_id.to_string()))
                        .metadata(json!({ "error": e.to_string(), "code": e.code() })),
                );
            })?;

        let state = ConsentState::ConsentPending.next(ConsentEvent::Polled(status.clone()))?;
        self.audit.emit(
            AuditEvent::new(ctx, AuditEventName::ConsentCheck, status.as_str().to_ascii_uppercase())
                .resource("consent", Some(consent_id.to_string()))
                .metadata(json!({ "state": state })),
        );

        if state == ConsentState::Denied {
            state.next(ConsentEvent::Finish)?;
            info!(trace_id = %ctx.trace_id, consent_id = %consent_id, status = %status, "Consent not approved");
            return Ok(FederationOutcome::Rejected {
                consent_id: consent_id.to_string(),
                status,
            });
        }

        let (_schema, plan, resolution) = self.prepare(request).await?;
        let owner_id = self.translator.owner_id(&plan.arguments);
        // Re-evaluated: the approved consent covers consent, not access.
        let decision = self.evaluate(ctx, owner_id.as_deref(), &resolution).await?;
        if !decision.allow {
            return Ok(FederationOutcome::Denied {
                reason: "access denied by policy".to_string(),
            });
        }

        let state = state.next(ConsentEvent::Execute)?;
        let response = self.execute(ctx, &plan, &resolution).await;
        state.next(ConsentEvent::Finish)?;
        Ok(FederationOutcome::Completed(response))
    }

    /// Loads the active schema for this request and maps the query onto it.
    async fn prepare(
        &self,
        request: &GraphQLRequest,
    ) -> Result<(UnifiedSchema, QueryPlan, Resolution), FederationError> {
        let schema = self
            .store
            .get_active_schema()
            .await?
            .ok_or(FederationError::NoActiveSchema)?;
        let plan = self.planner.plan_query(request, &schema.compiled)?;
        let resolution = self.resolver.resolve(&schema.compiled, &plan.requested);
        if !resolution.is_complete() {
            return Err(ClientError::UnresolvedFields(resolution.unmapped).into());
        }
        Ok((schema, plan, resolution))
    }

    async fn evaluate(
        &self,
        ctx: &RequestContext,
        owner_id: Option<&str>,
        resolution: &Resolution,
    ) -> Result<PolicyDecision, FederationError> {
        let requested = json!({ "fields": resolution.field_paths() });
        match self.gate.evaluate(ctx, owner_id, &resolution.records).await {
            Ok(decision) => {
                self.audit.emit(
                    AuditEvent::new(ctx, AuditEventName::PolicyCheck, decision.outcome())
                        .requested(requested)
                        .response(json!({
                            "allow": decision.allow,
                            "consentRequired": decision.consent_required,
                            "consentRequiredFields": decision.consent_required_fields,
                        })),
                );
                Ok(decision)
            }
            Err(e) => {
                self.audit.emit(
                    AuditEvent::new(ctx, AuditEventName::PolicyCheck, "FAILURE")
                        .requested(requested)
                        .metadata(json!({ "error": e.to_string(), "code": e.code() })),
                );
                Err(e.into())
            }
        }
    }

    async fn execute(&self, ctx: &RequestContext, plan: &QueryPlan, resolution: &Resolution) -> FederatedResponse {
        let mut pending = PendingFetches {
            audit: &self.audit,
            ctx,
            records: &resolution.records,
            done: false,
        };
        let results = self
            .executor
            .execute(ctx, &resolution.records, &plan.arguments)
            .await;
        pending.done = true;
        for result in results.values() {
            self.audit.emit(data_fetch_event(ctx, result, &resolution.records));
        }
        let response = merge(&results, &resolution.records);
        info!(
            trace_id = %ctx.trace_id,
            providers = results.len(),
            errors = response.errors.len(),
            "Federated query executed"
        );
        response
    }

    fn finish(&self, ctx: &RequestContext, result: &Result<FederationOutcome, FederationError>) {
        let event = match result {
            Ok(outcome) => {
                let mut metadata = json!({ "outcome": outcome.status() });
                if let FederationOutcome::Completed(response) = outcome {
                    metadata["errorCount"] = json!(response.errors.len());
                }
                AuditEvent::new(ctx, AuditEventName::OrchestrationCompleted, outcome.status()).metadata(metadata)
            }
            Err(e) => {
                warn!(trace_id = %ctx.trace_id, code = e.code(), error = %e, "Federated request failed");
                let status = match e {
                    FederationError::RequestTimeout(_) => "TIMEOUT",
                    _ => "FAILURE",
                };
                AuditEvent::new(ctx, AuditEventName::OrchestrationCompleted, status)
                    .metadata(json!({ "error": e.to_string(), "code": e.code() }))
            }
        };
        self.audit.emit(event);
    }
}

/// Reports a `DATA_FETCH` per provider when the fan-out is dropped before
/// it finished.
struct PendingFetches<'a> {
    audit: &'a AuditEmitter,
    ctx: &'a RequestContext,
    records: &'a [ProviderLevelFieldRecord],
    done: bool,
}

impl Drop for PendingFetches<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let mut providers: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for record in self.records {
            providers
                .entry(record.provider_key.as_str())
                .or_default()
                .push(record.unified_path.as_str());
        }
        for (provider_key, fields) in providers {
            self.audit.emit(
                AuditEvent::new(self.ctx, AuditEventName::DataFetch, "CANCELLED")
                    .target_service(provider_key)
                    .requested(json!({ "fields": fields })),
            );
        }
    }
}

fn data_fetch_event(
    ctx: &RequestContext,
    result: &ProviderResult,
    records: &[ProviderLevelFieldRecord],
) -> AuditEvent {
    let schema_id = records
        .iter()
        .find(|record| record.provider_key == result.provider_key)
        .and_then(|record| record.provider_schema_id.clone());
    let mut response: BTreeMap<&str, Value> = BTreeMap::new();
    response.insert("elapsedMs", json!(result.elapsed.as_millis() as u64));
    if let Err(error) = &result.outcome {
        response.insert("error", json!(error.cause.to_string()));
        response.insert("code", json!(error.cause.code()));
    }

    let status = if result.is_success() { "SUCCESS" } else { "FAILURE" };
    AuditEvent::new(ctx, AuditEventName::DataFetch, status)
        .target_service(result.provider_key.clone())
        .resource("provider-schema", schema_id)
        .requested(json!({ "fields": result.field_paths }))
        .response(json!(response))
}
