use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::argument_translator::{ArgumentTranslator, ConsumerArguments};
use crate::error::{ProviderError, ProviderFailure};
use crate::field_resolver::ProviderLevelFieldRecord;
use crate::metrics::Metrics;
use crate::provider::ProviderRegistry;
use crate::query_planner::provider_query;
use crate::{RequestContext, TRACE_ID_HEADER};

/// Sends one GraphQL document to one provider and returns its `data`.
#[async_trait]
pub trait ProviderTransport: Send + Sync {
    async fn fetch(
        &self,
        ctx: &RequestContext,
        provider_key: &str,
        query: &str,
    ) -> Result<Value, ProviderFailure>;

    /// Per-provider timeout, when the provider configures its own.
    fn timeout_for(&self, _provider_key: &str) -> Option<Duration> {
        None
    }
}

#[derive(Debug, Deserialize)]
struct ProviderResponse {
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    errors: Vec<Value>,
}

pub struct HttpProviderTransport {
    client: reqwest::Client,
    registry: ProviderRegistry,
}

impl HttpProviderTransport {
    pub fn new(registry: ProviderRegistry) -> Self {
        HttpProviderTransport {
            client: reqwest::Client::new(),
            registry,
        }
    }
}

#[async_trait]
impl ProviderTransport for HttpProviderTransport {
    async fn fetch(
        &self,
        ctx: &RequestContext,
        provider_key: &str,
        query: &str,
    ) -> Result<Value, ProviderFailure> {
        let provider = self
            .registry
            .get(provider_key)
            .ok_or(ProviderFailure::NotRegistered)?;

        let request = self
            .client
            .post(&provider.config.url)
            .header(TRACE_ID_HEADER, &ctx.trace_id)
            .json(&json!({ "query": query }));
        let request = provider.authorize(&self.client, request).await?;

        let response = request
            .send()
            .await
            .map_err(|e| ProviderFailure::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ProviderFailure::Status(status.as_u16()));
        }

        let body: ProviderResponse = response
            .json()
            .await
            .map_err(|e| ProviderFailure::InvalidResponse(e.to_string()))?;
        if !body.errors.is_empty() {
            let messages: Vec<String> = body
                .errors
                .iter()
                .map(|error| match error.get("message").and_then(Value::as_str) {
                    Some(message) => message.to_string(),
                    None => error.to_string(),
                })
                .collect();
            return Err(ProviderFailure::GraphQL(messages.join("; ")));
        }
        match body.data {
            Some(data @ Value::Object(_)) => Ok(data),
            _ => Err(ProviderFailure::InvalidResponse("response carries no data object".to_string())),
        }
    }

    fn timeout_for(&self, provider_key: &str) -> Option<Duration> {
        self.registry
            .get(provider_key)
            .and_then(|provider| provider.config.timeout_ms)
            .map(Duration::from_millis)
    }
}

/// What one provider call produced.
#[derive(Clone, Debug, PartialEq)]
pub struct ProviderResult {
    pub provider_key: String,
    pub field_paths: Vec<String>,
    pub elapsed: Duration,
    pub outcome: Result<Value, ProviderError>,
}

impl ProviderResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

struct ProviderCall {
    provider_key: String,
    field_paths: Vec<String>,
    query: String,
    timeout: Duration,
}

/// Fans a cleared request out to its providers: one sub-query per provider,
/// at most `max_concurrency` in flight, each under its own timeout.
pub struct ProviderExecutor {
    transport: Arc<dyn ProviderTransport>,
    translator: Arc<ArgumentTranslator>,
    max_concurrency: usize,
    default_timeout: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl ProviderExecutor {
    pub fn new(
        transport: Arc<dyn ProviderTransport>,
        translator: Arc<ArgumentTranslator>,
        max_concurrency: usize,
        default_timeout: Duration,
    ) -> Self {
        ProviderExecutor {
            transport,
            translator,
            max_concurrency: max_concurrency.max(1),
            default_timeout,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn execute(
        &self,
        ctx: &RequestContext,
        records: &[ProviderLevelFieldRecord],
        arguments: &ConsumerArguments,
    ) -> BTreeMap<String, ProviderResult> {
        let mut by_provider: BTreeMap<&str, Vec<&ProviderLevelFieldRecord>> = BTreeMap::new();
        for record in records {
            by_provider
                .entry(record.provider_key.as_str())
                .or_default()
                .push(record);
        }

        let calls: Vec<ProviderCall> = by_provider
            .into_iter()
            .map(|(provider_key, records)| {
                let translated = self.translator.translate(provider_key, arguments);
                let mut field_paths: Vec<String> = Vec::new();
                for record in &records {
                    if !field_paths.contains(&record.unified_path) {
                        field_paths.push(record.unified_path.clone());
                    }
                }
                ProviderCall {
                    provider_key: provider_key.to_string(),
                    field_paths,
                    query: provider_query(&records, &translated),
                    timeout: self
                        .transport
                        .timeout_for(provider_key)
                        .unwrap_or(self.default_timeout),
                }
            })
            .collect();

        stream::iter(calls)
            .map(|call| self.call(ctx, call))
            .buffer_unordered(self.max_concurrency)
            .map(|result| (result.provider_key.clone(), result))
            .collect()
            .await
    }

    async fn call(&self, ctx: &RequestContext, call: ProviderCall) -> ProviderResult {
        debug!(
            trace_id = %ctx.trace_id,
            provider_key = %call.provider_key,
            fields = call.field_paths.len(),
            "Calling provider"
        );
        let started = Instant::now();
        let fetched = tokio::time::timeout(
            call.timeout,
            self.transport.fetch(ctx, &call.provider_key, &call.query),
        )
        .await
        .unwrap_or_else(|_| Err(ProviderFailure::Timeout(call.timeout.as_millis() as u64)));
        let elapsed = started.elapsed();
        if let Some(metrics) = &self.metrics {
            let outcome = match &fetched {
                Ok(_) => "success",
                Err(cause) => cause.code(),
            };
            metrics.record_external_call(&call.provider_key, outcome, elapsed);
        }

        let outcome = fetched.map_err(|cause| {
            warn!(
                trace_id = %ctx.trace_id,
                provider_key = %call.provider_key,
                error = %cause,
                "Provider call failed"
            );
            ProviderError {
                provider_key: call.provider_key.clone(),
                field_paths: call.field_paths.clone(),
                cause,
            }
        });

        ProviderResult {
            provider_key: call.provider_key,
            field_paths: call.field_paths,
            elapsed,
            outcome,
        }
    }
}
