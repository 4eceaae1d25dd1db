use bytes::Bytes;
use futures::FutureExt;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, Method, StatusCode};
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::convert::Infallible;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::argument_translator::ArgumentTranslator;
use crate::audit::{AuditEmitter, HttpAuditSink};
use crate::config::Config;
use crate::consent::{ConsentEngine, HttpConsentClient};
use crate::error::{ClientError, FederationError, StoreError};
use crate::federation_gateway::{ConsentOptions, FederationGateway, FederationOutcome};
use crate::gate::PolicyConsentGate;
use crate::metrics::{Metrics, MetricsError, TEXT_CONTENT_TYPE};
use crate::policy::HttpPdpClient;
use crate::provider::ProviderRegistry;
use crate::query_executor::{HttpProviderTransport, ProviderExecutor};
use crate::schema_store::{NewProviderSchema, NewSchema, SchemaStore};
use crate::{GraphQLRequest, RequestContext, TRACE_ID_HEADER, sdl};

pub const CONSUMER_ID_HEADER: &str = "X-Consumer-ID";
pub const APP_ID_HEADER: &str = "X-App-ID";

pub type ResponseBody = BoxBody<Bytes, hyper::Error>;

pub struct AppState {
    pub gateway: Arc<FederationGateway>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    /// Wires the HTTP clients for the policy decision point, consent engine,
    /// providers and audit sink from `config`.
    pub fn from_config(config: &Config, store: Arc<dyn SchemaStore>) -> Result<Self, MetricsError> {
        let consent: Option<Arc<dyn ConsentEngine>> = config
            .consent
            .url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .map(|url| Arc::new(HttpConsentClient::new(url)) as Arc<dyn ConsentEngine>);
        if consent.is_none() {
            warn!("No consent engine configured; requests needing consent will fail");
        }
        let gate = Arc::new(PolicyConsentGate::new(
            Arc::new(HttpPdpClient::new(&config.pdp.url)),
            consent,
            config.pdp_timeout(),
            config.consent_timeout(),
        ));

        let translator = Arc::new(ArgumentTranslator::new(config.argument_mappings.clone()));
        let transport = Arc::new(HttpProviderTransport::new(ProviderRegistry::new(
            config.providers.clone(),
        )));
        let metrics = Arc::new(Metrics::new()?);
        let executor = Arc::new(
            ProviderExecutor::new(
                transport,
                translator.clone(),
                config.execution.max_concurrent_providers,
                config.provider_timeout(),
            )
            .with_metrics(metrics.clone()),
        );

        let audit = match config.audit.active_url() {
            Some(url) => AuditEmitter::new(Arc::new(HttpAuditSink::new(url, config.audit_timeout()))),
            None => {
                info!("Audit disabled");
                AuditEmitter::disabled()
            }
        };

        let gateway = FederationGateway::new(store, translator, gate, executor, audit)
            .with_consent_options(ConsentOptions {
                purpose: config.consent.purpose.clone(),
                redirect_url: config.consent.redirect_url.clone(),
                owner_type: config.consent.owner_type.clone(),
            })
            .with_request_timeout(config.request_timeout());
        Ok(AppState {
            gateway: Arc::new(gateway),
            metrics,
        })
    }

    fn store(&self) -> &Arc<dyn SchemaStore> {
        self.gateway.store()
    }
}

/// A routed response before it is turned into HTTP.
#[derive(Clone, Debug, PartialEq)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: Value,
    /// Sent instead of `body` as plain text when set.
    pub text: Option<String>,
}

impl ApiResponse {
    pub fn new(status: StatusCode, body: Value) -> Self {
        ApiResponse {
            status,
            body,
            text: None,
        }
    }

    fn text(status: StatusCode, text: String) -> Self {
        ApiResponse {
            status,
            body: Value::Null,
            text: Some(text),
        }
    }

    fn json<T: Serialize>(status: StatusCode, value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(body) => ApiResponse::new(status, body),
            Err(e) => ApiResponse::error(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", &e.to_string()),
        }
    }

    fn error(status: StatusCode, code: &str, message: &str) -> Self {
        ApiResponse::new(
            status,
            json!({ "errors": [{ "message": message, "extensions": { "code": code } }] }),
        )
    }

    fn internal(trace_id: &str) -> Self {
        ApiResponse::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({ "errors": [{
                "message": "internal server error",
                "extensions": { "code": "INTERNAL_ERROR", "correlationId": trace_id }
            }] }),
        )
    }
}

fn full<T: Into<Bytes>>(value: T) -> ResponseBody {
    Full::new(value.into())
        .map_err(|never| match never {})
        .boxed()
}

fn internal_server_error() -> Response<ResponseBody> {
    let mut response = Response::new(full("Internal Server Error"));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}

pub async fn handle_request(
    req: Request<Incoming>,
    state: Arc<AppState>,
) -> Result<Response<ResponseBody>, Infallible> {
    let started = Instant::now();
    let (parts, body) = req.into_parts();
    let trace_id = parts
        .headers
        .get(TRACE_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let response = match body.collect().await {
        Ok(collected) => {
            let body = collected.to_bytes();
            let routed = AssertUnwindSafe(route(
                &state,
                &parts.method,
                parts.uri.path(),
                parts.uri.query(),
                &parts.headers,
                &body,
                &trace_id,
            ))
            .catch_unwind()
            .await;
            routed.unwrap_or_else(|_| {
                error!(trace_id = %trace_id, path = %parts.uri.path(), "Request handler panicked");
                ApiResponse::internal(&trace_id)
            })
        }
        Err(e) => ApiResponse::error(
            StatusCode::BAD_REQUEST,
            "BAD_REQUEST",
            &format!("Failed to read request body: {}", e),
        ),
    };

    debug!(
        trace_id = %trace_id,
        method = %parts.method,
        path = %parts.uri.path(),
        status = response.status.as_u16(),
        "Request handled"
    );
    state
        .metrics
        .record_request(route_name(parts.uri.path()), response.status.as_u16(), started.elapsed());
    Ok(render(response, &trace_id))
}

fn render(response: ApiResponse, trace_id: &str) -> Response<ResponseBody> {
    let (content_type, body) = match response.text {
        Some(text) => (TEXT_CONTENT_TYPE, text.into_bytes()),
        None => ("application/json", serde_json::to_vec(&response.body).unwrap_or_default()),
    };
    Response::builder()
        .status(response.status)
        .header(CONTENT_TYPE, content_type)
        .header(TRACE_ID_HEADER, trace_id)
        .body(full(body))
        .unwrap_or_else(|_| internal_server_error())
}

/// Route template used as a metrics label, so raw paths never become labels.
fn route_name(path: &str) -> &'static str {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    match segments.as_slice() {
        [] | ["graphql"] => "/graphql",
        ["consent-complete"] => "/consent-complete",
        ["health"] => "/health",
        ["metrics"] => "/metrics",
        ["sdl"] => "/sdl",
        ["sdl", "versions"] => "/sdl/versions",
        ["sdl", "versions", _] => "/sdl/versions/{version}",
        ["sdl", "versions", _, "activate"] => "/sdl/versions/{version}/activate",
        ["sdl", "versions", _, "deprecate"] => "/sdl/versions/{version}/deprecate",
        ["sdl", "versions", _, "changes"] => "/sdl/versions/{version}/changes",
        ["sdl", "validate"] => "/sdl/validate",
        ["sdl", "check-compatibility"] => "/sdl/check-compatibility",
        ["provider-schemas"] => "/provider-schemas",
        _ => "unmatched",
    }
}

/// Dispatches one request. Kept free of hyper types so it can be driven
/// directly.
pub async fn route(
    state: &AppState,
    method: &Method,
    path: &str,
    query: Option<&str>,
    headers: &HeaderMap,
    body: &[u8],
    trace_id: &str,
) -> ApiResponse {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    match (method, segments.as_slice()) {
        (&Method::POST, []) | (&Method::POST, ["graphql"]) => graphql(state, headers, body, trace_id).await,
        (&Method::POST, ["consent-complete"]) => consent_complete(state, headers, body, trace_id).await,
        (&Method::GET, ["health"]) => health(state).await,
        (&Method::GET, ["metrics"]) => match state.metrics.encode_text() {
            Ok(text) => ApiResponse::text(StatusCode::OK, text),
            Err(e) => ApiResponse::error(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", &e.to_string()),
        },

        (&Method::GET, ["sdl"]) => match state.store().get_active_schema().await {
            Ok(Some(schema)) => ApiResponse::json(StatusCode::OK, &schema),
            Ok(None) => federation_error(&FederationError::NoActiveSchema),
            Err(e) => store_error(&e),
        },
        (&Method::POST, ["sdl"]) => match parse_body::<NewSchema>(body) {
            Ok(new) => match state.store().register_schema(new).await {
                Ok(schema) => {
                    info!(version = %schema.version, change_type = %schema.change_type, "Schema registered");
                    ApiResponse::json(StatusCode::CREATED, &schema)
                }
                Err(e) => store_error(&e),
            },
            Err(e) => client_error(&e),
        },
        (&Method::GET, ["sdl", "versions"]) => match state.store().list_schemas().await {
            Ok(schemas) => ApiResponse::json(StatusCode::OK, &json!({ "versions": schemas })),
            Err(e) => store_error(&e),
        },
        (&Method::GET, ["sdl", "versions", version]) => match state.store().get_schema(version).await {
            Ok(Some(schema)) => ApiResponse::json(StatusCode::OK, &schema),
            Ok(None) => store_error(&StoreError::NotFound(version.to_string())),
            Err(e) => store_error(&e),
        },
        (&Method::POST, ["sdl", "versions", version, "activate"]) => {
            let options = if body.iter().all(u8::is_ascii_whitespace) {
                Ok(ActivateBody::default())
            } else {
                parse_body::<ActivateBody>(body)
            };
            match options {
                Ok(options) => match state.store().activate_schema(version, options.allow_breaking).await {
                    Ok(schema) => {
                        info!(version = %schema.version, "Schema activated");
                        ApiResponse::json(StatusCode::OK, &schema)
                    }
                    Err(e) => store_error(&e),
                },
                Err(e) => client_error(&e),
            }
        }
        (&Method::POST, ["sdl", "versions", version, "deprecate"]) => {
            match state.store().deprecate_schema(version).await {
                Ok(schema) => ApiResponse::json(StatusCode::OK, &schema),
                Err(e) => store_error(&e),
            }
        }
        (&Method::GET, ["sdl", "versions", version, "changes"]) => {
            match state.store().change_history(Some(*version)).await {
                Ok(history) => ApiResponse::json(StatusCode::OK, &json!({ "changes": history })),
                Err(e) => store_error(&e),
            }
        }
        (&Method::POST, ["sdl", "validate"]) => match parse_body::<SdlBody>(body) {
            Ok(request) => validate_sdl(&request.sdl),
            Err(e) => client_error(&e),
        },
        (&Method::POST, ["sdl", "check-compatibility"]) => match parse_body::<CompatibilityBody>(body) {
            Ok(request) => match state
                .store()
                .check_compatibility(&request.sdl, request.base_version.as_deref())
                .await
            {
                Ok(report) => ApiResponse::json(StatusCode::OK, &report),
                Err(e) => store_error(&e),
            },
            Err(e) => client_error(&e),
        },

        (&Method::GET, ["provider-schemas"]) => {
            let provider_key = query_param(query, "provider_key");
            match state.store().list_provider_schemas(provider_key.as_deref()).await {
                Ok(schemas) => ApiResponse::json(StatusCode::OK, &json!({ "providerSchemas": schemas })),
                Err(e) => store_error(&e),
            }
        }
        (&Method::POST, ["provider-schemas"]) => match parse_body::<NewProviderSchema>(body) {
            Ok(new) => match state.store().register_provider_schema(new).await {
                Ok(schema) => ApiResponse::json(StatusCode::CREATED, &schema),
                Err(e) => store_error(&e),
            },
            Err(e) => client_error(&e),
        },

        _ => ApiResponse::error(StatusCode::NOT_FOUND, "NOT_FOUND", "Not Found"),
    }
}

#[derive(Debug, Default, Deserialize)]
struct ActivateBody {
    #[serde(default)]
    allow_breaking: bool,
}

#[derive(Debug, Deserialize)]
struct SdlBody {
    sdl: String,
}

#[derive(Debug, Deserialize)]
struct CompatibilityBody {
    sdl: String,
    #[serde(default)]
    base_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConsentCompleteBody {
    consent_id: String,
    #[serde(flatten)]
    request: GraphQLRequest,
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, ClientError> {
    serde_json::from_slice(body).map_err(|e| ClientError::InvalidBody(e.to_string()))
}

fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    url::form_urlencoded::parse(query?.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

fn request_context(headers: &HeaderMap, trace_id: &str) -> Result<RequestContext, ClientError> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };
    let consumer_id = header(CONSUMER_ID_HEADER).ok_or(ClientError::MissingConsumer(CONSUMER_ID_HEADER))?;
    Ok(RequestContext::new(
        Some(trace_id.to_string()),
        consumer_id,
        header(APP_ID_HEADER),
    ))
}

async fn health(state: &AppState) -> ApiResponse {
    match state.store().get_active_schema().await {
        Ok(active) => ApiResponse::new(
            StatusCode::OK,
            json!({
                "status": "healthy",
                "activeSchemaVersion": active.map(|schema| schema.version),
                "auditEnabled": state.gateway.audit().is_enabled(),
            }),
        ),
        Err(e) => ApiResponse::new(
            StatusCode::SERVICE_UNAVAILABLE,
            json!({ "status": "unhealthy", "error": e.to_string() }),
        ),
    }
}

fn validate_sdl(candidate: &str) -> ApiResponse {
    match sdl::compile(candidate) {
        Ok(compiled) => ApiResponse::new(
            StatusCode::OK,
            json!({
                "valid": true,
                "checksum": sdl::checksum(candidate),
                "types": compiled.types.len(),
                "fieldMappings": compiled.mappings.len(),
                "providers": compiled.provider_keys(),
            }),
        ),
        Err(e) => ApiResponse::new(
            StatusCode::OK,
            json!({ "valid": false, "errors": [e.to_string()] }),
        ),
    }
}

async fn graphql(state: &AppState, headers: &HeaderMap, body: &[u8], trace_id: &str) -> ApiResponse {
    let ctx = match request_context(headers, trace_id) {
        Ok(ctx) => ctx,
        Err(e) => return client_error(&e),
    };
    let request = match parse_body::<GraphQLRequest>(body) {
        Ok(request) => request,
        Err(e) => return client_error(&e),
    };

    outcome_response(state.gateway.federate(&ctx, &request).await)
}

async fn consent_complete(state: &AppState, headers: &HeaderMap, body: &[u8], trace_id: &str) -> ApiResponse {
    let ctx = match request_context(headers, trace_id) {
        Ok(ctx) => ctx,
        Err(e) => return client_error(&e),
    };
    let body = match parse_body::<ConsentCompleteBody>(body) {
        Ok(body) if !body.consent_id.trim().is_empty() => body,
        Ok(_) => return client_error(&ClientError::InvalidBody("consent_id must not be empty".to_string())),
        Err(e) => return client_error(&e),
    };

    outcome_response(
        state
            .gateway
            .complete_consent(&ctx, &body.consent_id, &body.request)
            .await,
    )
}

fn outcome_response(result: Result<FederationOutcome, FederationError>) -> ApiResponse {
    match result {
        Ok(FederationOutcome::Completed(response)) => {
            let mut body = json!({ "data": response.data });
            if !response.errors.is_empty() {
                body["errors"] = json!(response.errors);
            }
            ApiResponse::new(StatusCode::OK, body)
        }
        Ok(FederationOutcome::ConsentPending {
            consent_id,
            portal_url,
            fields,
        }) => ApiResponse::new(
            StatusCode::OK,
            json!({
                "consentRequired": true,
                "consentId": consent_id,
                "consentPortalUrl": portal_url,
                "consentRequiredFields": fields,
                "message": "Consent is required to access this data",
            }),
        ),
        Ok(FederationOutcome::Denied { reason }) => ApiResponse::new(
            StatusCode::FORBIDDEN,
            json!({
                "data": null,
                "errors": [{ "message": reason, "extensions": { "code": "ACCESS_DENIED" } }],
            }),
        ),
        Ok(FederationOutcome::Rejected { consent_id, status }) => ApiResponse::new(
            StatusCode::FORBIDDEN,
            json!({
                "success": false,
                "message": "Consent was rejected or not approved",
                "status": status,
                "consentId": consent_id,
            }),
        ),
        Err(e) => federation_error(&e),
    }
}

pub fn federation_status(err: &FederationError) -> StatusCode {
    match err {
        FederationError::Client(_) => StatusCode::BAD_REQUEST,
        FederationError::Gate(e) if e.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
        FederationError::Gate(_) => StatusCode::BAD_GATEWAY,
        FederationError::NoActiveSchema => StatusCode::SERVICE_UNAVAILABLE,
        FederationError::Store(e) => store_status(e),
        FederationError::RequestTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        FederationError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn store_status(err: &StoreError) -> StatusCode {
    match err {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        StoreError::DuplicateVersion(_) | StoreError::BreakingChange { .. } | StoreError::ActiveSchema(_) => {
            StatusCode::CONFLICT
        }
        StoreError::InvalidVersion(_) | StoreError::InvalidSdl(_) => StatusCode::BAD_REQUEST,
        StoreError::Backend(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn federation_error(err: &FederationError) -> ApiResponse {
    ApiResponse::error(federation_status(err), err.code(), &err.to_string())
}

fn client_error(err: &ClientError) -> ApiResponse {
    ApiResponse::error(StatusCode::BAD_REQUEST, err.code(), &err.to_string())
}

fn store_error(err: &StoreError) -> ApiResponse {
    let mut response = ApiResponse::error(store_status(err), store_code(err), &err.to_string());
    if let StoreError::BreakingChange { changes, .. } = err {
        response.body["errors"][0]["extensions"]["breakingChanges"] = json!(changes);
    }
    response
}

fn store_code(err: &StoreError) -> &'static str {
    match err {
        StoreError::NotFound(_) => "NOT_FOUND",
        StoreError::DuplicateVersion(_) => "DUPLICATE_VERSION",
        StoreError::BreakingChange { .. } => "BREAKING_CHANGE",
        StoreError::ActiveSchema(_) => "SCHEMA_ACTIVE",
        StoreError::InvalidVersion(_) => "INVALID_VERSION",
        StoreError::InvalidSdl(_) => "INVALID_SDL",
        StoreError::Backend(_) => "SCHEMA_STORE_ERROR",
    }
}

/// Accepts connections until the listener fails, one task per connection.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> std::io::Result<()> {
    loop {
        let (stream, remote) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::task::spawn(async move {
            let service = service_fn(move |req| handle_request(req, state.clone()));
            if let Err(e) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                .serve_connection(io, service)
                .await
            {
                debug!(remote = %remote, error = %e, "Connection closed with error");
            }
        });
    }
}
