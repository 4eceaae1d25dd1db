pub mod argument_translator;
pub mod audit;
pub mod compatibility;
pub mod config;
pub mod consent;
pub mod error;
pub mod federation_gateway;
pub mod field_resolver;
pub mod gate;
pub mod metrics;
pub mod policy;
pub mod provider;
pub mod query_executor;
pub mod query_planner;
pub mod response_merger;
pub mod schema_store;
pub mod sdl;
pub mod server;
pub mod sqlite_store;

pub use argument_translator::ArgumentTranslator;
pub use audit::{AuditEmitter, AuditEvent, AuditSink, HttpAuditSink};
pub use config::Config;
pub use error::{ClientError, FederationError, GateError, ProviderError, ProviderFailure, StoreError};
pub use federation_gateway::{FederationGateway, FederationOutcome};
pub use field_resolver::FieldResolver;
pub use gate::PolicyConsentGate;
pub use metrics::Metrics;
pub use query_executor::{HttpProviderTransport, ProviderExecutor};
pub use response_merger::FederatedResponse;
pub use schema_store::{InMemorySchemaStore, SchemaStore};
pub use sqlite_store::SqliteSchemaStore;

use graphql_parser::query::Value as AstValue;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Header carrying the correlation id across the gate, providers and audit.
pub const TRACE_ID_HEADER: &str = "X-Trace-ID";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GraphQLRequest {
    pub query: String,
    #[serde(default)]
    pub variables: Option<Value>,
    #[serde(default, rename = "operationName")]
    pub operation_name: Option<String>,
}

impl GraphQLRequest {
    pub fn new(query: impl Into<String>) -> Self {
        GraphQLRequest {
            query: query.into(),
            variables: None,
            operation_name: None,
        }
    }

    pub fn with_variables(mut self, variables: Value) -> Self {
        self.variables = Some(variables);
        self
    }

    pub(crate) fn variable_map(&self) -> Map<String, Value> {
        match &self.variables {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        }
    }
}

/// A GraphQL error entry as it appears in a response `errors` array.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GraphQLError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl GraphQLError {
    pub fn new(message: impl Into<String>) -> Self {
        GraphQLError {
            message: message.into(),
            path: Vec::new(),
            extensions: Map::new(),
        }
    }

    pub fn with_code(self, code: &str) -> Self {
        self.with_extension("code", Value::String(code.to_string()))
    }

    pub fn with_extension(mut self, key: &str, value: Value) -> Self {
        self.extensions.insert(key.to_string(), value);
        self
    }

    pub fn at_path(mut self, path: &[String]) -> Self {
        self.path = path.iter().cloned().map(Value::String).collect();
        self
    }
}

/// Who is asking, and the trace id shared by every call made on their behalf.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestContext {
    pub trace_id: String,
    pub consumer_id: String,
    pub app_id: String,
}

impl RequestContext {
    /// Uses the caller's trace id when present, otherwise mints a fresh one.
    pub fn new(trace_id: Option<String>, consumer_id: impl Into<String>, app_id: Option<String>) -> Self {
        let consumer_id = consumer_id.into();
        let trace_id = trace_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let app_id = app_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| consumer_id.clone());

        RequestContext {
            trace_id,
            consumer_id,
            app_id,
        }
    }
}

/// Converts a GraphQL literal into JSON, substituting variables. Unknown
/// variables become `null`; required-variable checks happen in the planner.
pub(crate) fn graphql_value_to_json<'a>(
    value: &AstValue<'a, String>,
    variables: &Map<String, Value>,
) -> Value {
    match value {
        AstValue::Variable(name) => variables.get(name).cloned().unwrap_or(Value::Null),
        AstValue::Int(number) => number.as_i64().map(Value::from).unwrap_or(Value::Null),
        AstValue::Float(float) => serde_json::Number::from_f64(*float)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        AstValue::String(text) => Value::String(text.clone()),
        AstValue::Boolean(flag) => Value::Bool(*flag),
        AstValue::Null => Value::Null,
        AstValue::Enum(name) => Value::String(name.clone()),
        AstValue::List(items) => Value::Array(
            items
                .iter()
                .map(|item| graphql_value_to_json(item, variables))
                .collect(),
        ),
        AstValue::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(key, item)| (key.clone(), graphql_value_to_json(item, variables)))
                .collect(),
        ),
    }
}

/// Splits a dot-separated path, ignoring empty segments.
pub(crate) fn path_segments(path: &str) -> Vec<&str> {
    path.split('.').filter(|segment| !segment.is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_context_generates_trace_id_when_missing() {
        let ctx = RequestContext::new(None, "passport-app", None);
        assert_eq!(ctx.app_id, "passport-app");
        assert!(uuid::Uuid::parse_str(&ctx.trace_id).is_ok());

        let blank = RequestContext::new(Some("  ".into()), "passport-app", None);
        assert_ne!(blank.trace_id.trim(), "");
    }

    #[test]
    fn request_context_keeps_supplied_trace_id() {
        let ctx = RequestContext::new(Some("trace-1".into()), "c1", Some("app-9".into()));
        assert_eq!(ctx.trace_id, "trace-1");
        assert_eq!(ctx.app_id, "app-9");
    }

    #[test]
    fn graphql_error_serializes_path_and_extensions() {
        let error = GraphQLError::new("boom")
            .at_path(&["person".to_string(), "name".to_string()])
            .with_code("PROVIDER_ERROR");
        let encoded = serde_json::to_value(&error).unwrap();
        assert_eq!(
            encoded,
            json!({"message": "boom", "path": ["person", "name"], "extensions": {"code": "PROVIDER_ERROR"}})
        );
    }
}
