use thiserror::Error;

/// Failures while compiling a unified SDL document into field mappings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SdlError {
    #[error("failed to parse SDL: {0}")]
    Parse(String),

    #[error("schema has no query root type `{0}`")]
    MissingQueryRoot(String),

    #[error("@sourceInfo on {path} is missing argument `{argument}`")]
    IncompleteSourceInfo { path: String, argument: &'static str },

    #[error("field {0} declares more than one @sourceInfo directive")]
    DuplicateSourceInfo(String),

    #[error("types `{first}` and `{second}` collide on field path prefix `{prefix}`")]
    AmbiguousTypeName {
        first: String,
        second: String,
        prefix: String,
    },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("schema version {0} already exists")]
    DuplicateVersion(String),

    #[error("schema version {0} not found")]
    NotFound(String),

    #[error("invalid schema version `{0}`, expected MAJOR.MINOR.PATCH")]
    InvalidVersion(String),

    #[error(transparent)]
    InvalidSdl(#[from] SdlError),

    #[error("activating {version} would break consumers: {}", .changes.join("; "))]
    BreakingChange {
        version: String,
        changes: Vec<String>,
    },

    #[error("schema version {0} is active and cannot be deprecated")]
    ActiveSchema(String),

    #[error("schema store backend failure: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Problems with the consumer's request. Never reaches the gate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("malformed query: {0}")]
    MalformedQuery(String),

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("field `{field}` does not exist on type `{type_name}`")]
    UnknownField { type_name: String, field: String },

    #[error("no provider mapping for fields: {}", .0.join(", "))]
    UnresolvedFields(Vec<String>),

    #[error("missing required argument: {0}")]
    MissingArgument(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("field `{0}` is selected more than once with different arguments")]
    ConflictingArguments(String),

    #[error("missing consumer identity header `{0}`")]
    MissingConsumer(&'static str),

    #[error("invalid request body: {0}")]
    InvalidBody(String),
}

impl ClientError {
    pub fn code(&self) -> &'static str {
        match self {
            ClientError::MalformedQuery(_) => "GRAPHQL_PARSE_FAILED",
            ClientError::UnsupportedOperation(_) => "UNSUPPORTED_OPERATION",
            ClientError::UnknownField { .. } => "UNKNOWN_FIELD",
            ClientError::UnresolvedFields(_) => "UNRESOLVED_FIELD",
            ClientError::MissingArgument(_) => "MISSING_ARGUMENT",
            ClientError::InvalidArgument(_) => "INVALID_ARGUMENT",
            ClientError::ConflictingArguments(_) => "CONFLICTING_ARGUMENTS",
            ClientError::MissingConsumer(_) => "MISSING_CONSUMER",
            ClientError::InvalidBody(_) => "BAD_REQUEST",
        }
    }
}

/// The policy decision point or the consent engine could not be consulted.
/// Requests hitting one of these fail closed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GateError {
    #[error("policy decision point unreachable: {0}")]
    PdpUnavailable(String),

    #[error("policy decision point timed out after {0} ms")]
    PdpTimeout(u64),

    #[error("invalid policy decision: {0}")]
    PdpInvalidResponse(String),

    #[error("consent engine unreachable: {0}")]
    ConsentUnavailable(String),

    #[error("consent engine timed out after {0} ms")]
    ConsentTimeout(u64),

    #[error("invalid consent engine response: {0}")]
    ConsentInvalidResponse(String),

    #[error("consent engine is not configured")]
    ConsentNotConfigured,
}

impl GateError {
    pub fn code(&self) -> &'static str {
        match self {
            GateError::PdpUnavailable(_)
            | GateError::PdpTimeout(_)
            | GateError::PdpInvalidResponse(_) => "PDP_ERROR",
            GateError::ConsentUnavailable(_)
            | GateError::ConsentTimeout(_)
            | GateError::ConsentInvalidResponse(_)
            | GateError::ConsentNotConfigured => "CE_ERROR",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, GateError::PdpTimeout(_) | GateError::ConsentTimeout(_))
    }
}

/// Why one provider call produced no usable data.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderFailure {
    #[error("provider is not registered")]
    NotRegistered,

    #[error("timed out after {0} ms")]
    Timeout(u64),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("provider returned status {0}")]
    Status(u16),

    #[error("provider returned errors: {0}")]
    GraphQL(String),

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("failed to obtain access token: {0}")]
    Auth(String),
}

impl ProviderFailure {
    pub fn code(&self) -> &'static str {
        match self {
            ProviderFailure::Timeout(_) => "PROVIDER_TIMEOUT",
            ProviderFailure::NotRegistered => "PROVIDER_NOT_REGISTERED",
            _ => "PROVIDER_ERROR",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("provider {provider_key} failed: {cause}")]
pub struct ProviderError {
    pub provider_key: String,
    /// Unified paths the failed call was meant to supply.
    pub field_paths: Vec<String>,
    pub cause: ProviderFailure,
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit sink unreachable: {0}")]
    Transport(String),

    #[error("audit sink rejected event with status {0}")]
    Rejected(u16),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Terminal failures of a federated request. Provider failures are not here:
/// they are folded into the merged response as field errors.
#[derive(Debug, Error)]
pub enum FederationError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Gate(#[from] GateError),

    #[error("no active schema; register and activate a schema first")]
    NoActiveSchema,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("request exceeded {0} ms")]
    RequestTimeout(u64),

    #[error("internal error: {0}")]
    Internal(String),
}

impl FederationError {
    pub fn code(&self) -> &'static str {
        match self {
            FederationError::Client(err) => err.code(),
            FederationError::Gate(err) => err.code(),
            FederationError::NoActiveSchema => "NO_ACTIVE_SCHEMA",
            FederationError::Store(_) => "SCHEMA_STORE_ERROR",
            FederationError::RequestTimeout(_) => "REQUEST_TIMEOUT",
            FederationError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}
