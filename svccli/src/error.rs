//! Error handling for svccli.
//!
//! Errors are split by the stage that raises them: [`ModelError`] while a
//! service model is loaded, [`ValidationError`] while parameters are bound
//! (always before any network traffic), and [`ServiceError`] once the call
//! has been handed to a transport. [`Error`] is the umbrella type returned by
//! the engine.

/// Failures raised while loading or checking a service model.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("unknown service '{0}'")]
    ModelNotFound(String),

    #[error("failed to parse service model '{id}': {source}")]
    Parse {
        id: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("service model '{service}' is invalid: {message}")]
    Invalid { service: String, message: String },

    #[error("shape '{0}' nests itself; recursive structures cannot be flattened into parameters")]
    RecursiveShape(String),

    #[error("unknown operation '{0}'")]
    UnknownOperation(String),
}

/// Problems with the caller's input. Never reaches the transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("missing required parameter {param} ({path})")]
    MissingRequiredField { param: String, path: String },

    #[error("invalid value '{value}' for {param}; expected one of: {}", .allowed.join(", "))]
    InvalidEnumValue {
        param: String,
        value: String,
        allowed: Vec<String>,
    },

    #[error("invalid value '{value}' for {param}: {reason}")]
    InvalidValue {
        param: String,
        value: String,
        reason: String,
    },

    #[error("unknown parameter '{0}'")]
    UnknownParameter(String),

    #[error("parameter {0} was supplied more than once")]
    Duplicate(String),

    #[error("{0}")]
    ConflictingOptions(String),

    #[error("invalid selector '{expr}': {reason}")]
    InvalidSelector { expr: String, reason: String },
}

/// A remote call failed.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(
        "name resolution failure attempting to reach service endpoint {endpoint}; \
         check the region, the endpoint URL and network connectivity"
    )]
    NameResolution {
        endpoint: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("{code}: {message} (HTTP {status}{})", request_id_suffix(.request_id))]
    Api {
        status: u16,
        code: String,
        message: String,
        request_id: Option<String>,
    },

    #[error("request to {endpoint} failed: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("cannot build request for {operation}: {reason}")]
    Request { operation: String, reason: String },

    #[error("malformed response from {operation}: {reason}")]
    MalformedResponse { operation: String, reason: String },
}

fn request_id_suffix(request_id: &Option<String>) -> String {
    request_id
        .as_ref()
        .map(|id| format!(", request id {id}"))
        .unwrap_or_default()
}

/// The main error type for svccli operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("operation cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to read confirmation: {0}")]
    Prompt(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A Result type alias for svccli operations.
pub type Result<T> = std::result::Result<T, Error>;
