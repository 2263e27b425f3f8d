//! Error types for the Kaspr Operator

use thiserror::Error;

/// Result type alias using the operator's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Operator error types
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Secret not found
    #[error("Secret not found: {0}")]
    SecretNotFound(String),

    /// Resource sync error
    #[error("Failed to sync {kind} '{name}': {message}")]
    ResourceSync {
        kind: String,
        name: String,
        message: String,
    },

    /// Linked resource lookup failed
    #[error("Failed to fetch linked {kind} resources: {message}")]
    LinkedResourceFetch { kind: String, message: String },

    /// Member web API error
    #[error("Status client error: {0}")]
    StatusClient(String),

    /// External call exceeded its timeout
    #[error("Timed out: {0}")]
    Timeout(String),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML rendering error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Finalizer error
    #[error("Finalizer error: {0}")]
    Finalizer(#[source] Box<kube::runtime::finalizer::Error<Error>>),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Create a status client error
    pub fn status_client(msg: impl Into<String>) -> Self {
        Error::StatusClient(msg.into())
    }

    /// Create a resource sync error
    pub fn resource_sync(
        kind: impl Into<String>,
        name: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Error::ResourceSync {
            kind: kind.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Short machine-readable reason used in status conditions
    pub fn reason(&self) -> &'static str {
        match self {
            Error::Kube(_) => "KubernetesApiError",
            Error::Config(_) => "ConfigurationError",
            Error::Validation(_) => "ValidationFailed",
            Error::SecretNotFound(_) => "SecretNotFound",
            Error::ResourceSync { .. } => "ResourceSyncFailed",
            Error::LinkedResourceFetch { .. } => "LinkedResourceFetchFailed",
            Error::StatusClient(_) | Error::Http(_) => "StatusClientError",
            Error::Timeout(_) => "Timeout",
            Error::Serialization(_) | Error::Yaml(_) => "SerializationError",
            Error::Finalizer(_) => "FinalizerError",
        }
    }

    /// Whether the error is an optimistic concurrency conflict (HTTP 409)
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(resp)) if resp.code == 409)
    }
}
