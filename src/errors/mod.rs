//! # Error Handling
//!
//! Errors surfaced by the gangway control plane.
//!
//! Problems found in Kubernetes objects while building the graph are never
//! errors: they are recorded as status conditions on the offending object and
//! the rest of the build continues. [`Error`] covers the operational failures
//! around that core, such as bad configuration, unreadable manifests and
//! transport problems.

mod tls;

pub use tls::TlsError;

/// Custom result type for gangway operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the gangway control plane
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Validation errors raised by the `validator` derive or custom checks
    #[error("Validation error: {message}")]
    Validation { message: String, field: Option<String> },

    /// Manifest decoding errors
    #[error("Manifest error: {context}")]
    Manifest {
        context: String,
        #[source]
        source: Option<serde_yaml::Error>,
    },

    /// xDS protocol errors
    #[error("xDS protocol error: {0}")]
    Xds(String),

    /// Network transport errors (gRPC)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal server errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config(message.into())
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation { message: message.into(), field: None }
    }

    /// Create a validation error for a specific field
    pub fn validation_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Validation { message: message.into(), field: Some(field.into()) }
    }

    /// Create a manifest error without an underlying decoder error
    pub fn manifest<S: Into<String>>(context: S) -> Self {
        Self::Manifest { context: context.into(), source: None }
    }

    /// Create a manifest error wrapping a YAML decoding failure
    pub fn manifest_with_source<S: Into<String>>(context: S, source: serde_yaml::Error) -> Self {
        Self::Manifest { context: context.into(), source: Some(source) }
    }

    /// Create a new xDS protocol error
    pub fn xds<S: Into<String>>(message: S) -> Self {
        Self::Xds(message.into())
    }

    /// Create a new transport error
    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport(message.into())
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal(message.into())
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(errors: validator::ValidationErrors) -> Self {
        let field = errors.field_errors().keys().next().map(|field| field.to_string());
        Self::Validation { message: errors.to_string(), field }
    }
}

impl From<tonic::transport::Error> for Error {
    fn from(error: tonic::transport::Error) -> Self {
        Self::Transport(error.to_string())
    }
}
