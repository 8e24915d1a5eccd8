//! Error types for slipway-core

use thiserror::Error;

/// Errors that can occur during a reconciliation run
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration document not found: {path}")]
    DocumentNotFound { path: String },

    #[error("Failed to resolve reference '{reference}': {message}")]
    ReferenceResolution { reference: String, message: String },

    #[error("Cyclic reference detected: {chain}")]
    CyclicReference { chain: String },

    #[error("No prior deployment found under prefix '{prefix}'")]
    NoPriorDeployment { prefix: String },

    #[error("Stored template '{key}' failed integrity check: {message}")]
    Integrity { key: String, message: String },

    #[error("Stored template '{key}' is not valid JSON: {source}")]
    MalformedTemplate {
        key: String,
        source: serde_json::Error,
    },

    #[error("Referenced resource '{name}' does not exist in the compiled template")]
    UnresolvableReference { name: String },

    #[error("Resource '{name}' is of type '{resource_type}', not an identity role")]
    NotAnIdentityResource { name: String, resource_type: String },

    #[error("Invalid environment variable key '{key}': must start with a letter or underscore and contain only letters, digits and underscores")]
    InvalidEnvironmentKey { key: String },

    #[error("Invalid configuration: {message}")]
    InvalidConfiguration { message: String },

    #[error("Artifact not found: {path}")]
    ArtifactNotFound { path: String },

    #[error("Transport error during {operation}: {message}")]
    Transport { operation: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wrap a remote collaborator failure with the operation that issued it
    pub fn transport(operation: impl Into<String>, message: impl ToString) -> Self {
        Error::Transport {
            operation: operation.into(),
            message: message.to_string(),
        }
    }
}
