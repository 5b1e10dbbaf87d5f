//! Error types for secrets sync

use thiserror::Error;

/// Every failure a mapping resource can hit during one sync tick.
///
/// Must stay `Clone`: a failed coalesced fetch is returned to every waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Remote call failed (network, throttling, missing permission).
    #[error("Fetch error for '{secret}': {message}")]
    Fetch { secret: String, message: String },

    #[error("Secret not found: {0}")]
    NotFound(String),

    #[error("Key '{key}' not found in secret '{secret}'")]
    KeyNotFound { secret: String, key: String },

    #[error("Secret '{0}' is not a JSON object of strings")]
    TypeMismatch(String),

    #[error("Secret '{0}' cannot be imported with dataFrom: value is not a JSON object of strings")]
    NotAMap(String),

    #[error("Role '{role}' is not allowed in namespace '{namespace}'")]
    PolicyDenied { namespace: String, role: String },

    #[error("Template error: {0}")]
    Template(String),

    #[error("Invalid mapping spec: {0}")]
    InvalidSpec(String),

    #[error("Output store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    pub fn fetch(secret: impl Into<String>, message: impl std::fmt::Display) -> Self {
        SyncError::Fetch {
            secret: secret.into(),
            message: message.to_string(),
        }
    }

    /// Short reason recorded in a resource's `Failed` state.
    pub fn reason(&self) -> &'static str {
        match self {
            SyncError::Fetch { .. } => "fetch-error",
            SyncError::NotFound(_) => "secret-not-found",
            SyncError::KeyNotFound { .. } => "key-not-found",
            SyncError::TypeMismatch(_) => "type-mismatch",
            SyncError::NotAMap(_) => "not-a-map",
            SyncError::PolicyDenied { .. } => "policy-denied",
            SyncError::Template(_) => "template-error",
            SyncError::InvalidSpec(_) => "invalid-spec",
            SyncError::Store(_) => "store-error",
            SyncError::Config(_) => "config-error",
        }
    }
}

impl From<handlebars::RenderError> for SyncError {
    fn from(err: handlebars::RenderError) -> Self {
        SyncError::Template(err.to_string())
    }
}

impl From<kube::Error> for SyncError {
    fn from(err: kube::Error) -> Self {
        SyncError::Store(err.to_string())
    }
}
