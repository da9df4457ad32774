//! Error types for the sample controller

use thiserror::Error;

/// Main error type for controller operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Validation error for a Foo spec
    #[error("validation error: {0}")]
    Validation(String),

    /// A Deployment with the requested name exists but is controlled by someone else
    #[error("Resource {name:?} already exists and is not managed by Foo")]
    ResourceExists {
        /// Name of the conflicting Deployment
        name: String,
    },

    /// Informer caches did not report initial sync in time
    #[error("failed to wait for caches to sync: {0}")]
    CacheSync(String),

    /// Object delivered by the change feed is missing identifying metadata
    #[error("invalid object: {0}")]
    InvalidObject(String),

    /// A reconcile attempt panicked
    #[error("reconcile panicked: {0}")]
    ReconcilePanic(String),

    /// Client configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an ownership conflict error for the named Deployment
    pub fn resource_exists(name: impl Into<String>) -> Self {
        Self::ResourceExists { name: name.into() }
    }

    /// Create a cache sync error with the given message
    pub fn cache_sync(msg: impl Into<String>) -> Self {
        Self::CacheSync(msg.into())
    }

    /// Create an invalid object error with the given message
    pub fn invalid_object(msg: impl Into<String>) -> Self {
        Self::InvalidObject(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether requeueing the work item can make progress.
    ///
    /// Permanent errors need the object (or the process configuration) to be
    /// edited first; retrying them would only hot-loop.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Validation(_) | Error::InvalidObject(_) | Error::Config(_) => false,
            Error::Kube(_)
            | Error::ResourceExists { .. }
            | Error::CacheSync(_)
            | Error::ReconcilePanic(_) => true,
        }
    }
}
