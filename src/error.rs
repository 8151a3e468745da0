//! Error types for the Baler disruption engine

use thiserror::Error;

/// Capacity error subtypes reported by the cloud adapter
///
/// Each subtype marks the requested offering as unavailable for a short TTL
/// so the same launch is not retried within the tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum CapacityErrorKind {
    /// The zone/instance-type pair has no capacity right now
    InsufficientCapacity,
    /// The account's spot instance limit was reached
    SpotLimitExceeded,
    /// The offering is not supported for the requested configuration
    Unsupported,
}

impl std::fmt::Display for CapacityErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InsufficientCapacity => write!(f, "insufficient capacity"),
            Self::SpotLimitExceeded => write!(f, "spot limit exceeded"),
            Self::Unsupported => write!(f, "unsupported offering"),
        }
    }
}

/// Main error type for Baler operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Transient cloud-provider error, retried with backoff
    #[error("transient cloud error: {0}")]
    TransientCloud(String),

    /// The cloud adapter could not satisfy the requested capacity
    #[error("capacity error ({kind}): {message}")]
    Capacity {
        /// Which capacity failure occurred
        kind: CapacityErrorKind,
        /// Adapter-supplied detail
        message: String,
    },

    /// The adapter holds a cached launch template that no longer exists
    #[error("stale launch template: {0}")]
    StaleLaunchTemplate(String),

    /// A pod disruption budget refused an eviction
    #[error("workload blocked: {0}")]
    WorkloadBlocked(String),

    /// The referenced object no longer exists; success for terminate/delete
    #[error("not found: {0}")]
    NotFound(String),

    /// Cluster state changed under a decision; the tick must restart
    #[error("precondition violated: {0}")]
    PreconditionViolated(String),

    /// Validation error for CRD specs
    #[error("validation error: {0}")]
    Validation(String),

    /// Unresolvable configuration; fatal at startup
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a transient cloud error with the given message
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientCloud(msg.into())
    }

    /// Create a capacity error of the given subtype
    pub fn capacity(kind: CapacityErrorKind, msg: impl Into<String>) -> Self {
        Self::Capacity {
            kind,
            message: msg.into(),
        }
    }

    /// Create a workload-blocked error with the given message
    pub fn workload_blocked(msg: impl Into<String>) -> Self {
        Self::WorkloadBlocked(msg.into())
    }

    /// Create a not-found error with the given message
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a precondition-violated error with the given message
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::PreconditionViolated(msg.into())
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Whether the operation should be retried with backoff
    ///
    /// Capacity errors are excluded: the offering is cached as unavailable
    /// instead, and the launch is not retried in-tick.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TransientCloud(_) | Self::StaleLaunchTemplate(_) => true,
            Self::Kube(e) => matches!(
                e,
                kube::Error::Api(resp) if resp.code == 429 || resp.code >= 500
            ),
            _ => false,
        }
    }

    /// Whether this error means the target object is already gone
    ///
    /// Terminate and delete treat this as success (idempotence).
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Kube(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }
}
