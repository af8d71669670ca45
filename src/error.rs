//! Error types for the trainkube controller
//!
//! Errors are grouped by how the controller reacts to them: transient cluster
//! failures are requeued, objects not yet visible in the cache are requeued
//! under a larger attempt budget, contract violations are dropped, and job
//! failures end the owning training run.

use thiserror::Error;

/// Main error type for trainkube operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Invalid TrainingRequest spec or controller configuration
    #[error("validation error: {0}")]
    Validation(String),

    /// Malformed option while rendering a Job or ConfigMap
    #[error("builder error: {0}")]
    Builder(String),

    /// An object the current step depends on is not visible yet
    #[error("{kind} {key} not ready")]
    NotReady {
        /// Kind of the missing object
        kind: String,
        /// Cache key of the missing object
        key: String,
    },

    /// A reconciled or watched object broke an invariant the controller relies on
    #[error("contract violation: {0}")]
    ContractViolation(String),

    /// A Job created by a training run reached the Failed state
    #[error("job {job} failed: {message}")]
    JobFailed {
        /// Name of the failed Job
        job: String,
        /// Failure message reported by the Job controller
        message: String,
    },

    /// The request asks for mini-batches of zero samples
    #[error("batch size cannot be 0")]
    ZeroBatchSize,

    /// A wait or API call exceeded its deadline
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// A wait was cancelled before it completed
    #[error("cancelled while waiting for {0}")]
    Cancelled(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a builder error with the given message
    pub fn builder(msg: impl Into<String>) -> Self {
        Self::Builder(msg.into())
    }

    /// Create a not-ready error for an object of the given kind
    pub fn not_ready(kind: impl Into<String>, key: impl ToString) -> Self {
        Self::NotReady {
            kind: kind.into(),
            key: key.to_string(),
        }
    }

    /// Create a contract violation error with the given message
    pub fn contract(msg: impl Into<String>) -> Self {
        Self::ContractViolation(msg.into())
    }

    /// Create a job failure error
    pub fn job_failed(job: impl Into<String>, message: impl Into<String>) -> Self {
        Self::JobFailed {
            job: job.into(),
            message: message.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Check if this error is worth another reconciliation attempt
    ///
    /// Kubernetes 4xx responses other than 409/429 need a spec or code fix,
    /// everything else on the API path is treated as transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(source) => match source {
                kube::Error::Api(ae) => {
                    !(400..500).contains(&ae.code) || ae.code == 409 || ae.code == 429
                }
                _ => true,
            },
            Error::NotReady { .. } => true,
            Error::Timeout(_) => true,
            Error::Validation(_)
            | Error::Builder(_)
            | Error::ContractViolation(_)
            | Error::JobFailed { .. }
            | Error::ZeroBatchSize
            | Error::Cancelled(_)
            | Error::Serialization(_) => false,
        }
    }

    /// Returns true for a Kubernetes 404 response
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(ae)) if ae.code == 404)
    }

    /// Returns true for a Kubernetes 409 response
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(ae)) if ae.code == 409)
    }
}

#[cfg(test)]
pub(crate) fn api_error(code: u16, reason: &str) -> Error {
    Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{} ({})", reason, code),
        reason: reason.to_string(),
        code,
    }))
}
