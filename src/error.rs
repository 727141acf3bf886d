//! Error types for the release-gate controller

use thiserror::Error;

/// Main error type for release verification operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Terminal misconfiguration: an undefined job template, an unknown
    /// retry strategy, or an unknown upgrade policy. Retrying cannot fix
    /// these; the slot is skipped and an event is emitted.
    #[error("configuration error: {0}")]
    Config(String),

    /// Retryable failure against the job subsystem
    #[error("job error: {0}")]
    Job(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a job error with the given message
    pub fn job(msg: impl Into<String>) -> Self {
        Self::Job(msg.into())
    }

    /// Terminal errors will not resolve by retrying; the reconcile skips
    /// the offending slot instead of aborting.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_are_terminal() {
        let err = Error::config("the prow job e2e is not valid: no job with that name");
        assert!(err.is_terminal());
        assert!(err.to_string().contains("no job with that name"));
    }

    #[test]
    fn job_errors_are_retryable() {
        let err = Error::job("prow job create timed out");
        assert!(!err.is_terminal());
    }

    #[test]
    fn serialization_errors_are_retryable() {
        let err: Error = serde_json::from_str::<serde_json::Value>("{not json")
            .unwrap_err()
            .into();
        assert!(!err.is_terminal());
        assert!(err.to_string().contains("serialization error"));
    }
}
