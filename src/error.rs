//! Error types for queue-dispatch operations.
//!
//! Defines the error types shared across subsystems:
//! - Worker launching (Docker, local processes)
//! - Credential and certificate provisioning
//! - External endpoint calls made for a single queue entry
//!
//! Queue-store, configuration, dispatcher and worker errors live next to the
//! code that raises them.

use thiserror::Error;

/// Errors that can occur while launching a single worker.
///
/// A launch error only ever concerns one worker instance; the dispatcher logs
/// it and moves on to the next launch.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Docker daemon not available: {0}")]
    DaemonUnavailable(String),

    #[error("Failed to create worker container: {0}")]
    CreateFailed(String),

    #[error("Failed to start worker container '{id}': {reason}")]
    StartFailed { id: String, reason: String },

    #[error("Failed to spawn worker process: {0}")]
    SpawnFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while fetching credentials or certificate material.
///
/// Every provisioning error is fatal to worker startup.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("Secret '{0}' not found")]
    SecretNotFound(String),

    #[error("Secret '{name}' is malformed: {reason}")]
    MalformedSecret { name: String, reason: String },

    #[error("Certificate object '{0}' not found")]
    ObjectNotFound(String),

    #[error("Certificate fetch for '{name}' failed: {reason}")]
    FetchFailed { name: String, reason: String },

    #[error("Invalid TLS material: {0}")]
    InvalidTls(String),

    #[error("No client certificate source configured (set QUEUE_CERT_SOURCE)")]
    ClientCertificateRequired,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur while processing one queue entry against the
/// external endpoint.
///
/// These never propagate out of a worker; they are written to the entry's
/// `error_message` column.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("External service returned status {0}")]
    Status(u16),

    #[error("External service timeout")]
    Timeout,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_error_display() {
        let err = ProcessError::Status(500);
        assert_eq!(err.to_string(), "External service returned status 500");

        let err = ProcessError::Timeout;
        assert_eq!(err.to_string(), "External service timeout");

        let err = ProcessError::Transport("connection reset".to_string());
        assert!(err.to_string().contains("connection reset"));
    }

    #[test]
    fn test_launch_error_display() {
        let err = LaunchError::StartFailed {
            id: "abc123".to_string(),
            reason: "no such image".to_string(),
        };
        assert!(err.to_string().contains("abc123"));
        assert!(err.to_string().contains("no such image"));
    }

    #[test]
    fn test_provision_error_display() {
        let err = ProvisionError::SecretNotFound("dev-queue-credentials".to_string());
        assert!(err.to_string().contains("dev-queue-credentials"));

        let err = ProvisionError::ObjectNotFound("dev/client.pem".to_string());
        assert!(err.to_string().contains("dev/client.pem"));
    }
}
