use serde::Serialize;

use crate::model::ThresholdAction;

#[derive(Debug, thiserror::Error)]
pub enum StampedeError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Data error: {0}")]
    Data(String),

    #[error("Expression error: {0}")]
    Expression(String),

    #[error("Operation timed out after {0} ms")]
    Timeout(u64),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Rendezvous error: {0}")]
    Rendezvous(String),

    #[error("Threshold violation on {metric}: {message}")]
    Threshold {
        metric: String,
        message: String,
        action: ThresholdAction,
    },

    #[error("Worker error ({address}): {message}")]
    Worker { address: String, message: String },

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StampedeError {
    /// True for errors that terminate the whole run rather than a single step.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StampedeError::Validation(_) | StampedeError::Config(_) | StampedeError::Cancelled
        ) || matches!(
            self,
            StampedeError::Threshold {
                action: ThresholdAction::FailTest | ThresholdAction::Abort,
                ..
            }
        )
    }
}

impl Serialize for StampedeError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_display() {
        let err = StampedeError::Validation("load phase is missing".to_string());
        assert_eq!(err.to_string(), "Validation error: load phase is missing");
    }

    #[test]
    fn timeout_error_display() {
        let err = StampedeError::Timeout(30_000);
        assert_eq!(err.to_string(), "Operation timed out after 30000 ms");
    }

    #[test]
    fn cancelled_error_display() {
        assert_eq!(StampedeError::Cancelled.to_string(), "Operation cancelled");
    }

    #[test]
    fn threshold_error_display_includes_metric() {
        let err = StampedeError::Threshold {
            metric: "response_time".to_string(),
            message: "812 > 500".to_string(),
            action: ThresholdAction::FailStep,
        };
        assert!(err.to_string().contains("response_time"));
        assert!(err.to_string().contains("812 > 500"));
    }

    #[test]
    fn worker_error_display_includes_address() {
        let err = StampedeError::Worker {
            address: "10.0.0.5:8080".to_string(),
            message: "connection refused".to_string(),
        };
        assert!(err.to_string().contains("10.0.0.5:8080"));
    }

    #[test]
    fn io_error_from_std() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err: StampedeError = io_err.into();
        assert!(err.to_string().contains("IO error"));
        assert!(err.to_string().contains("no such file"));
    }

    #[test]
    fn serde_error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: StampedeError = json_err.into();
        assert!(err.to_string().contains("Serialization error"));
    }

    #[test]
    fn serialize_produces_display_string() {
        let err = StampedeError::Engine("spawn failed".to_string());
        let json = serde_json::to_string(&err).expect("serialize should succeed");
        assert_eq!(json, "\"Engine error: spawn failed\"");
    }

    #[test]
    fn fatal_classification() {
        assert!(StampedeError::Validation("x".into()).is_fatal());
        assert!(StampedeError::Cancelled.is_fatal());
        assert!(StampedeError::Threshold {
            metric: "m".into(),
            message: "v".into(),
            action: ThresholdAction::Abort,
        }
        .is_fatal());
        assert!(!StampedeError::Threshold {
            metric: "m".into(),
            message: "v".into(),
            action: ThresholdAction::FailStep,
        }
        .is_fatal());
        assert!(!StampedeError::Timeout(100).is_fatal());
    }
}
