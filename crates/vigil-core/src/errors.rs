//! Error types for the vigil core library.

use chrono::{DateTime, Utc};

use crate::models::Plan;

/// Top-level error enum for the vigil core library.
#[derive(Debug, thiserror::Error)]
pub enum VigilError {
    /// Input rejected before any analysis work started.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Rate limit exceeded for {plan} plan ({limit} requests per window)")]
    AdmissionDenied {
        plan: Plan,
        limit: u32,
        remaining: u32,
        reset_time: Option<DateTime<Utc>>,
    },

    #[error("Analysis exceeded its {budget_ms} ms budget during {stage}")]
    Timeout { budget_ms: u64, stage: &'static str },

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Token error: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),
}

impl VigilError {
    /// HTTP-equivalent status class for the outer request layer.
    pub fn status_code(&self) -> u16 {
        match self {
            VigilError::Validation(_) => 400,
            VigilError::AdmissionDenied { .. } => 429,
            VigilError::Timeout { .. } => 408,
            _ => 500,
        }
    }

    /// Message safe to hand back to an untrusted caller.
    ///
    /// Caller-facing failures keep their detail; everything else collapses
    /// into an opaque message so store paths and internals never leak.
    pub fn public_message(&self) -> String {
        match self {
            VigilError::Validation(_)
            | VigilError::AdmissionDenied { .. }
            | VigilError::Timeout { .. } => self.to_string(),
            _ => "Internal error during analysis".to_string(),
        }
    }
}

#[cfg(feature = "python")]
impl From<VigilError> for pyo3::PyErr {
    fn from(err: VigilError) -> pyo3::PyErr {
        use pyo3::exceptions::{PyIOError, PyRuntimeError, PyTimeoutError, PyValueError};
        match &err {
            VigilError::Validation(_) | VigilError::Config(_) | VigilError::Token(_) => {
                PyValueError::new_err(err.to_string())
            }
            VigilError::Json(_) | VigilError::Regex(_) => PyValueError::new_err(err.to_string()),
            VigilError::Timeout { .. } => PyTimeoutError::new_err(err.to_string()),
            VigilError::Io(_) => PyIOError::new_err(err.to_string()),
            VigilError::AdmissionDenied { .. }
            | VigilError::Internal(_)
            | VigilError::Store(_)
            | VigilError::Sqlite(_) => PyRuntimeError::new_err(err.to_string()),
        }
    }
}

pub type VigilResult<T> = Result<T, VigilError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(VigilError::Validation("x".into()).status_code(), 400);
        let denied = VigilError::AdmissionDenied {
            plan: Plan::Anonymous,
            limit: 10,
            remaining: 0,
            reset_time: None,
        };
        assert_eq!(denied.status_code(), 429);
        let timeout = VigilError::Timeout {
            budget_ms: 10,
            stage: "detecting",
        };
        assert_eq!(timeout.status_code(), 408);
        assert_eq!(VigilError::Store("down".into()).status_code(), 500);
    }

    #[test]
    fn test_internal_detail_is_opaque() {
        let err = VigilError::Store("/var/lib/vigil/limits.db is locked".into());
        assert!(!err.public_message().contains("/var/lib"));
        let err = VigilError::Validation("Code cannot be empty".into());
        assert!(err.public_message().contains("Code cannot be empty"));
    }
}
