//! Unified error handling for labdesk.
//!
//! Every fallible operation in the crate resolves to one of four kinds:
//! local input rejected before any platform call, access denied by the
//! resolved course scope, a platform call that failed, or local state that
//! no longer matches what the platform reports. Callers can match on the
//! kind to decide whether to re-prompt, refresh, or surface the message.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, LabError>;

/// Unified error type for all labdesk services.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LabError {
    /// Input rejected locally, before any platform call was made.
    #[error("validation failed{}: {message}", field_suffix(.field))]
    Validation {
        /// The offending field, when the failure is attributable to one.
        field: Option<String>,
        message: String,
    },

    /// The caller's resolved scope does not cover the attempted operation.
    /// Raised before any platform call.
    #[error("access denied for {operation}: {reason}")]
    AccessDenied { operation: String, reason: String },

    /// A platform call failed. The upstream message is carried verbatim;
    /// the operation was not retried.
    #[error("{operation} failed upstream: {message}")]
    Upstream { operation: String, message: String },

    /// Local state no longer matches what the platform reports. Resolved by
    /// resetting the local view, not by retrying the operation.
    #[error("{operation} hit stale state: {message}")]
    Stale { operation: String, message: String },
}

fn field_suffix(field: &Option<String>) -> String {
    match field {
        Some(f) => format!(" for {f}"),
        None => String::new(),
    }
}

impl LabError {
    /// Validation failure not tied to a single field.
    pub fn validation(message: impl Into<String>) -> Self {
        LabError::Validation {
            field: None,
            message: message.into(),
        }
    }

    /// Validation failure for a specific field.
    pub fn validation_field(field: &str, message: impl Into<String>) -> Self {
        LabError::Validation {
            field: Some(field.to_string()),
            message: message.into(),
        }
    }

    /// Scope check failed for the named operation.
    pub fn access_denied(operation: &str, reason: impl Into<String>) -> Self {
        LabError::AccessDenied {
            operation: operation.to_string(),
            reason: reason.into(),
        }
    }

    /// Platform call failed for the named operation.
    pub fn upstream(operation: &str, message: impl Into<String>) -> Self {
        LabError::Upstream {
            operation: operation.to_string(),
            message: message.into(),
        }
    }

    /// Local state out of date for the named operation.
    pub fn stale(operation: &str, message: impl Into<String>) -> Self {
        LabError::Stale {
            operation: operation.to_string(),
            message: message.into(),
        }
    }

    /// True for errors raised before any platform call.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            LabError::Validation { .. } | LabError::AccessDenied { .. }
        )
    }
}
