//! Error types for resource parsing, validation and transformation.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResourcesError {
    /// The textual form could not be parsed.
    #[error("failed to parse resource '{input}': {reason}")]
    Parse { input: String, reason: String },

    /// A resource is structurally invalid.
    #[error("invalid resource '{name}': {reason}")]
    Invalid { name: String, reason: String },

    /// An offer operation could not be applied.
    #[error("invalid {operation} operation: {reason}")]
    Transformation {
        operation: &'static str,
        reason: String,
    },
}

impl ResourcesError {
    pub(crate) fn parse(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Parse {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            name: name.into(),
            reason: reason.into(),
        }
    }
}
