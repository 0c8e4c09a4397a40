//! Error types for procedure execution.

/// Input was rejected by a procedure's [`Parser`](crate::Parser).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid input: {message}")]
pub struct ValidationError {
    message: String,
}

impl ValidationError {
    /// Creates a validation error with a human-readable reason.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The reason without the `invalid input:` prefix.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Errors produced while executing a procedure.
///
/// The `Display` text is exactly what is relayed to the caller as the
/// failure payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcedureError {
    /// The input did not pass the parser. The resolver never ran.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The resolver returned an error, panicked, or produced an output
    /// that could not be serialized.
    #[error("{0}")]
    Failed(String),
}
