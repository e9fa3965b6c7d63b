use crate::report::ReportKind;
use thiserror::Error;

/// Errors raised while pairing and attributing reports
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FormulaError {
    /// A report matched zero or both stream predicates (broken setup)
    #[error("Cannot classify {kind}: {reason}")]
    Classification { kind: ReportKind, reason: String },

    /// A matched pair could not be attributed (zero/non-finite normalizer)
    #[error("Attribution failed: {0}")]
    Attribution(String),

    /// The formula received a message it does not handle
    #[error("Unsupported message: {kind}")]
    UnsupportedMessage { kind: String },
}

impl FormulaError {
    /// Fatal errors must stop the owning worker
    pub fn is_fatal(&self) -> bool {
        matches!(self, FormulaError::Classification { .. })
    }
}

/// Result type for formula operations
pub type Result<T> = std::result::Result<T, FormulaError>;
