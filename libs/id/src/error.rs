//! Parse errors for minted ids.

use thiserror::Error;

/// Why a string is not a valid id. Every variant keeps the offending input
/// so a bad ledger record name can be reported as-is.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("empty id")]
    Empty,

    #[error("id {input:?} is not in prefix_ulid form")]
    MissingSeparator { input: String },

    #[error("id {input:?} has prefix {found:?}, expected {expected:?}")]
    WrongPrefix {
        input: String,
        expected: &'static str,
        found: String,
    },

    #[error("id {input:?} has an invalid ULID: {reason}")]
    InvalidUlid { input: String, reason: String },
}

impl IdError {
    pub fn is_prefix_error(&self) -> bool {
        matches!(self, IdError::WrongPrefix { .. })
    }

    /// The string that failed to parse.
    pub fn input(&self) -> &str {
        match self {
            IdError::Empty => "",
            IdError::MissingSeparator { input }
            | IdError::WrongPrefix { input, .. }
            | IdError::InvalidUlid { input, .. } => input,
        }
    }
}
