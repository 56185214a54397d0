//! Error types for the rules crate.

use techsense_core::Error as CoreError;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RuleError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Duplicate id: {0}")]
    Duplicate(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Result type for rule operations
pub type Result<T> = std::result::Result<T, RuleError>;

impl From<RuleError> for CoreError {
    fn from(e: RuleError) -> Self {
        match e {
            RuleError::Validation(s) => CoreError::Validation(s),
            RuleError::Duplicate(s) => CoreError::Config(format!("duplicate id: {}", s)),
            RuleError::NotFound(s) => CoreError::NotFound(s),
        }
    }
}

impl From<techsense_commands::CommandError> for RuleError {
    fn from(e: techsense_commands::CommandError) -> Self {
        RuleError::Validation(e.to_string())
    }
}
