//! Error types for the optimizer crate.

pub use gridmind_core::Error as GridError;

#[derive(Debug, thiserror::Error)]
pub enum OptimizerError {
    #[error("Rule not found: {0}")]
    RuleNotFound(String),

    #[error("Rule already exists: {0}")]
    DuplicateRule(String),

    #[error("Invalid rule {rule_id}: {message}")]
    InvalidRule { rule_id: String, message: String },

    #[error("Action {action} on {device_id} failed: {reason}")]
    ActionFailed {
        device_id: String,
        action: String,
        reason: String,
    },

    #[error("Action not applicable to {device_id}: {reason}")]
    NotApplicable { device_id: String, reason: String },
}

impl OptimizerError {
    pub fn invalid(rule_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidRule {
            rule_id: rule_id.into(),
            message: message.into(),
        }
    }
}

/// Result type for optimizer operations
pub type Result<T> = std::result::Result<T, OptimizerError>;

impl From<OptimizerError> for GridError {
    fn from(e: OptimizerError) -> Self {
        match e {
            OptimizerError::RuleNotFound(id) => GridError::NotFound(format!("rule {}", id)),
            OptimizerError::DuplicateRule(id) => GridError::Validation(format!("rule {} already exists", id)),
            e @ OptimizerError::InvalidRule { .. } => GridError::Validation(e.to_string()),
            e @ OptimizerError::ActionFailed { .. } => GridError::OptimizationActionFailed(e.to_string()),
            e @ OptimizerError::NotApplicable { .. } => GridError::CommandRejected(e.to_string()),
        }
    }
}
