//! Failure taxonomy shared by the pipeline engine.

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::context::Context;

/// Expected domain outcome that halts a pipeline without raising.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// A contract attribute was missing or invalid.
    #[error("contract violation on '{field}': {message}")]
    ContractViolation { field: String, message: String },

    /// A policy predicate returned false.
    #[error("policy '{name}' denied the operation")]
    PolicyViolation { name: String },

    /// A required model could not be fetched.
    #[error("model '{name}' not found")]
    ModelNotFound { name: String },

    /// A step body failed the context explicitly.
    #[error("step '{name}' failed")]
    StepFailure { name: String, payload: Value },

    /// A step aborted its enclosing transaction group.
    #[error("transaction aborted")]
    TransactionAbort,
}

impl FailureReason {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ContractViolation { .. } => "contract_violation",
            Self::PolicyViolation { .. } => "policy_violation",
            Self::ModelNotFound { .. } => "model_not_found",
            Self::StepFailure { .. } => "step_failure",
            Self::TransactionAbort => "transaction_abort",
        }
    }
}

/// A single failed contract check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContractViolation {
    pub field: String,
    pub message: String,
}

impl ContractViolation {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn missing(field: impl Into<String>) -> Self {
        Self::new(field, "missing")
    }
}

impl From<ContractViolation> for FailureReason {
    fn from(violation: ContractViolation) -> Self {
        Self::ContractViolation {
            field: violation.field,
            message: violation.message,
        }
    }
}

/// Errors surfaced by [`crate::Pipeline`] invocations.
///
/// Both variants own the context of the invocation that produced them.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Expected failure raised by the strict entry points.
    #[error("pipeline '{pipeline}' failed: {reason}")]
    Failed {
        pipeline: String,
        reason: FailureReason,
        context: Box<Context>,
    },

    /// Unhandled error inside a step or unit of work. Rollback has already run.
    #[error("pipeline '{pipeline}' aborted in step '{step}'")]
    Fatal {
        pipeline: String,
        step: String,
        #[source]
        source: anyhow::Error,
        context: Box<Context>,
    },

    /// The context passed to `call` already went through an invocation.
    /// Nothing was run.
    #[error("pipeline '{pipeline}' refused a context that was already used")]
    ContextReused {
        pipeline: String,
        context: Box<Context>,
    },
}

impl PipelineError {
    pub fn context(&self) -> &Context {
        match self {
            Self::Failed { context, .. }
            | Self::Fatal { context, .. }
            | Self::ContextReused { context, .. } => context,
        }
    }

    pub fn into_context(self) -> Context {
        match self {
            Self::Failed { context, .. }
            | Self::Fatal { context, .. }
            | Self::ContextReused { context, .. } => *context,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }

    pub fn failure_reason(&self) -> Option<&FailureReason> {
        match self {
            Self::Failed { reason, .. } => Some(reason),
            Self::Fatal { .. } | Self::ContextReused { .. } => None,
        }
    }

    /// True only for an expected failure raised for the invocation `run_id`.
    ///
    /// A failure bubbling up from a nested pipeline carries a different run id
    /// and must not be mistaken for the caller's own.
    pub fn is_failure_of(&self, run_id: Uuid) -> bool {
        matches!(self, Self::Failed { context, .. } if context.run_id() == run_id)
    }
}

/// Structural problems found while building a pipeline.
#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("invalid pipeline definition '{name}': {}", .errors.join("; "))]
    Invalid { name: String, errors: Vec<String> },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn failure_reason_serializes_with_kind_tag() {
        let reason = FailureReason::StepFailure {
            name: "archive".into(),
            payload: json!({"code": 42}),
        };
        let value = serde_json::to_value(&reason).unwrap();
        assert_eq!(value["kind"], "step_failure");
        assert_eq!(value["name"], "archive");
        assert_eq!(value["payload"]["code"], 42);
        assert_eq!(reason.kind(), "step_failure");
    }

    #[test]
    fn violation_converts_into_reason() {
        let reason: FailureReason = ContractViolation::missing("name").into();
        assert_eq!(
            reason,
            FailureReason::ContractViolation {
                field: "name".into(),
                message: "missing".into()
            }
        );
        assert_eq!(reason.to_string(), "contract violation on 'name': missing");
    }
}
