use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;

use crate::context::{Context, ContextValue};
use crate::contract::Contract;

/// Side-effecting body of a `Step`. Returning `Err` is fatal.
pub type StepBody = Arc<dyn Fn(&mut Context) -> Result<()> + Send + Sync>;

/// Compensating action run when a later step fails fatally.
pub type RollbackFn = Arc<dyn Fn(&mut Context) -> Result<()> + Send + Sync>;

pub type PolicyFn = Arc<dyn Fn(&Context) -> bool + Send + Sync>;

pub type FetchFn = Arc<dyn Fn(&Context) -> Option<ContextValue> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Contract,
    Policy,
    Model,
    Step,
    Transaction,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Contract => "contract",
            Self::Policy => "policy",
            Self::Model => "model",
            Self::Step => "step",
            Self::Transaction => "transaction",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone)]
pub(crate) enum StepLogic {
    Contract(Contract),
    Policy(PolicyFn),
    Model {
        fetch: FetchFn,
        required: bool,
    },
    Step {
        body: StepBody,
        rollback: Option<RollbackFn>,
    },
    Transaction(Vec<StepDescriptor>),
}

/// Declarative record of one pipeline step.
#[derive(Clone)]
pub struct StepDescriptor {
    name: String,
    pub(crate) logic: StepLogic,
}

impl StepDescriptor {
    pub fn contract(schema: Contract) -> Self {
        Self {
            name: "contract".to_string(),
            logic: StepLogic::Contract(schema),
        }
    }

    pub fn policy<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&Context) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            logic: StepLogic::Policy(Arc::new(predicate)),
        }
    }

    pub fn model<F>(name: impl Into<String>, fetch: F, required: bool) -> Self
    where
        F: Fn(&Context) -> Option<ContextValue> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            logic: StepLogic::Model {
                fetch: Arc::new(fetch),
                required,
            },
        }
    }

    pub fn step<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut Context) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            logic: StepLogic::Step {
                body: Arc::new(body),
                rollback: None,
            },
        }
    }

    pub fn transaction(name: impl Into<String>, steps: Vec<StepDescriptor>) -> Self {
        Self {
            name: name.into(),
            logic: StepLogic::Transaction(steps),
        }
    }

    pub(crate) fn from_parts(name: impl Into<String>, logic: StepLogic) -> Self {
        Self {
            name: name.into(),
            logic,
        }
    }

    /// Attaches a compensating action. Only meaningful for `Step` descriptors.
    pub fn with_rollback<F>(mut self, rollback: F) -> Self
    where
        F: Fn(&mut Context) -> Result<()> + Send + Sync + 'static,
    {
        if let StepLogic::Step { rollback: slot, .. } = &mut self.logic {
            *slot = Some(Arc::new(rollback));
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> StepKind {
        match self.logic {
            StepLogic::Contract(_) => StepKind::Contract,
            StepLogic::Policy(_) => StepKind::Policy,
            StepLogic::Model { .. } => StepKind::Model,
            StepLogic::Step { .. } => StepKind::Step,
            StepLogic::Transaction(_) => StepKind::Transaction,
        }
    }

    pub fn has_rollback(&self) -> bool {
        matches!(
            self.logic,
            StepLogic::Step {
                rollback: Some(_),
                ..
            }
        )
    }

    pub fn nested(&self) -> &[StepDescriptor] {
        match &self.logic {
            StepLogic::Transaction(steps) => steps,
            _ => &[],
        }
    }

    pub(crate) fn handle(&self) -> StepHandle {
        let rollback = match &self.logic {
            StepLogic::Step { rollback, .. } => rollback.clone(),
            _ => None,
        };
        StepHandle {
            name: self.name.clone(),
            kind: self.kind(),
            rollback,
        }
    }
}

impl fmt::Debug for StepDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("StepDescriptor");
        debug.field("name", &self.name).field("kind", &self.kind());
        if let StepLogic::Transaction(steps) = &self.logic {
            debug.field("steps", steps);
        }
        debug.finish()
    }
}

/// Record of a step that executed during one invocation.
#[derive(Clone)]
pub struct StepHandle {
    name: String,
    kind: StepKind,
    rollback: Option<RollbackFn>,
}

impl StepHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> StepKind {
        self.kind
    }

    pub fn has_rollback(&self) -> bool {
        self.rollback.is_some()
    }

    pub(crate) fn rollback(&self) -> Option<&RollbackFn> {
        self.rollback.as_ref()
    }
}

impl fmt::Debug for StepHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepHandle")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("rollback", &self.rollback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollback_only_attaches_to_steps() {
        let step = StepDescriptor::step("archive", |_| Ok(())).with_rollback(|_| Ok(()));
        assert!(step.has_rollback());
        assert!(step.handle().has_rollback());

        let policy = StepDescriptor::policy("is_admin", |_| true).with_rollback(|_| Ok(()));
        assert!(!policy.has_rollback());
        assert_eq!(policy.kind(), StepKind::Policy);
    }

    #[test]
    fn transaction_exposes_nested_steps() {
        let group = StepDescriptor::transaction(
            "persist",
            vec![
                StepDescriptor::step("a", |_| Ok(())),
                StepDescriptor::step("b", |_| Ok(())),
            ],
        );
        let names: Vec<_> = group.nested().iter().map(StepDescriptor::name).collect();
        assert_eq!(names, ["a", "b"]);
        assert_eq!(group.kind().to_string(), "transaction");
    }
}
