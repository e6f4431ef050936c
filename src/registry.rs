use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context as _, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::step::{FetchFn, PolicyFn, RollbackFn, StepBody, StepDescriptor, StepKind, StepLogic};

pub type StepParameters = Map<String, Value>;

/// Body and optional compensation produced by a registered step action.
pub struct StepAction {
    pub body: StepBody,
    pub rollback: Option<RollbackFn>,
}

impl StepAction {
    pub fn new<F>(body: F) -> Self
    where
        F: Fn(&mut crate::Context) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            body: Arc::new(body),
            rollback: None,
        }
    }

    pub fn with_rollback<F>(mut self, rollback: F) -> Self
    where
        F: Fn(&mut crate::Context) -> Result<()> + Send + Sync + 'static,
    {
        self.rollback = Some(Arc::new(rollback));
        self
    }
}

type PolicyConstructor = Arc<dyn Fn(StepParameters) -> Result<PolicyFn> + Send + Sync>;
type ModelConstructor = Arc<dyn Fn(StepParameters) -> Result<FetchFn> + Send + Sync>;
type StepConstructor = Arc<dyn Fn(StepParameters) -> Result<StepAction> + Send + Sync>;

/// Named policy, model and step actions that declarative pipelines refer to.
#[derive(Default)]
pub struct StepRegistry {
    policies: HashMap<String, PolicyConstructor>,
    models: HashMap<String, ModelConstructor>,
    steps: HashMap<String, StepConstructor>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_policy<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(StepParameters) -> Result<PolicyFn> + Send + Sync + 'static,
    {
        self.policies.insert(name.into(), Arc::new(constructor));
    }

    pub fn register_model<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(StepParameters) -> Result<FetchFn> + Send + Sync + 'static,
    {
        self.models.insert(name.into(), Arc::new(constructor));
    }

    pub fn register_step<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(StepParameters) -> Result<StepAction> + Send + Sync + 'static,
    {
        self.steps.insert(name.into(), Arc::new(constructor));
    }

    pub fn create_policy(&self, name: &str, params: StepParameters) -> Result<PolicyFn> {
        lookup(StepKind::Policy, &self.policies, name)?(params)
    }

    pub fn create_model(&self, name: &str, params: StepParameters) -> Result<FetchFn> {
        lookup(StepKind::Model, &self.models, name)?(params)
    }

    pub fn create_step(&self, name: &str, params: StepParameters) -> Result<StepAction> {
        lookup(StepKind::Step, &self.steps, name)?(params)
    }

    /// Sorted `kind:name` pairs of everything registered.
    pub fn known_actions(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .policies
            .keys()
            .map(|name| format!("policy:{name}"))
            .chain(self.models.keys().map(|name| format!("model:{name}")))
            .chain(self.steps.keys().map(|name| format!("step:{name}")))
            .collect();
        names.sort();
        names
    }
}

fn lookup<'a, T>(kind: StepKind, factories: &'a HashMap<String, T>, name: &str) -> Result<&'a T> {
    factories.get(name).ok_or_else(|| {
        let mut available: Vec<_> = factories.keys().map(String::as_str).collect();
        available.sort_unstable();
        anyhow!(
            "Unknown {} action '{}'. Available {} actions: {}",
            kind,
            name,
            kind,
            available.join(", ")
        )
    })
}

/// Declarative form of one step, as written in a recipe.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepSpec {
    Policy {
        name: String,
        #[serde(rename = "use")]
        action: String,
        #[serde(default)]
        params: Option<StepParameters>,
    },
    Model {
        name: String,
        #[serde(rename = "use")]
        action: String,
        #[serde(default)]
        params: Option<StepParameters>,
        #[serde(default)]
        optional: bool,
    },
    Step {
        name: String,
        #[serde(rename = "use")]
        action: String,
        #[serde(default)]
        params: Option<StepParameters>,
    },
    Transaction {
        #[serde(default = "default_transaction_name")]
        name: String,
        steps: Vec<StepSpec>,
    },
}

fn default_transaction_name() -> String {
    "transaction".to_string()
}

impl StepSpec {
    pub fn name(&self) -> &str {
        match self {
            Self::Policy { name, .. }
            | Self::Model { name, .. }
            | Self::Step { name, .. }
            | Self::Transaction { name, .. } => name,
        }
    }

    pub fn kind(&self) -> StepKind {
        match self {
            Self::Policy { .. } => StepKind::Policy,
            Self::Model { .. } => StepKind::Model,
            Self::Step { .. } => StepKind::Step,
            Self::Transaction { .. } => StepKind::Transaction,
        }
    }

    pub fn action(&self) -> Option<&str> {
        match self {
            Self::Policy { action, .. } | Self::Model { action, .. } | Self::Step { action, .. } => {
                Some(action)
            }
            Self::Transaction { .. } => None,
        }
    }

    pub fn params(&self) -> Option<&StepParameters> {
        match self {
            Self::Policy { params, .. } | Self::Model { params, .. } | Self::Step { params, .. } => {
                params.as_ref()
            }
            Self::Transaction { .. } => None,
        }
    }

    pub fn nested(&self) -> &[StepSpec] {
        match self {
            Self::Transaction { steps, .. } => steps,
            _ => &[],
        }
    }
}

pub fn build_steps(registry: &StepRegistry, specs: &[StepSpec]) -> Result<Vec<StepDescriptor>> {
    specs
        .iter()
        .map(|spec| {
            build_step(registry, spec)
                .with_context(|| format!("{} '{}'", spec.kind(), spec.name()))
        })
        .collect()
}

pub fn build_step(registry: &StepRegistry, spec: &StepSpec) -> Result<StepDescriptor> {
    let params = spec.params().cloned().unwrap_or_default();
    let logic = match spec {
        StepSpec::Policy { action, .. } => StepLogic::Policy(registry.create_policy(action, params)?),
        StepSpec::Model {
            action, optional, ..
        } => StepLogic::Model {
            fetch: registry.create_model(action, params)?,
            required: !optional,
        },
        StepSpec::Step { action, .. } => {
            let action = registry.create_step(action, params)?;
            StepLogic::Step {
                body: action.body,
                rollback: action.rollback,
            }
        }
        StepSpec::Transaction { steps, .. } => StepLogic::Transaction(build_steps(registry, steps)?),
    };
    Ok(StepDescriptor::from_parts(spec.name(), logic))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Context;

    fn registry() -> StepRegistry {
        let mut registry = StepRegistry::new();
        registry.register_policy("always", |_| Ok(Arc::new(|_: &Context| true) as PolicyFn));
        registry.register_step("noop", |_| Ok(StepAction::new(|_| Ok(()))));
        registry
    }

    #[test]
    fn unknown_actions_list_alternatives() {
        let err = registry()
            .create_step("missing", StepParameters::new())
            .err()
            .unwrap();
        assert_eq!(
            err.to_string(),
            "Unknown step action 'missing'. Available step actions: noop"
        );
    }

    #[test]
    fn known_actions_are_namespaced() {
        assert_eq!(registry().known_actions(), ["policy:always", "step:noop"]);
    }

    #[test]
    fn builds_nested_descriptors() {
        let specs = vec![
            StepSpec::Policy {
                name: "allowed".into(),
                action: "always".into(),
                params: None,
            },
            StepSpec::Transaction {
                name: "persist".into(),
                steps: vec![StepSpec::Step {
                    name: "write".into(),
                    action: "noop".into(),
                    params: None,
                }],
            },
        ];
        let steps = build_steps(&registry(), &specs).unwrap();
        assert_eq!(steps[0].kind(), StepKind::Policy);
        assert_eq!(steps[1].nested()[0].name(), "write");
    }

    #[test]
    fn build_errors_name_the_step() {
        let specs = vec![StepSpec::Step {
            name: "write".into(),
            action: "nope".into(),
            params: None,
        }];
        let err = build_steps(&registry(), &specs).err().unwrap();
        assert_eq!(err.to_string(), "step 'write'");
        assert!(format!("{err:#}").contains("Unknown step action 'nope'"));
    }
}
