use std::collections::HashSet;

use serde::Serialize;

use crate::recipe::Recipe;
use crate::registry::{StepRegistry, StepSpec, build_step};
use crate::step::{StepDescriptor, StepKind};

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

pub fn validate_recipe(recipe: &Recipe, registry: &StepRegistry) -> ValidationReport {
    let mut report = ValidationReport::default();

    if recipe.version != 1 {
        report
            .errors
            .push(format!("Unsupported recipe version: {}", recipe.version));
    }

    if recipe.name.trim().is_empty() {
        report.errors.push("Pipeline name cannot be empty".into());
    }

    if recipe.steps.is_empty() && recipe.contract.is_empty() {
        report
            .errors
            .push("Pipeline must contain at least one step".into());
    }

    report.merge(validate_contract(recipe));

    let mut seen = HashSet::new();
    for (idx, spec) in recipe.steps.iter().enumerate() {
        report.merge(validate_spec(&format!("Step {}", idx + 1), spec, registry, &mut seen));
        report.merge(validate_step_order(idx, spec, &recipe.steps));
    }

    report
}

fn validate_contract(recipe: &Recipe) -> ValidationReport {
    let mut report = ValidationReport::default();
    let mut seen = HashSet::new();

    for spec in &recipe.contract {
        if spec.name.trim().is_empty() {
            report
                .errors
                .push("Contract attribute names cannot be empty".into());
            continue;
        }
        if !seen.insert(spec.name.as_str()) {
            report
                .errors
                .push(format!("Duplicate contract attribute '{}'", spec.name));
        }
        match spec.to_attribute() {
            Ok(attribute) => {
                for rule in attribute.rules() {
                    if !rule.applies_to(attribute.kind()) {
                        report.warnings.push(format!(
                            "Rule '{}' on attribute '{}' has no effect for type {:?}",
                            rule.description(),
                            spec.name,
                            spec.kind
                        ));
                    }
                }
            }
            Err(err) => report
                .errors
                .push(format!("Contract attribute '{}': {:#}", spec.name, err)),
        }
    }

    report
}

fn validate_spec<'a>(
    label: &str,
    spec: &'a StepSpec,
    registry: &StepRegistry,
    seen: &mut HashSet<&'a str>,
) -> ValidationReport {
    let mut report = ValidationReport::default();
    let label = format!("{label} ('{}')", spec.name());

    if spec.name().trim().is_empty() {
        report.errors.push(format!("{label}: name cannot be empty"));
    }

    match spec {
        StepSpec::Transaction { steps, .. } => {
            if steps.is_empty() {
                report
                    .errors
                    .push(format!("{label}: transaction has no steps"));
            }
            for (idx, nested) in steps.iter().enumerate() {
                let nested_label = format!("{label} > step {}", idx + 1);
                report.merge(validate_spec(&nested_label, nested, registry, seen));
            }
        }
        _ => {
            if !seen.insert(spec.name()) {
                report
                    .errors
                    .push(format!("{label}: duplicate step name '{}'", spec.name()));
            }
            if let Err(err) = build_step(registry, spec) {
                report
                    .errors
                    .push(format!("{label}: failed to instantiate {}: {:#}", spec.kind(), err));
            }
        }
    }

    report
}

fn validate_step_order(idx: usize, spec: &StepSpec, steps: &[StepSpec]) -> ValidationReport {
    let mut report = ValidationReport::default();
    if matches!(spec.kind(), StepKind::Policy | StepKind::Model) {
        let side_effect = steps[..idx]
            .iter()
            .find(|prev| matches!(prev.kind(), StepKind::Step | StepKind::Transaction));
        if let Some(prev) = side_effect {
            report.warnings.push(format!(
                "{} '{}' runs after side-effecting {} '{}'; its effects are not compensated on an expected failure",
                spec.kind(),
                spec.name(),
                prev.kind(),
                prev.name()
            ));
        }
    }
    report
}

/// Structural checks applied by [`crate::PipelineBuilder::build`].
pub fn check_definition(steps: &[StepDescriptor]) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();
    let mut contracts = 0;
    walk_definition(steps, &mut seen, &mut contracts, &mut errors);
    if contracts > 1 {
        errors.push(format!("Pipeline declares {contracts} contracts; at most one is allowed"));
    }
    errors
}

fn walk_definition<'a>(
    steps: &'a [StepDescriptor],
    seen: &mut HashSet<&'a str>,
    contracts: &mut usize,
    errors: &mut Vec<String>,
) {
    for step in steps {
        match step.kind() {
            StepKind::Contract => *contracts += 1,
            StepKind::Transaction => {
                if step.nested().is_empty() {
                    errors.push(format!("Transaction '{}' has no steps", step.name()));
                }
                walk_definition(step.nested(), seen, contracts, errors);
            }
            _ => {
                if !seen.insert(step.name()) {
                    errors.push(format!("Duplicate step name '{}'", step.name()));
                }
            }
        }
    }
}
