use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::contract::{Attribute, AttributeType, Contract, Rule};
use crate::pipeline::{Pipeline, PipelineBuilder};
use crate::registry::{StepRegistry, StepSpec, build_steps};

/// Declarative pipeline definition loaded from YAML.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Recipe {
    pub version: u32,
    pub name: String,
    #[serde(default)]
    pub contract: Vec<AttributeSpec>,
    pub steps: Vec<StepSpec>,
}

impl Recipe {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read recipe file: {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse recipe YAML: {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// `None` when the recipe declares no attributes.
    pub fn contract(&self) -> Result<Option<Contract>> {
        if self.contract.is_empty() {
            return Ok(None);
        }
        let mut contract = Contract::new();
        for spec in &self.contract {
            contract = contract.attribute(
                spec.to_attribute()
                    .with_context(|| format!("Contract attribute '{}'", spec.name))?,
            );
        }
        Ok(Some(contract))
    }

    pub fn builder(&self, registry: &StepRegistry) -> Result<PipelineBuilder> {
        let mut builder = Pipeline::builder(&self.name);
        if let Some(contract) = self.contract()? {
            builder = builder.contract(contract);
        }
        for step in build_steps(registry, &self.steps)? {
            builder = builder.add_step(step);
        }
        Ok(builder)
    }
}

pub fn build_pipeline(registry: &StepRegistry, recipe: &Recipe) -> Result<Pipeline> {
    Ok(recipe.builder(registry)?.build()?)
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AttributeSpec {
    pub name: String,
    #[serde(rename = "type", default = "default_attribute_type")]
    pub kind: AttributeType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub rules: RuleSpec,
}

fn default_attribute_type() -> AttributeType {
    AttributeType::Any
}

impl AttributeSpec {
    pub fn to_attribute(&self) -> Result<Attribute> {
        let mut attribute = Attribute::new(&self.name, self.kind);
        if self.required {
            attribute = attribute.required();
        }
        if let Some(default) = &self.default {
            attribute = attribute.default_value(default.clone());
        }
        for rule in self.rules.to_rules()? {
            attribute = attribute.rule(rule);
        }
        Ok(attribute)
    }
}

/// Optional format rules of one attribute.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuleSpec {
    #[serde(default)]
    pub min_length: Option<usize>,
    #[serde(default)]
    pub max_length: Option<usize>,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub one_of: Option<Vec<Value>>,
    #[serde(default)]
    pub pattern: Option<String>,
}

impl RuleSpec {
    pub fn to_rules(&self) -> Result<Vec<Rule>> {
        let mut rules = Vec::new();
        if let Some(n) = self.min_length {
            rules.push(Rule::MinLength(n));
        }
        if let Some(n) = self.max_length {
            rules.push(Rule::MaxLength(n));
        }
        if let Some(n) = self.min {
            rules.push(Rule::Min(n));
        }
        if let Some(n) = self.max {
            rules.push(Rule::Max(n));
        }
        if let Some(allowed) = &self.one_of {
            rules.push(Rule::OneOf(allowed.clone()));
        }
        if let Some(pattern) = &self.pattern {
            let regex = Regex::new(pattern)
                .with_context(|| format!("Invalid pattern: {pattern}"))?;
            rules.push(Rule::Pattern(regex));
        }
        Ok(rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECIPE: &str = r#"
version: 1
name: rename_channel
contract:
  - name: channel_id
    type: integer
    required: true
    rules: { min: 1 }
  - name: title
    type: string
    rules: { max_length: 20, pattern: "^[a-z-]+$" }
steps:
  - kind: policy
    name: is_owner
    use: value_equals
    params: { key: role, equals: owner }
  - kind: transaction
    steps:
      - kind: step
        name: rename
        use: copy
        params: { from: title, to: channel_title }
"#;

    #[test]
    fn parses_contract_and_nested_steps() {
        let recipe = Recipe::from_yaml(RECIPE).unwrap();
        assert_eq!(recipe.name, "rename_channel");
        assert_eq!(recipe.contract[0].kind, AttributeType::Integer);
        assert!(recipe.contract[0].required);
        assert_eq!(recipe.contract[1].rules.max_length, Some(20));
        assert_eq!(recipe.steps[1].name(), "transaction");
        assert_eq!(recipe.steps[1].nested()[0].action(), Some("copy"));

        let contract = recipe.contract().unwrap().unwrap();
        assert_eq!(contract.attributes()[1].rules().len(), 2);
    }

    #[test]
    fn invalid_patterns_are_reported() {
        let spec = RuleSpec {
            pattern: Some("(".into()),
            ..RuleSpec::default()
        };
        let err = spec.to_rules().unwrap_err();
        assert_eq!(err.to_string(), "Invalid pattern: (");
    }
}
