//! Declared input attributes and their validation.
//!
//! A [`Contract`] is evaluated before anything else in a pipeline touches the
//! input. Validation only casts and checks values; it never consults policies
//! or persistence.

use std::fmt;
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::context::{Context, is_blank};
use crate::failure::ContractViolation;

/// Anything attributes can be read from.
pub trait AttributeSource {
    fn attribute(&self, name: &str) -> Option<&Value>;

    /// Whether `name` is bound to an opaque entity rather than data.
    fn holds_entity(&self, _name: &str) -> bool {
        false
    }
}

impl AttributeSource for Context {
    fn attribute(&self, name: &str) -> Option<&Value> {
        self.value(name)
    }

    fn holds_entity(&self, name: &str) -> bool {
        self.get(name).is_some_and(|value| value.as_data().is_none())
    }
}

impl AttributeSource for Map<String, Value> {
    fn attribute(&self, name: &str) -> Option<&Value> {
        self.get(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeType {
    String,
    Integer,
    Float,
    Boolean,
    Array,
    Object,
    Any,
}

impl AttributeType {
    fn expectation(&self) -> &'static str {
        match self {
            Self::String => "must be a string",
            Self::Integer => "must be an integer",
            Self::Float => "must be a number",
            Self::Boolean => "must be a boolean",
            Self::Array => "must be an array",
            Self::Object => "must be an object",
            Self::Any => "is invalid",
        }
    }

    /// Lenient cast of raw input into this type.
    fn cast(&self, raw: &Value) -> Option<Value> {
        match (self, raw) {
            (Self::Any, value) => Some(value.clone()),
            (Self::String, Value::String(_)) => Some(raw.clone()),
            (Self::String, Value::Number(n)) => Some(Value::String(n.to_string())),
            (Self::String, Value::Bool(b)) => Some(Value::String(b.to_string())),
            (Self::Integer, Value::Number(n)) => match n.as_i64() {
                Some(i) => Some(Value::from(i)),
                None => n
                    .as_f64()
                    .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                    .map(|f| Value::from(f as i64)),
            },
            (Self::Integer, Value::String(s)) => s.trim().parse::<i64>().ok().map(Value::from),
            (Self::Float, Value::Number(n)) => n.as_f64().and_then(Number::from_f64).map(Value::Number),
            (Self::Float, Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number),
            (Self::Boolean, Value::Bool(_)) => Some(raw.clone()),
            (Self::Boolean, Value::Number(n)) => match n.as_i64() {
                Some(0) => Some(Value::Bool(false)),
                Some(1) => Some(Value::Bool(true)),
                _ => None,
            },
            (Self::Boolean, Value::String(s)) => parse_bool(s).map(Value::Bool),
            (Self::Array, Value::Array(_)) | (Self::Object, Value::Object(_)) => Some(raw.clone()),
            _ => None,
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "t" | "1" | "yes" | "on" => Some(true),
        "false" | "f" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// A format rule applied after casting.
#[derive(Clone)]
pub enum Rule {
    MinLength(usize),
    MaxLength(usize),
    Min(f64),
    Max(f64),
    OneOf(Vec<Value>),
    Pattern(Regex),
    Custom {
        description: String,
        check: Arc<dyn Fn(&Value) -> bool + Send + Sync>,
    },
}

impl Rule {
    pub fn custom<F>(description: impl Into<String>, check: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        Self::Custom {
            description: description.into(),
            check: Arc::new(check),
        }
    }

    pub fn description(&self) -> String {
        match self {
            Self::MinLength(n) => format!("is too short (minimum is {n})"),
            Self::MaxLength(n) => format!("is too long (maximum is {n})"),
            Self::Min(n) => format!("must be greater than or equal to {n}"),
            Self::Max(n) => format!("must be less than or equal to {n}"),
            Self::OneOf(_) => "is not included in the list".to_string(),
            Self::Pattern(_) => "is invalid".to_string(),
            Self::Custom { description, .. } => description.clone(),
        }
    }

    /// Whether the rule can say anything about values of `kind`.
    pub fn applies_to(&self, kind: AttributeType) -> bool {
        match self {
            Self::MinLength(_) | Self::MaxLength(_) => matches!(
                kind,
                AttributeType::String | AttributeType::Array | AttributeType::Any
            ),
            Self::Min(_) | Self::Max(_) => matches!(
                kind,
                AttributeType::Integer | AttributeType::Float | AttributeType::Any
            ),
            Self::Pattern(_) => matches!(kind, AttributeType::String | AttributeType::Any),
            Self::OneOf(_) | Self::Custom { .. } => true,
        }
    }

    fn check(&self, value: &Value) -> bool {
        match self {
            Self::MinLength(n) => length_of(value).is_none_or(|len| len >= *n),
            Self::MaxLength(n) => length_of(value).is_none_or(|len| len <= *n),
            Self::Min(n) => value.as_f64().is_none_or(|v| v >= *n),
            Self::Max(n) => value.as_f64().is_none_or(|v| v <= *n),
            Self::OneOf(allowed) => allowed.contains(value),
            Self::Pattern(regex) => value.as_str().is_none_or(|s| regex.is_match(s)),
            Self::Custom { check, .. } => check(value),
        }
    }
}

fn length_of(value: &Value) -> Option<usize> {
    match value {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(items) => Some(items.len()),
        _ => None,
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pattern(regex) => write!(f, "Pattern({})", regex.as_str()),
            Self::Custom { description, .. } => write!(f, "Custom({description})"),
            other => f.write_str(&other.description()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Attribute {
    name: String,
    kind: AttributeType,
    required: bool,
    default: Option<Value>,
    rules: Vec<Rule>,
}

impl Attribute {
    pub fn new(name: impl Into<String>, kind: AttributeType) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            default: None,
            rules: Vec::new(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> AttributeType {
        self.kind
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// `None` leaves whatever the source already binds under the name.
    fn validate(
        &self,
        source: &impl AttributeSource,
        violations: &mut Vec<ContractViolation>,
    ) -> Option<Value> {
        let raw = match source.attribute(&self.name).filter(|value| !is_blank(value)) {
            Some(value) => value,
            None if source.holds_entity(&self.name) => {
                if self.kind != AttributeType::Any {
                    violations.push(ContractViolation::new(&self.name, self.kind.expectation()));
                }
                return None;
            }
            None => match &self.default {
                Some(default) => default,
                None => {
                    if self.required {
                        violations.push(ContractViolation::missing(&self.name));
                    }
                    return Some(Value::Null);
                }
            },
        };

        let Some(cast) = self.kind.cast(raw) else {
            violations.push(ContractViolation::new(&self.name, self.kind.expectation()));
            return None;
        };

        for rule in &self.rules {
            if !rule.check(&cast) {
                violations.push(ContractViolation::new(&self.name, rule.description()));
            }
        }
        Some(cast)
    }
}

/// Schema of the attributes a pipeline accepts.
#[derive(Debug, Clone, Default)]
pub struct Contract {
    attributes: Vec<Attribute>,
}

impl Contract {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attribute(mut self, attribute: Attribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Validates every declared attribute, accumulating all violations.
    ///
    /// On success returns the cast values keyed by attribute name, including
    /// `null` for optional attributes that were not supplied. Attributes bound
    /// to an entity of an `Any` attribute are left out so the entity survives.
    pub fn validate(
        &self,
        source: &impl AttributeSource,
    ) -> Result<Map<String, Value>, Vec<ContractViolation>> {
        let mut violations = Vec::new();
        let mut values = Map::new();
        for attribute in &self.attributes {
            if let Some(value) = attribute.validate(source, &mut violations) {
                values.insert(attribute.name.clone(), value);
            }
        }
        if violations.is_empty() {
            Ok(values)
        } else {
            Err(violations)
        }
    }
}
