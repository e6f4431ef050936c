use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::failure::{ContractViolation, FailureReason};
use crate::policy::Guardian;
use crate::step::StepHandle;

/// Value stored in a [`Context`]: plain data or an opaque domain entity.
#[derive(Clone)]
pub enum ContextValue {
    Data(Value),
    Entity(Arc<dyn Any + Send + Sync>),
}

impl ContextValue {
    pub fn entity<T: Any + Send + Sync>(value: T) -> Self {
        Self::Entity(Arc::new(value))
    }

    pub fn as_data(&self) -> Option<&Value> {
        match self {
            Self::Data(value) => Some(value),
            Self::Entity(_) => None,
        }
    }

    pub fn downcast<T: Any>(&self) -> Option<&T> {
        match self {
            Self::Entity(entity) => entity.downcast_ref::<T>(),
            Self::Data(_) => None,
        }
    }

    /// Null data and empty collections count as blank; entities never do.
    pub fn is_blank(&self) -> bool {
        match self {
            Self::Data(value) => is_blank(value),
            Self::Entity(_) => false,
        }
    }
}

impl fmt::Debug for ContextValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data(value) => f.debug_tuple("Data").field(value).finish(),
            Self::Entity(_) => f.write_str("Entity(..)"),
        }
    }
}

impl From<Value> for ContextValue {
    fn from(value: Value) -> Self {
        Self::Data(value)
    }
}

impl From<&str> for ContextValue {
    fn from(value: &str) -> Self {
        Self::Data(Value::String(value.to_string()))
    }
}

impl From<String> for ContextValue {
    fn from(value: String) -> Self {
        Self::Data(Value::String(value))
    }
}

impl From<i64> for ContextValue {
    fn from(value: i64) -> Self {
        Self::Data(Value::from(value))
    }
}

impl From<f64> for ContextValue {
    fn from(value: f64) -> Self {
        Self::Data(Value::from(value))
    }
}

impl From<bool> for ContextValue {
    fn from(value: bool) -> Self {
        Self::Data(Value::Bool(value))
    }
}

pub(crate) fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Per-invocation state bag threaded through every step of a pipeline.
pub struct Context {
    run_id: Uuid,
    values: BTreeMap<String, ContextValue>,
    failure: Option<FailureReason>,
    violations: Vec<ContractViolation>,
    called_steps: Vec<StepHandle>,
    rolled_back: bool,
    guardian: Option<Arc<dyn Guardian>>,
    current_step: Option<String>,
}

impl Default for Context {
    fn default() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            values: BTreeMap::new(),
            failure: None,
            violations: Vec::new(),
            called_steps: Vec::new(),
            rolled_back: false,
            guardian: None,
            current_step: None,
        }
    }
}

impl Context {
    pub fn new<I, K, V>(input: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<ContextValue>,
    {
        let mut ctx = Self::default();
        for (key, value) in input {
            ctx.set(key, value);
        }
        ctx
    }

    pub fn with_guardian(mut self, guardian: Arc<dyn Guardian>) -> Self {
        self.guardian = Some(guardian);
        self
    }

    /// Identity of the invocation this context belongs to.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn guardian(&self) -> Option<&dyn Guardian> {
        self.guardian.as_deref()
    }

    pub fn get(&self, key: &str) -> Option<&ContextValue> {
        self.values.get(key)
    }

    pub fn value(&self, key: &str) -> Option<&Value> {
        self.get(key).and_then(ContextValue::as_data)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.value(key).and_then(Value::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.value(key).and_then(Value::as_i64)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.value(key).and_then(Value::as_bool)
    }

    pub fn entity<T: Any>(&self, key: &str) -> Option<&T> {
        self.get(key).and_then(ContextValue::downcast::<T>)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<ContextValue>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn set_entity<T: Any + Send + Sync>(&mut self, key: impl Into<String>, entity: T) {
        self.values.insert(key.into(), ContextValue::entity(entity));
    }

    pub fn remove(&mut self, key: &str) -> Option<ContextValue> {
        self.values.remove(key)
    }

    /// Data values only, for reporting.
    pub fn data(&self) -> Map<String, Value> {
        self.values
            .iter()
            .filter_map(|(key, value)| value.as_data().map(|v| (key.clone(), v.clone())))
            .collect()
    }

    /// Records a failure. The first failure of a run wins.
    pub fn fail(&mut self, reason: FailureReason) {
        if self.failure.is_none() {
            self.failure = Some(reason);
        }
    }

    /// Fails the running step with `payload`.
    pub fn fail_step(&mut self, payload: impl Into<Value>) {
        let name = self
            .current_step
            .clone()
            .unwrap_or_else(|| "step".to_string());
        self.fail(FailureReason::StepFailure {
            name,
            payload: payload.into(),
        });
    }

    /// Aborts the enclosing transaction group without raising.
    pub fn abort_transaction(&mut self) {
        self.fail(FailureReason::TransactionAbort);
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    pub fn is_failure(&self) -> bool {
        self.failure.is_some()
    }

    pub fn failure_reason(&self) -> Option<&FailureReason> {
        self.failure.as_ref()
    }

    /// Every contract violation of the run, not only the surfaced one.
    pub fn violations(&self) -> &[ContractViolation] {
        &self.violations
    }

    pub fn called_steps(&self) -> &[StepHandle] {
        &self.called_steps
    }

    pub fn is_rolled_back(&self) -> bool {
        self.rolled_back
    }

    /// True once the context has been through an invocation.
    pub(crate) fn is_spent(&self) -> bool {
        self.failure.is_some()
            || self.rolled_back
            || !self.called_steps.is_empty()
            || !self.violations.is_empty()
    }

    /// Fatal runs carry no expected failure reason.
    pub(crate) fn clear_failure(&mut self) {
        self.failure = None;
    }

    pub(crate) fn record_violations(&mut self, violations: Vec<ContractViolation>) {
        self.violations = violations;
    }

    pub(crate) fn record_called(&mut self, handle: StepHandle) {
        self.called_steps.push(handle);
    }

    pub(crate) fn mark_rolled_back(&mut self) {
        self.rolled_back = true;
    }

    pub(crate) fn enter_step(&mut self, name: &str) {
        self.current_step = Some(name.to_string());
    }

    pub(crate) fn leave_step(&mut self) {
        self.current_step = None;
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("run_id", &self.run_id)
            .field("values", &self.values)
            .field("failure", &self.failure)
            .field("violations", &self.violations)
            .field("called_steps", &self.called_steps)
            .field("rolled_back", &self.rolled_back)
            .field("guardian", &self.guardian.is_some())
            .finish()
    }
}

/// Immutable, terminal view of one finished invocation.
#[derive(Debug)]
pub struct ServiceResult {
    context: Context,
}

impl ServiceResult {
    pub(crate) fn new(context: Context) -> Self {
        Self { context }
    }

    pub fn is_success(&self) -> bool {
        self.context.is_success()
    }

    pub fn is_failure(&self) -> bool {
        self.context.is_failure()
    }

    pub fn failure_reason(&self) -> Option<&FailureReason> {
        self.context.failure_reason()
    }

    pub fn run_id(&self) -> Uuid {
        self.context.run_id()
    }

    pub fn get(&self, key: &str) -> Option<&ContextValue> {
        self.context.get(key)
    }

    pub fn value(&self, key: &str) -> Option<&Value> {
        self.context.value(key)
    }

    pub fn entity<T: Any>(&self, key: &str) -> Option<&T> {
        self.context.entity(key)
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn into_context(self) -> Context {
        self.context
    }

    pub fn report(&self) -> RunReport {
        RunReport::from_context(&self.context)
    }
}

/// Serializable summary of a finished context.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<ContractViolation>,
    pub values: Map<String, Value>,
    pub called_steps: Vec<String>,
    pub rolled_back: bool,
}

impl RunReport {
    pub fn from_context(ctx: &Context) -> Self {
        Self {
            run_id: ctx.run_id(),
            success: ctx.is_success(),
            failure_reason: ctx.failure_reason().cloned(),
            violations: ctx.violations().to_vec(),
            values: ctx.data(),
            called_steps: ctx
                .called_steps()
                .iter()
                .map(|step| step.name().to_string())
                .collect(),
            rolled_back: ctx.is_rolled_back(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, PartialEq)]
    struct Channel {
        id: u64,
    }

    #[test]
    fn seeds_input_and_reads_typed_values() {
        let ctx = Context::new([("name", json!("general")), ("limit", json!(10))]);
        assert_eq!(ctx.get_str("name"), Some("general"));
        assert_eq!(ctx.get_i64("limit"), Some(10));
        assert!(ctx.is_success());
        assert!(ctx.called_steps().is_empty());
    }

    #[test]
    fn entities_downcast_by_type() {
        let mut ctx = Context::default();
        ctx.set_entity("channel", Channel { id: 7 });
        assert_eq!(ctx.entity::<Channel>("channel"), Some(&Channel { id: 7 }));
        assert!(ctx.entity::<String>("channel").is_none());
        assert!(ctx.value("channel").is_none());
        assert!(!ctx.data().contains_key("channel"));
    }

    #[test]
    fn first_failure_wins() {
        let mut ctx = Context::default();
        ctx.enter_step("archive");
        ctx.fail_step(json!("boom"));
        ctx.abort_transaction();
        assert!(ctx.is_failure());
        assert_eq!(
            ctx.failure_reason(),
            Some(&FailureReason::StepFailure {
                name: "archive".into(),
                payload: json!("boom"),
            })
        );
    }

    #[test]
    fn every_context_gets_its_own_run_id() {
        assert_ne!(Context::default().run_id(), Context::default().run_id());
    }

    #[test]
    fn blank_values() {
        assert!(ContextValue::from(Value::Null).is_blank());
        assert!(ContextValue::from("  ").is_blank());
        assert!(ContextValue::from(json!([])).is_blank());
        assert!(!ContextValue::from(0_i64).is_blank());
        assert!(!ContextValue::entity(()).is_blank());
    }
}
