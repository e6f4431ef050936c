//! Built-in actions available to declarative pipelines.

use std::sync::Arc;

use anyhow::{Result, anyhow, bail};
use serde_json::{Map, Value};

use crate::context::{Context, ContextValue};
use crate::registry::{StepAction, StepParameters, StepRegistry};
use crate::step::{FetchFn, PolicyFn};

pub fn register_defaults(registry: &mut StepRegistry) {
    registry.register_policy("present", present_policy);
    registry.register_policy("value_equals", value_equals_policy);
    registry.register_model("lookup", lookup_model);
    registry.register_model("context_value", context_value_model);
    registry.register_step("annotate", annotate_step);
    registry.register_step("copy", copy_step);
    registry.register_step("increment", increment_step);
    registry.register_step("fail", fail_step);
    registry.register_step("abort", |_| Ok(StepAction::new(abort)));
    registry.register_step("raise", raise_step);
}

fn present_policy(mut params: StepParameters) -> Result<PolicyFn> {
    let key = require_string(&mut params, "present", "key")?;
    Ok(Arc::new(move |ctx: &Context| {
        ctx.get(&key).is_some_and(|value| !value.is_blank())
    }))
}

fn value_equals_policy(mut params: StepParameters) -> Result<PolicyFn> {
    let key = require_string(&mut params, "value_equals", "key")?;
    let expected = params
        .remove("equals")
        .ok_or_else(|| anyhow!("value_equals policy requires 'equals' parameter"))?;
    Ok(Arc::new(move |ctx: &Context| ctx.value(&key) == Some(&expected)))
}

/// Finds a record in an inline table by the string form of a context value.
fn lookup_model(mut params: StepParameters) -> Result<FetchFn> {
    let key = require_string(&mut params, "lookup", "key")?;
    let records = match params.remove("records") {
        Some(Value::Object(records)) => records,
        Some(_) => bail!("lookup model 'records' parameter must be a mapping"),
        None => Map::new(),
    };
    Ok(Arc::new(move |ctx: &Context| {
        let id = match ctx.value(&key)? {
            Value::String(s) => s.clone(),
            Value::Null => return None,
            other => other.to_string(),
        };
        records.get(&id).cloned().map(ContextValue::Data)
    }))
}

fn context_value_model(mut params: StepParameters) -> Result<FetchFn> {
    let key = require_string(&mut params, "context_value", "key")?;
    Ok(Arc::new(move |ctx: &Context| ctx.get(&key).cloned()))
}

/// Sets `key`; rollback removes it again.
fn annotate_step(mut params: StepParameters) -> Result<StepAction> {
    let key = require_string(&mut params, "annotate", "key")?;
    let value = params.remove("value").unwrap_or(Value::Bool(true));
    let undo_key = key.clone();
    Ok(StepAction::new(move |ctx| {
        ctx.set(key.clone(), value.clone());
        Ok(())
    })
    .with_rollback(move |ctx| {
        ctx.remove(&undo_key);
        Ok(())
    }))
}

fn copy_step(mut params: StepParameters) -> Result<StepAction> {
    let from = require_string(&mut params, "copy", "from")?;
    let to = require_string(&mut params, "copy", "to")?;
    let undo_key = to.clone();
    Ok(StepAction::new(move |ctx| {
        let value = ctx
            .get(&from)
            .cloned()
            .ok_or_else(|| anyhow!("copy source '{from}' is not set"))?;
        ctx.set(to.clone(), value);
        Ok(())
    })
    .with_rollback(move |ctx| {
        ctx.remove(&undo_key);
        Ok(())
    }))
}

/// Adds `by` (default 1) to an integer; rollback subtracts it.
fn increment_step(mut params: StepParameters) -> Result<StepAction> {
    let key = require_string(&mut params, "increment", "key")?;
    let by = match params.remove("by") {
        Some(value) => value_as_i64(&value)
            .ok_or_else(|| anyhow!("increment step 'by' parameter must be an integer"))?,
        None => 1,
    };
    let undo_key = key.clone();
    Ok(StepAction::new(move |ctx| add(ctx, &key, by)).with_rollback(move |ctx| add(ctx, &undo_key, -by)))
}

fn add(ctx: &mut Context, key: &str, delta: i64) -> Result<()> {
    let current = match ctx.value(key) {
        None | Some(Value::Null) => 0,
        Some(value) => value
            .as_i64()
            .ok_or_else(|| anyhow!("'{key}' is not an integer: {value}"))?,
    };
    let next = current
        .checked_add(delta)
        .ok_or_else(|| anyhow!("'{key}' overflowed"))?;
    ctx.set(key, next);
    Ok(())
}

fn fail_step(mut params: StepParameters) -> Result<StepAction> {
    let payload = params.remove("payload").unwrap_or(Value::Null);
    Ok(StepAction::new(move |ctx| {
        ctx.fail_step(payload.clone());
        Ok(())
    }))
}

fn abort(ctx: &mut Context) -> Result<()> {
    ctx.abort_transaction();
    Ok(())
}

fn raise_step(mut params: StepParameters) -> Result<StepAction> {
    let message = take_string(&mut params, "message").unwrap_or_else(|| "raised".to_string());
    Ok(StepAction::new(move |_| Err(anyhow!(message.clone()))))
}

fn require_string(params: &mut StepParameters, action: &str, key: &str) -> Result<String> {
    take_string(params, key).ok_or_else(|| anyhow!("{action} requires '{key}' parameter"))
}

fn take_string(params: &mut StepParameters, key: &str) -> Option<String> {
    params.remove(key).and_then(|value| match value {
        Value::String(s) => Some(s),
        Value::Null => None,
        other => Some(other.to_string()),
    })
}

fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(num) => num.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> StepParameters {
        value.as_object().cloned().unwrap_or_default()
    }

    fn registry() -> StepRegistry {
        let mut registry = StepRegistry::new();
        register_defaults(&mut registry);
        registry
    }

    #[test]
    fn defaults_are_registered() {
        let known = registry().known_actions();
        for action in ["policy:present", "model:lookup", "step:annotate", "step:raise"] {
            assert!(known.iter().any(|k| k == action), "missing {action}");
        }
    }

    #[test]
    fn missing_parameters_are_rejected() {
        let err = registry()
            .create_step("annotate", StepParameters::new())
            .err()
            .unwrap();
        assert_eq!(err.to_string(), "annotate requires 'key' parameter");
    }

    #[test]
    fn increment_rolls_back() {
        let action = registry()
            .create_step("increment", params(json!({"key": "unread", "by": 3})))
            .unwrap();
        let mut ctx = Context::new([("unread", json!(2))]);
        (action.body)(&mut ctx).unwrap();
        assert_eq!(ctx.get_i64("unread"), Some(5));
        (action.rollback.unwrap())(&mut ctx).unwrap();
        assert_eq!(ctx.get_i64("unread"), Some(2));
    }

    #[test]
    fn lookup_resolves_by_string_key() {
        let fetch = registry()
            .create_model(
                "lookup",
                params(json!({"key": "channel_id", "records": {"7": {"name": "general"}}})),
            )
            .unwrap();
        let ctx = Context::new([("channel_id", json!(7))]);
        let found = fetch(&ctx).unwrap();
        assert_eq!(found.as_data(), Some(&json!({"name": "general"})));
        assert!(fetch(&Context::new([("channel_id", json!(8))])).is_none());
    }

    #[test]
    fn value_equals_compares_data() {
        let policy = registry()
            .create_policy("value_equals", params(json!({"key": "role", "equals": "admin"})))
            .unwrap();
        assert!(policy(&Context::new([("role", json!("admin"))])));
        assert!(!policy(&Context::new([("role", json!("member"))])));
    }

    #[test]
    fn raise_returns_an_error() {
        let action = registry()
            .create_step("raise", params(json!({"message": "database unavailable"})))
            .unwrap();
        let err = (action.body)(&mut Context::default()).unwrap_err();
        assert_eq!(err.to_string(), "database unavailable");
    }
}
