use service_pipeline::recipe::{Recipe, build_pipeline};
use service_pipeline::registry::StepRegistry;
use service_pipeline::steps;
use service_pipeline::{FailureReason, PipelineError};
use serde_json::{Map, Value, json};

fn registry() -> StepRegistry {
    let mut registry = StepRegistry::new();
    steps::register_defaults(&mut registry);
    registry
}

const COUNTER: &str = r#"
version: 1
name: bump_unread
steps:
  - kind: step
    name: bump
    use: increment
    params: { key: unread, by: 2 }
  - kind: step
    name: tag
    use: annotate
    params: { key: notified, value: true }
  - kind: step
    name: push
    use: raise
    params: { message: "push gateway unavailable" }
"#;

#[test]
fn raise_compensates_builtin_steps() {
    let recipe = Recipe::from_yaml(COUNTER).unwrap();
    let pipeline = build_pipeline(&registry(), &recipe).unwrap();

    let err = pipeline.run([("unread", json!(3))]).unwrap_err();
    let PipelineError::Fatal { step, source, .. } = &err else {
        panic!("expected a fatal error");
    };
    assert_eq!(step, "push");
    assert_eq!(source.to_string(), "push gateway unavailable");

    let ctx = err.context();
    assert!(ctx.is_rolled_back());
    assert_eq!(ctx.get_i64("unread"), Some(3));
    assert!(!ctx.contains("notified"));
}

#[test]
fn abort_inside_transaction_halts_the_recipe() {
    let recipe = Recipe::from_yaml(
        r#"
version: 1
name: close_poll
steps:
  - kind: transaction
    name: close
    steps:
      - { kind: step, name: freeze, use: annotate, params: { key: frozen } }
      - { kind: step, name: bail, use: abort }
  - { kind: step, name: announce, use: annotate, params: { key: announced } }
"#,
    )
    .unwrap();
    let pipeline = build_pipeline(&registry(), &recipe).unwrap();
    let result = pipeline.run(Map::<String, Value>::new()).unwrap();
    assert_eq!(result.failure_reason(), Some(&FailureReason::TransactionAbort));
    assert!(!result.context().contains("announced"));
}

#[test]
fn fail_step_carries_its_payload() {
    let recipe = Recipe::from_yaml(
        r#"
version: 1
name: reject_upload
steps:
  - kind: step
    name: scan
    use: fail
    params: { payload: { reason: infected } }
"#,
    )
    .unwrap();
    let pipeline = build_pipeline(&registry(), &recipe).unwrap();
    let err = pipeline.run_strict(Map::<String, Value>::new()).unwrap_err();
    assert_eq!(
        err.failure_reason(),
        Some(&FailureReason::StepFailure {
            name: "scan".into(),
            payload: json!({"reason": "infected"}),
        })
    );
}

#[test]
fn unknown_actions_fail_the_build() {
    let recipe = Recipe::from_yaml(
        r#"
version: 1
name: broken
steps:
  - { kind: step, name: send, use: teleport }
"#,
    )
    .unwrap();
    let err = build_pipeline(&registry(), &recipe).err().unwrap();
    let message = format!("{err:#}");
    assert!(message.contains("step 'send'"), "{message}");
    assert!(message.contains("Unknown step action 'teleport'"), "{message}");
}

#[test]
fn duplicate_step_names_fail_the_build() {
    let recipe = Recipe::from_yaml(
        r#"
version: 1
name: twice
steps:
  - { kind: step, name: tag, use: annotate, params: { key: a } }
  - { kind: step, name: tag, use: annotate, params: { key: b } }
"#,
    )
    .unwrap();
    let err = build_pipeline(&registry(), &recipe).err().unwrap();
    assert!(err.to_string().contains("Duplicate step name 'tag'"));
}
