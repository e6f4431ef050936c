use service_pipeline::lockfile::generate_lock;
use service_pipeline::recipe::Recipe;
use service_pipeline::registry::StepRegistry;
use service_pipeline::steps;
use service_pipeline::validation::validate_recipe;
use tempfile::tempdir;

fn registry() -> StepRegistry {
    let mut registry = StepRegistry::new();
    steps::register_defaults(&mut registry);
    registry
}

#[test]
fn validation_collects_structural_errors() {
    let recipe = Recipe::from_yaml(
        r#"
version: 2
name: "  "
contract:
  - { name: title, type: string, rules: { pattern: "(" } }
  - { name: title, type: string }
steps:
  - { kind: step, name: save, use: annotate }
  - { kind: step, name: save, use: teleport }
  - { kind: transaction, name: empty, steps: [] }
"#,
    )
    .unwrap();
    let report = validate_recipe(&recipe, &registry());
    assert!(!report.is_ok());

    let expect = [
        "Unsupported recipe version: 2",
        "Pipeline name cannot be empty",
        "Contract attribute 'title': Invalid pattern: (",
        "Duplicate contract attribute 'title'",
        "Step 1 ('save'): failed to instantiate step: annotate requires 'key' parameter",
        "Step 2 ('save'): duplicate step name 'save'",
        "Step 2 ('save'): failed to instantiate step: Unknown step action 'teleport'",
        "Step 3 ('empty'): transaction has no steps",
    ];
    for needle in expect {
        assert!(
            report.errors.iter().any(|e| e.contains(needle)),
            "missing error '{needle}' in {:?}",
            report.errors
        );
    }
}

#[test]
fn validation_warns_about_late_policies_and_idle_rules() {
    let recipe = Recipe::from_yaml(
        r#"
version: 1
name: kick_member
contract:
  - { name: user_id, type: integer, required: true, rules: { max_length: 3 } }
steps:
  - { kind: step, name: log, use: annotate, params: { key: logged } }
  - { kind: policy, name: is_admin, use: value_equals, params: { key: role, equals: admin } }
"#,
    )
    .unwrap();
    let report = validate_recipe(&recipe, &registry());
    assert!(report.is_ok(), "{:?}", report.errors);
    assert_eq!(report.warnings.len(), 2, "{:?}", report.warnings);
    assert!(report.warnings[0].contains("attribute 'user_id'"));
    assert!(report.warnings[1].contains("policy 'is_admin' runs after side-effecting step 'log'"));
}

#[test]
fn generate_lock_writes_hashed_steps() {
    let recipe = Recipe::from_yaml(
        r#"
version: 1
name: update_last_read
contract:
  - { name: channel_id, type: integer, required: true }
steps:
  - { kind: policy, name: is_member, use: present, params: { key: membership } }
  - kind: transaction
    name: persist
    steps:
      - { kind: step, name: mark_read, use: annotate, params: { key: last_read } }
"#,
    )
    .unwrap();

    let temp = tempdir().unwrap();
    let lock_path = temp.path().join("pipeline.lock");
    generate_lock(&recipe, &lock_path).unwrap();

    let content = std::fs::read_to_string(&lock_path).unwrap();
    assert!(content.contains("recipe_version: 1"));
    assert!(content.contains("name: update_last_read"));
    assert!(content.contains("type: integer"));
    assert!(content.contains("path: persist/mark_read"));
    assert!(content.contains("action: annotate"));
    assert!(content.contains("params_hash:"));
}
