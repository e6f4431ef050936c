use assert_cmd::Command;
use serde_json::Value;
use tempfile::tempdir;

const RECIPE: &str = "recipes/update-last-read.yaml";

fn cli() -> Command {
    Command::cargo_bin("service-pipeline").expect("binary present")
}

fn report(output: &[u8]) -> Value {
    serde_json::from_slice(output).expect("stdout should be a JSON report")
}

#[test]
fn run_prints_a_successful_report() {
    let output = cli()
        .args([
            "run",
            RECIPE,
            "--input-json",
            r#"{"channel_id": 2, "message_id": 9, "membership": "owner"}"#,
        ])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let report = report(&output);
    assert_eq!(report["success"], Value::Bool(true));
    assert_eq!(report["values"]["last_read_message_id"], 9);
    assert_eq!(report["called_steps"][0], "contract");
}

#[test]
fn expected_failures_exit_zero_unless_strict() {
    let input = r#"{"channel_id": 2, "message_id": 9}"#;
    let output = cli()
        .args(["run", RECIPE, "--input-json", input])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let report = report(&output);
    assert_eq!(report["success"], Value::Bool(false));
    assert_eq!(report["failure_reason"]["kind"], "policy_violation");
    assert_eq!(report["failure_reason"]["name"], "is_member");

    cli()
        .args(["run", RECIPE, "--strict", "--input-json", input])
        .assert()
        .failure();
}

#[test]
fn run_reads_input_file_and_writes_metrics() {
    let temp = tempdir().unwrap();
    let input = temp.path().join("input.json");
    std::fs::write(&input, r#"{"channel_id": "1", "message_id": 3, "membership": "member"}"#)
        .unwrap();
    let metrics_json = temp.path().join("metrics/run.json");
    let metrics_prom = temp.path().join("metrics/run.prom");

    cli()
        .arg("run")
        .arg(RECIPE)
        .arg("--input")
        .arg(&input)
        .arg("--metrics-json")
        .arg(&metrics_json)
        .arg("--metrics-prometheus")
        .arg(&metrics_prom)
        .assert()
        .success();

    let snapshot: Value =
        serde_json::from_str(&std::fs::read_to_string(&metrics_json).unwrap()).unwrap();
    assert_eq!(snapshot["pipelines"]["update_last_read"]["successes"], 1);
    let prom = std::fs::read_to_string(&metrics_prom).unwrap();
    assert!(prom.contains("pipeline_step_calls_total{step=\"update_last_read/mark_read\"} 1"));
}

#[test]
fn validate_and_lock_the_sample_recipe() {
    cli().args(["validate", RECIPE]).assert().success();

    let temp = tempdir().unwrap();
    let lock = temp.path().join("locks/update-last-read.lock");
    cli()
        .arg("lock")
        .arg(RECIPE)
        .arg(&lock)
        .assert()
        .success();
    let content = std::fs::read_to_string(&lock).unwrap();
    assert!(content.contains("path: persist/bump_read_count"));
}

#[test]
fn validate_rejects_broken_recipes() {
    let temp = tempdir().unwrap();
    let recipe = temp.path().join("broken.yaml");
    std::fs::write(
        &recipe,
        "version: 1\nname: broken\nsteps:\n  - { kind: step, name: go, use: teleport }\n",
    )
    .unwrap();
    cli().arg("validate").arg(&recipe).assert().failure();
}

#[test]
fn list_steps_names_builtins() {
    let output = cli()
        .arg("list-steps")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).unwrap();
    assert!(text.contains("- step:increment"));
    assert!(text.contains("- policy:present"));
}
