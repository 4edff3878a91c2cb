use assert_cmd::Command;
use tempfile::NamedTempFile;

fn write_temp(contents: &str) -> NamedTempFile {
    let mut f = NamedTempFile::new().expect("tempfile");
    std::io::Write::write_all(&mut f, contents.as_bytes()).expect("write");
    f
}

fn mender() -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("mender"));
    cmd.env_remove("MENDER_CONFIG")
        .env_remove("MENDER_GENERATOR_URL")
        .env_remove("RUST_LOG");
    cmd
}

const VALID_PLAN: &str = r#"
name: greet
steps:
  - number: 1
    description: say hello
    command: ["echo", "hello"]
    expected_output: hello
  - number: 2
    description: say goodbye
    command: ["echo", "goodbye"]
    depends_on: [1]
  - number: 3
    description: independent
    informational: true
"#;

const FORWARD_DEPENDENCY: &str = r#"
steps:
  - number: 1
    description: first
    command: ["true"]
    depends_on: [2]
  - number: 2
    description: second
    command: ["true"]
"#;

#[test]
fn validate_accepts_a_valid_plan() {
    let f = write_temp(VALID_PLAN);
    let out = mender()
        .args(["validate", f.path().to_string_lossy().as_ref()])
        .assert()
        .success();
    let stdout = String::from_utf8_lossy(&out.get_output().stdout).to_string();
    assert!(stdout.contains("ok: valid plan `greet` (3 steps"), "{stdout}");
}

#[test]
fn validate_reports_violations_with_exit_code_2() {
    let f = write_temp(FORWARD_DEPENDENCY);
    let out = mender()
        .args(["validate", f.path().to_string_lossy().as_ref()])
        .assert()
        .code(2);
    let stderr = String::from_utf8_lossy(&out.get_output().stderr).to_string();
    assert!(stderr.contains("steps[0].depends_on[0]"), "{stderr}");
}

#[test]
fn validate_json_lists_errors() {
    let f = write_temp(FORWARD_DEPENDENCY);
    let out = mender()
        .args([
            "validate",
            f.path().to_string_lossy().as_ref(),
            "--format",
            "json",
        ])
        .assert()
        .code(2);
    let v: serde_json::Value = serde_json::from_slice(&out.get_output().stdout).expect("json");
    assert_eq!(v["valid"], false);
    assert!(!v["errors"].as_array().unwrap().is_empty());
}

#[test]
fn missing_file_is_a_runtime_error() {
    mender()
        .args(["validate", "/nonexistent/mender-plan.yaml"])
        .assert()
        .code(4);
}

#[test]
fn unparseable_plan_fails_validation() {
    let f = write_temp("steps: [unclosed");
    mender()
        .args(["validate", f.path().to_string_lossy().as_ref()])
        .assert()
        .code(2);
}

#[test]
fn plan_outputs_levels_as_json() {
    let f = write_temp(VALID_PLAN);
    let out = mender()
        .args([
            "plan",
            f.path().to_string_lossy().as_ref(),
            "--format",
            "json",
        ])
        .assert()
        .success();
    let v: serde_json::Value = serde_json::from_slice(&out.get_output().stdout).expect("json");
    assert_eq!(v["validation"]["is_valid"], true);
    assert_eq!(v["plan"]["graph"]["levels"], serde_json::json!([[1, 3], [2]]));
    assert_eq!(v["plan"]["graph"]["topo_order"], serde_json::json!([1, 3, 2]));
}

#[test]
fn plan_renders_dot() {
    let f = write_temp(VALID_PLAN);
    let out = mender()
        .args(["plan", f.path().to_string_lossy().as_ref(), "--format", "dot"])
        .assert()
        .success();
    let stdout = String::from_utf8_lossy(&out.get_output().stdout).to_string();
    assert!(stdout.starts_with("digraph mender {"), "{stdout}");
    assert!(stdout.contains("\"1\" -> \"2\";"), "{stdout}");
}

#[test]
fn plan_text_for_invalid_plan_exits_2() {
    let f = write_temp(FORWARD_DEPENDENCY);
    let out = mender()
        .args(["plan", f.path().to_string_lossy().as_ref()])
        .assert()
        .code(2);
    let stdout = String::from_utf8_lossy(&out.get_output().stdout).to_string();
    assert!(stdout.contains("validation: invalid"), "{stdout}");
}

#[test]
fn run_rejects_invalid_plan_before_executing() {
    let f = write_temp(FORWARD_DEPENDENCY);
    mender()
        .args(["run", f.path().to_string_lossy().as_ref()])
        .assert()
        .code(2);
}

#[test]
fn run_rejects_zero_lanes() {
    let f = write_temp(VALID_PLAN);
    mender()
        .args(["run", f.path().to_string_lossy().as_ref(), "--lanes", "0"])
        .assert()
        .code(4);
}

#[test]
fn run_reports_missing_config_file() {
    let f = write_temp(VALID_PLAN);
    mender()
        .env("MENDER_CONFIG", "/nonexistent/mender-engine.yaml")
        .args(["run", f.path().to_string_lossy().as_ref()])
        .assert()
        .code(4);
}

#[cfg(unix)]
#[test]
fn run_succeeds_and_writes_report() {
    let f = write_temp(VALID_PLAN);
    let dir = tempfile::tempdir().unwrap();
    let report_path = dir.path().join("report.json");

    let out = mender()
        .args([
            "run",
            f.path().to_string_lossy().as_ref(),
            "--format",
            "json",
            "--base-delay-ms",
            "10",
            "--report",
            report_path.to_string_lossy().as_ref(),
        ])
        .assert()
        .success();

    let stdout = String::from_utf8_lossy(&out.get_output().stdout).to_string();
    let lines: Vec<&str> = stdout.lines().filter(|l| !l.trim().is_empty()).collect();
    let first: serde_json::Value = serde_json::from_str(lines[0]).expect("event json");
    assert_eq!(first["type"], "run.started");
    let report: serde_json::Value =
        serde_json::from_str(lines[lines.len() - 1]).expect("report json");
    assert_eq!(report["summary"]["completed"], 3);
    assert_eq!(report["summary"]["failed"], 0);

    let written: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&report_path).unwrap()).unwrap();
    assert_eq!(written["run_id"], report["run_id"]);
}

#[cfg(unix)]
#[test]
fn run_with_failed_step_exits_3() {
    let plan = r#"
steps:
  - number: 1
    description: use a tool that is not installed
    command: ["mender-test-missing-tool", "--version"]
  - number: 2
    description: depends on the tool
    command: ["true"]
    depends_on: [1]
"#;
    let f = write_temp(plan);
    let out = mender()
        .args(["run", f.path().to_string_lossy().as_ref(), "--base-delay-ms", "10"])
        .assert()
        .code(3);

    let stdout = String::from_utf8_lossy(&out.get_output().stdout).to_string();
    assert!(stdout.contains("0 completed, 1 failed, 1 skipped (of 2)"), "{stdout}");
    assert!(
        stdout.contains("verify that mender-test-missing-tool is installed and on PATH"),
        "{stdout}"
    );
}

#[cfg(unix)]
#[test]
fn quiet_run_prints_nothing() {
    let f = write_temp(VALID_PLAN);
    let out = mender()
        .args(["run", f.path().to_string_lossy().as_ref(), "--quiet"])
        .assert()
        .success();
    assert!(out.get_output().stdout.is_empty());
}
