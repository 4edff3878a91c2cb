use chrono::Utc;
use mender_core::{Effect, Params, Step};
use mender_exec::attempt::ExecutionAttempt;
use mender_exec::verify::{
    DiagnosticsCollector, SideEffectVerifier, VerificationStatus, VerifyConfig,
};

fn quick() -> VerifyConfig {
    VerifyConfig {
        strict: false,
        settle_ms: 50,
        poll_interval_ms: 10,
        ..VerifyConfig::default()
    }
}

fn attempt(stdout: &str) -> ExecutionAttempt {
    ExecutionAttempt {
        index: 1,
        strategy: "original".to_string(),
        started_at: Utc::now(),
        finished_at: Utc::now(),
        stdout: stdout.to_string(),
        stderr: String::new(),
        exit_code: Some(0),
        success: true,
        failure: None,
        params: Params::new(),
        preparation: None,
    }
}

fn step_with(effect: Option<Effect>) -> Step {
    let mut step = Step::new(1, "test step");
    step.command = Some(vec!["true".to_string()]);
    step.effect = effect;
    step
}

fn target(path: &std::path::Path) -> Params {
    let mut params = Params::new();
    params.insert("target_path".to_string(), path.display().to_string());
    params
}

#[tokio::test]
async fn created_file_is_verified() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("report.txt");
    std::fs::write(&path, "total: 3\n").unwrap();

    let step = step_with(Some(Effect::CreateFile {
        path: path.display().to_string(),
        content: Some("total: 3".to_string()),
        alternative_locations: Vec::new(),
    }));
    let result = SideEffectVerifier::new(quick())
        .verify(&step, &target(&path), &attempt(""))
        .await;

    assert_eq!(result.status, VerificationStatus::Verified, "{}", result.message);
    assert_eq!(result.method, "file_check");
}

#[tokio::test]
async fn missing_file_fails_with_diagnostics() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("never").join("written.txt");

    let step = step_with(Some(Effect::CreateFile {
        path: path.display().to_string(),
        content: None,
        alternative_locations: Vec::new(),
    }));
    let result = SideEffectVerifier::new(quick())
        .verify(&step, &target(&path), &attempt(""))
        .await;

    assert_eq!(result.status, VerificationStatus::Failed);
    assert!(result.message.contains("was not created"));
    let perms = result.diagnostics.permissions.expect("permission facts");
    assert!(!perms.target_exists);
    assert_eq!(perms.path, dir.path().display().to_string());
}

#[tokio::test]
async fn effective_target_param_wins_over_declared_path() {
    let dir = tempfile::tempdir().unwrap();
    let moved = dir.path().join("moved.txt");
    std::fs::write(&moved, "x").unwrap();

    let step = step_with(Some(Effect::CreateFile {
        path: dir.path().join("original.txt").display().to_string(),
        content: None,
        alternative_locations: Vec::new(),
    }));
    let result = SideEffectVerifier::new(quick())
        .verify(&step, &target(&moved), &attempt(""))
        .await;

    assert!(result.is_verified(), "{}", result.message);
}

#[tokio::test]
async fn wrong_content_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.txt");
    std::fs::write(&path, "partial").unwrap();

    let step = step_with(Some(Effect::CreateFile {
        path: path.display().to_string(),
        content: Some("complete".to_string()),
        alternative_locations: Vec::new(),
    }));
    let result = SideEffectVerifier::new(quick())
        .verify(&step, &target(&path), &attempt(""))
        .await;

    assert_eq!(result.status, VerificationStatus::Failed);
    assert!(result.message.contains("lacks the expected content"));
}

#[tokio::test]
async fn directory_and_absence_checks() {
    let dir = tempfile::tempdir().unwrap();
    let sub = dir.path().join("data");
    std::fs::create_dir(&sub).unwrap();
    let verifier = SideEffectVerifier::new(quick());

    let created = step_with(Some(Effect::CreateDirectory {
        path: sub.display().to_string(),
        alternative_locations: Vec::new(),
    }));
    assert!(verifier.verify(&created, &target(&sub), &attempt("")).await.is_verified());

    let deleted = step_with(Some(Effect::DeleteFile {
        path: sub.display().to_string(),
    }));
    let still_there = verifier.verify(&deleted, &target(&sub), &attempt("")).await;
    assert_eq!(still_there.status, VerificationStatus::Failed);

    std::fs::remove_dir(&sub).unwrap();
    assert!(verifier.verify(&deleted, &target(&sub), &attempt("")).await.is_verified());
}

#[tokio::test]
async fn output_effect_matches_combined_output() {
    let step = step_with(Some(Effect::Output {
        pattern: r"rows=\d+".to_string(),
    }));
    let verifier = SideEffectVerifier::new(quick());

    let ok = verifier.verify(&step, &Params::new(), &attempt("rows=12")).await;
    assert!(ok.is_verified());
    assert_eq!(ok.method, "output_match");

    let bad = verifier.verify(&step, &Params::new(), &attempt("no rows")).await;
    assert_eq!(bad.status, VerificationStatus::Failed);
    assert!(bad.diagnostics.permissions.is_some());
}

#[tokio::test]
async fn steps_without_effect_are_unverifiable_unless_output_is_expected() {
    let verifier = SideEffectVerifier::new(quick());
    let plain = step_with(None);
    let result = verifier.verify(&plain, &Params::new(), &attempt("hi")).await;
    assert_eq!(result.status, VerificationStatus::Unverifiable);
    assert!(verifier.accepts(&result));

    let strict = SideEffectVerifier::new(VerifyConfig {
        strict: true,
        ..quick()
    });
    assert!(!strict.accepts(&result));

    let mut expecting = step_with(None);
    expecting.expected_output = Some("hi".to_string());
    let result = verifier.verify(&expecting, &Params::new(), &attempt("hi")).await;
    assert!(result.is_verified());
}

#[tokio::test]
async fn typed_text_cannot_be_observed() {
    let step = step_with(Some(Effect::TypeText {
        text: "hello".to_string(),
        methods: Vec::new(),
    }));
    let result = SideEffectVerifier::new(quick())
        .verify(&step, &Params::new(), &attempt(""))
        .await;
    assert_eq!(result.status, VerificationStatus::Unverifiable);
}

#[cfg(unix)]
#[tokio::test]
async fn launched_application_is_found_among_processes() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let app = dir.path().join("mendersleeper");
    std::fs::write(&app, "#!/bin/sh\nsleep 5\n").unwrap();
    std::fs::set_permissions(&app, std::fs::Permissions::from_mode(0o755)).unwrap();
    let mut child = tokio::process::Command::new(&app)
        .kill_on_drop(true)
        .spawn()
        .unwrap();

    let step = step_with(Some(Effect::LaunchApplication {
        application: "mendersleeper".to_string(),
        alternatives: Vec::new(),
    }));
    let verifier = SideEffectVerifier::new(VerifyConfig {
        settle_ms: 3000,
        ..quick()
    });
    let result = verifier.verify(&step, &Params::new(), &attempt("")).await;
    child.kill().await.ok();

    assert!(result.is_verified(), "{}", result.message);
    assert_eq!(result.method, "process_check");
    assert!(result
        .diagnostics
        .processes
        .iter()
        .any(|p| p.name.contains("mendersleeper")));
}

#[tokio::test]
async fn absent_application_fails_with_diagnostics() {
    let step = step_with(Some(Effect::LaunchApplication {
        application: "mender-no-such-application".to_string(),
        alternatives: Vec::new(),
    }));
    let result = SideEffectVerifier::new(quick())
        .verify(&step, &Params::new(), &attempt(""))
        .await;

    assert_eq!(result.status, VerificationStatus::Failed);
    assert_eq!(result.method, "process_check");
    assert!(result.diagnostics.processes.is_empty());
    assert!(result.diagnostics.permissions.is_some());
}

#[tokio::test]
async fn relative_targets_are_checked_against_the_working_directory() {
    let diagnostics = DiagnosticsCollector::default()
        .for_path(std::path::Path::new("mender-never-written.txt"))
        .await;

    let perms = diagnostics.permissions.expect("permission facts");
    assert_eq!(
        perms.path,
        std::env::current_dir().unwrap().display().to_string()
    );
    assert!(!perms.target_exists);
}
