#![cfg(unix)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use mender_core::{Effect, PlanDocument, Step, StepStatus};
use mender_exec::executor::{
    ChannelEventSink, EngineConfig, Event, ExecutionError, ExecutionReport, Orchestrator,
};
use mender_exec::generator::{FnGenerator, GenerationContext, GeneratorError};
use mender_exec::retry::StopReason;
use mender_exec::runner::Resilience;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.retry.base_delay_ms = 10;
    config.retry.max_delay_ms = 50;
    config.verify.settle_ms = 100;
    config.verify.poll_interval_ms = 20;
    config
}

fn command_step(number: u32, argv: &[&str]) -> Step {
    let mut step = Step::new(number, format!("step {number}"));
    step.command = Some(argv.iter().map(|s| s.to_string()).collect());
    step
}

fn shell_step(number: u32, script: &str) -> Step {
    let mut step = Step::new(number, format!("step {number}"));
    step.code = Some(script.to_string());
    step.interpreter = Some("sh".to_string());
    step
}

async fn run(
    config: EngineConfig,
    steps: Vec<Step>,
) -> (ExecutionReport, UnboundedReceiver<Event>) {
    let (sink, rx) = ChannelEventSink::channel();
    let orchestrator = Orchestrator::builder(config)
        .event_sink(Arc::new(sink))
        .build()
        .expect("valid config");
    let report = orchestrator
        .execute(&PlanDocument::from_steps(steps), CancellationToken::new())
        .await
        .expect("plan accepted");
    (report, rx)
}

fn drain(rx: &mut UnboundedReceiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn status(report: &ExecutionReport, number: u32) -> StepStatus {
    report.step(number).expect("step reported").status
}

#[tokio::test]
async fn missing_tool_is_installed_before_the_retry() {
    let dir = tempfile::tempdir().unwrap();
    let bin = dir.path().join("bin");
    std::fs::create_dir(&bin).unwrap();
    let source = dir.path().join("fakepm.src");
    std::fs::write(&source, "#!/bin/sh\necho installed\n").unwrap();
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&source, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    let mut config = fast_config();
    let path = format!("{}:{}", bin.display(), std::env::var("PATH").unwrap_or_default());
    config.runner.env.insert("PATH".to_string(), path);
    config.fixes.installers.insert(
        "fakepm".to_string(),
        vec![
            "cp".to_string(),
            "-p".to_string(),
            source.display().to_string(),
            bin.join("fakepm").display().to_string(),
        ],
    );

    let mut step = command_step(1, &["fakepm", "install", "x"]);
    step.expected_output = Some("installed".to_string());
    let (report, _rx) = run(config, vec![step]).await;

    let step = report.step(1).unwrap();
    assert_eq!(step.status, StepStatus::Completed, "{:#?}", step);
    assert_eq!(step.strategies(), vec!["original", "fix:install-dependency"]);
    let preparation = step.attempts[1]
        .attempt
        .preparation
        .as_ref()
        .expect("install ran before attempt 2");
    assert_eq!(preparation.package, "fakepm");
    assert!(preparation.success);
    assert!(step.recommendations[0].starts_with("succeeded after 2 attempts"));
}

#[tokio::test]
async fn unverified_file_moves_to_an_alternative_location() {
    let dir = tempfile::tempdir().unwrap();
    let protected = dir.path().join("protected");
    let alt = dir.path().join("alt");
    std::fs::create_dir(&protected).unwrap();
    std::fs::create_dir(&alt).unwrap();

    let mut step = command_step(
        1,
        &[
            "sh",
            "-c",
            r#"case "$1" in *protected*) exit 0;; *) echo done > "$1";; esac"#,
            "sh",
            "{$params.target_path}",
        ],
    );
    step.effect = Some(Effect::CreateFile {
        path: protected.join("out.txt").display().to_string(),
        content: None,
        alternative_locations: vec![alt.display().to_string()],
    });
    let (report, _rx) = run(fast_config(), vec![step]).await;

    let step = report.step(1).unwrap();
    let expected = alt.join("out.txt");
    assert_eq!(step.status, StepStatus::Completed, "{:#?}", step);
    assert_eq!(step.strategies(), vec!["original", "alt_path_alt"]);
    assert_eq!(step.effective_target.as_deref(), Some(expected.to_str().unwrap()));
    assert!(expected.exists());
    assert!(!protected.join("out.txt").exists());
}

#[tokio::test]
async fn failed_branch_skips_only_its_dependents() {
    let mut s3 = command_step(3, &["true"]);
    s3.depends_on = vec![1];
    let mut s4 = command_step(4, &["true"]);
    s4.depends_on = vec![2, 3];
    let steps = vec![
        command_step(1, &["true"]),
        command_step(2, &["mender-test-no-such-program"]),
        s3,
        s4,
        command_step(5, &["true"]),
    ];
    let (report, mut rx) = run(fast_config(), steps).await;

    assert_eq!(status(&report, 1), StepStatus::Completed);
    assert_eq!(status(&report, 2), StepStatus::Failed);
    assert_eq!(status(&report, 3), StepStatus::Completed);
    assert_eq!(status(&report, 4), StepStatus::Skipped);
    assert_eq!(status(&report, 5), StepStatus::Completed);
    assert_eq!(report.summary.completed, 3);
    assert_eq!(report.summary.failed, 1);
    assert_eq!(report.summary.skipped, 1);
    assert_eq!(report.summary.permanently_failed, vec![2]);
    assert_eq!(report.summary.escalated, vec![2]);
    assert!(!report.is_success());

    let skipped = report.step(4).unwrap();
    assert_eq!(skipped.message, "dependency 2 failed");
    assert!(skipped.attempts.is_empty());

    let events = drain(&mut rx);
    assert_eq!(events.first().map(Event::event_type), Some("run.started"));
    assert_eq!(events.last().map(Event::event_type), Some("run.finished"));
    assert!(events.iter().any(|e| e.event_type() == "diagnosis.ready" && e.step() == Some(2)));
    assert!(!events.iter().any(|e| e.event_type() == "step.started" && e.step() == Some(4)));
}

#[tokio::test]
async fn absent_application_is_not_retried() {
    let mut step = command_step(1, &["{$params.application}"]);
    step.max_retries = 2;
    step.effect = Some(Effect::LaunchApplication {
        application: "mender-test-absent-app".to_string(),
        alternatives: Vec::new(),
    });
    let (report, _rx) = run(fast_config(), vec![step]).await;

    let step = report.step(1).unwrap();
    assert_eq!(step.status, StepStatus::Failed);
    assert_eq!(step.attempts_used(), 1);
    assert_eq!(step.stop_reason, Some(StopReason::Permanent));
    assert!(
        step.recommendations
            .iter()
            .any(|r| r.contains("is installed and on PATH")),
        "{:?}",
        step.recommendations
    );
}

#[tokio::test]
async fn invalid_plan_runs_nothing() {
    let mut step = command_step(3, &["true"]);
    step.depends_on = vec![5];
    let (sink, mut rx) = ChannelEventSink::channel();
    let orchestrator = Orchestrator::builder(fast_config())
        .event_sink(Arc::new(sink))
        .build()
        .unwrap();

    let err = orchestrator
        .execute(
            &PlanDocument::from_steps(vec![command_step(1, &["true"]), step]),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutionError::Plan(_)), "{err}");
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn cancellation_stops_the_run() {
    let mut dependent = command_step(2, &["true"]);
    dependent.depends_on = vec![1];
    let steps = vec![command_step(1, &["sleep", "5"]), dependent];

    let orchestrator = Orchestrator::new(fast_config()).unwrap();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let report = orchestrator
        .execute(&PlanDocument::from_steps(steps), cancel)
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(4));
    assert!(report.cancelled);
    let first = report.step(1).unwrap();
    assert_eq!(first.status, StepStatus::Failed);
    assert_eq!(first.stop_reason, Some(StopReason::Cancelled));
    assert_eq!(status(&report, 2), StepStatus::Skipped);
}

#[tokio::test]
async fn payload_policy_for_steps_without_payload() {
    let mut informational = Step::new(1, "read the instructions");
    informational.informational = true;
    let empty = Step::new(2, "do something unspecified");
    let (report, _rx) = run(fast_config(), vec![informational, empty]).await;

    let info = report.step(1).unwrap();
    assert_eq!(info.status, StepStatus::Completed);
    assert!(info.attempts.is_empty());
    let empty = report.step(2).unwrap();
    assert_eq!(empty.status, StepStatus::Failed);
    assert_eq!(empty.stop_reason, Some(StopReason::NoPayload));
    assert!(empty.attempts.is_empty());
    assert_eq!(empty.last_diagnosis().map(|d| d.error_kind.as_str()), Some("NoPayload"));
}

#[tokio::test]
async fn generator_fills_in_a_missing_payload() {
    let mut step = Step::new(1, "print a greeting");
    step.expected_output = Some("hello".to_string());
    let generator = FnGenerator(|ctx: &GenerationContext| -> Result<String, GeneratorError> {
        assert_eq!(ctx.interpreter, "sh");
        Ok("```sh\necho hello\n```".to_string())
    });
    let mut config = fast_config();
    config.runner.default_interpreter = "sh".to_string();
    let orchestrator = Orchestrator::builder(config)
        .generator(Arc::new(generator))
        .build()
        .unwrap();

    let report = orchestrator
        .execute(&PlanDocument::from_steps(vec![step]), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(status(&report, 1), StepStatus::Completed);
    assert_eq!(report.step(1).unwrap().attempts_used(), 1);
}

#[tokio::test]
async fn lanes_run_independent_steps_together() {
    let mut config = fast_config();
    config.lanes = 2;
    let steps = vec![
        command_step(1, &["sleep", "1"]),
        command_step(2, &["sleep", "1"]),
    ];
    let started = Instant::now();
    let (report, _rx) = run(config, steps).await;

    assert!(report.is_success());
    assert!(started.elapsed() < Duration::from_millis(1900));
}

#[tokio::test]
async fn transient_failure_exhausts_attempts() {
    let mut config = fast_config();
    config.fixes.resilience = Resilience {
        attempts: 2,
        delay_ms: 0,
    };
    let mut step = shell_step(1, "echo 'connection refused' >&2\nexit 1\n");
    step.max_retries = 2;
    let (report, mut rx) = run(config, vec![step]).await;

    let step = report.step(1).unwrap();
    assert_eq!(step.status, StepStatus::Failed);
    assert_eq!(step.stop_reason, Some(StopReason::AttemptsExhausted));
    assert_eq!(
        step.strategies(),
        vec!["original", "fix:add-retry-logic", "fix:add-retry-logic"]
    );
    assert!(step.attempts[1].attempt.stderr.contains("retrying"));

    let events = drain(&mut rx);
    let output_lines = events
        .iter()
        .filter(|e| e.event_type() == "attempt.output")
        .count();
    assert!(output_lines >= 3);
    let retries = events
        .iter()
        .filter(|e| e.event_type() == "step.retry_scheduled")
        .count();
    assert_eq!(retries, 2);
}

#[tokio::test]
async fn configured_interpreter_runs_code_without_one() {
    let mut config = fast_config();
    config.runner.default_interpreter = "sh".to_string();
    let mut step = Step::new(1, "print a greeting");
    step.code = Some("echo hi".to_string());
    step.expected_output = Some("hi".to_string());

    let (report, _rx) = run(config, vec![step]).await;

    let step = report.step(1).unwrap();
    assert_eq!(step.status, StepStatus::Completed, "{:#?}", step);
    assert_eq!(step.attempts_used(), 1);
    assert_eq!(step.attempts[0].attempt.stdout, "hi");
}

#[tokio::test]
async fn retry_logic_fix_recovers_a_flaky_step() {
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("count");
    let mut config = fast_config();
    config.fixes.resilience = Resilience {
        attempts: 3,
        delay_ms: 0,
    };
    let script = format!(
        "n=$(cat {c} 2>/dev/null || echo 0); n=$((n+1)); echo $n > {c}\n\
         if [ $n -lt 3 ]; then echo 'ConnectionResetError: connection reset by peer' >&2; exit 1; fi\n\
         echo ok\n",
        c = counter.display()
    );
    let (report, _rx) = run(config, vec![shell_step(1, &script)]).await;

    let step = report.step(1).unwrap();
    assert_eq!(step.status, StepStatus::Completed, "{:#?}", step);
    assert_eq!(step.strategies(), vec!["original", "fix:add-retry-logic"]);
    let wrapped = &step.attempts[1].attempt;
    assert_eq!(wrapped.stdout, "ok");
    assert!(wrapped.stderr.contains("retrying"));
    assert_eq!(std::fs::read_to_string(&counter).unwrap().trim(), "3");
}

#[tokio::test]
async fn deterministic_step_repeats_the_same_observations() {
    let mut config = fast_config();
    config.fixes.resilience = Resilience {
        attempts: 1,
        delay_ms: 0,
    };
    let mut step = shell_step(1, "echo same-output\necho 'connection refused' >&2\nexit 1\n");
    step.max_retries = 2;
    let (report, _rx) = run(config, vec![step]).await;

    let step = report.step(1).unwrap();
    assert_eq!(step.attempts_used(), 3);
    let first = &step.attempts[0];
    for record in &step.attempts[1..] {
        assert_eq!(record.attempt.stdout, first.attempt.stdout);
        assert_eq!(record.attempt.stderr, first.attempt.stderr);
        assert_eq!(record.attempt.exit_code, first.attempt.exit_code);
        assert_eq!(record.attempt.failure, first.attempt.failure);
        assert_eq!(
            record.verification.as_ref().map(|v| v.status),
            first.verification.as_ref().map(|v| v.status)
        );
    }
    assert_eq!(first.attempt.stdout, "same-output");
}

#[test]
fn zero_lanes_is_rejected() {
    let config = EngineConfig {
        lanes: 0,
        ..EngineConfig::default()
    };
    assert!(Orchestrator::new(config).is_err());
}

