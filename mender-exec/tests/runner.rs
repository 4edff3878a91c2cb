#![cfg(unix)]

use std::time::{Duration, Instant};

use mender_core::{Params, Payload};
use mender_exec::attempt::{AttemptFailure, SetupFailureKind};
use mender_exec::runner::{
    descendant_pids, render_argv, ActionRunner, Invocation, Preparation, RunnerConfig, RunnerEvent,
    Termination,
};
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};
use tokio_util::sync::CancellationToken;

fn sh(script: &str) -> Payload {
    Payload::Command {
        argv: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
    }
}

fn invocation(payload: Payload) -> Invocation {
    Invocation::new(payload, Params::new(), Duration::from_secs(10))
}

#[tokio::test]
async fn run_captures_both_streams() {
    let runner = ActionRunner::default();
    let attempt = runner
        .run(&invocation(sh("echo out; echo err >&2")), &CancellationToken::new())
        .await;

    assert!(attempt.success);
    assert_eq!(attempt.exit_code, Some(0));
    assert_eq!(attempt.stdout, "out");
    assert_eq!(attempt.stderr, "err");
    assert_eq!(attempt.index, 1);
    assert_eq!(attempt.strategy, "original");
    assert!(attempt.failure.is_none());
}

#[tokio::test]
async fn non_zero_exit_is_a_failure() {
    let attempt = ActionRunner::default()
        .run(&invocation(sh("exit 3")), &CancellationToken::new())
        .await;

    assert!(!attempt.success);
    assert_eq!(attempt.exit_code, Some(3));
    assert_eq!(attempt.failure, Some(AttemptFailure::ExitCode { code: Some(3) }));
}

#[tokio::test]
async fn missing_program_is_a_setup_failure() {
    let payload = Payload::Command {
        argv: vec!["mender-no-such-program-8f3a".to_string()],
    };
    let attempt = ActionRunner::default()
        .run(&invocation(payload), &CancellationToken::new())
        .await;

    assert!(!attempt.success);
    assert!(attempt.is_setup_failure());
    match attempt.failure {
        Some(AttemptFailure::Setup { program, reason, .. }) => {
            assert_eq!(program, "mender-no-such-program-8f3a");
            assert_eq!(reason, SetupFailureKind::NotFound);
        }
        other => panic!("unexpected failure: {other:?}"),
    }
}

#[tokio::test]
async fn timeout_kills_the_process() {
    let mut inv = invocation(sh("sleep 5"));
    inv.timeout = Duration::from_millis(200);

    let started = Instant::now();
    let attempt = ActionRunner::default().run(&inv, &CancellationToken::new()).await;

    assert!(started.elapsed() < Duration::from_secs(4));
    assert!(matches!(attempt.failure, Some(AttemptFailure::TimedOut { .. })));
}

#[tokio::test]
async fn cancellation_stops_the_process() {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let attempt = ActionRunner::default().run(&invocation(sh("sleep 5")), &cancel).await;

    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(attempt.failure, Some(AttemptFailure::Cancelled));
}

fn is_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system
        .process(pid)
        .is_some_and(|p| p.status() != ProcessStatus::Zombie)
}

#[tokio::test]
async fn timeout_kills_background_descendants() {
    let mut inv = invocation(sh("sleep 30 & echo $!; wait"));
    inv.timeout = Duration::from_millis(500);
    let mut action = ActionRunner::default()
        .start(&inv, &CancellationToken::new())
        .unwrap();
    let root = action.pid().expect("child pid");

    let grandchild: u32 = match action.next_event().await {
        Some(RunnerEvent::Line(line)) => line.text.trim().parse().expect("pid line"),
        other => panic!("unexpected event: {other:?}"),
    };
    assert!(descendant_pids(root).contains(&grandchild));

    let exit = loop {
        match action.next_event().await {
            Some(RunnerEvent::Finished(exit)) => break exit,
            Some(RunnerEvent::Line(_)) => {}
            None => panic!("runner closed without finishing"),
        }
    };
    assert_eq!(exit.termination, Termination::TimedOut);

    let deadline = Instant::now() + Duration::from_secs(3);
    while is_alive(grandchild) && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(!is_alive(grandchild), "pid {grandchild} survived the timeout");
}

#[tokio::test]
async fn code_payload_is_rendered_with_params() {
    let payload = Payload::Code {
        source: "echo hello {$params.name}".to_string(),
        interpreter: "sh".to_string(),
    };
    let mut params = Params::new();
    params.insert("name".to_string(), "world".to_string());
    let inv = Invocation::new(payload, params, Duration::from_secs(10));

    let attempt = ActionRunner::default().run(&inv, &CancellationToken::new()).await;

    assert!(attempt.success, "{attempt:?}");
    assert_eq!(attempt.stdout, "hello world");
    assert_eq!(attempt.params.get("name").map(String::as_str), Some("world"));
}

#[tokio::test]
async fn unknown_template_param_is_an_invalid_payload() {
    let payload = Payload::Command {
        argv: vec!["echo".to_string(), "{$params.missing}".to_string()],
    };
    let attempt = ActionRunner::default()
        .run(&invocation(payload), &CancellationToken::new())
        .await;

    assert!(matches!(
        attempt.failure,
        Some(AttemptFailure::Setup {
            reason: SetupFailureKind::InvalidPayload,
            ..
        })
    ));
}

#[tokio::test]
async fn configured_env_reaches_the_child() {
    let mut config = RunnerConfig::default();
    config
        .env
        .insert("MENDER_TEST_VALUE".to_string(), "from-config".to_string());
    let attempt = ActionRunner::new(config)
        .run(&invocation(sh("echo $MENDER_TEST_VALUE")), &CancellationToken::new())
        .await;

    assert_eq!(attempt.stdout, "from-config");
}

#[tokio::test]
async fn preparation_reports_its_outcome() {
    let runner = ActionRunner::default();
    let ok = runner
        .prepare(
            &Preparation {
                package: "demo".to_string(),
                payload: sh("echo installing demo"),
            },
            Duration::from_secs(10),
            &CancellationToken::new(),
        )
        .await;
    assert!(ok.success);
    assert_eq!(ok.package, "demo");
    assert!(ok.output.contains("installing demo"));

    let failed = runner
        .prepare(
            &Preparation {
                package: "demo".to_string(),
                payload: sh("exit 7"),
            },
            Duration::from_secs(10),
            &CancellationToken::new(),
        )
        .await;
    assert!(!failed.success);
    assert_eq!(failed.exit_code, Some(7));
}

#[test]
fn render_argv_substitutes_each_argument() {
    let mut params = Params::new();
    params.insert("target_path".to_string(), "/tmp/x.txt".to_string());
    let argv = vec!["touch".to_string(), "{$params.target_path}".to_string()];
    assert_eq!(
        render_argv(&argv, &params).unwrap(),
        vec!["touch".to_string(), "/tmp/x.txt".to_string()]
    );
}
