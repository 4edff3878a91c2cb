//! Launches step payloads as child processes and streams their output.
//!
//! Every process gets its own supervisor task that races exit, the step
//! timeout and a stop token; whichever fires first decides the
//! [`Termination`]. Output arrives line by line through a bounded channel and
//! the final [`RunnerEvent::Finished`] is only sent once both pipes have been
//! drained (or the drain window expired).

mod process;
mod script;

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use chrono::Utc;
use mender_core::expressions::TemplateError;
use mender_core::{Params, Payload, DEFAULT_INTERPRETER};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::attempt::{
    AttemptFailure, ExecutionAttempt, OutputLine, OutputStream, PreparationRecord, SetupFailureKind,
};

pub use process::{descendant_pids, terminate_tree};
pub use script::{render_argv, Resilience};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub working_dir: Option<PathBuf>,
    /// Extra environment for every child. A `PATH` entry here also drives program lookup.
    pub env: BTreeMap<String, String>,
    pub default_interpreter: String,
    pub channel_capacity: usize,
    pub drain_timeout_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            working_dir: None,
            env: BTreeMap::new(),
            default_interpreter: DEFAULT_INTERPRETER.to_string(),
            channel_capacity: 256,
            drain_timeout_ms: 500,
        }
    }
}

/// Auxiliary install run executed before the main payload of an attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Preparation {
    pub package: String,
    pub payload: Payload,
}

/// Everything needed to run one attempt of a step.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub attempt: u32,
    pub strategy: String,
    pub payload: Payload,
    pub params: Params,
    pub timeout: Duration,
    pub resilience: Option<Resilience>,
    pub preparation: Option<Preparation>,
}

impl Invocation {
    pub fn new(payload: Payload, params: Params, timeout: Duration) -> Self {
        Self {
            attempt: 1,
            strategy: "original".to_string(),
            payload,
            params,
            timeout,
            resilience: None,
            preparation: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Termination {
    Exited,
    TimedOut,
    /// Stopped through the stop token (failure signature or cancellation).
    Killed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub exit_code: Option<i32>,
    pub termination: Termination,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerEvent {
    Line(OutputLine),
    Finished(ProcessExit),
}

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        kind: SetupFailureKind,
        #[source]
        source: io::Error,
    },
    #[error("failed to render payload: {0}")]
    Template(#[from] TemplateError),
    #[error("failed to write script file: {0}")]
    Script(#[source] io::Error),
    #[error("command payload is empty")]
    EmptyCommand,
}

impl RunnerError {
    /// `program` is reported unless the error names the one that failed to spawn.
    pub fn to_failure(&self, program: &str) -> AttemptFailure {
        let (reason, program) = match self {
            RunnerError::Spawn { kind, program, .. } => (*kind, program.as_str()),
            RunnerError::Template(_) | RunnerError::EmptyCommand => {
                (SetupFailureKind::InvalidPayload, program)
            }
            RunnerError::Script(_) => (SetupFailureKind::Other, program),
        };
        AttemptFailure::Setup {
            program: program.to_string(),
            reason,
            message: self.to_string(),
        }
    }
}

/// A started process. Drive it with [`RunningAction::next_event`] until `Finished`.
pub struct RunningAction {
    events: mpsc::Receiver<RunnerEvent>,
    stop: CancellationToken,
    pid: Option<u32>,
}

impl RunningAction {
    pub async fn next_event(&mut self) -> Option<RunnerEvent> {
        self.events.recv().await
    }

    /// Ask the supervisor to kill the process tree.
    pub fn request_stop(&self) {
        self.stop.cancel();
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

#[derive(Debug, Clone, Default)]
pub struct ActionRunner {
    config: RunnerConfig,
}

impl ActionRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Spawn the invocation's payload. Preparation is not run here.
    ///
    /// `cancel` is the caller's token; the returned action also stops when it fires.
    pub fn start(
        &self,
        invocation: &Invocation,
        cancel: &CancellationToken,
    ) -> Result<RunningAction, RunnerError> {
        let prepared = script::prepare(invocation, &self.config)?;
        let program = prepared.program.clone();

        let mut cmd = Command::new(&prepared.program);
        cmd.args(&prepared.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (k, v) in &self.config.env {
            cmd.env(k, v);
        }
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| RunnerError::Spawn {
            program: program.clone(),
            kind: classify_spawn_error(&source),
            source,
        })?;
        let pid = child.id();
        debug!(program = %program, pid = ?pid, attempt = invocation.attempt, "spawned payload");

        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let mut readers = Vec::with_capacity(2);
        if let Some(out) = child.stdout.take() {
            readers.push(tokio::spawn(forward_lines(out, OutputStream::Stdout, tx.clone())));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(tokio::spawn(forward_lines(err, OutputStream::Stderr, tx.clone())));
        }

        let stop = cancel.child_token();
        tokio::spawn(supervise(Supervision {
            child,
            readers,
            tx,
            stop: stop.clone(),
            timeout: invocation.timeout,
            drain: Duration::from_millis(self.config.drain_timeout_ms),
            script: prepared.script,
        }));

        Ok(RunningAction {
            events: rx,
            stop,
            pid,
        })
    }

    /// Run the payload to completion and capture the whole attempt.
    ///
    /// Used for preparation runs; no failure signatures or expectations apply.
    pub async fn run(&self, invocation: &Invocation, cancel: &CancellationToken) -> ExecutionAttempt {
        let started_at = Utc::now();
        let program = invocation.payload.program().to_string();
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        let mut action = match self.start(invocation, cancel) {
            Ok(action) => action,
            Err(err) => {
                return ExecutionAttempt {
                    index: invocation.attempt,
                    strategy: invocation.strategy.clone(),
                    started_at,
                    finished_at: Utc::now(),
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code: None,
                    success: false,
                    failure: Some(err.to_failure(&program)),
                    params: invocation.params.clone(),
                    preparation: None,
                };
            }
        };

        let mut exit = None;
        while let Some(event) = action.next_event().await {
            match event {
                RunnerEvent::Line(line) => match line.stream {
                    OutputStream::Stdout => stdout.push(line.text),
                    OutputStream::Stderr => stderr.push(line.text),
                },
                RunnerEvent::Finished(e) => {
                    exit = Some(e);
                    break;
                }
            }
        }

        let failure = match exit {
            Some(e) => exit_failure(&e, cancel.is_cancelled()),
            None => Some(AttemptFailure::ExitCode { code: None }),
        };
        ExecutionAttempt {
            index: invocation.attempt,
            strategy: invocation.strategy.clone(),
            started_at,
            finished_at: Utc::now(),
            stdout: stdout.join("\n"),
            stderr: stderr.join("\n"),
            exit_code: exit.and_then(|e| e.exit_code),
            success: failure.is_none(),
            failure,
            params: invocation.params.clone(),
            preparation: None,
        }
    }

    /// Run an install payload ahead of an attempt.
    pub async fn prepare(
        &self,
        preparation: &Preparation,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> PreparationRecord {
        let mut invocation = Invocation::new(preparation.payload.clone(), Params::new(), timeout);
        invocation.strategy = format!("prepare:{}", preparation.package);
        let attempt = self.run(&invocation, cancel).await;
        PreparationRecord {
            package: preparation.package.clone(),
            command: preparation.payload.describe(),
            success: attempt.success,
            exit_code: attempt.exit_code,
            output: attempt.combined_output(),
        }
    }
}

/// Failure implied by how the process ended, ignoring output.
pub(crate) fn exit_failure(exit: &ProcessExit, cancelled: bool) -> Option<AttemptFailure> {
    match exit.termination {
        Termination::TimedOut => Some(AttemptFailure::TimedOut {
            after_ms: exit.elapsed.as_millis() as u64,
        }),
        Termination::Killed if cancelled => Some(AttemptFailure::Cancelled),
        Termination::Killed => Some(AttemptFailure::ExitCode {
            code: exit.exit_code,
        }),
        Termination::Exited if exit.exit_code == Some(0) => None,
        Termination::Exited => Some(AttemptFailure::ExitCode {
            code: exit.exit_code,
        }),
    }
}

fn classify_spawn_error(err: &io::Error) -> SetupFailureKind {
    match err.kind() {
        io::ErrorKind::NotFound => SetupFailureKind::NotFound,
        io::ErrorKind::PermissionDenied => SetupFailureKind::PermissionDenied,
        _ => SetupFailureKind::Other,
    }
}

async fn forward_lines<R>(reader: R, stream: OutputStream, tx: mpsc::Sender<RunnerEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\n', '\r'])
                    .to_string();
                if tx.send(RunnerEvent::Line(OutputLine { stream, text })).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                debug!(?stream, error = %err, "output pipe read failed");
                break;
            }
        }
    }
}

struct Supervision {
    child: Child,
    readers: Vec<JoinHandle<()>>,
    tx: mpsc::Sender<RunnerEvent>,
    stop: CancellationToken,
    timeout: Duration,
    drain: Duration,
    // Held so the script file outlives the process.
    script: Option<tempfile::NamedTempFile>,
}

async fn supervise(s: Supervision) {
    let Supervision {
        mut child,
        readers,
        tx,
        stop,
        timeout,
        drain,
        script,
    } = s;
    let started = Instant::now();

    let (termination, exit_code) = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => (Termination::Exited, status.code()),
            Err(err) => {
                warn!(error = %err, "waiting on child failed");
                (Termination::Exited, None)
            }
        },
        _ = tokio::time::sleep(timeout) => {
            terminate_tree(&mut child).await;
            (Termination::TimedOut, None)
        }
        _ = stop.cancelled() => {
            terminate_tree(&mut child).await;
            (Termination::Killed, None)
        }
    };
    let elapsed = started.elapsed();

    // Orphaned grandchildren may hold the pipes open; never wait on them forever.
    for mut reader in readers {
        if tokio::time::timeout(drain, &mut reader).await.is_err() {
            debug!("output drain window expired");
            reader.abort();
        }
    }
    drop(script);

    let _ = tx
        .send(RunnerEvent::Finished(ProcessExit {
            exit_code,
            termination,
            elapsed,
        }))
        .await;
}
