//! Watches a running payload line by line for failure signatures.

mod signatures;

use chrono::{DateTime, Utc};
use futures_util::stream::{self, Stream};
use mender_core::Params;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::attempt::{AttemptFailure, ExecutionAttempt, OutputStream, PreparationRecord};
use crate::runner::{exit_failure, ActionRunner, Invocation, ProcessExit, RunnerEvent, RunningAction};

pub use signatures::SignatureSet;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Extra regexes treated as failure signatures.
    pub extra_signatures: Vec<String>,
    pub disable_builtin: bool,
}

impl MonitorConfig {
    pub fn signature_set(&self) -> Result<SignatureSet, regex::Error> {
        let base = if self.disable_builtin {
            SignatureSet::empty()
        } else {
            SignatureSet::builtin()
        };
        base.with_patterns(&self.extra_signatures)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignatureMatch {
    pub pattern: String,
    pub line: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoredLine {
    pub stream: OutputStream,
    pub text: String,
    /// Set only on the line that first matched a signature.
    pub signature: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionMonitor {
    runner: ActionRunner,
    signatures: SignatureSet,
}

impl ExecutionMonitor {
    pub fn new(runner: ActionRunner, signatures: SignatureSet) -> Self {
        Self { runner, signatures }
    }

    pub fn runner(&self) -> &ActionRunner {
        &self.runner
    }

    /// Start an attempt. Setup failures come back as an already-finished run.
    pub async fn start(
        &self,
        invocation: &Invocation,
        expected_output: Option<&str>,
        cancel: &CancellationToken,
    ) -> MonitoredRun {
        let mut run = MonitoredRun {
            attempt: invocation.attempt,
            strategy: invocation.strategy.clone(),
            params: invocation.params.clone(),
            started_at: Utc::now(),
            action: None,
            cancel: cancel.clone(),
            signatures: self.signatures.clone(),
            stop_on_signature: invocation.resilience.is_none(),
            expected: expected_output.map(str::to_string),
            stdout: Vec::new(),
            stderr: Vec::new(),
            detected: None,
            exit: None,
            failure: None,
            preparation: None,
        };

        if let Some(prep) = &invocation.preparation {
            info!(package = %prep.package, "running preparation before attempt");
            let record = self.runner.prepare(prep, invocation.timeout, cancel).await;
            let ok = record.success;
            if !ok {
                run.failure = Some(if cancel.is_cancelled() {
                    AttemptFailure::Cancelled
                } else {
                    AttemptFailure::PreparationFailed {
                        package: record.package.clone(),
                        exit_code: record.exit_code,
                    }
                });
            }
            run.preparation = Some(record);
            if !ok {
                return run;
            }
        }

        match self.runner.start(invocation, cancel) {
            Ok(action) => run.action = Some(action),
            Err(err) => {
                debug!(error = %err, "payload could not be started");
                run.failure = Some(err.to_failure(invocation.payload.program()));
            }
        }
        run
    }
}

/// An attempt in flight. Lines are yielded as they arrive; [`MonitoredRun::finish`]
/// waits for the process and assembles the [`ExecutionAttempt`].
pub struct MonitoredRun {
    attempt: u32,
    strategy: String,
    params: Params,
    started_at: DateTime<Utc>,
    action: Option<RunningAction>,
    cancel: CancellationToken,
    signatures: SignatureSet,
    /// Off under a retry wrapper: an inner try may fail and a later one succeed.
    stop_on_signature: bool,
    expected: Option<String>,
    stdout: Vec<String>,
    stderr: Vec<String>,
    detected: Option<SignatureMatch>,
    exit: Option<ProcessExit>,
    failure: Option<AttemptFailure>,
    preparation: Option<PreparationRecord>,
}

impl MonitoredRun {
    /// Next output line, or `None` once the process has finished.
    pub async fn next_line(&mut self) -> Option<MonitoredLine> {
        let action = self.action.as_mut()?;
        match action.next_event().await {
            Some(RunnerEvent::Line(line)) => {
                let signature = if self.detected.is_none() {
                    self.signatures.find(&line.text).map(str::to_string)
                } else {
                    None
                };
                if let Some(pattern) = &signature {
                    info!(pattern = %pattern, line = %line.text, "failure signature detected");
                    self.detected = Some(SignatureMatch {
                        pattern: pattern.clone(),
                        line: line.text.clone(),
                    });
                    if self.stop_on_signature {
                        action.request_stop();
                    }
                }
                match line.stream {
                    OutputStream::Stdout => self.stdout.push(line.text.clone()),
                    OutputStream::Stderr => self.stderr.push(line.text.clone()),
                }
                Some(MonitoredLine {
                    stream: line.stream,
                    text: line.text,
                    signature,
                })
            }
            Some(RunnerEvent::Finished(exit)) => {
                self.exit = Some(exit);
                self.action = None;
                None
            }
            None => {
                self.action = None;
                None
            }
        }
    }

    pub fn lines(&mut self) -> impl Stream<Item = MonitoredLine> + '_ {
        stream::unfold(self, |run| async move {
            let line = run.next_line().await?;
            Some((line, run))
        })
    }

    pub fn detected(&self) -> Option<&SignatureMatch> {
        self.detected.as_ref()
    }

    pub async fn finish(mut self) -> ExecutionAttempt {
        while self.next_line().await.is_some() {}

        let stdout = self.stdout.join("\n");
        let stderr = self.stderr.join("\n");
        let failure = self.failure.take().or_else(|| {
            let from_exit = match self.exit {
                Some(exit) => exit_failure(&exit, self.cancel.is_cancelled()),
                None => Some(AttemptFailure::ExitCode { code: None }),
            };
            if let Some(m) = self.detected.take() {
                // A tolerated signature only explains a non-zero exit.
                if self.stop_on_signature
                    || matches!(from_exit, Some(AttemptFailure::ExitCode { .. }))
                {
                    return Some(AttemptFailure::Signature {
                        pattern: m.pattern,
                        line: m.line,
                    });
                }
            }
            if from_exit.is_some() {
                return from_exit;
            }
            let pattern = self.expected.as_deref()?;
            let combined = format!("{stdout}\n{stderr}");
            let met = Regex::new(pattern).is_ok_and(|re| re.is_match(&combined));
            (!met).then(|| AttemptFailure::ExpectationNotMet {
                pattern: pattern.to_string(),
            })
        });

        ExecutionAttempt {
            index: self.attempt,
            strategy: self.strategy,
            started_at: self.started_at,
            finished_at: Utc::now(),
            stdout,
            stderr,
            exit_code: self.exit.and_then(|e| e.exit_code),
            success: failure.is_none(),
            failure,
            params: self.params,
            preparation: self.preparation,
        }
    }
}
