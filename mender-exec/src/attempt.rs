use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use mender_core::Params;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SetupFailureKind {
    NotFound,
    PermissionDenied,
    InvalidPayload,
    Other,
}

/// Why an attempt did not count as a raw success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum AttemptFailure {
    /// The process never ran.
    Setup {
        program: String,
        reason: SetupFailureKind,
        message: String,
    },
    Signature {
        pattern: String,
        line: String,
    },
    ExitCode {
        code: Option<i32>,
    },
    TimedOut {
        after_ms: u64,
    },
    Cancelled,
    ExpectationNotMet {
        pattern: String,
    },
    PreparationFailed {
        package: String,
        exit_code: Option<i32>,
    },
}

impl AttemptFailure {
    pub fn summary(&self) -> String {
        match self {
            AttemptFailure::Setup {
                program, message, ..
            } => format!("could not start `{program}`: {message}"),
            AttemptFailure::Signature { pattern, line } => {
                format!("failure signature `{pattern}` detected: {line}")
            }
            AttemptFailure::ExitCode { code: Some(c) } => format!("exited with code {c}"),
            AttemptFailure::ExitCode { code: None } => "terminated by signal".to_string(),
            AttemptFailure::TimedOut { after_ms } => format!("timed out after {after_ms} ms"),
            AttemptFailure::Cancelled => "cancelled".to_string(),
            AttemptFailure::ExpectationNotMet { pattern } => {
                format!("ran cleanly but expected output `{pattern}` was not found")
            }
            AttemptFailure::PreparationFailed { package, exit_code } => match exit_code {
                Some(c) => format!("installing `{package}` failed with code {c}"),
                None => format!("installing `{package}` failed"),
            },
        }
    }
}

/// Output of the auxiliary install run that precedes the main payload.
#[derive(Debug, Clone, Serialize)]
pub struct PreparationRecord {
    pub package: String,
    pub command: String,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub output: String,
}

/// One execution of a step's payload under one strategy.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionAttempt {
    pub index: u32,
    pub strategy: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    /// Raw execution result, before verification.
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<AttemptFailure>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub params: Params,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preparation: Option<PreparationRecord>,
}

impl ExecutionAttempt {
    pub fn combined_output(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (true, _) => self.stderr.clone(),
            (_, true) => self.stdout.clone(),
            _ => format!("{}\n{}", self.stdout, self.stderr),
        }
    }

    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }

    pub fn is_setup_failure(&self) -> bool {
        matches!(self.failure, Some(AttemptFailure::Setup { .. }))
    }

    pub fn failure_summary(&self) -> Option<String> {
        self.failure.as_ref().map(AttemptFailure::summary)
    }
}
