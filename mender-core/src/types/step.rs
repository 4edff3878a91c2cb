use std::collections::BTreeMap;
use std::fmt;

use crate::expressions::TemplateError;
use crate::types::Effect;

pub type StepNumber = u32;

/// String parameters substituted into payload templates (`{$params.name}`).
pub type Params = BTreeMap<String, String>;

pub const DEFAULT_INTERPRETER: &str = "python3";
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_timeout_seconds() -> u64 {
    DEFAULT_TIMEOUT_SECONDS
}

fn is_false(v: &bool) -> bool {
    !*v
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Step {
    pub number: StepNumber,

    pub description: String,

    /// Source text run through `interpreter`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpreter: Option<String>,

    /// argv list, run without a shell.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,

    #[serde(default, alias = "dependencies", skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<StepNumber>,

    /// Regex that must appear in the output for an attempt to count as successful.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_output: Option<String>,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: Params,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect: Option<Effect>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub informational: bool,

    #[serde(default)]
    pub status: StepStatus,
}

impl Step {
    pub fn new(number: StepNumber, description: impl Into<String>) -> Self {
        Self {
            number,
            description: description.into(),
            code: None,
            interpreter: None,
            command: None,
            depends_on: Vec::new(),
            expected_output: None,
            max_retries: DEFAULT_MAX_RETRIES,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            params: Params::new(),
            effect: None,
            informational: false,
            status: StepStatus::Pending,
        }
    }

    /// The executable payload; code without an interpreter gets [`DEFAULT_INTERPRETER`].
    pub fn payload(&self) -> Option<Payload> {
        self.payload_with(DEFAULT_INTERPRETER)
    }

    /// Like [`Step::payload`], with `default_interpreter` for code that names none.
    pub fn payload_with(&self, default_interpreter: &str) -> Option<Payload> {
        if let Some(argv) = &self.command {
            if !argv.is_empty() {
                return Some(Payload::Command { argv: argv.clone() });
            }
        }
        let source = self.code.as_ref().filter(|c| !c.trim().is_empty())?;
        Some(Payload::Code {
            source: source.clone(),
            interpreter: self
                .interpreter
                .clone()
                .unwrap_or_else(|| default_interpreter.to_string()),
        })
    }

    /// Step params merged with the effect's built-in params; explicit params win.
    pub fn resolved_params(&self) -> Result<Params, TemplateError> {
        let mut params = self.params.clone();
        if let Some(effect) = &self.effect {
            for (k, v) in effect.render(&self.params)?.builtin_params() {
                params.entry(k).or_insert(v);
            }
        }
        Ok(params)
    }

    /// Upper bound on attempts: the first run plus `max_retries`.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn transition(&mut self, next: StepStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                step: self.number,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    Code { source: String, interpreter: String },
    Command { argv: Vec<String> },
}

impl Payload {
    /// The program that has to exist for this payload to start.
    pub fn program(&self) -> &str {
        match self {
            Payload::Code { interpreter, .. } => interpreter,
            Payload::Command { argv } => argv.first().map(String::as_str).unwrap_or(""),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Payload::Code { source, interpreter } => {
                let first = source.lines().next().unwrap_or("").trim();
                format!("{interpreter} script ({first})")
            }
            Payload::Command { argv } => argv.join(" "),
        }
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn can_transition_to(self, next: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Skipped)
                | (Running, Completed)
                | (Running, Failed)
                | (Failed, Running)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("step {step}: invalid status transition {from} -> {to}")]
pub struct InvalidTransition {
    pub step: StepNumber,
    pub from: StepStatus,
    pub to: StepStatus,
}
