//! Turns a diagnosis into a concrete change for the next attempt.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use mender_core::expressions::render_str;
use mender_core::{Params, Payload, Step};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::diagnosis::{strip_code_fences, Diagnosis, FixStrategy};
use crate::generator::{CodeGenerator, GenerationContext};
use crate::runner::{Invocation, Resilience};

/// Installers are argv templates; `{$params.package}` and `{$params.interpreter}` are available.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FixConfig {
    /// Keyed by missing program name.
    pub installers: BTreeMap<String, Vec<String>>,
    /// Keyed by interpreter family (`python`, `node`, ...).
    pub package_installers: BTreeMap<String, Vec<String>>,
    pub resilience: Resilience,
}

impl Default for FixConfig {
    fn default() -> Self {
        let argv = |parts: &[&str]| parts.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        let mut package_installers = BTreeMap::new();
        package_installers.insert(
            "python".to_string(),
            argv(&["{$params.interpreter}", "-m", "pip", "install", "{$params.package}"]),
        );
        package_installers.insert("node".to_string(), argv(&["npm", "install", "{$params.package}"]));
        let mut installers = BTreeMap::new();
        for pip in ["pip", "pip3"] {
            installers.insert(pip.to_string(), argv(&["python3", "-m", "ensurepip", "--upgrade"]));
        }
        Self {
            installers,
            package_installers,
            resilience: Resilience::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum FixAction {
    Regenerate { payload: Payload },
    AddRetryLogic { resilience: Resilience },
    InstallDependency { package: String, install: Payload },
    AdjustParameters {
        overrides: Params,
        #[serde(skip_serializing_if = "Option::is_none")]
        timeout: Option<Duration>,
    },
}

impl FixAction {
    pub fn strategy(&self) -> FixStrategy {
        match self {
            FixAction::Regenerate { .. } => FixStrategy::Regenerate,
            FixAction::AddRetryLogic { .. } => FixStrategy::AddRetryLogic,
            FixAction::InstallDependency { .. } => FixStrategy::InstallDependency,
            FixAction::AdjustParameters { .. } => FixStrategy::AdjustParameters,
        }
    }

    pub fn label(&self) -> String {
        format!("fix:{}", self.strategy())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FixOutcome {
    Ready(FixAction),
    /// The diagnosis names a fix that cannot be applied here.
    NotActionable(String),
    /// Needs a human.
    Escalate,
}

/// Per-step memory of fixes already applied.
#[derive(Debug, Clone, Default)]
pub struct FixHistory {
    pub installed: BTreeSet<String>,
    pub regenerations: u32,
}

#[derive(Clone, Default)]
pub struct FixGenerator {
    config: FixConfig,
    generator: Option<Arc<dyn CodeGenerator>>,
}

impl FixGenerator {
    pub fn new(config: FixConfig, generator: Option<Arc<dyn CodeGenerator>>) -> Self {
        Self { config, generator }
    }

    pub fn has_generator(&self) -> bool {
        self.generator.is_some()
    }

    /// Program names with a configured installer.
    pub fn installable(&self) -> BTreeSet<String> {
        self.config.installers.keys().cloned().collect()
    }

    pub async fn generate(
        &self,
        step: &Step,
        current: &Invocation,
        diagnosis: &Diagnosis,
        last_output: &str,
        history: &FixHistory,
    ) -> FixOutcome {
        let outcome = match diagnosis.fix_strategy {
            FixStrategy::Manual => FixOutcome::Escalate,
            FixStrategy::Regenerate => self.regenerate(step, current, diagnosis, last_output).await,
            FixStrategy::AddRetryLogic => self.add_retry_logic(current),
            FixStrategy::InstallDependency => self.install(current, diagnosis, history),
            FixStrategy::AdjustParameters => adjust_parameters(current, diagnosis),
        };
        debug!(step = step.number, strategy = %diagnosis.fix_strategy, outcome = ?outcome_label(&outcome), "fix generated");
        outcome
    }

    async fn regenerate(
        &self,
        step: &Step,
        current: &Invocation,
        diagnosis: &Diagnosis,
        last_output: &str,
    ) -> FixOutcome {
        let Some(generator) = &self.generator else {
            return FixOutcome::NotActionable("no code generator configured".to_string());
        };
        let (previous, interpreter) = match &current.payload {
            Payload::Code {
                source,
                interpreter,
            } => (source.clone(), interpreter.clone()),
            Payload::Command { .. } => (current.payload.describe(), "sh".to_string()),
        };
        let context = GenerationContext {
            step: step.number,
            description: step.description.clone(),
            interpreter: interpreter.clone(),
            attempt: Some(current.attempt),
            previous_payload: Some(previous.clone()),
            error_output: (!last_output.trim().is_empty()).then(|| last_output.to_string()),
            diagnosis: Some(diagnosis.clone()),
        };
        match generator.generate(&context).await {
            Ok(text) => {
                let source = strip_code_fences(&text);
                if source.trim().is_empty() {
                    return FixOutcome::NotActionable("generator returned no code".to_string());
                }
                if source.trim() == previous.trim() {
                    return FixOutcome::NotActionable("generator returned the same payload".to_string());
                }
                FixOutcome::Ready(FixAction::Regenerate {
                    payload: Payload::Code {
                        source,
                        interpreter,
                    },
                })
            }
            Err(err) => FixOutcome::NotActionable(format!("code generation failed: {err}")),
        }
    }

    fn add_retry_logic(&self, current: &Invocation) -> FixOutcome {
        if current.resilience.is_some() {
            return FixOutcome::NotActionable("payload already retries internally".to_string());
        }
        if !cfg!(unix) {
            return FixOutcome::NotActionable("retry wrapper needs a POSIX shell".to_string());
        }
        FixOutcome::Ready(FixAction::AddRetryLogic {
            resilience: self.config.resilience,
        })
    }

    fn install(&self, current: &Invocation, diagnosis: &Diagnosis, history: &FixHistory) -> FixOutcome {
        let Some(package) = diagnosis.dependency.as_deref() else {
            return FixOutcome::NotActionable("diagnosis names no dependency".to_string());
        };
        if history.installed.contains(package) {
            return FixOutcome::NotActionable(format!("`{package}` was already installed once"));
        }

        let interpreter = match &current.payload {
            Payload::Code { interpreter, .. } => interpreter.clone(),
            Payload::Command { argv } => argv.first().cloned().unwrap_or_default(),
        };
        let template = self.config.installers.get(package).or_else(|| {
            let family = interpreter_family(&interpreter);
            self.config
                .package_installers
                .iter()
                .find(|(k, _)| family.starts_with(k.as_str()))
                .map(|(_, v)| v)
        });
        let Some(template) = template else {
            return FixOutcome::NotActionable(format!("no installer known for `{package}`"));
        };

        let mut vars = Params::new();
        vars.insert("package".to_string(), package.to_string());
        vars.insert("interpreter".to_string(), interpreter);
        let argv: Result<Vec<String>, _> = template.iter().map(|a| render_str(a, &vars)).collect();
        match argv {
            Ok(argv) if !argv.is_empty() => FixOutcome::Ready(FixAction::InstallDependency {
                package: package.to_string(),
                install: Payload::Command { argv },
            }),
            Ok(_) => FixOutcome::NotActionable(format!("installer for `{package}` is empty")),
            Err(err) => FixOutcome::NotActionable(format!("installer template for `{package}`: {err}")),
        }
    }
}

fn adjust_parameters(current: &Invocation, diagnosis: &Diagnosis) -> FixOutcome {
    let mut overrides = Params::new();
    let mut timeout = None;
    for (key, value) in &diagnosis.parameters {
        if key == "timeout_seconds" {
            if let Ok(secs) = value.parse::<u64>() {
                let t = Duration::from_secs(secs.max(1));
                if t != current.timeout {
                    timeout = Some(t);
                }
            }
            continue;
        }
        if current.params.get(key) != Some(value) {
            overrides.insert(key.clone(), value.clone());
        }
    }
    if overrides.is_empty() && timeout.is_none() {
        return FixOutcome::NotActionable("no parameter change suggested".to_string());
    }
    FixOutcome::Ready(FixAction::AdjustParameters { overrides, timeout })
}

fn interpreter_family(interpreter: &str) -> String {
    let program = interpreter.split_whitespace().next().unwrap_or(interpreter);
    Path::new(program)
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}

fn outcome_label(outcome: &FixOutcome) -> &str {
    match outcome {
        FixOutcome::Ready(_) => "ready",
        FixOutcome::NotActionable(reason) => reason,
        FixOutcome::Escalate => "escalate",
    }
}
