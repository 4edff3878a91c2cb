use std::io::Write;
use std::path::Path;

use mender_core::expressions::{render_str, TemplateError};
use mender_core::{Params, Payload};
use serde::{Deserialize, Serialize};

use crate::runner::{Invocation, RunnerConfig, RunnerError};

/// In-process retry loop wrapped around a payload by the add-retry-logic fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resilience {
    pub attempts: u32,
    pub delay_ms: u64,
}

impl Default for Resilience {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay_ms: 1000,
        }
    }
}

const RETRY_WRAPPER: &str = r#"n=$1; d=$2; shift 2; i=1
while :; do
  "$@" && exit 0
  s=$?
  [ "$i" -ge "$n" ] && exit "$s"
  echo "attempt $i failed with status $s, retrying" >&2
  i=$((i+1))
  sleep "$d"
done"#;

pub(crate) struct PreparedCommand {
    pub program: String,
    pub args: Vec<String>,
    pub script: Option<tempfile::NamedTempFile>,
}

pub fn render_argv(argv: &[String], params: &Params) -> Result<Vec<String>, TemplateError> {
    argv.iter().map(|a| render_str(a, params)).collect()
}

pub(crate) fn prepare(
    invocation: &Invocation,
    config: &RunnerConfig,
) -> Result<PreparedCommand, RunnerError> {
    let mut prepared = match &invocation.payload {
        Payload::Command { argv } => {
            let mut argv = render_argv(argv, &invocation.params)?.into_iter();
            let program = argv.next().ok_or(RunnerError::EmptyCommand)?;
            PreparedCommand {
                program,
                args: argv.collect(),
                script: None,
            }
        }
        Payload::Code {
            source,
            interpreter,
        } => {
            let rendered = render_str(source, &invocation.params)?;
            let interpreter = if interpreter.trim().is_empty() {
                config.default_interpreter.as_str()
            } else {
                interpreter.as_str()
            };
            let mut parts = interpreter.split_whitespace().map(str::to_string);
            let program = parts.next().ok_or(RunnerError::EmptyCommand)?;
            let file = write_script(&rendered, script_extension(&program))?;
            let mut args: Vec<String> = parts.collect();
            args.push(file.path().to_string_lossy().into_owned());
            PreparedCommand {
                program,
                args,
                script: Some(file),
            }
        }
    };

    if let Some(resilience) = invocation.resilience {
        prepared = wrap_with_retries(prepared, resilience);
    }
    Ok(prepared)
}

fn wrap_with_retries(inner: PreparedCommand, resilience: Resilience) -> PreparedCommand {
    let delay = format!("{}.{:03}", resilience.delay_ms / 1000, resilience.delay_ms % 1000);
    let mut args = vec![
        "-c".to_string(),
        RETRY_WRAPPER.to_string(),
        "mender-retry".to_string(),
        resilience.attempts.max(1).to_string(),
        delay,
        inner.program,
    ];
    args.extend(inner.args);
    PreparedCommand {
        program: "sh".to_string(),
        args,
        script: inner.script,
    }
}

fn write_script(source: &str, extension: &str) -> Result<tempfile::NamedTempFile, RunnerError> {
    let mut file = tempfile::Builder::new()
        .prefix("mender-step-")
        .suffix(extension)
        .tempfile()
        .map_err(RunnerError::Script)?;
    file.write_all(source.as_bytes()).map_err(RunnerError::Script)?;
    file.flush().map_err(RunnerError::Script)?;
    Ok(file)
}

fn script_extension(program: &str) -> &'static str {
    let name = Path::new(program)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(program)
        .to_ascii_lowercase();
    match name.trim_end_matches(|c: char| c.is_ascii_digit() || c == '.') {
        "python" | "py" => ".py",
        "node" | "nodejs" | "deno" => ".js",
        "ruby" => ".rb",
        "perl" => ".pl",
        "sh" | "bash" | "zsh" | "dash" => ".sh",
        "pwsh" | "powershell" => ".ps1",
        _ => "",
    }
}
