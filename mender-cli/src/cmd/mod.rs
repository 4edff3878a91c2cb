pub mod config;
pub mod plan;
pub mod progress;
pub mod run;
pub mod validate;

use std::path::Path;

use mender_core::{parse_plan_str, DocumentFormat, ParseError, ParsedPlan};

use crate::exit_codes;
use crate::output::print_error;
use crate::OutputArgs;

/// Read and parse a plan file; on failure the error is printed and the exit code returned.
pub(crate) fn read_plan(path: &Path, output: &OutputArgs) -> Result<ParsedPlan, i32> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        print_error(
            output.format,
            output.quiet,
            &format!("failed to read {}: {e}", path.display()),
        );
        exit_codes::RUNTIME_ERROR
    })?;

    parse_plan_str(&content, DocumentFormat::Auto).map_err(|e| {
        let message = match e {
            ParseError::Json(e) => format!("JSON parse failed: {e}"),
            ParseError::Yaml(e) => format!("YAML parse failed: {e}"),
            ParseError::UnknownFormat => "input is neither valid JSON nor valid YAML".to_string(),
        };
        print_error(output.format, output.quiet, &message);
        exit_codes::VALIDATION_FAILED
    })
}

pub(crate) fn join_numbers(numbers: &[u32]) -> String {
    numbers
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
