use std::path::Path;

use mender_core::{plan_document, ExecutionPlan, PlanningOutcome};

use crate::cmd::join_numbers;
use crate::exit_codes;
use crate::output::{print_error, OutputFormat};
use crate::OutputArgs;

pub fn plan_cmd(path: &Path, output: OutputArgs) -> i32 {
    let parsed = match super::read_plan(path, &output) {
        Ok(p) => p,
        Err(code) => return code,
    };

    let outcome = match plan_document(&parsed.document) {
        Ok(o) => o,
        Err(e) => {
            print_error(output.format, output.quiet, &format!("{e}"));
            return exit_codes::VALIDATION_FAILED;
        }
    };

    if output.quiet {
        return validation_code(&outcome);
    }
    match output.format {
        OutputFormat::Json => print_json(&outcome),
        OutputFormat::Text => print_text(&outcome),
        OutputFormat::Dot => print_dot(&outcome),
    }
}

fn validation_code(outcome: &PlanningOutcome) -> i32 {
    if outcome.validation.is_valid {
        exit_codes::SUCCESS
    } else {
        exit_codes::VALIDATION_FAILED
    }
}

fn print_json(outcome: &PlanningOutcome) -> i32 {
    match serde_json::to_string_pretty(outcome) {
        Ok(s) => {
            println!("{s}");
            validation_code(outcome)
        }
        Err(e) => {
            eprintln!("error: failed to serialize plan as JSON: {e}");
            exit_codes::RUNTIME_ERROR
        }
    }
}

fn print_text(outcome: &PlanningOutcome) -> i32 {
    let Some(plan) = valid_plan(outcome) else {
        println!("validation: invalid");
        println!("errors: {}", outcome.validation.errors.len());
        for e in &outcome.validation.errors {
            println!("- {e}");
        }
        return exit_codes::VALIDATION_FAILED;
    };

    println!("plan: {}", plan.name);
    println!("validation: valid");

    println!("\nexecution levels:");
    for (idx, level) in plan.graph.levels.iter().enumerate() {
        if !level.is_empty() {
            println!("  Level {idx}: {}", join_numbers(level));
        }
    }
    println!("\norder: {}", join_numbers(&plan.graph.topo_order));

    println!("\nsteps:");
    for step in &plan.steps {
        println!("- {}: {}", step.number, step.description);
        if !step.depends_on.is_empty() {
            println!("  depends on: {}", join_numbers(&step.depends_on));
        }
        match step.payload() {
            Some(payload) => println!("  payload: {}", payload.describe()),
            None if step.informational => println!("  payload: none (informational)"),
            None => println!("  payload: none (generated at run time)"),
        }
        if let Some(effect) = &step.effect {
            println!("  effect: {} ({})", effect.kind(), effect.category().as_str());
        }
        println!(
            "  retries: {}, timeout: {}s",
            step.max_retries, step.timeout_seconds
        );
    }
    exit_codes::SUCCESS
}

fn print_dot(outcome: &PlanningOutcome) -> i32 {
    let Some(plan) = valid_plan(outcome) else {
        eprintln!("error: cannot render DOT for an invalid plan");
        for e in &outcome.validation.errors {
            eprintln!("- {e}");
        }
        return exit_codes::VALIDATION_FAILED;
    };
    print!("{}", plan.graph.to_dot(&plan.name));
    exit_codes::SUCCESS
}

fn valid_plan(outcome: &PlanningOutcome) -> Option<&ExecutionPlan> {
    outcome
        .plan
        .as_ref()
        .filter(|_| outcome.validation.is_valid)
}
