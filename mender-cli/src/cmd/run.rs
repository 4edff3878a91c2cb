use std::path::Path;
use std::sync::Arc;

use mender_core::{build_plan, PlanError, StepStatus};
use mender_exec::executor::{EventSink, NoOpEventSink, StdoutEventSink};
use mender_exec::{ExecutionReport, Orchestrator};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::cmd::progress::ProgressEventSink;
use crate::cmd::join_numbers;
use crate::exit_codes;
use crate::output::{print_error, print_result, OutputFormat};
use crate::{EngineArgs, GeneratorArgs, OutputArgs};

pub async fn run_cmd(
    path: &Path,
    report_path: Option<&Path>,
    engine: EngineArgs,
    generator: GeneratorArgs,
    output: OutputArgs,
    verbose: bool,
) -> i32 {
    if output.format == OutputFormat::Dot {
        print_error(output.format, output.quiet, "dot output is only available for `mender plan`");
        return exit_codes::RUNTIME_ERROR;
    }

    let parsed = match super::read_plan(path, &output) {
        Ok(p) => p,
        Err(code) => return code,
    };
    let plan = match build_plan(&parsed.document) {
        Ok(plan) => plan,
        Err(PlanError::Validation(err)) => {
            print_error(output.format, output.quiet, "validation failed");
            if !output.quiet {
                for e in err.messages() {
                    eprintln!("- {e}");
                }
            }
            return exit_codes::VALIDATION_FAILED;
        }
        Err(e) => {
            print_error(output.format, output.quiet, &e.to_string());
            return exit_codes::VALIDATION_FAILED;
        }
    };

    let config = match super::config::build_engine_config(&engine, &generator) {
        Ok(c) => c,
        Err(e) => {
            print_error(output.format, output.quiet, &e);
            return exit_codes::RUNTIME_ERROR;
        }
    };

    let sink: Arc<dyn EventSink> = match (output.quiet, output.format) {
        (true, _) => Arc::new(NoOpEventSink),
        (false, OutputFormat::Json) => Arc::new(StdoutEventSink),
        (false, _) => Arc::new(ProgressEventSink::new(plan.steps.len(), verbose)),
    };
    let orchestrator = match Orchestrator::builder(config).event_sink(sink).build() {
        Ok(o) => o,
        Err(e) => {
            print_error(output.format, output.quiet, &e.to_string());
            return exit_codes::RUNTIME_ERROR;
        }
    };

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        let quiet = output.quiet;
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                if !quiet {
                    eprintln!("interrupted, cancelling the run");
                }
                cancel.cancel();
            }
        })
    };
    let report = orchestrator.execute_plan(&plan, cancel).await;
    interrupt.abort();

    if let Some(report_path) = report_path {
        if let Err(e) = write_report(report_path, &report) {
            print_error(output.format, output.quiet, &e);
            return exit_codes::RUNTIME_ERROR;
        }
    }

    if !output.quiet {
        match output.format {
            OutputFormat::Json => print_result(output.format, false, &report),
            _ => print_text(&report),
        }
    }

    if report.is_success() {
        exit_codes::SUCCESS
    } else {
        exit_codes::RUN_FAILED
    }
}

fn write_report(path: &Path, report: &ExecutionReport) -> Result<(), String> {
    let json = serde_json::to_string_pretty(report)
        .map_err(|e| format!("failed to serialize report: {e}"))?;
    std::fs::write(path, json).map_err(|e| {
        warn!(path = %path.display(), error = %e, "report not written");
        format!("failed to write report {}: {e}", path.display())
    })
}

fn print_text(report: &ExecutionReport) {
    let summary = &report.summary;
    println!(
        "run {} {}: {} completed, {} failed, {} skipped (of {})",
        report.run_id,
        if report.cancelled { "cancelled" } else { "finished" },
        summary.completed,
        summary.failed,
        summary.skipped,
        summary.total
    );
    for step in &report.steps {
        let label = match step.status {
            StepStatus::Completed => "ok",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
            StepStatus::Pending | StepStatus::Running => "pending",
        };
        println!(
            "  [{label}] {}: {} ({} attempt(s))",
            step.number,
            step.description,
            step.attempts_used()
        );
        if step.status != StepStatus::Completed && !step.message.is_empty() {
            match step.stop_reason {
                Some(reason) => println!("      {} ({reason})", step.message),
                None => println!("      {}", step.message),
            }
        }
        if let Some(target) = &step.effective_target {
            println!("      target: {target}");
        }
    }
    if !summary.escalated.is_empty() {
        println!("escalated: {}", join_numbers(&summary.escalated));
    }
    if !summary.permanently_failed.is_empty() {
        println!("permanently failed: {}", join_numbers(&summary.permanently_failed));
    }
    if !summary.recommendations.is_empty() {
        println!("recommendations:");
        for (step, lines) in &summary.recommendations {
            for line in lines {
                println!("  step {step}: {line}");
            }
        }
    }
    for fault in &report.internal_faults {
        println!("internal fault: {}", fault.message);
    }
}
