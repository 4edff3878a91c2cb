use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use mender_core::{Effect, Params, Step, StepNumber, StepStatus};
use serde::Serialize;
use uuid::Uuid;

use crate::attempt::{AttemptFailure, ExecutionAttempt, SetupFailureKind};
use crate::diagnosis::{Diagnosis, FailureClass, FixStrategy};
use crate::retry::StopReason;
use crate::verify::{DiskInfo, VerificationResult, VerificationStatus};

#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    #[serde(flatten)]
    pub attempt: ExecutionAttempt,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnosis: Option<Diagnosis>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub number: StepNumber,
    pub description: String,
    pub status: StepStatus,
    pub message: String,
    pub attempts: Vec<AttemptRecord>,
    /// Diagnosis behind the final status, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnosis: Option<Diagnosis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    #[serde(skip_serializing_if = "Params::is_empty")]
    pub effective_params: Params,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effective_target: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub recommendations: Vec<String>,
}

impl StepReport {
    pub fn new(step: &Step) -> Self {
        Self {
            number: step.number,
            description: step.description.clone(),
            status: step.status,
            message: String::new(),
            attempts: Vec::new(),
            diagnosis: None,
            stop_reason: None,
            effective_params: Params::new(),
            effective_target: None,
            recommendations: Vec::new(),
        }
    }

    pub fn attempts_used(&self) -> usize {
        self.attempts.len()
    }

    /// Strategy labels in attempt order.
    pub fn strategies(&self) -> Vec<&str> {
        self.attempts.iter().map(|a| a.attempt.strategy.as_str()).collect()
    }

    pub fn diagnoses(&self) -> impl Iterator<Item = &Diagnosis> {
        self.attempts.iter().filter_map(|a| a.diagnosis.as_ref())
    }

    pub fn last_diagnosis(&self) -> Option<&Diagnosis> {
        self.diagnosis.as_ref()
    }

    pub fn final_verification(&self) -> Option<&VerificationResult> {
        self.attempts.last().and_then(|a| a.verification.as_ref())
    }

    pub fn is_escalated(&self) -> bool {
        self.status == StepStatus::Failed
            && self
                .last_diagnosis()
                .is_some_and(|d| d.fix_strategy == FixStrategy::Manual)
    }

    pub fn is_permanent(&self) -> bool {
        self.status == StepStatus::Failed
            && self
                .last_diagnosis()
                .is_some_and(|d| d.class == FailureClass::Permanent)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InternalFault {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<StepNumber>,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PlanSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub escalated: Vec<StepNumber>,
    pub permanently_failed: Vec<StepNumber>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub recommendations: BTreeMap<StepNumber, Vec<String>>,
}

impl PlanSummary {
    pub fn from_steps(steps: &[StepReport]) -> Self {
        let mut summary = PlanSummary {
            total: steps.len(),
            ..PlanSummary::default()
        };
        for step in steps {
            match step.status {
                StepStatus::Completed => summary.completed += 1,
                StepStatus::Failed => summary.failed += 1,
                StepStatus::Skipped => summary.skipped += 1,
                StepStatus::Pending | StepStatus::Running => {}
            }
            if step.is_escalated() {
                summary.escalated.push(step.number);
            }
            if step.is_permanent() {
                summary.permanently_failed.push(step.number);
            }
            if !step.recommendations.is_empty() {
                summary
                    .recommendations
                    .insert(step.number, step.recommendations.clone());
            }
        }
        summary
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub run_id: Uuid,
    pub plan: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cancelled: bool,
    pub summary: PlanSummary,
    pub steps: Vec<StepReport>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub internal_faults: Vec<InternalFault>,
}

impl ExecutionReport {
    pub fn step(&self, number: StepNumber) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.number == number)
    }

    pub fn is_success(&self) -> bool {
        !self.cancelled && self.summary.completed == self.summary.total
    }
}

/// Follow-up advice for a step, derived from its last diagnosis, verification and effect.
pub fn recommendations_for(step: &Step, report: &StepReport) -> Vec<String> {
    let mut out = Vec::new();
    match report.status {
        StepStatus::Completed => {
            if report.attempts_used() > 1 {
                let winning = report.strategies().last().copied().unwrap_or("original");
                out.push(format!(
                    "succeeded after {} attempts (strategy {winning})",
                    report.attempts_used()
                ));
            }
            if report
                .final_verification()
                .is_some_and(|v| v.status == VerificationStatus::Unverifiable)
            {
                out.push("reported success but the effect could not be verified".to_string());
            }
        }
        StepStatus::Failed => failure_recommendations(step, report, &mut out),
        StepStatus::Skipped => {
            if !step.depends_on.is_empty() {
                out.push(format!(
                    "re-run once dependencies {:?} succeed",
                    step.depends_on
                ));
            }
        }
        StepStatus::Pending | StepStatus::Running => {}
    }
    let mut seen = std::collections::BTreeSet::new();
    out.retain(|r| seen.insert(r.clone()));
    out
}

fn failure_recommendations(step: &Step, report: &StepReport, out: &mut Vec<String>) {
    let last = report.attempts.last();
    let output = last
        .map(|a| a.attempt.combined_output().to_ascii_lowercase())
        .unwrap_or_default();
    let diagnostics = report.final_verification().map(|v| &v.diagnostics);

    if let Some(AttemptFailure::Setup {
        program,
        reason: SetupFailureKind::NotFound,
        ..
    }) = last.and_then(|a| a.attempt.failure.as_ref())
    {
        out.push(format!("verify that {program} is installed and on PATH"));
    }
    if let Some(d) = report.last_diagnosis() {
        if let Some(dep) = &d.dependency {
            out.push(format!("verify that {dep} is installed and on PATH"));
        }
        if d.fix_strategy == FixStrategy::Manual && !d.suggested_fix.is_empty() {
            out.push(d.suggested_fix.clone());
        }
    }

    let denied = output.contains("permission denied")
        || output.contains("access is denied")
        || diagnostics
            .and_then(|d| d.permissions.as_ref())
            .is_some_and(|p| !p.writable);
    if denied {
        out.push("check permissions or choose a different location".to_string());
        out.push("run with elevated privileges".to_string());
    }
    let full = output.contains("no space left")
        || output.contains("disk full")
        || diagnostics
            .and_then(|d| d.disk.as_ref())
            .is_some_and(DiskInfo::is_low);
    if full {
        out.push("free disk space".to_string());
    }
    if output.contains("locked") || output.contains("being used by another process") {
        out.push("close the application locking the file".to_string());
    }
    if matches!(step.effect, Some(Effect::TypeText { .. })) {
        out.push("check window focus or use the clipboard method".to_string());
    }

    match report.stop_reason {
        Some(StopReason::AttemptsExhausted) => out.push(format!(
            "raise max_retries above {} or simplify the step",
            step.max_retries
        )),
        Some(StopReason::CandidatesExhausted) => out.push(
            "add alternatives to the step's effect or configure a code generator".to_string(),
        ),
        Some(StopReason::NoPayload) => out.push("give the step code or a command".to_string()),
        _ => {}
    }
}
