mod dependency;
mod model;

use crate::error::PlanError;
use crate::parser::{parse_plan_str, DocumentFormat};
use crate::types::PlanDocument;
use crate::validate::validate_plan;

pub use model::{DependencyGraph, ExecutionPlan, PlanningOutcome, ValidationSummary};

/// Parse and plan; validation problems are reported in the outcome rather than as an error.
pub fn plan_from_str(input: &str, format: DocumentFormat) -> Result<PlanningOutcome, PlanError> {
    let parsed = parse_plan_str(input, format)?;
    plan_document(&parsed.document)
}

pub fn plan_document(doc: &PlanDocument) -> Result<PlanningOutcome, PlanError> {
    match build_plan(doc) {
        Ok(plan) => Ok(PlanningOutcome {
            validation: ValidationSummary::valid(),
            plan: Some(plan),
        }),
        Err(PlanError::Validation(e)) => Ok(PlanningOutcome {
            validation: ValidationSummary::invalid_from(e),
            plan: None,
        }),
        Err(e) => Err(e),
    }
}

/// Validate the plan and compute its dependency graph; any violation rejects the whole plan.
pub fn build_plan(doc: &PlanDocument) -> Result<ExecutionPlan, PlanError> {
    validate_plan(doc)?;
    let graph =
        dependency::build_step_dependency_graph(doc).map_err(PlanError::DependencyGraph)?;
    Ok(ExecutionPlan {
        name: doc.display_name().to_string(),
        steps: doc.steps.clone(),
        graph,
    })
}
