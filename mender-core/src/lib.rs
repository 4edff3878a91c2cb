#![forbid(unsafe_code)]

pub mod error;
pub mod expressions;
pub mod parser;
pub mod planner;
pub mod types;
pub mod validate;

pub use crate::error::{ParseError, PlanError, ValidationError, Violation};
pub use crate::parser::{parse_plan_str, DocumentFormat, ParsedPlan};
pub use crate::planner::{
    build_plan, plan_document, plan_from_str, DependencyGraph, ExecutionPlan,
    PlanningOutcome, ValidationSummary,
};
pub use crate::types::{
    ActionCategory, Effect, InvalidTransition, Params, Payload, PlanDocument, Step, StepNumber,
    StepStatus, DEFAULT_INTERPRETER,
};
pub use crate::validate::{validate_plan, Validate};
