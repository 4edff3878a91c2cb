#![forbid(unsafe_code)]

//! Runtime engine for executing step plans.
//!
//! Plan parsing, validation and the dependency graph live in `mender-core`; this crate runs
//! the steps, watches their output, checks their effects and decides how to retry them.

pub mod attempt;
pub mod diagnosis;
pub mod executor;
pub mod fallback;
pub mod fix;
pub mod generator;
pub mod monitor;
pub mod retry;
pub mod runner;
pub mod verify;

pub use crate::attempt::{AttemptFailure, ExecutionAttempt, OutputLine, OutputStream};
pub use crate::diagnosis::{Diagnosis, DiagnosisEngine, FailureAnalyzer, FailureClass, FixStrategy};
pub use crate::executor::{
    EngineConfig, Event, EventSink, ExecutionError, ExecutionReport, Orchestrator, StepReport,
};
pub use crate::generator::{CodeGenerator, HttpGenerator};
pub use crate::monitor::ExecutionMonitor;
pub use crate::runner::ActionRunner;
pub use crate::verify::{SideEffectVerifier, VerificationResult, VerificationStatus};
