pub mod events;
mod report;
mod result;
mod scheduler;
mod step_runner;
mod types;

pub use events::{
    ChannelEventSink, CompositeEventSink, Event, EventSink, NoOpEventSink, StdoutEventSink,
};
pub use report::{
    recommendations_for, AttemptRecord, ExecutionReport, InternalFault, PlanSummary, StepReport,
};
pub use result::ExecutionError;
pub use scheduler::{Orchestrator, OrchestratorBuilder};
pub use types::{ConfigError, EngineConfig, InformationalPolicy, MissingPayloadPolicy, PayloadPolicy};
