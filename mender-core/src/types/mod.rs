mod effect;
mod plan;
mod step;

pub use effect::{ActionCategory, Effect};
pub use plan::PlanDocument;
pub use step::{
    InvalidTransition, Params, Payload, Step, StepNumber, StepStatus, DEFAULT_INTERPRETER,
    DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT_SECONDS,
};
