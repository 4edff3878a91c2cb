use mender_core::PlanError;

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Plan(#[from] PlanError),
}
