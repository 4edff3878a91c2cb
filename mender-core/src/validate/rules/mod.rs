pub(crate) mod effect;
pub(crate) mod plan;
pub(crate) mod step;
