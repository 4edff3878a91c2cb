mod rules;
mod validator;

use crate::error::ValidationError;
use crate::types::PlanDocument;
use validator::Validator;

pub trait Validate {
    fn validate(&self) -> Result<(), ValidationError>;
}

impl Validate for PlanDocument {
    fn validate(&self) -> Result<(), ValidationError> {
        validate_plan(self)
    }
}

pub fn validate_plan(doc: &PlanDocument) -> Result<(), ValidationError> {
    let mut v = Validator::new();
    v.validate_plan(doc);
    v.finish()
}
