use regex::Regex;

use crate::error::{ValidationError, Violation};
use crate::expressions::parse_template;
use crate::types::PlanDocument;

use super::rules;

pub struct Validator {
    violations: Vec<Violation>,
}

impl Validator {
    pub fn new() -> Self {
        Self {
            violations: Vec::new(),
        }
    }

    pub fn finish(self) -> Result<(), ValidationError> {
        if self.violations.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::new(self.violations))
        }
    }

    pub fn validate_plan(&mut self, doc: &PlanDocument) {
        rules::plan::validate_plan(self, doc);
    }

    pub(crate) fn push(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.violations.push(Violation::new(path, message));
    }

    pub(crate) fn validate_regex(&mut self, path: &str, pattern: &str) {
        if pattern.trim().is_empty() {
            self.push(path, "must not be empty");
            return;
        }
        if let Err(e) = Regex::new(pattern) {
            self.push(path, format!("invalid regular expression: {e}"));
        }
    }

    /// Returns the parameter names the template references, or records a violation.
    pub(crate) fn validate_template(&mut self, path: &str, value: &str) -> Vec<String> {
        match parse_template(value) {
            Ok(t) => t.param_names().into_iter().map(String::from).collect(),
            Err(e) => {
                self.push(path, e.to_string());
                Vec::new()
            }
        }
    }
}
