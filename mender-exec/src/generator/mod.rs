//! External code generation: used to fill missing payloads and to regenerate failing ones.

mod http;

use async_trait::async_trait;
use mender_core::StepNumber;
use serde::Serialize;

use crate::diagnosis::Diagnosis;

pub use http::{GeneratorConfig, HttpGenerator};

#[derive(Debug, Clone, Serialize)]
pub struct GenerationContext {
    pub step: StepNumber,
    pub description: String,
    pub interpreter: String,
    /// Attempt that failed, when regenerating.
    pub attempt: Option<u32>,
    pub previous_payload: Option<String>,
    pub error_output: Option<String>,
    pub diagnosis: Option<Diagnosis>,
}

impl GenerationContext {
    pub fn fresh(step: StepNumber, description: impl Into<String>, interpreter: impl Into<String>) -> Self {
        Self {
            step,
            description: description.into(),
            interpreter: interpreter.into(),
            attempt: None,
            previous_payload: None,
            error_output: None,
            diagnosis: None,
        }
    }

    pub fn prompt(&self) -> String {
        let mut prompt = format!(
            "Write a {} program that performs this task:\n{}\n",
            self.interpreter, self.description
        );
        if let Some(previous) = &self.previous_payload {
            prompt.push_str(&format!("\nThis earlier version failed:\n```\n{previous}\n```\n"));
        }
        if let Some(output) = &self.error_output {
            prompt.push_str(&format!("\nIt produced:\n```\n{output}\n```\n"));
        }
        if let Some(d) = &self.diagnosis {
            prompt.push_str(&format!(
                "\nDiagnosis: {}\nSuggested fix: {}\n",
                d.root_cause, d.suggested_fix
            ));
        }
        prompt.push_str("\nReply with only the program in a single fenced code block.");
        prompt
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GeneratorError {
    #[error("generator request timed out")]
    Timeout,
    #[error("generator request failed: {0}")]
    Network(String),
    #[error("generator returned status {0}")]
    Status(u16),
    #[error("generator returned malformed output: {0}")]
    Malformed(String),
    #[error("generator produced no code")]
    Empty,
}

#[async_trait]
pub trait CodeGenerator: Send + Sync {
    /// Returns raw model text; callers strip code fences.
    async fn generate(&self, context: &GenerationContext) -> Result<String, GeneratorError>;
}

/// Adapts a plain function into a [`CodeGenerator`].
pub struct FnGenerator<F>(pub F);

#[async_trait]
impl<F> CodeGenerator for FnGenerator<F>
where
    F: Fn(&GenerationContext) -> Result<String, GeneratorError> + Send + Sync,
{
    async fn generate(&self, context: &GenerationContext) -> Result<String, GeneratorError> {
        (self.0)(context)
    }
}
