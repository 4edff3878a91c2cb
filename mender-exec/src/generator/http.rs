use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use url::Url;

use crate::diagnosis::{
    extract_json_object, AnalyzerError, AnalyzerReport, FailureAnalyzer, FailureContext,
};
use crate::generator::{CodeGenerator, GenerationContext, GeneratorError};

/// Output beyond this many characters is cut before it goes into a prompt.
const MAX_PROMPT_OUTPUT: usize = 4000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Base URL of an Ollama-compatible server.
    pub url: Url,
    pub model: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    60_000
}

/// Model backend speaking the `/api/generate` protocol.
///
/// Serves both as a [`CodeGenerator`] and as a [`FailureAnalyzer`].
pub struct HttpGenerator {
    client: reqwest::Client,
    endpoint: Url,
    config: GeneratorConfig,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

impl HttpGenerator {
    pub fn new(config: GeneratorConfig) -> Result<Self, GeneratorError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("mender/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| GeneratorError::Network(e.to_string()))?;
        let endpoint = generate_endpoint(&config.url)?;
        Ok(Self {
            client,
            endpoint,
            config,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    async fn complete(&self, prompt: String) -> Result<String, GeneratorError> {
        let body = json!({
            "model": self.config.model,
            "prompt": prompt,
            "stream": false,
        });
        let resp = self
            .client
            .post(self.endpoint.clone())
            .timeout(Duration::from_millis(self.config.timeout_ms))
            .json(&body)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(GeneratorError::Status(status.as_u16()));
        }
        let parsed: GenerateResponse = resp
            .json()
            .await
            .map_err(|e| GeneratorError::Malformed(e.to_string()))?;
        Ok(parsed.response)
    }
}

#[async_trait]
impl CodeGenerator for HttpGenerator {
    async fn generate(&self, context: &GenerationContext) -> Result<String, GeneratorError> {
        let text = self.complete(context.prompt()).await?;
        if text.trim().is_empty() {
            return Err(GeneratorError::Empty);
        }
        Ok(text)
    }
}

#[async_trait]
impl FailureAnalyzer for HttpGenerator {
    fn name(&self) -> &str {
        "http"
    }

    async fn analyze(&self, context: &FailureContext) -> Result<AnalyzerReport, AnalyzerError> {
        let text = self
            .complete(analysis_prompt(context))
            .await
            .map_err(|e| AnalyzerError::Backend(e.to_string()))?;
        let value = extract_json_object(&text)
            .ok_or_else(|| AnalyzerError::Malformed("no JSON object in response".to_string()))?;
        serde_json::from_value(value).map_err(|e| AnalyzerError::Malformed(e.to_string()))
    }
}

fn analysis_prompt(context: &FailureContext) -> String {
    let attempt = &context.attempt;
    let mut output = attempt.combined_output();
    if output.len() > MAX_PROMPT_OUTPUT {
        let mut cut = output.len() - MAX_PROMPT_OUTPUT;
        while !output.is_char_boundary(cut) {
            cut += 1;
        }
        output = output.split_off(cut);
    }
    let failure = attempt
        .failure_summary()
        .or_else(|| context.verification.as_ref().map(|v| v.message.clone()))
        .unwrap_or_default();

    format!(
        "A step of an automation plan failed.\n\
         Step: {description}\n\
         Failure: {failure}\n\
         Exit code: {exit:?}\n\
         Output:\n```\n{output}\n```\n\
         Untried fallback strategies: {fallbacks}\n\n\
         Respond with a JSON object with keys error_kind, root_cause, suggested_fix, \
         fix_strategy (one of regenerate, add-retry-logic, install-dependency, adjust-parameters, manual), \
         class (one of transient, resource, permanent, verification-mismatch, missing-dependency, unknown), \
         confidence (0 to 1), dependency (package name, if any) and parameters (string map).",
        description = context.step.description,
        exit = attempt.exit_code,
        fallbacks = context.fallback_candidates.len(),
    )
}

/// `base` is treated as a directory so a path prefix like `/ollama` survives the join.
fn generate_endpoint(base: &Url) -> Result<Url, GeneratorError> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join("api/generate")
        .map_err(|e| GeneratorError::Network(e.to_string()))
}

fn map_reqwest_error(e: reqwest::Error) -> GeneratorError {
    if e.is_timeout() {
        return GeneratorError::Timeout;
    }
    if e.is_connect() || e.is_request() {
        return GeneratorError::Network(e.to_string());
    }
    GeneratorError::Malformed(e.to_string())
}
