use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::diagnosis::DiagnosisConfig;
use crate::fallback::FallbackConfig;
use crate::fix::FixConfig;
use crate::generator::GeneratorConfig;
use crate::monitor::MonitorConfig;
use crate::retry::RetryConfig;
use crate::runner::RunnerConfig;
use crate::verify::VerifyConfig;

/// What to do with steps that carry no payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PayloadPolicy {
    pub informational: InformationalPolicy,
    pub missing: MissingPayloadPolicy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InformationalPolicy {
    /// Complete with zero attempts.
    #[default]
    Complete,
    Fail,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingPayloadPolicy {
    /// Ask the code generator for one; fail when none is configured.
    #[default]
    Generate,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of independent steps running at once.
    pub lanes: usize,
    pub runner: RunnerConfig,
    pub monitor: MonitorConfig,
    pub verify: VerifyConfig,
    pub diagnosis: DiagnosisConfig,
    pub fixes: FixConfig,
    pub fallback: FallbackConfig,
    pub retry: RetryConfig,
    pub payload_policy: PayloadPolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generator: Option<GeneratorConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lanes: 1,
            runner: RunnerConfig::default(),
            monitor: MonitorConfig::default(),
            verify: VerifyConfig::default(),
            diagnosis: DiagnosisConfig::default(),
            fixes: FixConfig::default(),
            fallback: FallbackConfig::default(),
            retry: RetryConfig::default(),
            payload_policy: PayloadPolicy::default(),
            generator: None,
        }
    }
}

impl EngineConfig {
    /// Load from a YAML or JSON file (YAML is a superset, so one parser covers both).
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_str_any(&text)
    }

    pub fn from_str_any(text: &str) -> Result<Self, ConfigError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self =
            serde_yaml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    pub fn check(&self) -> Result<(), ConfigError> {
        if self.lanes == 0 {
            return Err(ConfigError::Invalid("lanes must be at least 1".to_string()));
        }
        if !(self.retry.factor.is_finite() && self.retry.factor >= 1.0) {
            return Err(ConfigError::Invalid("retry.factor must be >= 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.retry.min_confidence) {
            return Err(ConfigError::Invalid(
                "retry.min_confidence must be within 0..=1".to_string(),
            ));
        }
        self.monitor
            .signature_set()
            .map_err(|e| ConfigError::Invalid(format!("monitor.extra_signatures: {e}")))?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("generator setup failed: {0}")]
    Generator(#[from] crate::generator::GeneratorError),
}
