//! Turns a failed attempt into a structured [`Diagnosis`].
//!
//! Analyzers are pluggable through [`FailureAnalyzer`]. Whatever they return
//! is normalised by the [`DiagnosisEngine`]: unknown fix strategies are
//! rejected, confidence is clamped, and a diagnosis is always produced even
//! when the analyzer errors, panics or times out.

mod extract;
mod rules;

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mender_core::{Params, Step};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::attempt::ExecutionAttempt;
use crate::verify::{VerificationResult, VerificationStatus};

pub use extract::{extract_json_object, parse_error_from_output, strip_code_fences};
pub use rules::RuleBasedAnalyzer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FixStrategy {
    #[serde(alias = "regenerate_code", alias = "regenerate-code")]
    Regenerate,
    #[serde(alias = "add_retry_logic", alias = "retry")]
    AddRetryLogic,
    #[serde(alias = "install_dependency", alias = "install_package")]
    InstallDependency,
    #[serde(alias = "adjust_parameters")]
    AdjustParameters,
    #[serde(alias = "manual_intervention")]
    Manual,
}

impl FixStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            FixStrategy::Regenerate => "regenerate",
            FixStrategy::AddRetryLogic => "add-retry-logic",
            FixStrategy::InstallDependency => "install-dependency",
            FixStrategy::AdjustParameters => "adjust-parameters",
            FixStrategy::Manual => "manual",
        }
    }
}

impl fmt::Display for FixStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown fix strategy `{0}`")]
pub struct UnknownFixStrategy(pub String);

impl FromStr for FixStrategy {
    type Err = UnknownFixStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tag = s.trim().to_ascii_lowercase();
        serde_json::from_value(serde_json::Value::String(tag)).map_err(|_| UnknownFixStrategy(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureClass {
    Transient,
    Resource,
    Permanent,
    VerificationMismatch,
    MissingDependency,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnosis {
    pub error_kind: String,
    pub error_detail: String,
    pub root_cause: String,
    pub suggested_fix: String,
    pub fix_strategy: FixStrategy,
    pub class: FailureClass,
    /// Always within `0.0..=1.0`.
    pub confidence: f64,
    pub analyzer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dependency: Option<String>,
    #[serde(skip_serializing_if = "Params::is_empty")]
    pub parameters: Params,
}

impl Diagnosis {
    /// Placeholder used when no analyzer produced anything usable.
    pub fn unknown(attempt: &ExecutionAttempt, analyzer: &str, reason: impl Into<String>) -> Self {
        let (error_kind, error_detail) = parse_error_from_output(attempt);
        Self {
            error_kind,
            error_detail,
            root_cause: reason.into(),
            suggested_fix: "try an alternative strategy or regenerate the payload".to_string(),
            fix_strategy: FixStrategy::Regenerate,
            class: FailureClass::Unknown,
            confidence: 0.0,
            analyzer: analyzer.to_string(),
            dependency: None,
            parameters: Params::new(),
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "{}: {} (fix: {}, confidence {:.2})",
            self.error_kind, self.root_cause, self.fix_strategy, self.confidence
        )
    }
}

/// Raw analyzer output before normalisation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalyzerReport {
    #[serde(default)]
    pub error_kind: Option<String>,
    #[serde(default)]
    pub root_cause: String,
    #[serde(default)]
    pub suggested_fix: String,
    pub fix_strategy: String,
    #[serde(default)]
    pub class: Option<FailureClass>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub dependency: Option<String>,
    #[serde(default)]
    pub parameters: Params,
}

impl AnalyzerReport {
    pub fn new(strategy: FixStrategy, class: FailureClass, confidence: f64) -> Self {
        Self {
            fix_strategy: strategy.as_str().to_string(),
            class: Some(class),
            confidence,
            ..Self::default()
        }
    }

    pub fn cause(mut self, root_cause: impl Into<String>, suggested_fix: impl Into<String>) -> Self {
        self.root_cause = root_cause.into();
        self.suggested_fix = suggested_fix.into();
        self
    }

    pub fn dependency(mut self, dependency: impl Into<String>) -> Self {
        self.dependency = Some(dependency.into());
        self
    }

    pub fn parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }
}

/// Everything an analyzer may look at.
#[derive(Debug, Clone)]
pub struct FailureContext {
    pub step: Step,
    pub attempt: ExecutionAttempt,
    pub verification: Option<VerificationResult>,
    /// Ids of fallback candidates not yet tried.
    pub fallback_candidates: Vec<String>,
    pub generator_available: bool,
    /// Programs the fix generator knows how to install.
    pub installable: BTreeSet<String>,
}

impl FailureContext {
    pub fn verification_failed(&self) -> bool {
        self.attempt.success
            && self
                .verification
                .as_ref()
                .is_some_and(|v| v.status != VerificationStatus::Verified)
    }

    pub fn has_candidate(&self, prefix: &str) -> bool {
        self.fallback_candidates.iter().any(|c| c.starts_with(prefix))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AnalyzerError {
    #[error("analyzer backend failed: {0}")]
    Backend(String),
    #[error("analyzer returned malformed output: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait FailureAnalyzer: Send + Sync {
    fn name(&self) -> &str;

    async fn analyze(&self, context: &FailureContext) -> Result<AnalyzerReport, AnalyzerError>;
}

/// Tries analyzers in order and keeps the first confident answer.
pub struct AnalyzerChain {
    analyzers: Vec<Arc<dyn FailureAnalyzer>>,
    threshold: f64,
}

impl AnalyzerChain {
    pub fn new(threshold: f64) -> Self {
        Self {
            analyzers: Vec::new(),
            threshold,
        }
    }

    pub fn with(mut self, analyzer: Arc<dyn FailureAnalyzer>) -> Self {
        self.analyzers.push(analyzer);
        self
    }

    pub fn len(&self) -> usize {
        self.analyzers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.analyzers.is_empty()
    }
}

#[async_trait]
impl FailureAnalyzer for AnalyzerChain {
    fn name(&self) -> &str {
        "chain"
    }

    async fn analyze(&self, context: &FailureContext) -> Result<AnalyzerReport, AnalyzerError> {
        let mut best: Option<AnalyzerReport> = None;
        let mut last_err = None;
        for analyzer in &self.analyzers {
            match analyzer.analyze(context).await {
                Ok(report) if report.confidence >= self.threshold => return Ok(report),
                Ok(report) => {
                    if best.as_ref().map_or(true, |b| report.confidence > b.confidence) {
                        best = Some(report);
                    }
                }
                Err(err) => {
                    debug!(analyzer = analyzer.name(), error = %err, "analyzer failed, trying next");
                    last_err = Some(err);
                }
            }
        }
        match (best, last_err) {
            (Some(report), _) => Ok(report),
            (None, Some(err)) => Err(err),
            (None, None) => Err(AnalyzerError::Backend("no analyzers configured".to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosisConfig {
    pub analyzer_timeout_ms: u64,
    /// Confidence at which an analyzer chain stops asking further analyzers.
    pub chain_threshold: f64,
}

impl Default for DiagnosisConfig {
    fn default() -> Self {
        Self {
            analyzer_timeout_ms: 30_000,
            chain_threshold: 0.6,
        }
    }
}

pub struct DiagnosisEngine {
    analyzer: Arc<dyn FailureAnalyzer>,
    timeout: Duration,
}

impl DiagnosisEngine {
    pub fn new(analyzer: Arc<dyn FailureAnalyzer>, timeout: Duration) -> Self {
        Self { analyzer, timeout }
    }

    pub fn rule_based() -> Self {
        Self::new(Arc::new(RuleBasedAnalyzer), Duration::from_millis(DiagnosisConfig::default().analyzer_timeout_ms))
    }

    /// Never fails: analyzer errors, panics and timeouts yield an `unknown` diagnosis.
    pub async fn diagnose(&self, context: FailureContext) -> Diagnosis {
        let context = Arc::new(context);
        let analyzer = Arc::clone(&self.analyzer);
        let name = analyzer.name().to_string();
        let task_ctx = Arc::clone(&context);
        let mut handle = tokio::spawn(async move { analyzer.analyze(&task_ctx).await });

        let report = match tokio::time::timeout(self.timeout, &mut handle).await {
            Ok(Ok(Ok(report))) => report,
            Ok(Ok(Err(err))) => {
                warn!(analyzer = %name, error = %err, "analyzer failed");
                return Diagnosis::unknown(&context.attempt, &name, format!("analyzer failed: {err}"));
            }
            Ok(Err(join)) => {
                warn!(analyzer = %name, error = %join, "analyzer task aborted");
                return Diagnosis::unknown(&context.attempt, &name, "analyzer crashed");
            }
            Err(_) => {
                handle.abort();
                warn!(analyzer = %name, timeout_ms = self.timeout.as_millis() as u64, "analyzer timed out");
                return Diagnosis::unknown(&context.attempt, &name, "analyzer timed out");
            }
        };
        normalize(report, &context, &name)
    }
}

fn normalize(report: AnalyzerReport, context: &FailureContext, analyzer: &str) -> Diagnosis {
    let fix_strategy = match report.fix_strategy.parse::<FixStrategy>() {
        Ok(s) => s,
        Err(err) => {
            warn!(analyzer, error = %err, "rejecting analyzer report");
            return Diagnosis::unknown(&context.attempt, analyzer, err.to_string());
        }
    };
    let confidence = if report.confidence.is_finite() {
        report.confidence.clamp(0.0, 1.0)
    } else {
        0.0
    };
    let class = report.class.unwrap_or_else(|| default_class(fix_strategy, context));
    let (parsed_kind, error_detail) = parse_error_from_output(&context.attempt);
    let error_kind = report
        .error_kind
        .filter(|k| !k.trim().is_empty())
        .unwrap_or(parsed_kind);

    Diagnosis {
        error_kind,
        error_detail,
        root_cause: non_empty(report.root_cause, "unknown"),
        suggested_fix: non_empty(report.suggested_fix, fix_strategy.as_str()),
        fix_strategy,
        class,
        confidence,
        analyzer: analyzer.to_string(),
        dependency: report.dependency.filter(|d| !d.trim().is_empty()),
        parameters: report.parameters,
    }
}

fn default_class(strategy: FixStrategy, context: &FailureContext) -> FailureClass {
    if context.verification_failed() {
        return FailureClass::VerificationMismatch;
    }
    match strategy {
        FixStrategy::InstallDependency => FailureClass::MissingDependency,
        FixStrategy::AddRetryLogic => FailureClass::Transient,
        _ => FailureClass::Unknown,
    }
}

fn non_empty(s: String, fallback: &str) -> String {
    if s.trim().is_empty() {
        fallback.to_string()
    } else {
        s
    }
}
