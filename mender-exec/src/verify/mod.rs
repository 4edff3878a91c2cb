//! Checks that a step's declared real-world effect actually happened.

mod diagnostics;

use std::path::Path;
use std::time::Duration;

use mender_core::{Effect, Params, Step};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::attempt::ExecutionAttempt;

pub use diagnostics::{
    find_processes, Diagnostics, DiagnosticsCollector, DiskInfo, FileStat, PermissionInfo,
    ProcessInfo,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyConfig {
    /// Treat `unverifiable` as a failure.
    pub strict: bool,
    /// How long a missing effect is re-checked before it counts as absent.
    pub settle_ms: u64,
    pub poll_interval_ms: u64,
    /// Cap on processes listed in process checks and diagnostics.
    pub max_processes: usize,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            strict: false,
            settle_ms: 1500,
            poll_interval_ms: 250,
            max_processes: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationStatus {
    Verified,
    Failed,
    Unverifiable,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationResult {
    pub status: VerificationStatus,
    pub method: String,
    pub message: String,
    #[serde(skip_serializing_if = "Diagnostics::is_empty")]
    pub diagnostics: Diagnostics,
}

impl VerificationResult {
    pub fn verified(method: &str, message: impl Into<String>) -> Self {
        Self::with_status(VerificationStatus::Verified, method, message)
    }

    pub fn failed(method: &str, message: impl Into<String>) -> Self {
        Self::with_status(VerificationStatus::Failed, method, message)
    }

    pub fn unverifiable(method: &str, message: impl Into<String>) -> Self {
        Self::with_status(VerificationStatus::Unverifiable, method, message)
    }

    fn with_status(status: VerificationStatus, method: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            method: method.to_string(),
            message: message.into(),
            diagnostics: Diagnostics::default(),
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: Diagnostics) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn is_verified(&self) -> bool {
        self.status == VerificationStatus::Verified
    }
}

#[derive(Debug, Clone, Default)]
pub struct SideEffectVerifier {
    config: VerifyConfig,
    collector: DiagnosticsCollector,
}

impl SideEffectVerifier {
    pub fn new(config: VerifyConfig) -> Self {
        Self {
            collector: DiagnosticsCollector::new(config.max_processes),
            config,
        }
    }

    /// Whether `result` lets the step complete under the configured policy.
    pub fn accepts(&self, result: &VerificationResult) -> bool {
        match result.status {
            VerificationStatus::Verified => true,
            VerificationStatus::Unverifiable => !self.config.strict,
            VerificationStatus::Failed => false,
        }
    }

    /// Verify a raw-successful attempt. `params` are the attempt's effective params.
    pub async fn verify(
        &self,
        step: &Step,
        params: &Params,
        attempt: &ExecutionAttempt,
    ) -> VerificationResult {
        let Some(effect) = &step.effect else {
            return match &step.expected_output {
                Some(pattern) => self.verify_output(pattern, attempt).await,
                None => VerificationResult::unverifiable("none", "step declares no checkable effect"),
            };
        };

        let effect = match effect.render(params) {
            Ok(e) => e,
            Err(err) => {
                return VerificationResult::failed(
                    effect.kind(),
                    format!("could not resolve effect fields: {err}"),
                )
            }
        };
        let target = |fallback: &str| {
            effect
                .target_param()
                .and_then(|k| params.get(k))
                .cloned()
                .unwrap_or_else(|| fallback.to_string())
        };

        let result = match &effect {
            Effect::LaunchApplication { application, .. } => {
                self.verify_process(&target(application)).await
            }
            Effect::CreateFile { path, content, .. } => {
                self.verify_file(Path::new(&target(path)), content.as_deref()).await
            }
            Effect::CreateDirectory { path, .. } => {
                self.verify_directory(Path::new(&target(path))).await
            }
            Effect::DeleteFile { path } => self.verify_absent(Path::new(&target(path))).await,
            Effect::TypeText { .. } => VerificationResult::unverifiable(
                "input_delivery",
                "delivered keystrokes cannot be observed",
            ),
            Effect::Output { pattern } => self.verify_output(pattern, attempt).await,
        };
        debug!(step = step.number, status = ?result.status, method = %result.method, "verification finished");
        result
    }

    async fn verify_process(&self, application: &str) -> VerificationResult {
        let settle = self.settle();
        let limit = self.config.max_processes;
        let processes = loop {
            let needle = application.to_string();
            let found = tokio::task::spawn_blocking(move || find_processes(&needle, limit))
                .await
                .unwrap_or_default();
            if !found.is_empty() || settle.expired() {
                break found;
            }
            settle.wait().await;
        };
        if processes.is_empty() {
            return VerificationResult::failed(
                "process_check",
                format!("no running process matching `{application}`"),
            )
            .with_diagnostics(self.collector.for_process(application).await);
        }
        let pids: Vec<String> = processes.iter().map(|p| p.pid.to_string()).collect();
        VerificationResult::verified(
            "process_check",
            format!("`{application}` is running (pid {})", pids.join(", ")),
        )
        .with_diagnostics(Diagnostics {
            processes,
            ..Diagnostics::default()
        })
    }

    async fn verify_file(&self, path: &Path, content: Option<&str>) -> VerificationResult {
        let settle = self.settle();
        loop {
            if let Ok(meta) = tokio::fs::metadata(path).await {
                if !meta.is_file() {
                    return self
                        .failure("file_check", path, format!("{} exists but is not a file", path.display()))
                        .await;
                }
                let Some(expected) = content else {
                    return VerificationResult::verified(
                        "file_check",
                        format!("{} exists ({} bytes)", path.display(), meta.len()),
                    );
                };
                let actual = tokio::fs::read_to_string(path).await.unwrap_or_default();
                if actual.contains(expected) {
                    return VerificationResult::verified(
                        "file_check",
                        format!("{} exists with expected content", path.display()),
                    );
                }
                if settle.expired() {
                    return self
                        .failure(
                            "file_check",
                            path,
                            format!("{} exists but lacks the expected content", path.display()),
                        )
                        .await;
                }
            } else if settle.expired() {
                return self
                    .failure("file_check", path, format!("{} was not created", path.display()))
                    .await;
            }
            settle.wait().await;
        }
    }

    async fn verify_directory(&self, path: &Path) -> VerificationResult {
        let settle = self.settle();
        loop {
            match tokio::fs::metadata(path).await {
                Ok(meta) if meta.is_dir() => {
                    return VerificationResult::verified(
                        "directory_check",
                        format!("{} exists", path.display()),
                    )
                }
                Ok(_) => {
                    return self
                        .failure(
                            "directory_check",
                            path,
                            format!("{} exists but is not a directory", path.display()),
                        )
                        .await
                }
                Err(_) if settle.expired() => {
                    return self
                        .failure("directory_check", path, format!("{} was not created", path.display()))
                        .await
                }
                Err(_) => settle.wait().await,
            }
        }
    }

    async fn verify_absent(&self, path: &Path) -> VerificationResult {
        let settle = self.settle();
        loop {
            if tokio::fs::symlink_metadata(path).await.is_err() {
                return VerificationResult::verified("absence_check", format!("{} is gone", path.display()));
            }
            if settle.expired() {
                return self
                    .failure("absence_check", path, format!("{} still exists", path.display()))
                    .await;
            }
            settle.wait().await;
        }
    }

    async fn verify_output(&self, pattern: &str, attempt: &ExecutionAttempt) -> VerificationResult {
        let message = match Regex::new(pattern) {
            Ok(re) if re.is_match(&attempt.combined_output()) => {
                return VerificationResult::verified("output_match", format!("output matched `{pattern}`"))
            }
            Ok(_) => format!("output did not match `{pattern}`"),
            Err(err) => format!("invalid pattern `{pattern}`: {err}"),
        };
        let diagnostics = self.collector.for_working_dir().await;
        VerificationResult::failed("output_match", message).with_diagnostics(diagnostics)
    }

    async fn failure(&self, method: &str, path: &Path, message: String) -> VerificationResult {
        let diagnostics = self.collector.for_path(path).await;
        VerificationResult::failed(method, message).with_diagnostics(diagnostics)
    }

    fn settle(&self) -> Settle {
        Settle {
            deadline: Instant::now() + Duration::from_millis(self.config.settle_ms),
            interval: Duration::from_millis(self.config.poll_interval_ms.max(10)),
        }
    }
}

struct Settle {
    deadline: Instant,
    interval: Duration,
}

impl Settle {
    fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    async fn wait(&self) {
        tokio::time::sleep(self.interval).await;
    }
}
