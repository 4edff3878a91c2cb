use std::fmt;
use std::time::Duration;

use mender_core::Step;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::diagnosis::{Diagnosis, FailureClass, FixStrategy};
use crate::fallback::{FallbackStrategySelector, StrategyCandidate};
use crate::fix::{FixAction, FixGenerator, FixHistory, FixOutcome};
use crate::retry::config::{Jitter, RetryConfig};
use crate::runner::{Invocation, Preparation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopReason {
    /// The diagnosis asks for a human.
    Manual,
    Permanent,
    AttemptsExhausted,
    /// Nothing left to try: no applicable fix and no fallback.
    CandidatesExhausted,
    Cancelled,
    /// Nothing to execute and nothing generated.
    NoPayload,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::Manual => "manual",
            StopReason::Permanent => "permanent",
            StopReason::AttemptsExhausted => "attempts-exhausted",
            StopReason::CandidatesExhausted => "candidates-exhausted",
            StopReason::Cancelled => "cancelled",
            StopReason::NoPayload => "no-payload",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NextStrategy {
    Fix(FixAction),
    Fallback(StrategyCandidate),
    /// Same strategy again; only for transient failures.
    Repeat,
}

impl NextStrategy {
    pub fn label(&self, current: &str) -> String {
        match self {
            NextStrategy::Fix(action) => action.label(),
            NextStrategy::Fallback(candidate) => candidate.id.clone(),
            NextStrategy::Repeat => current.to_string(),
        }
    }

    /// The invocation for `next_attempt` under this strategy.
    pub fn apply(&self, current: &Invocation, next_attempt: u32) -> Invocation {
        let mut next = current.clone();
        next.attempt = next_attempt;
        next.strategy = self.label(&current.strategy);
        next.preparation = None;
        match self {
            NextStrategy::Fix(FixAction::Regenerate { payload }) => next.payload = payload.clone(),
            NextStrategy::Fix(FixAction::AddRetryLogic { resilience }) => {
                next.resilience = Some(*resilience)
            }
            NextStrategy::Fix(FixAction::InstallDependency { package, install }) => {
                next.preparation = Some(Preparation {
                    package: package.clone(),
                    payload: install.clone(),
                })
            }
            NextStrategy::Fix(FixAction::AdjustParameters { overrides, timeout }) => {
                next.params.extend(overrides.clone());
                if let Some(t) = timeout {
                    next.timeout = *t;
                }
            }
            NextStrategy::Fallback(candidate) => next.params.extend(candidate.overrides.clone()),
            NextStrategy::Repeat => {}
        }
        next
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    Retry {
        next_attempt: u32,
        delay: Duration,
        next: NextStrategy,
    },
    Stop {
        reason: StopReason,
        detail: String,
    },
}

/// Outcome of classifying a diagnosis, before any fix is generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Stop(StopReason),
    Continue { prefer_fallback: bool },
}

/// Exponential backoff: `base * factor^(attempt_no-1)`, clamped to the max delay.
pub fn backoff_delay(cfg: &RetryConfig, attempt_no: u32, rand_u64: impl Fn() -> u64) -> Duration {
    let exp = attempt_no.saturating_sub(1) as i32;
    let raw = (cfg.base_delay_ms as f64) * cfg.factor.powi(exp);
    let raw_ms = raw.min(cfg.max_delay_ms as f64).max(0.0) as u64;
    let ms = match cfg.jitter {
        Jitter::None => raw_ms,
        Jitter::Full if raw_ms == 0 => 0,
        Jitter::Full => rand_u64() % raw_ms.saturating_add(1),
    };
    Duration::from_millis(ms)
}

/// Sleep for `delay` unless cancelled first. Returns false on cancellation.
pub async fn wait_backoff(delay: Duration, cancel: &CancellationToken) -> bool {
    if delay.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = cancel.cancelled() => false,
    }
}

/// Decides, attempt by attempt, whether a step gets another try and how.
pub struct RetryController {
    config: RetryConfig,
    max_attempts: u32,
    selector: FallbackStrategySelector,
    history: FixHistory,
}

impl RetryController {
    pub fn new(config: RetryConfig, step: &Step, selector: FallbackStrategySelector) -> Self {
        Self {
            config,
            max_attempts: step.max_attempts(),
            selector,
            history: FixHistory::default(),
        }
    }

    pub fn remaining_fallbacks(&self) -> Vec<String> {
        self.selector.remaining_ids()
    }

    pub fn classify(&self, attempt_no: u32, diagnosis: &Diagnosis) -> Verdict {
        if diagnosis.class == FailureClass::Permanent {
            return Verdict::Stop(StopReason::Permanent);
        }
        if diagnosis.fix_strategy == FixStrategy::Manual {
            return Verdict::Stop(StopReason::Manual);
        }
        if attempt_no >= self.max_attempts {
            return Verdict::Stop(StopReason::AttemptsExhausted);
        }
        let prefer_fallback = matches!(
            diagnosis.class,
            FailureClass::Resource | FailureClass::VerificationMismatch
        ) || diagnosis.confidence < self.config.min_confidence;
        Verdict::Continue { prefer_fallback }
    }

    /// `attempt_no` is the 1-based index of the attempt that just failed.
    pub async fn decide(
        &mut self,
        attempt_no: u32,
        diagnosis: &Diagnosis,
        step: &Step,
        current: &Invocation,
        last_output: &str,
        fixes: &FixGenerator,
    ) -> RetryDecision {
        let prefer_fallback = match self.classify(attempt_no, diagnosis) {
            Verdict::Stop(reason) => {
                return RetryDecision::Stop {
                    reason,
                    detail: stop_detail(reason, diagnosis, self.max_attempts),
                }
            }
            Verdict::Continue { prefer_fallback } => prefer_fallback,
        };

        let mut skipped = Vec::new();
        let next = if prefer_fallback {
            match self.selector.next_candidate() {
                Some(c) => Some(NextStrategy::Fallback(c)),
                None => self
                    .try_fix(step, current, diagnosis, last_output, fixes, &mut skipped)
                    .await
                    .map(NextStrategy::Fix),
            }
        } else {
            match self
                .try_fix(step, current, diagnosis, last_output, fixes, &mut skipped)
                .await
            {
                Some(action) => Some(NextStrategy::Fix(action)),
                None => self.selector.next_candidate().map(NextStrategy::Fallback),
            }
        };

        let next = match next {
            Some(next) => next,
            None if diagnosis.class == FailureClass::Transient => NextStrategy::Repeat,
            None => {
                skipped.push("no fallback strategies left".to_string());
                return RetryDecision::Stop {
                    reason: StopReason::CandidatesExhausted,
                    detail: skipped.join("; "),
                };
            }
        };

        let delay = backoff_delay(&self.config, attempt_no, || fastrand::u64(..));
        debug!(step = step.number, attempt_no, delay_ms = delay.as_millis() as u64, strategy = %next.label(&current.strategy), "retry scheduled");
        RetryDecision::Retry {
            next_attempt: attempt_no + 1,
            delay,
            next,
        }
    }

    async fn try_fix(
        &mut self,
        step: &Step,
        current: &Invocation,
        diagnosis: &Diagnosis,
        last_output: &str,
        fixes: &FixGenerator,
        skipped: &mut Vec<String>,
    ) -> Option<FixAction> {
        match fixes
            .generate(step, current, diagnosis, last_output, &self.history)
            .await
        {
            FixOutcome::Ready(action) => {
                match &action {
                    FixAction::InstallDependency { package, .. } => {
                        self.history.installed.insert(package.clone());
                    }
                    FixAction::Regenerate { .. } => self.history.regenerations += 1,
                    _ => {}
                }
                Some(action)
            }
            FixOutcome::NotActionable(reason) => {
                skipped.push(reason);
                None
            }
            FixOutcome::Escalate => None,
        }
    }
}

fn stop_detail(reason: StopReason, diagnosis: &Diagnosis, max_attempts: u32) -> String {
    match reason {
        StopReason::AttemptsExhausted => format!("all {max_attempts} attempts used"),
        StopReason::Permanent | StopReason::Manual => diagnosis.root_cause.clone(),
        other => other.to_string(),
    }
}
