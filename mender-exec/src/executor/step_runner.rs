use std::sync::Arc;
use std::time::Duration;

use mender_core::{Payload, Step, StepStatus};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::attempt::{AttemptFailure, ExecutionAttempt};
use crate::diagnosis::{
    strip_code_fences, Diagnosis, DiagnosisEngine, FailureClass, FailureContext, FixStrategy,
};
use crate::executor::events::{Event, EventSink};
use crate::executor::report::{recommendations_for, AttemptRecord, StepReport};
use crate::executor::types::{EngineConfig, InformationalPolicy, MissingPayloadPolicy};
use crate::fallback::FallbackStrategySelector;
use crate::fix::FixGenerator;
use crate::generator::{CodeGenerator, GenerationContext};
use crate::monitor::ExecutionMonitor;
use crate::retry::{wait_backoff, RetryController, RetryDecision, StopReason};
use crate::runner::Invocation;
use crate::verify::{SideEffectVerifier, VerificationResult};

/// Everything a step task needs, shared across all tasks of a run.
pub(crate) struct StepServices {
    pub config: EngineConfig,
    pub monitor: ExecutionMonitor,
    pub verifier: SideEffectVerifier,
    pub diagnosis: DiagnosisEngine,
    pub fixes: FixGenerator,
    pub generator: Option<Arc<dyn CodeGenerator>>,
    pub events: Arc<dyn EventSink>,
}

/// Runs one step to a terminal status: attempt, verify, diagnose, decide, repeat.
pub(crate) async fn run_step(
    services: Arc<StepServices>,
    run_id: Uuid,
    step: Step,
    cancel: CancellationToken,
) -> StepReport {
    let mut runner = StepRun {
        services: &services,
        run_id,
        step: &step,
        report: StepReport::new(&step),
    };
    runner.report.status = StepStatus::Running;
    runner.execute(&cancel).await;
    let mut report = runner.report;
    report.recommendations = recommendations_for(&step, &report);
    report
}

struct StepRun<'a> {
    services: &'a StepServices,
    run_id: Uuid,
    step: &'a Step,
    report: StepReport,
}

impl StepRun<'_> {
    async fn emit(&self, event: Event) {
        self.services.events.emit(event).await;
    }

    fn finish(&mut self, status: StepStatus, stop: Option<StopReason>, message: impl Into<String>) {
        self.report.status = status;
        self.report.stop_reason = stop;
        self.report.message = message.into();
    }

    /// Fail without ever running anything.
    fn fail_early(&mut self, stop: StopReason, root_cause: String) {
        let diagnosis = Diagnosis {
            error_kind: "NoPayload".to_string(),
            error_detail: String::new(),
            root_cause: root_cause.clone(),
            suggested_fix: "give the step code or a command".to_string(),
            fix_strategy: FixStrategy::Manual,
            class: FailureClass::Permanent,
            confidence: 1.0,
            analyzer: "engine".to_string(),
            dependency: None,
            parameters: Default::default(),
        };
        self.finish(StepStatus::Failed, Some(stop), root_cause);
        self.report.diagnosis = Some(diagnosis);
    }

    async fn execute(&mut self, cancel: &CancellationToken) {
        let step = self.step;
        let params = match step.resolved_params() {
            Ok(p) => p,
            Err(err) => {
                self.fail_early(StopReason::NoPayload, format!("parameters could not be resolved: {err}"));
                return;
            }
        };
        self.report.effective_params = params.clone();

        let payload = match self.payload().await {
            Ok(Some(p)) => p,
            Ok(None) => {
                self.finish(StepStatus::Completed, None, "informational step");
                return;
            }
            Err(reason) => {
                self.fail_early(StopReason::NoPayload, reason);
                return;
            }
        };

        let services = self.services;
        let selector = FallbackStrategySelector::for_step(step, &params, &services.config.fallback);
        let mut controller = RetryController::new(services.config.retry.clone(), step, selector);
        let mut invocation = Invocation::new(payload, params, Duration::from_secs(step.timeout_seconds.max(1)));

        loop {
            let (attempt, verification, accepted) = self.attempt(&invocation, cancel).await;
            self.report.effective_params = invocation.params.clone();

            if accepted {
                let attempts = attempt.index;
                self.record(attempt, verification, None);
                self.finish(
                    StepStatus::Completed,
                    None,
                    format!("completed after {attempts} attempt(s)"),
                );
                break;
            }
            if cancel.is_cancelled() || attempt.failure == Some(AttemptFailure::Cancelled) {
                self.record(attempt, verification, None);
                self.finish(StepStatus::Failed, Some(StopReason::Cancelled), "run cancelled");
                break;
            }

            let context = FailureContext {
                step: step.clone(),
                attempt: attempt.clone(),
                verification: verification.clone(),
                fallback_candidates: controller.remaining_fallbacks(),
                generator_available: services.fixes.has_generator(),
                installable: services.fixes.installable(),
            };
            let diagnosis = services.diagnosis.diagnose(context).await;
            info!(
                step = step.number,
                attempt = attempt.index,
                class = ?diagnosis.class,
                fix = %diagnosis.fix_strategy,
                confidence = diagnosis.confidence,
                "diagnosed failure"
            );
            self.emit(Event::DiagnosisReady {
                run_id: self.run_id,
                step: step.number,
                attempt_no: attempt.index,
                class: diagnosis.class,
                fix_strategy: diagnosis.fix_strategy,
                confidence: diagnosis.confidence,
                root_cause: diagnosis.root_cause.clone(),
            })
            .await;

            let output = attempt.combined_output();
            let decision = controller
                .decide(attempt.index, &diagnosis, step, &invocation, &output, &services.fixes)
                .await;
            self.record(attempt, verification, Some(diagnosis.clone()));

            match decision {
                RetryDecision::Stop { reason, detail } => {
                    self.finish(StepStatus::Failed, Some(reason), detail);
                    break;
                }
                RetryDecision::Retry {
                    next_attempt,
                    delay,
                    next,
                } => {
                    let strategy = next.label(&invocation.strategy);
                    self.emit(Event::StepRetryScheduled {
                        run_id: self.run_id,
                        step: step.number,
                        next_attempt,
                        strategy,
                        delay_ms: delay.as_millis() as u64,
                    })
                    .await;
                    if !wait_backoff(delay, cancel).await {
                        self.finish(StepStatus::Failed, Some(StopReason::Cancelled), "run cancelled");
                        break;
                    }
                    invocation = next.apply(&invocation, next_attempt);
                }
            }
        }

        if let Some(key) = step.effect.as_ref().and_then(|e| e.target_param()) {
            self.report.effective_target = self.report.effective_params.get(key).cloned();
        }
    }

    /// One monitored attempt plus verification when it ran cleanly.
    async fn attempt(
        &self,
        invocation: &Invocation,
        cancel: &CancellationToken,
    ) -> (ExecutionAttempt, Option<VerificationResult>, bool) {
        let services = self.services;
        let step = self.step;
        self.emit(Event::AttemptStarted {
            run_id: self.run_id,
            step: step.number,
            attempt_no: invocation.attempt,
            strategy: invocation.strategy.clone(),
        })
        .await;

        let mut run = services
            .monitor
            .start(invocation, step.expected_output.as_deref(), cancel)
            .await;
        while let Some(line) = run.next_line().await {
            if let Some(pattern) = &line.signature {
                self.emit(Event::FailureSignature {
                    run_id: self.run_id,
                    step: step.number,
                    attempt_no: invocation.attempt,
                    pattern: pattern.clone(),
                    line: line.text.clone(),
                })
                .await;
            }
            self.emit(Event::OutputLine {
                run_id: self.run_id,
                step: step.number,
                attempt_no: invocation.attempt,
                stream: line.stream,
                line: line.text,
            })
            .await;
        }
        let attempt = run.finish().await;
        debug!(step = step.number, attempt = attempt.index, success = attempt.success, "attempt finished");

        let finished = Event::AttemptFinished {
            run_id: self.run_id,
            step: step.number,
            attempt_no: attempt.index,
            succeeded: attempt.success,
            exit_code: attempt.exit_code,
            failure: attempt.failure_summary(),
        };
        if !attempt.success {
            self.emit(finished).await;
            return (attempt, None, false);
        }

        // Verification polls the filesystem for a while; report the raw result meanwhile.
        let (verification, ()) = tokio::join!(
            services.verifier.verify(step, &invocation.params, &attempt),
            self.emit(finished)
        );
        let accepted = services.verifier.accepts(&verification);
        self.emit(Event::VerificationFinished {
            run_id: self.run_id,
            step: step.number,
            attempt_no: attempt.index,
            status: verification.status,
            message: verification.message.clone(),
        })
        .await;
        (attempt, Some(verification), accepted)
    }

    fn record(
        &mut self,
        attempt: ExecutionAttempt,
        verification: Option<VerificationResult>,
        diagnosis: Option<Diagnosis>,
    ) {
        if diagnosis.is_some() {
            self.report.diagnosis.clone_from(&diagnosis);
        }
        self.report.attempts.push(AttemptRecord {
            attempt,
            verification,
            diagnosis,
        });
    }

    /// The payload to run, `None` for informational steps that may complete, or a failure reason.
    async fn payload(&self) -> Result<Option<Payload>, String> {
        let step = self.step;
        let policy = &self.services.config.payload_policy;
        let default_interpreter = &self.services.config.runner.default_interpreter;
        if let Some(payload) = step.payload_with(default_interpreter) {
            return Ok(Some(payload));
        }
        if step.informational {
            return match policy.informational {
                InformationalPolicy::Complete => Ok(None),
                InformationalPolicy::Fail => Err("informational step has nothing to execute".to_string()),
            };
        }
        if policy.missing == MissingPayloadPolicy::Fail {
            return Err("step has no code or command".to_string());
        }
        let Some(generator) = &self.services.generator else {
            return Err("step has no code or command and no code generator is configured".to_string());
        };

        let interpreter = step
            .interpreter
            .clone()
            .unwrap_or_else(|| default_interpreter.clone());
        let context = GenerationContext::fresh(step.number, step.description.clone(), interpreter.clone());
        match generator.generate(&context).await {
            Ok(text) => {
                let source = strip_code_fences(&text);
                if source.trim().is_empty() {
                    return Err("code generator returned no code".to_string());
                }
                info!(step = step.number, "generated missing payload");
                Ok(Some(Payload::Code {
                    source,
                    interpreter,
                }))
            }
            Err(err) => {
                warn!(step = step.number, error = %err, "payload generation failed");
                Err(format!("payload generation failed: {err}"))
            }
        }
    }
}
