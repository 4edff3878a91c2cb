use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use mender_exec::executor::{Event, EventSink};

/// Human-readable progress lines on stderr.
pub struct ProgressEventSink {
    total_steps: usize,
    show_output: bool,
    completed: AtomicUsize,
    failed: AtomicUsize,
    skipped: AtomicUsize,
}

impl ProgressEventSink {
    pub fn new(total_steps: usize, show_output: bool) -> Self {
        Self {
            total_steps,
            show_output,
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            skipped: AtomicUsize::new(0),
        }
    }

    fn update_progress(&self) {
        let completed = self.completed.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let skipped = self.skipped.load(Ordering::Relaxed);
        let total = self.total_steps;
        let done = completed + failed + skipped;
        let percent = if total > 0 { (done * 100) / total } else { 100 };
        eprintln!(
            "Progress: [{done}/{total}] {percent}% (✓{completed} ✗{failed} ↷{skipped})"
        );
    }
}

#[async_trait]
impl EventSink for ProgressEventSink {
    async fn emit(&self, event: Event) {
        match event {
            Event::RunStarted {
                plan, total_steps, ..
            } => eprintln!("running `{plan}` ({total_steps} steps)"),
            Event::StepStarted {
                step, description, ..
            } => eprintln!("[step {step}] started: {description}"),
            Event::AttemptStarted {
                step,
                attempt_no,
                strategy,
                ..
            } if attempt_no > 1 => eprintln!("[step {step}] attempt {attempt_no} ({strategy})"),
            Event::OutputLine { step, line, .. } if self.show_output => {
                eprintln!("[step {step}] | {line}")
            }
            Event::VerificationFinished {
                step,
                status,
                message,
                ..
            } => eprintln!("[step {step}] verification {status:?}: {message}"),
            Event::DiagnosisReady {
                step,
                class,
                fix_strategy,
                confidence,
                root_cause,
                ..
            } => eprintln!(
                "[step {step}] diagnosis: {class:?}, fix {fix_strategy} ({confidence:.2}): {root_cause}"
            ),
            Event::StepRetryScheduled {
                step,
                next_attempt,
                strategy,
                delay_ms,
                ..
            } => eprintln!("[step {step}] retry {next_attempt} with {strategy} in {delay_ms} ms"),
            Event::StepSucceeded { step, attempts, .. } => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                eprintln!("[step {step}] completed after {attempts} attempt(s)");
                self.update_progress();
            }
            Event::StepFailed { step, reason, .. } => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                eprintln!("[step {step}] failed: {reason}");
                self.update_progress();
            }
            Event::StepSkipped { step, reason, .. } => {
                self.skipped.fetch_add(1, Ordering::Relaxed);
                eprintln!("[step {step}] skipped: {reason}");
                self.update_progress();
            }
            Event::InternalFault { step, message, .. } => match step {
                Some(step) => eprintln!("[step {step}] internal fault: {message}"),
                None => eprintln!("internal fault: {message}"),
            },
            _ => {}
        }
    }
}
