use async_trait::async_trait;
use mender_core::StepNumber;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::attempt::OutputStream;
use crate::diagnosis::{FailureClass, FixStrategy};
use crate::verify::VerificationStatus;

#[derive(Debug, Clone)]
pub enum Event {
    RunStarted {
        run_id: Uuid,
        plan: String,
        total_steps: usize,
    },
    RunFinished {
        run_id: Uuid,
        completed: usize,
        failed: usize,
        skipped: usize,
        cancelled: bool,
    },
    StepStarted {
        run_id: Uuid,
        step: StepNumber,
        description: String,
    },
    StepSucceeded {
        run_id: Uuid,
        step: StepNumber,
        attempts: usize,
    },
    StepFailed {
        run_id: Uuid,
        step: StepNumber,
        attempts: usize,
        reason: String,
    },
    StepSkipped {
        run_id: Uuid,
        step: StepNumber,
        reason: String,
    },
    AttemptStarted {
        run_id: Uuid,
        step: StepNumber,
        attempt_no: u32,
        strategy: String,
    },
    OutputLine {
        run_id: Uuid,
        step: StepNumber,
        attempt_no: u32,
        stream: OutputStream,
        line: String,
    },
    FailureSignature {
        run_id: Uuid,
        step: StepNumber,
        attempt_no: u32,
        pattern: String,
        line: String,
    },
    AttemptFinished {
        run_id: Uuid,
        step: StepNumber,
        attempt_no: u32,
        succeeded: bool,
        exit_code: Option<i32>,
        failure: Option<String>,
    },
    VerificationFinished {
        run_id: Uuid,
        step: StepNumber,
        attempt_no: u32,
        status: VerificationStatus,
        message: String,
    },
    DiagnosisReady {
        run_id: Uuid,
        step: StepNumber,
        attempt_no: u32,
        class: FailureClass,
        fix_strategy: FixStrategy,
        confidence: f64,
        root_cause: String,
    },
    StepRetryScheduled {
        run_id: Uuid,
        step: StepNumber,
        next_attempt: u32,
        strategy: String,
        delay_ms: u64,
    },
    InternalFault {
        run_id: Uuid,
        step: Option<StepNumber>,
        message: String,
    },
}

impl Event {
    pub fn event_type(&self) -> &'static str {
        match self {
            Event::RunStarted { .. } => "run.started",
            Event::RunFinished { .. } => "run.finished",
            Event::StepStarted { .. } => "step.started",
            Event::StepSucceeded { .. } => "step.succeeded",
            Event::StepFailed { .. } => "step.failed",
            Event::StepSkipped { .. } => "step.skipped",
            Event::AttemptStarted { .. } => "attempt.started",
            Event::OutputLine { .. } => "attempt.output",
            Event::FailureSignature { .. } => "attempt.signature",
            Event::AttemptFinished { .. } => "attempt.finished",
            Event::VerificationFinished { .. } => "verification.finished",
            Event::DiagnosisReady { .. } => "diagnosis.ready",
            Event::StepRetryScheduled { .. } => "step.retry_scheduled",
            Event::InternalFault { .. } => "run.internal_fault",
        }
    }

    pub fn run_id(&self) -> Uuid {
        match self {
            Event::RunStarted { run_id, .. }
            | Event::RunFinished { run_id, .. }
            | Event::StepStarted { run_id, .. }
            | Event::StepSucceeded { run_id, .. }
            | Event::StepFailed { run_id, .. }
            | Event::StepSkipped { run_id, .. }
            | Event::AttemptStarted { run_id, .. }
            | Event::OutputLine { run_id, .. }
            | Event::FailureSignature { run_id, .. }
            | Event::AttemptFinished { run_id, .. }
            | Event::VerificationFinished { run_id, .. }
            | Event::DiagnosisReady { run_id, .. }
            | Event::StepRetryScheduled { run_id, .. }
            | Event::InternalFault { run_id, .. } => *run_id,
        }
    }

    pub fn step(&self) -> Option<StepNumber> {
        match self {
            Event::RunStarted { .. } | Event::RunFinished { .. } => None,
            Event::InternalFault { step, .. } => *step,
            Event::StepStarted { step, .. }
            | Event::StepSucceeded { step, .. }
            | Event::StepFailed { step, .. }
            | Event::StepSkipped { step, .. }
            | Event::AttemptStarted { step, .. }
            | Event::OutputLine { step, .. }
            | Event::FailureSignature { step, .. }
            | Event::AttemptFinished { step, .. }
            | Event::VerificationFinished { step, .. }
            | Event::DiagnosisReady { step, .. }
            | Event::StepRetryScheduled { step, .. } => Some(*step),
        }
    }

    /// Event-specific fields, without `type` and `run_id`.
    pub fn payload(&self) -> Value {
        match self {
            Event::RunStarted {
                plan, total_steps, ..
            } => json!({ "plan": plan, "total_steps": total_steps }),
            Event::RunFinished {
                completed,
                failed,
                skipped,
                cancelled,
                ..
            } => json!({
                "completed": completed,
                "failed": failed,
                "skipped": skipped,
                "cancelled": cancelled
            }),
            Event::StepStarted {
                step, description, ..
            } => json!({ "step": step, "description": description }),
            Event::StepSucceeded { step, attempts, .. } => {
                json!({ "step": step, "attempts": attempts })
            }
            Event::StepFailed {
                step,
                attempts,
                reason,
                ..
            } => json!({ "step": step, "attempts": attempts, "reason": reason }),
            Event::StepSkipped { step, reason, .. } => json!({ "step": step, "reason": reason }),
            Event::AttemptStarted {
                step,
                attempt_no,
                strategy,
                ..
            } => json!({ "step": step, "attempt_no": attempt_no, "strategy": strategy }),
            Event::OutputLine {
                step,
                attempt_no,
                stream,
                line,
                ..
            } => json!({
                "step": step,
                "attempt_no": attempt_no,
                "stream": stream,
                "line": line
            }),
            Event::FailureSignature {
                step,
                attempt_no,
                pattern,
                line,
                ..
            } => json!({
                "step": step,
                "attempt_no": attempt_no,
                "pattern": pattern,
                "line": line
            }),
            Event::AttemptFinished {
                step,
                attempt_no,
                succeeded,
                exit_code,
                failure,
                ..
            } => json!({
                "step": step,
                "attempt_no": attempt_no,
                "succeeded": succeeded,
                "exit_code": exit_code,
                "failure": failure
            }),
            Event::VerificationFinished {
                step,
                attempt_no,
                status,
                message,
                ..
            } => json!({
                "step": step,
                "attempt_no": attempt_no,
                "status": status,
                "message": message
            }),
            Event::DiagnosisReady {
                step,
                attempt_no,
                class,
                fix_strategy,
                confidence,
                root_cause,
                ..
            } => json!({
                "step": step,
                "attempt_no": attempt_no,
                "class": class,
                "fix_strategy": fix_strategy,
                "confidence": confidence,
                "root_cause": root_cause
            }),
            Event::StepRetryScheduled {
                step,
                next_attempt,
                strategy,
                delay_ms,
                ..
            } => json!({
                "step": step,
                "next_attempt": next_attempt,
                "strategy": strategy,
                "delay_ms": delay_ms
            }),
            Event::InternalFault { step, message, .. } => {
                json!({ "step": step, "message": message })
            }
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "type": self.event_type(),
            "run_id": self.run_id().to_string(),
            "payload": self.payload(),
        })
    }
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: Event);
}

pub struct CompositeEventSink {
    sinks: Vec<Box<dyn EventSink>>,
}

impl Default for CompositeEventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl CompositeEventSink {
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    pub fn add(&mut self, sink: Box<dyn EventSink>) {
        self.sinks.push(sink);
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[async_trait]
impl EventSink for CompositeEventSink {
    async fn emit(&self, event: Event) {
        for sink in &self.sinks {
            sink.emit(event.clone()).await;
        }
    }
}

pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event: Event) {}
}

/// JSON lines on stdout.
pub struct StdoutEventSink;

#[async_trait]
impl EventSink for StdoutEventSink {
    async fn emit(&self, event: Event) {
        println!("{}", event.to_json());
    }
}

/// Forwards events to an in-process consumer. A dropped receiver is ignored.
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelEventSink {
    pub fn new(tx: mpsc::UnboundedSender<Event>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventSink for ChannelEventSink {
    async fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}
