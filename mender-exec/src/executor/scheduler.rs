use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::stream::{FuturesUnordered, StreamExt};
use mender_core::{build_plan, ExecutionPlan, PlanDocument, Step, StepNumber, StepStatus};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::diagnosis::{AnalyzerChain, DiagnosisEngine, FailureAnalyzer, RuleBasedAnalyzer};
use crate::executor::events::{Event, EventSink, NoOpEventSink};
use crate::executor::report::{
    recommendations_for, ExecutionReport, InternalFault, PlanSummary, StepReport,
};
use crate::executor::result::ExecutionError;
use crate::executor::step_runner::{run_step, StepServices};
use crate::executor::types::{ConfigError, EngineConfig};
use crate::fix::FixGenerator;
use crate::generator::{CodeGenerator, HttpGenerator};
use crate::monitor::ExecutionMonitor;
use crate::runner::ActionRunner;
use crate::verify::SideEffectVerifier;

/// Runs validated plans. Holds configuration and collaborators only; every
/// call to [`Orchestrator::execute`] gets its own run id, statuses and report.
pub struct Orchestrator {
    services: Arc<StepServices>,
}

pub struct OrchestratorBuilder {
    config: EngineConfig,
    analyzer: Option<Arc<dyn FailureAnalyzer>>,
    generator: Option<Arc<dyn CodeGenerator>>,
    events: Option<Arc<dyn EventSink>>,
}

impl OrchestratorBuilder {
    /// Replaces the default analyzer (rules, chained with the HTTP backend when one is configured).
    pub fn analyzer(mut self, analyzer: Arc<dyn FailureAnalyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    pub fn generator(mut self, generator: Arc<dyn CodeGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> Result<Orchestrator, ConfigError> {
        let config = self.config;
        config.check()?;
        let signatures = config
            .monitor
            .signature_set()
            .map_err(|e| ConfigError::Invalid(format!("monitor.extra_signatures: {e}")))?;

        let http = match &config.generator {
            Some(cfg) => Some(Arc::new(HttpGenerator::new(cfg.clone())?)),
            None => None,
        };
        let generator: Option<Arc<dyn CodeGenerator>> = match (self.generator, &http) {
            (Some(g), _) => Some(g),
            (None, Some(http)) => Some(http.clone()),
            (None, None) => None,
        };
        let analyzer: Arc<dyn FailureAnalyzer> = match (self.analyzer, http) {
            (Some(a), _) => a,
            (None, Some(http)) => Arc::new(
                AnalyzerChain::new(config.diagnosis.chain_threshold)
                    .with(Arc::new(RuleBasedAnalyzer))
                    .with(http),
            ),
            (None, None) => Arc::new(RuleBasedAnalyzer),
        };

        let services = StepServices {
            monitor: ExecutionMonitor::new(ActionRunner::new(config.runner.clone()), signatures),
            verifier: SideEffectVerifier::new(config.verify.clone()),
            diagnosis: DiagnosisEngine::new(
                analyzer,
                Duration::from_millis(config.diagnosis.analyzer_timeout_ms),
            ),
            fixes: FixGenerator::new(config.fixes.clone(), generator.clone()),
            generator,
            events: self.events.unwrap_or_else(|| Arc::new(NoOpEventSink)),
            config,
        };
        Ok(Orchestrator {
            services: Arc::new(services),
        })
    }
}

impl Orchestrator {
    pub fn builder(config: EngineConfig) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            analyzer: None,
            generator: None,
            events: None,
        }
    }

    pub fn new(config: EngineConfig) -> Result<Self, ConfigError> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.services.config
    }

    /// Validate `doc` and run it. A rejected plan executes nothing.
    pub async fn execute(
        &self,
        doc: &PlanDocument,
        cancel: CancellationToken,
    ) -> Result<ExecutionReport, ExecutionError> {
        let plan = build_plan(doc)?;
        Ok(self.execute_plan(&plan, cancel).await)
    }

    pub async fn execute_plan(&self, plan: &ExecutionPlan, cancel: CancellationToken) -> ExecutionReport {
        let mut run = RunContext::new(plan, Arc::clone(&self.services.events));
        let lanes = self.services.config.lanes.max(1);
        let started_at = Utc::now();
        info!(run_id = %run.run_id, plan = %plan.name, steps = plan.steps.len(), lanes, "run started");
        run.emit(Event::RunStarted {
            run_id: run.run_id,
            plan: plan.name.clone(),
            total_steps: plan.steps.len(),
        })
        .await;

        let mut in_flight = FuturesUnordered::new();
        loop {
            while !cancel.is_cancelled() && in_flight.len() < lanes {
                let Some(step) = run.claim_next().await else {
                    break;
                };
                let number = step.number;
                let handle = tokio::spawn(run_step(
                    Arc::clone(&self.services),
                    run.run_id,
                    step,
                    cancel.clone(),
                ));
                in_flight.push(async move { (number, handle.await) });
            }
            match in_flight.next().await {
                Some((number, outcome)) => run.apply(number, outcome).await,
                None => break,
            }
        }

        let cancelled = cancel.is_cancelled();
        let reason = if cancelled {
            "run cancelled before the step started"
        } else {
            "dependencies did not complete"
        };
        run.skip_pending(reason).await;

        let report = run.into_report(started_at, cancelled);
        info!(
            run_id = %report.run_id,
            completed = report.summary.completed,
            failed = report.summary.failed,
            skipped = report.summary.skipped,
            cancelled,
            "run finished"
        );
        self.services
            .events
            .emit(Event::RunFinished {
                run_id: report.run_id,
                completed: report.summary.completed,
                failed: report.summary.failed,
                skipped: report.summary.skipped,
                cancelled,
            })
            .await;
        report
    }
}

/// Per-run state; only the scheduling loop mutates it.
struct RunContext<'p> {
    run_id: Uuid,
    plan: &'p ExecutionPlan,
    steps: BTreeMap<StepNumber, Step>,
    reports: BTreeMap<StepNumber, StepReport>,
    faults: Vec<InternalFault>,
    events: Arc<dyn EventSink>,
}

impl<'p> RunContext<'p> {
    fn new(plan: &'p ExecutionPlan, events: Arc<dyn EventSink>) -> Self {
        let steps = plan
            .steps
            .iter()
            .map(|s| {
                let mut step = s.clone();
                step.status = StepStatus::Pending;
                (step.number, step)
            })
            .collect();
        Self {
            run_id: Uuid::new_v4(),
            plan,
            steps,
            reports: BTreeMap::new(),
            faults: Vec::new(),
            events,
        }
    }

    async fn emit(&self, event: Event) {
        self.events.emit(event).await;
    }

    fn transition(&mut self, number: StepNumber, next: StepStatus) {
        let Some(step) = self.steps.get_mut(&number) else {
            return;
        };
        if let Err(err) = step.transition(next) {
            warn!(run_id = %self.run_id, error = %err, "rejected status change");
            self.faults.push(InternalFault {
                step: Some(number),
                message: err.to_string(),
            });
        }
    }

    fn is_ready(&self, step: &Step) -> bool {
        step.status == StepStatus::Pending
            && self.plan.graph.dependencies_of(step.number).iter().all(|d| {
                self.steps
                    .get(d)
                    .is_some_and(|dep| dep.status == StepStatus::Completed)
            })
    }

    /// Lowest-numbered pending step whose dependencies all completed, marked running.
    async fn claim_next(&mut self) -> Option<Step> {
        let number = self
            .plan
            .graph
            .topo_order
            .iter()
            .copied()
            .filter(|n| self.steps.get(n).is_some_and(|s| self.is_ready(s)))
            .min()?;
        self.transition(number, StepStatus::Running);
        let step = self.steps.get(&number)?.clone();
        info!(run_id = %self.run_id, step = number, "step started");
        self.emit(Event::StepStarted {
            run_id: self.run_id,
            step: number,
            description: step.description.clone(),
        })
        .await;
        Some(step)
    }

    async fn apply(&mut self, number: StepNumber, outcome: Result<StepReport, JoinError>) {
        let mut report = match outcome {
            Ok(report) => report,
            Err(err) => {
                let message = if err.is_panic() {
                    format!("step task panicked: {err}")
                } else {
                    format!("step task was aborted: {err}")
                };
                warn!(run_id = %self.run_id, step = number, error = %err, "internal fault");
                self.faults.push(InternalFault {
                    step: Some(number),
                    message: message.clone(),
                });
                self.emit(Event::InternalFault {
                    run_id: self.run_id,
                    step: Some(number),
                    message: message.clone(),
                })
                .await;
                let mut report = match self.steps.get(&number) {
                    Some(step) => StepReport::new(step),
                    None => return,
                };
                report.status = StepStatus::Failed;
                report.message = message;
                report
            }
        };
        if !matches!(report.status, StepStatus::Completed | StepStatus::Failed) {
            report.status = StepStatus::Failed;
        }
        self.transition(number, report.status);

        let attempts = report.attempts_used();
        if report.status == StepStatus::Completed {
            info!(run_id = %self.run_id, step = number, attempts, "step succeeded");
            self.emit(Event::StepSucceeded {
                run_id: self.run_id,
                step: number,
                attempts,
            })
            .await;
            self.reports.insert(number, report);
            return;
        }

        warn!(run_id = %self.run_id, step = number, attempts, reason = %report.message, "step failed");
        self.emit(Event::StepFailed {
            run_id: self.run_id,
            step: number,
            attempts,
            reason: report.message.clone(),
        })
        .await;
        self.reports.insert(number, report);

        let dependents: BTreeSet<StepNumber> = self.plan.graph.transitive_dependents(number);
        for dependent in dependents {
            self.skip(dependent, format!("dependency {number} failed")).await;
        }
    }

    async fn skip(&mut self, number: StepNumber, reason: String) {
        if self
            .steps
            .get(&number)
            .map_or(true, |s| s.status != StepStatus::Pending)
        {
            return;
        }
        self.transition(number, StepStatus::Skipped);
        let Some(step) = self.steps.get(&number) else {
            return;
        };
        let mut report = StepReport::new(step);
        report.message = reason.clone();
        report.recommendations = recommendations_for(step, &report);
        info!(run_id = %self.run_id, step = number, reason = %reason, "step skipped");
        self.reports.insert(number, report);
        self.emit(Event::StepSkipped {
            run_id: self.run_id,
            step: number,
            reason,
        })
        .await;
    }

    async fn skip_pending(&mut self, reason: &str) {
        let pending: Vec<StepNumber> = self
            .plan
            .graph
            .topo_order
            .iter()
            .copied()
            .filter(|n| self.steps.get(n).is_some_and(|s| s.status == StepStatus::Pending))
            .collect();
        for number in pending {
            self.skip(number, reason.to_string()).await;
        }
    }

    fn into_report(self, started_at: chrono::DateTime<Utc>, cancelled: bool) -> ExecutionReport {
        let mut reports = self.reports;
        let steps: Vec<StepReport> = self
            .plan
            .steps
            .iter()
            .filter_map(|s| reports.remove(&s.number))
            .collect();
        ExecutionReport {
            run_id: self.run_id,
            plan: self.plan.name.clone(),
            started_at,
            finished_at: Utc::now(),
            cancelled,
            summary: PlanSummary::from_steps(&steps),
            steps,
            internal_faults: self.faults,
        }
    }
}
