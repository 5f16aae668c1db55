use super::dag::Plan;
use super::step_executor::{StepExecutor, StepExecutorConfig, StepOutcome};
use crate::error::{OrchestratorError, StepError};
use crate::events::{Event, EventLog, EventType, RunOutcome};
use crate::manifest::Manifest;
use crate::registry::{AdapterRegistry, RollbackOutcome};
use crate::secrets::SecretBroker;
use crate::storage::{StateError, StateStore};
use crate::types::{
    ErrorKind, ExecutionRecord, FailureDetail, PlanId, PlanSummary, RunId, StepId, StepStatus,
};
use crate::verifier::{
    HealthProbe, VerificationError, VerificationTimeout, Verifier, VerifierConfig,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Upper bound on steps running at once
    pub max_concurrency: usize,
    pub executor: StepExecutorConfig,
    pub verifier: VerifierConfig,
    /// How long a run's claim on a plan survives without renewal
    pub lease_ttl: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            executor: StepExecutorConfig::default(),
            verifier: VerifierConfig::default(),
            lease_ttl: Duration::from_secs(60),
        }
    }
}

/// Per-step line of a run report
#[derive(Debug, Clone)]
pub struct StepReport {
    pub step_id: StepId,
    pub kind: String,
    pub status: StepStatus,
    pub attempts: u32,
    /// Satisfied by idempotency key instead of running the adapter
    pub reused: bool,
    pub last_error: Option<FailureDetail>,
}

#[derive(Debug, Clone)]
pub enum VerificationReport {
    /// The plan declares no health signal
    NotConfigured,
    /// Steps did not all succeed, so health was never checked
    Skipped,
    Passed { attempts: u32, elapsed: Duration },
    TimedOut(VerificationTimeout),
    Cancelled,
}

/// Outcome of one `apply`
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: RunId,
    pub plan_id: PlanId,
    pub outcome: RunOutcome,
    pub steps: Vec<StepReport>,
    pub verification: VerificationReport,
    pub duration: Duration,
}

impl RunReport {
    pub fn exit_code(&self) -> u8 {
        match self.outcome {
            RunOutcome::Succeeded => 0,
            RunOutcome::Failed | RunOutcome::Cancelled => 1,
            RunOutcome::VerificationTimedOut => 2,
        }
    }

    pub fn step(&self, step_id: &str) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.step_id.as_str() == step_id)
    }
}

/// Outcome of one `rollback`
#[derive(Debug, Clone)]
pub struct RollbackReport {
    pub run_id: RunId,
    pub plan_id: PlanId,
    /// Reverted steps, in the order they were reverted
    pub reverted: Vec<StepId>,
    pub unsupported: Vec<StepId>,
    pub failed: Option<(StepId, String)>,
    pub cancelled: bool,
}

impl RollbackReport {
    pub fn exit_code(&self) -> u8 {
        if self.failed.is_some() || self.cancelled {
            1
        } else {
            0
        }
    }
}

/// Stored state of a plan
#[derive(Debug, Clone)]
pub struct PlanStatus {
    pub summary: PlanSummary,
    pub records: Vec<ExecutionRecord>,
}

/// Drives a plan to completion: dispatches ready steps, isolates failures,
/// verifies health and reports
pub struct Orchestrator {
    registry: Arc<AdapterRegistry>,
    state: Arc<dyn StateStore>,
    event_log: Arc<dyn EventLog>,
    step_executor: Arc<StepExecutor>,
    config: OrchestratorConfig,
    probe: Option<Arc<dyn HealthProbe>>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<AdapterRegistry>,
        state: Arc<dyn StateStore>,
        secrets: SecretBroker,
        event_log: Arc<dyn EventLog>,
        config: OrchestratorConfig,
    ) -> Self {
        let step_executor = Arc::new(StepExecutor::new(
            registry.clone(),
            state.clone(),
            secrets,
            event_log.clone(),
            config.executor.clone(),
        ));

        Self {
            registry,
            state,
            event_log,
            step_executor,
            config,
            probe: None,
        }
    }

    /// Use `probe` for verification instead of the plan's HTTP health signal
    pub fn with_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn state(&self) -> &Arc<dyn StateStore> {
        &self.state
    }

    pub fn event_log(&self) -> &Arc<dyn EventLog> {
        &self.event_log
    }

    /// Compile a manifest and apply it
    pub async fn apply_manifest(
        &self,
        manifest: &Manifest,
        cancel: CancellationToken,
    ) -> Result<RunReport, OrchestratorError> {
        let plan = Plan::from_manifest(manifest)?;
        self.apply(Arc::new(plan), cancel).await
    }

    /// Execute every step not yet Succeeded, then verify health.
    ///
    /// Fails with `StateError::RunInProgress` while another live run holds the
    /// plan's lease.
    pub async fn apply(
        &self,
        plan: Arc<Plan>,
        cancel: CancellationToken,
    ) -> Result<RunReport, OrchestratorError> {
        self.registry.validate(&plan)?;

        let run_id = RunId::new();
        let verifier = self.verifier_for(&plan)?;

        self.state.register_plan(&plan)?;
        let lease = LeaseGuard::acquire(self.state.clone(), &plan, run_id, self.config.lease_ttl)?;
        let result = self.apply_leased(&plan, run_id, verifier, &cancel).await;
        lease.release().await;
        result
    }

    async fn apply_leased(
        &self,
        plan: &Arc<Plan>,
        run_id: RunId,
        verifier: Option<Verifier>,
        cancel: &CancellationToken,
    ) -> Result<RunReport, OrchestratorError> {
        let started = Instant::now();
        self.state.record_run(plan.id(), run_id)?;
        let resumed = self.reset_unfinished(plan)?;

        tracing::info!(
            "Starting run {} for plan {} ({} steps, {} reset for resume)",
            run_id,
            plan.id().short(),
            plan.len(),
            resumed
        );
        self.emit(
            run_id,
            EventType::RunStarted {
                plan_id: plan.id().clone(),
                steps: plan.len(),
            },
        )
        .await;

        let result = self.drive(plan, run_id, cancel).await;
        let (outcome, reused) = match result {
            Ok(done) => done,
            Err(e) => {
                tracing::error!("Run {} aborted: {}", run_id, e);
                self.flush(run_id).await;
                return Err(e);
            }
        };

        let (outcome, verification) = match outcome {
            DriveOutcome::AllSucceeded => match verifier {
                None => (RunOutcome::Succeeded, VerificationReport::NotConfigured),
                Some(verifier) => self.verify(run_id, &verifier, cancel).await,
            },
            DriveOutcome::Failed => (RunOutcome::Failed, VerificationReport::Skipped),
            DriveOutcome::Cancelled => (RunOutcome::Cancelled, VerificationReport::Skipped),
        };

        let duration = started.elapsed();
        self.emit(
            run_id,
            EventType::RunFinished {
                outcome,
                duration_ms: duration.as_millis() as u64,
            },
        )
        .await;
        self.flush(run_id).await;
        tracing::info!("Run {} finished: {} in {:?}", run_id, outcome, duration);

        let steps = self.step_reports(plan, &reused)?;
        Ok(RunReport {
            run_id,
            plan_id: plan.id().clone(),
            outcome,
            steps,
            verification,
            duration,
        })
    }

    /// Reverse Succeeded steps in reverse topological order. Reverted steps go
    /// back to Pending; steps without a reverse action stay Succeeded. Stops at
    /// the first failure.
    pub async fn rollback(
        &self,
        plan: Arc<Plan>,
        cancel: CancellationToken,
    ) -> Result<RollbackReport, OrchestratorError> {
        self.registry.validate(&plan)?;

        let run_id = RunId::new();
        let report = RollbackReport {
            run_id,
            plan_id: plan.id().clone(),
            reverted: Vec::new(),
            unsupported: Vec::new(),
            failed: None,
            cancelled: false,
        };

        if self.state.plan_summary(plan.id())?.is_none() {
            tracing::info!("Plan {} has no recorded state; nothing to roll back", plan.id().short());
            return Ok(report);
        }
        let lease = LeaseGuard::acquire(self.state.clone(), &plan, run_id, self.config.lease_ttl)?;
        let result = self.rollback_leased(&plan, &cancel, report).await;
        lease.release().await;
        result
    }

    async fn rollback_leased(
        &self,
        plan: &Plan,
        cancel: &CancellationToken,
        mut report: RollbackReport,
    ) -> Result<RollbackReport, OrchestratorError> {
        let run_id = report.run_id;
        self.state.record_run(plan.id(), run_id)?;

        tracing::info!("Rolling back plan {} (run {})", plan.id().short(), run_id);
        self.emit(
            run_id,
            EventType::RollbackStarted {
                plan_id: plan.id().clone(),
            },
        )
        .await;

        for step_id in plan.execution_order().iter().rev() {
            let status = match self.state.get_record(plan.id(), step_id)? {
                Some(record) => record.status,
                None => continue,
            };
            if status != StepStatus::Succeeded {
                continue;
            }

            if cancel.is_cancelled() {
                tracing::warn!("Rollback of plan {} cancelled", plan.id().short());
                report.cancelled = true;
                break;
            }

            match self
                .step_executor
                .rollback(plan, run_id, step_id, cancel)
                .await
            {
                Ok(RollbackOutcome::Reverted) => {
                    self.state.transition(
                        plan.id(),
                        step_id,
                        StepStatus::Succeeded,
                        StepStatus::Pending,
                        None,
                    )?;
                    tracing::info!("Rolled back step {}", step_id);
                    self.emit(
                        run_id,
                        EventType::StepRolledBack {
                            step_id: step_id.clone(),
                        },
                    )
                    .await;
                    report.reverted.push(step_id.clone());
                }
                Ok(RollbackOutcome::Unsupported) => {
                    tracing::info!("Step {} has no reverse action; leaving it in place", step_id);
                    self.emit(
                        run_id,
                        EventType::RollbackUnsupported {
                            step_id: step_id.clone(),
                        },
                    )
                    .await;
                    report.unsupported.push(step_id.clone());
                }
                Err(error) => {
                    tracing::error!("Rollback of step {} failed: {}", step_id, error);
                    self.emit(
                        run_id,
                        EventType::RollbackFailed {
                            step_id: step_id.clone(),
                            error: error.to_string(),
                        },
                    )
                    .await;
                    report.failed = Some((step_id.clone(), error.to_string()));
                    break;
                }
            }
        }

        self.flush(run_id).await;
        Ok(report)
    }

    /// Stored summary and records of a plan
    pub fn status(&self, plan_id: &PlanId) -> Result<Option<PlanStatus>, OrchestratorError> {
        let Some(summary) = self.state.plan_summary(plan_id)? else {
            return Ok(None);
        };
        let records = self.state.records(plan_id)?;
        Ok(Some(PlanStatus { summary, records }))
    }

    fn verifier_for(&self, plan: &Plan) -> Result<Option<Verifier>, OrchestratorError> {
        let verifier_config = &self.config.verifier;
        let verifier = match (&self.probe, plan.health()) {
            (Some(probe), health) => Some(Verifier::new(
                probe.clone(),
                health
                    .and_then(|h| h.interval_ms)
                    .map(Duration::from_millis)
                    .unwrap_or(verifier_config.interval),
                health
                    .and_then(|h| h.budget_ms)
                    .map(Duration::from_millis)
                    .unwrap_or(verifier_config.budget),
            )),
            (None, Some(signal)) => Some(Verifier::for_signal(signal, verifier_config)?),
            (None, None) => None,
        };
        Ok(verifier)
    }

    /// Move Failed, Skipped and interrupted Ready/Running records back to Pending.
    /// Only called under the plan's lease, so no live run owns these records.
    fn reset_unfinished(&self, plan: &Plan) -> Result<usize, OrchestratorError> {
        let mut reset = 0;
        for record in self.state.records(plan.id())? {
            if matches!(
                record.status,
                StepStatus::Failed | StepStatus::Skipped | StepStatus::Ready | StepStatus::Running
            ) {
                self.state.transition(
                    plan.id(),
                    &record.step_id,
                    record.status,
                    StepStatus::Pending,
                    None,
                )?;
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn drive(
        &self,
        plan: &Arc<Plan>,
        run_id: RunId,
        cancel: &CancellationToken,
    ) -> Result<(DriveOutcome, HashSet<StepId>), OrchestratorError> {
        let max_in_flight = self.config.max_concurrency.max(1);
        let mut in_flight: JoinSet<(StepId, Result<StepOutcome, OrchestratorError>)> =
            JoinSet::new();
        let mut reused = HashSet::new();

        loop {
            if cancel.is_cancelled() {
                self.cancel_remaining(plan, run_id, &mut in_flight).await?;
                return Ok((DriveOutcome::Cancelled, reused));
            }

            if in_flight.len() < max_in_flight {
                for step_id in self.state.list_ready(plan)? {
                    if in_flight.len() >= max_in_flight {
                        break;
                    }
                    match self.state.transition(
                        plan.id(),
                        &step_id,
                        StepStatus::Pending,
                        StepStatus::Ready,
                        None,
                    ) {
                        Ok(_) => {}
                        Err(StateError::Conflict { .. }) => continue,
                        Err(e) => return Err(e.into()),
                    }
                    self.emit(
                        run_id,
                        EventType::StepReady {
                            step_id: step_id.clone(),
                        },
                    )
                    .await;

                    let executor = self.step_executor.clone();
                    let plan = plan.clone();
                    let cancel = cancel.clone();
                    in_flight.spawn(async move {
                        let outcome = executor.execute(&plan, run_id, &step_id, &cancel).await;
                        (step_id, outcome)
                    });
                }
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                joined = in_flight.join_next() => {
                    let Some(joined) = joined else { continue };
                    let (step_id, outcome) = joined.map_err(|e| {
                        OrchestratorError::Internal(anyhow::anyhow!("step task failed: {}", e))
                    })?;
                    match outcome? {
                        StepOutcome::Succeeded { reused: true, .. } => {
                            reused.insert(step_id);
                        }
                        StepOutcome::Succeeded { .. } | StepOutcome::Cancelled => {}
                        StepOutcome::Failed { error, .. } => {
                            self.skip_dependents(plan, run_id, &step_id, &error).await?;
                        }
                    }
                }
                _ = cancel.cancelled() => {}
            }
        }

        let records = self.state.records(plan.id())?;
        let pending: Vec<StepId> = records
            .iter()
            .filter(|r| r.status == StepStatus::Pending)
            .map(|r| r.step_id.clone())
            .collect();
        if !pending.is_empty() {
            return Err(OrchestratorError::Deadlock { pending });
        }

        let outcome = if records.iter().all(|r| r.status == StepStatus::Succeeded) {
            DriveOutcome::AllSucceeded
        } else {
            DriveOutcome::Failed
        };
        Ok((outcome, reused))
    }

    /// A terminal failure makes every still-Pending transitive dependent Skipped
    async fn skip_dependents(
        &self,
        plan: &Plan,
        run_id: RunId,
        failed: &StepId,
        error: &StepError,
    ) -> Result<(), OrchestratorError> {
        let Some(descendants) = plan.descendants(failed) else {
            return Ok(());
        };

        tracing::warn!(
            "Step {} failed terminally ({}); skipping {} dependent step(s)",
            failed,
            error.kind(),
            descendants.len()
        );

        for step_id in descendants {
            let reason = format!("dependency '{}' failed", failed);
            match self.state.transition(
                plan.id(),
                step_id,
                StepStatus::Pending,
                StepStatus::Skipped,
                Some(FailureDetail::new(ErrorKind::DependencyFailed, &reason, 0)),
            ) {
                Ok(_) => {
                    self.emit(
                        run_id,
                        EventType::StepSkipped {
                            step_id: step_id.clone(),
                            reason,
                        },
                    )
                    .await;
                }
                Err(StateError::Conflict { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Skip all Pending and Ready steps, then wait for in-flight attempts
    async fn cancel_remaining(
        &self,
        plan: &Plan,
        run_id: RunId,
        in_flight: &mut JoinSet<(StepId, Result<StepOutcome, OrchestratorError>)>,
    ) -> Result<(), OrchestratorError> {
        tracing::warn!(
            "Run {} cancelled; waiting for {} in-flight step(s)",
            run_id,
            in_flight.len()
        );
        self.emit(
            run_id,
            EventType::RunCancelled {
                reason: "cancellation requested".to_string(),
            },
        )
        .await;

        for record in self.state.records(plan.id())? {
            if !matches!(record.status, StepStatus::Pending | StepStatus::Ready) {
                continue;
            }
            match self.state.transition(
                plan.id(),
                &record.step_id,
                record.status,
                StepStatus::Skipped,
                Some(FailureDetail::new(
                    ErrorKind::Cancelled,
                    "run cancelled",
                    record.attempts,
                )),
            ) {
                Ok(_) => {
                    self.emit(
                        run_id,
                        EventType::StepSkipped {
                            step_id: record.step_id.clone(),
                            reason: "run cancelled".to_string(),
                        },
                    )
                    .await;
                }
                Err(StateError::Conflict { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        // Results are ignored; attempts already running are allowed to finish
        while let Some(joined) = in_flight.join_next().await {
            if let Ok((step_id, Err(e))) = joined {
                tracing::warn!("Step {} errored during cancellation: {}", step_id, e);
            }
        }
        Ok(())
    }

    async fn verify(
        &self,
        run_id: RunId,
        verifier: &Verifier,
        cancel: &CancellationToken,
    ) -> (RunOutcome, VerificationReport) {
        self.emit(
            run_id,
            EventType::VerificationStarted {
                target: verifier.target(),
            },
        )
        .await;

        match verifier.verify(cancel).await {
            Ok(success) => {
                self.emit(
                    run_id,
                    EventType::VerificationPassed {
                        attempts: success.attempts,
                        elapsed_ms: success.elapsed.as_millis() as u64,
                    },
                )
                .await;
                (
                    RunOutcome::Succeeded,
                    VerificationReport::Passed {
                        attempts: success.attempts,
                        elapsed: success.elapsed,
                    },
                )
            }
            Err(VerificationError::Timeout(timeout)) => {
                tracing::error!("{}", timeout);
                self.emit(
                    run_id,
                    EventType::VerificationTimedOut {
                        attempts: timeout.attempts,
                        elapsed_ms: timeout.elapsed.as_millis() as u64,
                        last_observation: timeout.last_observation.clone(),
                    },
                )
                .await;
                (
                    RunOutcome::VerificationTimedOut,
                    VerificationReport::TimedOut(timeout),
                )
            }
            Err(VerificationError::Cancelled) => {
                self.emit(
                    run_id,
                    EventType::RunCancelled {
                        reason: "cancelled during verification".to_string(),
                    },
                )
                .await;
                (RunOutcome::Cancelled, VerificationReport::Cancelled)
            }
        }
    }

    fn step_reports(
        &self,
        plan: &Plan,
        reused: &HashSet<StepId>,
    ) -> Result<Vec<StepReport>, OrchestratorError> {
        let mut reports = Vec::with_capacity(plan.len());
        for step_id in plan.execution_order() {
            let record = self
                .state
                .get_record(plan.id(), step_id)?
                .ok_or_else(|| StateError::NotFound {
                    plan: plan.id().clone(),
                    step: step_id.clone(),
                })?;
            let kind = plan
                .step(step_id)
                .map(|s| s.kind.clone())
                .unwrap_or_default();
            reports.push(StepReport {
                step_id: step_id.clone(),
                kind,
                status: record.status,
                attempts: record.attempts,
                reused: reused.contains(step_id),
                last_error: record.last_error,
            });
        }
        Ok(reports)
    }

    async fn emit(&self, run_id: RunId, event_type: EventType) {
        if let Err(e) = self.event_log.append(Event::new(run_id, event_type)).await {
            tracing::warn!("Failed to append event for run {}: {:#}", run_id, e);
        }
    }

    async fn flush(&self, run_id: RunId) {
        if let Err(e) = self.event_log.flush_run(run_id).await {
            tracing::warn!("Failed to flush event log for run {}: {:#}", run_id, e);
        }
    }
}

/// Holds a run's lease on a plan and renews it in the background until released
struct LeaseGuard {
    state: Arc<dyn StateStore>,
    plan_id: PlanId,
    run_id: RunId,
    stop: CancellationToken,
    heartbeat: Option<tokio::task::JoinHandle<()>>,
}

impl LeaseGuard {
    fn acquire(
        state: Arc<dyn StateStore>,
        plan: &Plan,
        run_id: RunId,
        ttl: Duration,
    ) -> Result<Self, StateError> {
        let plan_id = plan.id().clone();
        state.acquire_lease(&plan_id, run_id, ttl)?;
        tracing::debug!("Run {} holds the lease on plan {}", run_id, plan_id.short());

        let stop = CancellationToken::new();
        let heartbeat = tokio::spawn({
            let state = state.clone();
            let plan_id = plan_id.clone();
            let stop = stop.clone();
            let every = (ttl / 3).max(Duration::from_millis(10));
            async move {
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(every) => {}
                    }
                    if let Err(e) = state.acquire_lease(&plan_id, run_id, ttl) {
                        tracing::warn!("Run {} failed to renew its lease: {}", run_id, e);
                    }
                }
            }
        });

        Ok(Self {
            state,
            plan_id,
            run_id,
            stop,
            heartbeat: Some(heartbeat),
        })
    }

    /// Stop renewing, then give the lease up
    async fn release(mut self) {
        self.stop.cancel();
        if let Some(heartbeat) = self.heartbeat.take() {
            let _ = heartbeat.await;
        }
        self.give_up();
    }

    fn give_up(&self) {
        if let Err(e) = self.state.release_lease(&self.plan_id, self.run_id) {
            tracing::warn!("Run {} failed to release its lease: {}", self.run_id, e);
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        // Dropped without `release`, e.g. the apply future was cancelled
        if let Some(heartbeat) = self.heartbeat.take() {
            self.stop.cancel();
            heartbeat.abort();
            self.give_up();
        }
    }
}

enum DriveOutcome {
    AllSucceeded,
    Failed,
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;
    use crate::manifest::StepDeclaration;
    use crate::secrets::StaticSecretSource;
    use crate::storage::{MemoryEventLog, MemoryStateStore, RedbStateStore};
    use crate::testing::{plan_of, ScriptedAdapter};
    use crate::verifier::tests::CountingProbe;
    use tempfile::TempDir;

    struct Harness {
        orchestrator: Orchestrator,
        state: Arc<dyn StateStore>,
        events: Arc<MemoryEventLog>,
        adapter: Arc<ScriptedAdapter>,
    }

    fn config(max_concurrency: usize) -> OrchestratorConfig {
        OrchestratorConfig {
            max_concurrency,
            executor: StepExecutorConfig {
                backoff_cap: Duration::from_secs(30),
                jitter: false,
                default_timeout: Duration::from_secs(60),
            },
            verifier: VerifierConfig {
                interval: Duration::from_secs(1),
                budget: Duration::from_secs(10),
                request_timeout: Duration::from_secs(1),
            },
            lease_ttl: Duration::from_secs(30),
        }
    }

    fn harness_with(
        adapter: ScriptedAdapter,
        state: Arc<dyn StateStore>,
        secrets: SecretBroker,
        max_concurrency: usize,
    ) -> Harness {
        let adapter = Arc::new(adapter);
        let mut registry = AdapterRegistry::with_builtins();
        registry.register("scripted", adapter.clone());
        let events = Arc::new(MemoryEventLog::new());
        let orchestrator = Orchestrator::new(
            Arc::new(registry),
            state.clone(),
            secrets,
            events.clone(),
            config(max_concurrency),
        );
        Harness {
            orchestrator,
            state,
            events,
            adapter,
        }
    }

    fn harness(adapter: ScriptedAdapter) -> Harness {
        harness_with(
            adapter,
            Arc::new(MemoryStateStore::new()),
            SecretBroker::new(),
            2,
        )
    }

    fn step(id: &str) -> StepDeclaration {
        StepDeclaration::new(id, "scripted")
    }

    /// The provisioning chain of a typical deployment
    fn deployment_plan() -> Arc<Plan> {
        Arc::new(plan_of(vec![
            step("provision-db"),
            step("import-image"),
            step("create-secret").depends_on(&["provision-db"]),
            step("deploy").depends_on(&["create-secret", "import-image"]),
            step("migrate").depends_on(&["deploy"]),
            step("bootstrap-admin").depends_on(&["migrate"]),
        ]))
    }

    fn position(invocations: &[String], id: &str) -> usize {
        invocations.iter().position(|s| s == id).unwrap()
    }

    #[tokio::test]
    async fn test_apply_runs_in_dependency_order() {
        let h = harness(ScriptedAdapter::new());
        let plan = deployment_plan();

        let report = h
            .orchestrator
            .apply(plan.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.outcome, RunOutcome::Succeeded);
        assert_eq!(report.exit_code(), 0);
        assert!(matches!(report.verification, VerificationReport::NotConfigured));
        assert!(report
            .steps
            .iter()
            .all(|s| s.status == StepStatus::Succeeded && s.attempts == 1));

        let calls = h.adapter.invocations();
        assert_eq!(calls.len(), 6);
        for id in plan.execution_order() {
            for dep in plan.dependencies(id) {
                assert!(position(&calls, dep.as_str()) < position(&calls, id.as_str()));
            }
        }

        let events = h.events.get_run_events(report.run_id).await.unwrap();
        assert!(matches!(
            events.first().map(|e| &e.event_type),
            Some(EventType::RunStarted { steps: 6, .. })
        ));
        assert!(matches!(
            events.last().map(|e| &e.event_type),
            Some(EventType::RunFinished {
                outcome: RunOutcome::Succeeded,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_reapply_invokes_no_adapter() {
        let h = harness(ScriptedAdapter::new());
        let plan = deployment_plan();

        h.orchestrator
            .apply(plan.clone(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(h.adapter.total_calls(), 6);

        let second = h
            .orchestrator
            .apply(plan, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(second.outcome, RunOutcome::Succeeded);
        assert_eq!(h.adapter.total_calls(), 6);
    }

    #[tokio::test]
    async fn test_failed_dependency_skips_dependents() {
        let h = harness(
            ScriptedAdapter::new().always_fail("provision-db", StepError::permanent("quota exceeded")),
        );
        let report = h
            .orchestrator
            .apply(deployment_plan(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.outcome, RunOutcome::Failed);
        assert_eq!(report.exit_code(), 1);
        assert!(matches!(report.verification, VerificationReport::Skipped));

        assert_eq!(report.step("provision-db").unwrap().status, StepStatus::Failed);
        assert_eq!(report.step("import-image").unwrap().status, StepStatus::Succeeded);
        for id in ["create-secret", "deploy", "migrate", "bootstrap-admin"] {
            let step = report.step(id).unwrap();
            assert_eq!(step.status, StepStatus::Skipped, "{}", id);
            assert_eq!(
                step.last_error.as_ref().unwrap().kind,
                ErrorKind::DependencyFailed
            );
            assert_eq!(h.adapter.calls(id), 0);
        }

        // Skipped steps never entered Running
        let record = h
            .state
            .get_record(&report.plan_id, &StepId::new("deploy"))
            .unwrap()
            .unwrap();
        assert!(record
            .transitions
            .iter()
            .all(|t| t.to != StepStatus::Running));
    }

    #[tokio::test]
    async fn test_resume_reruns_only_unfinished_steps() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.redb");
        let plan = deployment_plan();

        {
            let state: Arc<dyn StateStore> = Arc::new(RedbStateStore::new(path.clone()).unwrap());
            let h = harness_with(
                ScriptedAdapter::new().always_fail("migrate", StepError::permanent("bad schema")),
                state,
                SecretBroker::new(),
                2,
            );
            let report = h
                .orchestrator
                .apply(plan.clone(), CancellationToken::new())
                .await
                .unwrap();
            assert_eq!(report.outcome, RunOutcome::Failed);
            assert_eq!(report.step("bootstrap-admin").unwrap().status, StepStatus::Skipped);
        }

        let state: Arc<dyn StateStore> = Arc::new(RedbStateStore::new(path.clone()).unwrap());
        let h = harness_with(ScriptedAdapter::new(), state, SecretBroker::new(), 2);
        let report = h
            .orchestrator
            .apply(plan, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.outcome, RunOutcome::Succeeded);
        assert_eq!(h.adapter.invocations(), vec!["migrate", "bootstrap-admin"]);
        // Attempt counts restart after a reset
        assert_eq!(report.step("migrate").unwrap().attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_bound_and_overlap() {
        let h = harness(ScriptedAdapter::new().with_delay(Duration::from_secs(5)));
        let plan = Arc::new(plan_of(vec![
            step("a"),
            step("b").depends_on(&["a"]),
            step("c").depends_on(&["a"]),
        ]));
        let h = Harness {
            orchestrator: h
                .orchestrator
                .with_probe(Arc::new(CountingProbe::ready_at(2))),
            ..h
        };

        let report = h
            .orchestrator
            .apply(plan, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.outcome, RunOutcome::Succeeded);
        assert!(matches!(
            report.verification,
            VerificationReport::Passed { attempts: 2, .. }
        ));
        assert_eq!(h.adapter.invocations()[0], "a");
        // b and c ran side by side after a
        assert_eq!(h.adapter.max_in_flight(), 2);
        let b = h.adapter.call_times("b")[0];
        let c = h.adapter.call_times("c")[0];
        assert_eq!(b, c);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_of_one_serialises() {
        let h = harness_with(
            ScriptedAdapter::new().with_delay(Duration::from_secs(1)),
            Arc::new(MemoryStateStore::new()),
            SecretBroker::new(),
            1,
        );
        let plan = Arc::new(plan_of(vec![step("a"), step("b"), step("c")]));

        h.orchestrator
            .apply(plan, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(h.adapter.max_in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_verification_timeout_despite_success() {
        let h = harness(ScriptedAdapter::new());
        let h = Harness {
            orchestrator: h.orchestrator.with_probe(Arc::new(CountingProbe::never())),
            ..h
        };

        let report = h
            .orchestrator
            .apply(deployment_plan(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.outcome, RunOutcome::VerificationTimedOut);
        assert_eq!(report.exit_code(), 2);
        assert!(report.steps.iter().all(|s| s.status == StepStatus::Succeeded));
        match report.verification {
            VerificationReport::TimedOut(timeout) => {
                assert_eq!(timeout.elapsed, Duration::from_secs(10));
            }
            other => panic!("unexpected verification {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_secret_fails_consuming_step() {
        let secrets = SecretBroker::new().with_source(Arc::new(
            StaticSecretSource::new().with("registry-token", "tok-very-secret"),
        ));
        let h = harness_with(
            ScriptedAdapter::new(),
            Arc::new(MemoryStateStore::new()),
            secrets,
            2,
        );
        let plan = Arc::new(plan_of(vec![
            step("provision-db"),
            step("create-secret")
                .depends_on(&["provision-db"])
                .secret("registry-token")
                .secret("db-password"),
            step("deploy").depends_on(&["create-secret"]),
        ]));

        let report = h
            .orchestrator
            .apply(plan, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.outcome, RunOutcome::Failed);
        let failed = report.step("create-secret").unwrap();
        assert_eq!(failed.status, StepStatus::Failed);
        let detail = failed.last_error.as_ref().unwrap();
        assert_eq!(detail.kind, ErrorKind::SecretUnavailable);
        assert!(detail.message.contains("db-password"));
        assert_eq!(report.step("deploy").unwrap().status, StepStatus::Skipped);

        let events = serde_json::to_string(&h.events.all().await).unwrap();
        assert!(!events.contains("tok-very-secret"));
    }

    #[tokio::test]
    async fn test_unknown_kind_rejected_before_state_is_touched() {
        let h = harness(ScriptedAdapter::new());
        let plan = Arc::new(plan_of(vec![
            step("a"),
            StepDeclaration::new("b", "apply-manifest").depends_on(&["a"]),
        ]));

        let err = h
            .orchestrator
            .apply(plan.clone(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Validation(ValidationError::UnknownKind { .. })
        ));
        assert!(h.state.plan_summary(plan.id()).unwrap().is_none());
        assert_eq!(h.adapter.total_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_skips_pending_work() {
        let h = harness(ScriptedAdapter::new().with_delay(Duration::from_secs(10)));
        let plan = deployment_plan();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            trigger.cancel();
        });

        let report = h.orchestrator.apply(plan, cancel).await.unwrap();

        assert_eq!(report.outcome, RunOutcome::Cancelled);
        assert_eq!(report.exit_code(), 1);
        // The first wave was allowed to finish
        assert_eq!(report.step("provision-db").unwrap().status, StepStatus::Succeeded);
        assert_eq!(report.step("import-image").unwrap().status, StepStatus::Succeeded);
        for id in ["create-secret", "deploy", "migrate", "bootstrap-admin"] {
            assert_eq!(report.step(id).unwrap().status, StepStatus::Skipped, "{}", id);
        }
        assert_eq!(h.adapter.total_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_driver_refused_while_plan_is_leased() {
        let state: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let first = harness_with(
            ScriptedAdapter::new().with_delay(Duration::from_secs(10)),
            state.clone(),
            SecretBroker::new(),
            2,
        );
        let second = harness_with(ScriptedAdapter::new(), state.clone(), SecretBroker::new(), 2);
        let plan = Arc::new(plan_of(vec![step("provision-db")]));

        let (first_result, second_result) = tokio::join!(
            first.orchestrator.apply(plan.clone(), CancellationToken::new()),
            async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                second
                    .orchestrator
                    .apply(plan.clone(), CancellationToken::new())
                    .await
            }
        );

        let report = first_result.unwrap();
        assert_eq!(report.outcome, RunOutcome::Succeeded);
        match second_result {
            Err(OrchestratorError::State(StateError::RunInProgress { run, .. })) => {
                assert_eq!(run, report.run_id);
            }
            other => panic!("expected the plan to be leased, got {:?}", other),
        }
        assert_eq!(first.adapter.total_calls() + second.adapter.total_calls(), 1);
        assert_eq!(report.step("provision-db").unwrap().attempts, 1);

        // The lease is released with the run, so the second driver may proceed
        assert!(state.plan_summary(plan.id()).unwrap().unwrap().lease.is_none());
        let again = second
            .orchestrator
            .apply(plan, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(again.outcome, RunOutcome::Succeeded);
        assert_eq!(second.adapter.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over() {
        let h = harness(ScriptedAdapter::new());
        let plan = Arc::new(plan_of(vec![step("provision-db")]));
        let step_id = StepId::new("provision-db");

        // A driver that died mid-step: Running record, lease never renewed
        h.state.register_plan(&plan).unwrap();
        h.state
            .acquire_lease(plan.id(), RunId::new(), Duration::ZERO)
            .unwrap();
        h.state
            .transition(plan.id(), &step_id, StepStatus::Pending, StepStatus::Ready, None)
            .unwrap();
        h.state
            .transition(plan.id(), &step_id, StepStatus::Ready, StepStatus::Running, None)
            .unwrap();

        let report = h
            .orchestrator
            .apply(plan.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.outcome, RunOutcome::Succeeded);
        assert_eq!(h.adapter.calls("provision-db"), 1);
        assert!(h.state.plan_summary(plan.id()).unwrap().unwrap().lease.is_none());
    }

    #[tokio::test]
    async fn test_rollback_walks_reverse_order() {
        let h = harness(ScriptedAdapter::new().without_rollback("import-image"));
        let plan = deployment_plan();
        h.orchestrator
            .apply(plan.clone(), CancellationToken::new())
            .await
            .unwrap();

        let report = h
            .orchestrator
            .rollback(plan.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.unsupported, vec![StepId::new("import-image")]);

        let reverted = h.adapter.rolled_back();
        assert_eq!(reverted.len(), 5);
        for id in plan.execution_order() {
            for dep in plan.dependencies(id) {
                if let (Some(dep_pos), Some(id_pos)) = (
                    reverted.iter().position(|s| s == dep.as_str()),
                    reverted.iter().position(|s| s == id.as_str()),
                ) {
                    assert!(id_pos < dep_pos, "{} reverted before {}", dep, id);
                }
            }
        }

        let status = h.orchestrator.status(plan.id()).unwrap().unwrap();
        for record in status.records {
            let expected = if record.step_id.as_str() == "import-image" {
                StepStatus::Succeeded
            } else {
                StepStatus::Pending
            };
            assert_eq!(record.status, expected, "{}", record.step_id);
        }
    }

    #[tokio::test]
    async fn test_rollback_stops_at_first_failure() {
        let h = harness(ScriptedAdapter::new().failing_rollback("deploy"));
        let plan = deployment_plan();
        h.orchestrator
            .apply(plan.clone(), CancellationToken::new())
            .await
            .unwrap();

        let report = h
            .orchestrator
            .rollback(plan.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.failed.as_ref().unwrap().0, StepId::new("deploy"));
        assert_eq!(
            report.reverted,
            vec![StepId::new("bootstrap-admin"), StepId::new("migrate")]
        );
        assert_eq!(
            h.state
                .get_status(plan.id(), &StepId::new("deploy"))
                .unwrap(),
            StepStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn test_rollback_of_unknown_plan_is_empty() {
        let h = harness(ScriptedAdapter::new());
        let report = h
            .orchestrator
            .rollback(deployment_plan(), CancellationToken::new())
            .await
            .unwrap();
        assert!(report.reverted.is_empty());
        assert_eq!(report.exit_code(), 0);
    }
}
