use crate::types::{
    ExecutionRecord, FailureDetail, PlanId, PlanSummary, RunId, RunLease, StatusChange, StepId,
    StepStatus,
};
use crate::workflow::Plan;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by a [`StateStore`]
#[derive(Debug, Error)]
pub enum StateError {
    /// The stored status did not match the caller's expected prior status
    #[error("conflict on step '{step}': expected {expected}, found {actual}")]
    Conflict {
        step: StepId,
        expected: StepStatus,
        actual: StepStatus,
    },

    #[error("invalid transition for step '{step}': {from} -> {to}")]
    InvalidTransition {
        step: StepId,
        from: StepStatus,
        to: StepStatus,
    },

    #[error("no execution record for step '{step}' in plan {plan}")]
    NotFound { plan: PlanId, step: StepId },

    #[error("plan {0} is not registered")]
    UnknownPlan(PlanId),

    /// Another live run holds the plan's lease
    #[error("plan {plan} is being driven by run {run} (lease expires {expires_at})")]
    RunInProgress {
        plan: PlanId,
        run: RunId,
        expires_at: DateTime<Utc>,
    },

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Durable record of per-step execution status.
///
/// Records are keyed by (plan identity, step id). All status changes go through
/// [`StateStore::transition`], a compare-and-swap on the stored status.
pub trait StateStore: Send + Sync {
    /// Create Pending records for steps that have none yet and upsert the plan summary
    fn register_plan(&self, plan: &Plan) -> Result<PlanSummary, StateError>;

    /// Remember the latest run against a plan
    fn record_run(&self, plan_id: &PlanId, run_id: RunId) -> Result<(), StateError>;

    fn plan_summary(&self, plan_id: &PlanId) -> Result<Option<PlanSummary>, StateError>;

    /// All registered plans, most recently updated first
    fn list_plans(&self) -> Result<Vec<PlanSummary>, StateError>;

    fn get_record(
        &self,
        plan_id: &PlanId,
        step_id: &StepId,
    ) -> Result<Option<ExecutionRecord>, StateError>;

    /// All records of a plan, sorted by step id
    fn records(&self, plan_id: &PlanId) -> Result<Vec<ExecutionRecord>, StateError>;

    /// Compare-and-swap `from` -> `to`, attaching `failure` when given
    fn transition(
        &self,
        plan_id: &PlanId,
        step_id: &StepId,
        from: StepStatus,
        to: StepStatus,
        failure: Option<FailureDetail>,
    ) -> Result<ExecutionRecord, StateError>;

    /// Claim the plan for `run_id` until `ttl` from now. Renewing a lease the run
    /// already holds always succeeds; a live lease of another run is
    /// `StateError::RunInProgress`.
    fn acquire_lease(
        &self,
        plan_id: &PlanId,
        run_id: RunId,
        ttl: Duration,
    ) -> Result<RunLease, StateError>;

    /// Drop the lease if `run_id` still holds it
    fn release_lease(&self, plan_id: &PlanId, run_id: RunId) -> Result<(), StateError>;

    /// Delete every record and the summary of a plan; returns the number of records removed
    fn purge(&self, plan_id: &PlanId) -> Result<usize, StateError>;

    fn get_status(&self, plan_id: &PlanId, step_id: &StepId) -> Result<StepStatus, StateError> {
        self.get_record(plan_id, step_id)?
            .map(|record| record.status)
            .ok_or_else(|| StateError::NotFound {
                plan: plan_id.clone(),
                step: step_id.clone(),
            })
    }

    /// Steps that are Pending and whose dependencies are all Succeeded, in execution order
    fn list_ready(&self, plan: &Plan) -> Result<Vec<StepId>, StateError> {
        let statuses: HashMap<StepId, StepStatus> = self
            .records(plan.id())?
            .into_iter()
            .map(|record| (record.step_id, record.status))
            .collect();

        let ready = plan
            .execution_order()
            .iter()
            .filter(|step_id| statuses.get(*step_id) == Some(&StepStatus::Pending))
            .filter(|step_id| {
                plan.dependencies(step_id)
                    .iter()
                    .all(|dep| statuses.get(dep) == Some(&StepStatus::Succeeded))
            })
            .cloned()
            .collect();

        Ok(ready)
    }

    /// A Succeeded step of the same plan carrying `idempotency_key`, if any
    fn find_succeeded_by_key(
        &self,
        plan_id: &PlanId,
        idempotency_key: &str,
    ) -> Result<Option<StepId>, StateError> {
        Ok(self
            .records(plan_id)?
            .into_iter()
            .find(|record| {
                record.status == StepStatus::Succeeded && record.idempotency_key == idempotency_key
            })
            .map(|record| record.step_id))
    }
}

/// Apply a compare-and-swap transition to a record in place
pub(crate) fn apply_transition(
    record: &mut ExecutionRecord,
    from: StepStatus,
    to: StepStatus,
    failure: Option<FailureDetail>,
) -> Result<(), StateError> {
    if record.status != from {
        return Err(StateError::Conflict {
            step: record.step_id.clone(),
            expected: from,
            actual: record.status,
        });
    }
    if !from.can_transition_to(to) {
        return Err(StateError::InvalidTransition {
            step: record.step_id.clone(),
            from,
            to,
        });
    }

    let now = Utc::now();
    match to {
        StepStatus::Running => record.attempts += 1,
        StepStatus::Pending => record.attempts = 0,
        StepStatus::Succeeded => record.last_error = None,
        _ => {}
    }
    if failure.is_some() {
        record.last_error = failure;
    }
    record.status = to;
    record.updated_at = now;
    record.transitions.push(StatusChange { from, to, at: now });
    Ok(())
}

/// Take or renew the lease on `summary` for `run_id`
pub(crate) fn claim_lease(
    summary: &mut PlanSummary,
    run_id: RunId,
    ttl: Duration,
) -> Result<RunLease, StateError> {
    let now = Utc::now();
    if let Some(held) = summary.lease {
        if held.run_id != run_id && held.is_live(now) {
            return Err(StateError::RunInProgress {
                plan: summary.plan_id.clone(),
                run: held.run_id,
                expires_at: held.expires_at,
            });
        }
    }

    let ttl = chrono::Duration::from_std(ttl)
        .map_err(|e| StateError::Storage(anyhow::anyhow!("invalid lease duration: {}", e)))?;
    let lease = RunLease {
        run_id,
        expires_at: now + ttl,
    };
    summary.lease = Some(lease);
    Ok(lease)
}

/// Clear the lease on `summary` if `run_id` holds it; true when it changed
pub(crate) fn clear_lease(summary: &mut PlanSummary, run_id: RunId) -> bool {
    if summary.lease.is_some_and(|held| held.run_id == run_id) {
        summary.lease = None;
        return true;
    }
    false
}

/// Build the records a plan is missing, plus its refreshed summary
pub(crate) fn plan_registration(
    plan: &Plan,
    existing: Option<PlanSummary>,
    has_record: impl Fn(&StepId) -> bool,
) -> (Vec<ExecutionRecord>, PlanSummary) {
    let missing = plan
        .steps()
        .filter(|step| !has_record(&step.id))
        .map(|step| {
            ExecutionRecord::pending(
                plan.id().clone(),
                step.id.clone(),
                step.idempotency_key.clone(),
            )
        })
        .collect();

    let now = Utc::now();
    let summary = match existing {
        Some(mut summary) => {
            summary.steps = plan.execution_order().to_vec();
            summary.updated_at = now;
            summary
        }
        None => PlanSummary {
            plan_id: plan.id().clone(),
            steps: plan.execution_order().to_vec(),
            created_at: now,
            updated_at: now,
            last_run: None,
            lease: None,
        },
    };

    (missing, summary)
}

#[derive(Default)]
struct MemoryState {
    records: BTreeMap<(PlanId, StepId), ExecutionRecord>,
    plans: HashMap<PlanId, PlanSummary>,
}

/// In-process state store; transitions are serialised by a mutex
#[derive(Default)]
pub struct MemoryStateStore {
    inner: Mutex<MemoryState>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, StateError> {
        self.inner
            .lock()
            .map_err(|_| StateError::Storage(anyhow::anyhow!("state store lock poisoned")))
    }
}

impl StateStore for MemoryStateStore {
    fn register_plan(&self, plan: &Plan) -> Result<PlanSummary, StateError> {
        let mut state = self.lock()?;
        let existing = state.plans.get(plan.id()).cloned();
        let (missing, summary) = plan_registration(plan, existing, |step_id| {
            state
                .records
                .contains_key(&(plan.id().clone(), step_id.clone()))
        });
        for record in missing {
            state
                .records
                .insert((record.plan_id.clone(), record.step_id.clone()), record);
        }
        state.plans.insert(plan.id().clone(), summary.clone());
        Ok(summary)
    }

    fn record_run(&self, plan_id: &PlanId, run_id: RunId) -> Result<(), StateError> {
        let mut state = self.lock()?;
        if let Some(summary) = state.plans.get_mut(plan_id) {
            summary.last_run = Some(run_id);
            summary.updated_at = Utc::now();
        }
        Ok(())
    }

    fn plan_summary(&self, plan_id: &PlanId) -> Result<Option<PlanSummary>, StateError> {
        Ok(self.lock()?.plans.get(plan_id).cloned())
    }

    fn list_plans(&self) -> Result<Vec<PlanSummary>, StateError> {
        let mut plans: Vec<PlanSummary> = self.lock()?.plans.values().cloned().collect();
        plans.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(plans)
    }

    fn get_record(
        &self,
        plan_id: &PlanId,
        step_id: &StepId,
    ) -> Result<Option<ExecutionRecord>, StateError> {
        Ok(self
            .lock()?
            .records
            .get(&(plan_id.clone(), step_id.clone()))
            .cloned())
    }

    fn records(&self, plan_id: &PlanId) -> Result<Vec<ExecutionRecord>, StateError> {
        Ok(self
            .lock()?
            .records
            .iter()
            .filter(|((plan, _), _)| plan == plan_id)
            .map(|(_, record)| record.clone())
            .collect())
    }

    fn transition(
        &self,
        plan_id: &PlanId,
        step_id: &StepId,
        from: StepStatus,
        to: StepStatus,
        failure: Option<FailureDetail>,
    ) -> Result<ExecutionRecord, StateError> {
        let mut state = self.lock()?;
        let record = state
            .records
            .get_mut(&(plan_id.clone(), step_id.clone()))
            .ok_or_else(|| StateError::NotFound {
                plan: plan_id.clone(),
                step: step_id.clone(),
            })?;
        apply_transition(record, from, to, failure)?;
        Ok(record.clone())
    }

    fn acquire_lease(
        &self,
        plan_id: &PlanId,
        run_id: RunId,
        ttl: Duration,
    ) -> Result<RunLease, StateError> {
        let mut state = self.lock()?;
        let summary = state
            .plans
            .get_mut(plan_id)
            .ok_or_else(|| StateError::UnknownPlan(plan_id.clone()))?;
        claim_lease(summary, run_id, ttl)
    }

    fn release_lease(&self, plan_id: &PlanId, run_id: RunId) -> Result<(), StateError> {
        let mut state = self.lock()?;
        if let Some(summary) = state.plans.get_mut(plan_id) {
            clear_lease(summary, run_id);
        }
        Ok(())
    }

    fn purge(&self, plan_id: &PlanId) -> Result<usize, StateError> {
        let mut state = self.lock()?;
        let before = state.records.len();
        state.records.retain(|(plan, _), _| plan != plan_id);
        state.plans.remove(plan_id);
        Ok(before - state.records.len())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::manifest::StepDeclaration;
    use crate::types::{ErrorKind, GlobalContext};

    pub(crate) fn diamond_plan() -> Plan {
        Plan::compile(
            &[
                StepDeclaration::new("a", "noop"),
                StepDeclaration::new("b", "noop").depends_on(&["a"]),
                StepDeclaration::new("c", "noop").depends_on(&["a"]),
                StepDeclaration::new("d", "noop").depends_on(&["b", "c"]),
            ],
            GlobalContext::default(),
            None,
        )
        .unwrap()
    }

    /// Behaviour every StateStore implementation must share
    pub(crate) fn exercise_store(store: &dyn StateStore) {
        let plan = diamond_plan();
        let id = plan.id().clone();
        let a = StepId::new("a");
        let b = StepId::new("b");

        let summary = store.register_plan(&plan).unwrap();
        assert_eq!(summary.steps.len(), 4);
        assert_eq!(store.records(&id).unwrap().len(), 4);
        assert_eq!(store.get_status(&id, &a).unwrap(), StepStatus::Pending);
        assert_eq!(store.list_ready(&plan).unwrap(), vec![a.clone()]);

        // Compare-and-swap rejects a stale expectation
        let conflict = store.transition(&id, &a, StepStatus::Ready, StepStatus::Running, None);
        assert!(matches!(conflict, Err(StateError::Conflict { .. })));

        // Edges outside the state machine are rejected
        let invalid = store.transition(&id, &a, StepStatus::Pending, StepStatus::Succeeded, None);
        assert!(matches!(invalid, Err(StateError::InvalidTransition { .. })));

        store
            .transition(&id, &a, StepStatus::Pending, StepStatus::Ready, None)
            .unwrap();
        let running = store
            .transition(&id, &a, StepStatus::Ready, StepStatus::Running, None)
            .unwrap();
        assert_eq!(running.attempts, 1);

        let failed = store
            .transition(
                &id,
                &a,
                StepStatus::Running,
                StepStatus::Failed,
                Some(FailureDetail::new(ErrorKind::Transient, "throttled", 1)),
            )
            .unwrap();
        assert_eq!(failed.last_error.as_ref().unwrap().kind, ErrorKind::Transient);

        store
            .transition(&id, &a, StepStatus::Failed, StepStatus::Running, None)
            .unwrap();
        let succeeded = store
            .transition(&id, &a, StepStatus::Running, StepStatus::Succeeded, None)
            .unwrap();
        assert_eq!(succeeded.attempts, 2);
        assert!(succeeded.last_error.is_none());
        assert_eq!(succeeded.transitions.len(), 5);

        let mut ready = store.list_ready(&plan).unwrap();
        ready.sort();
        assert_eq!(ready, vec![b.clone(), StepId::new("c")]);

        let key = plan.step(&a).unwrap().idempotency_key.clone();
        assert_eq!(store.find_succeeded_by_key(&id, &key).unwrap(), Some(a.clone()));
        assert_eq!(
            store
                .find_succeeded_by_key(&PlanId::new("other"), &key)
                .unwrap(),
            None
        );

        // Registering again keeps existing progress
        store.register_plan(&plan).unwrap();
        assert_eq!(store.get_status(&id, &a).unwrap(), StepStatus::Succeeded);

        let run_id = RunId::new();
        store.record_run(&id, run_id).unwrap();
        assert_eq!(
            store.plan_summary(&id).unwrap().unwrap().last_run,
            Some(run_id)
        );
        assert_eq!(store.list_plans().unwrap().len(), 1);

        // One live lease per plan; expired leases can be taken over
        let other_run = RunId::new();
        let lease = store
            .acquire_lease(&id, run_id, Duration::from_secs(60))
            .unwrap();
        assert_eq!(lease.run_id, run_id);
        assert!(matches!(
            store.acquire_lease(&id, other_run, Duration::from_secs(60)),
            Err(StateError::RunInProgress { run, .. }) if run == run_id
        ));
        store
            .acquire_lease(&id, run_id, Duration::from_secs(120))
            .unwrap();
        store.release_lease(&id, other_run).unwrap();
        assert!(store.plan_summary(&id).unwrap().unwrap().lease.is_some());
        store.release_lease(&id, run_id).unwrap();
        assert!(store.plan_summary(&id).unwrap().unwrap().lease.is_none());

        store.acquire_lease(&id, run_id, Duration::ZERO).unwrap();
        let taken = store
            .acquire_lease(&id, other_run, Duration::from_secs(60))
            .unwrap();
        assert_eq!(taken.run_id, other_run);
        store.release_lease(&id, other_run).unwrap();
        assert!(matches!(
            store.acquire_lease(&PlanId::new("other"), run_id, Duration::from_secs(1)),
            Err(StateError::UnknownPlan(_))
        ));

        // Reset clears the attempt count
        let reset = store
            .transition(&id, &a, StepStatus::Succeeded, StepStatus::Pending, None)
            .unwrap();
        assert_eq!(reset.attempts, 0);

        assert_eq!(store.purge(&id).unwrap(), 4);
        assert!(store.records(&id).unwrap().is_empty());
        assert!(store.plan_summary(&id).unwrap().is_none());
        assert!(matches!(
            store.get_status(&id, &a),
            Err(StateError::NotFound { .. })
        ));
    }

    #[test]
    fn test_memory_state_store() {
        let store = MemoryStateStore::new();
        exercise_store(&store);
    }

    #[test]
    fn test_concurrent_cas_has_single_winner() {
        let store = std::sync::Arc::new(MemoryStateStore::new());
        let plan = diamond_plan();
        store.register_plan(&plan).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let plan_id = plan.id().clone();
                std::thread::spawn(move || {
                    store
                        .transition(
                            &plan_id,
                            &StepId::new("a"),
                            StepStatus::Pending,
                            StepStatus::Ready,
                            None,
                        )
                        .is_ok()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
