//! Test doubles shared by unit tests

use crate::error::StepError;
use crate::manifest::StepDeclaration;
use crate::registry::{RollbackOutcome, StepAdapter, StepContext, StepOutput};
use crate::secrets::SecretSet;
use crate::types::{GlobalContext, PlanId, RunId, StepId};
use crate::workflow::{Plan, StepSpec};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub(crate) fn test_context() -> GlobalContext {
    GlobalContext {
        region: Some("westeurope".to_string()),
        environment: Some("staging".to_string()),
        ..Default::default()
    }
}

pub(crate) fn plan_of(steps: Vec<StepDeclaration>) -> Plan {
    Plan::compile(&steps, test_context(), None).unwrap()
}

pub(crate) fn single_step(declaration: StepDeclaration) -> StepSpec {
    let id = declaration.id.clone();
    plan_of(vec![declaration]).step(&id).unwrap().clone()
}

pub(crate) fn step_context() -> StepContext {
    StepContext {
        plan_id: PlanId::new("test-plan"),
        run_id: RunId::new(),
        attempt: 1,
        context: test_context(),
        secrets: SecretSet::default(),
        cancel: CancellationToken::new(),
    }
}

enum Script {
    /// Fail the next `n` calls, then succeed
    Times(usize, StepError),
    Always(StepError),
}

/// Adapter whose behaviour is scripted per step id. Records every call.
#[derive(Default)]
pub(crate) struct ScriptedAdapter {
    scripts: Mutex<HashMap<String, Script>>,
    calls: Mutex<Vec<(StepId, Instant)>>,
    rollbacks: Mutex<Vec<StepId>>,
    no_rollback: HashSet<String>,
    failing_rollback: HashSet<String>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedAdapter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn always_fail(self, step: &str, error: StepError) -> Self {
        self.script(step, Script::Always(error))
    }

    pub(crate) fn fail_times(self, step: &str, times: usize, error: StepError) -> Self {
        self.script(step, Script::Times(times, error))
    }

    /// Every invocation takes this long
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn without_rollback(mut self, step: &str) -> Self {
        self.no_rollback.insert(step.to_string());
        self
    }

    pub(crate) fn failing_rollback(mut self, step: &str) -> Self {
        self.failing_rollback.insert(step.to_string());
        self
    }

    fn script(self, step: &str, script: Script) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(step.to_string(), script);
        self
    }

    pub(crate) fn calls(&self, step: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id.as_str() == step)
            .count()
    }

    pub(crate) fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Step ids in invocation order
    pub(crate) fn invocations(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _)| id.to_string())
            .collect()
    }

    pub(crate) fn call_times(&self, step: &str) -> Vec<Instant> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id.as_str() == step)
            .map(|(_, at)| *at)
            .collect()
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn rolled_back(&self) -> Vec<String> {
        self.rollbacks
            .lock()
            .unwrap()
            .iter()
            .map(|id| id.to_string())
            .collect()
    }
}

#[async_trait::async_trait]
impl StepAdapter for ScriptedAdapter {
    async fn execute(&self, step: &StepSpec, _ctx: &StepContext) -> Result<StepOutput, StepError> {
        self.calls
            .lock()
            .unwrap()
            .push((step.id.clone(), Instant::now()));

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(step.id.as_str()) {
            Some(Script::Always(error)) => Err(error.clone()),
            Some(Script::Times(remaining, error)) if *remaining > 0 => {
                *remaining -= 1;
                Err(error.clone())
            }
            _ => Ok(StepOutput::summary(format!("{} done", step.id))),
        }
    }

    async fn rollback(
        &self,
        step: &StepSpec,
        _ctx: &StepContext,
    ) -> Result<RollbackOutcome, StepError> {
        if self.failing_rollback.contains(step.id.as_str()) {
            return Err(StepError::permanent("reverse action failed"));
        }
        if self.no_rollback.contains(step.id.as_str()) {
            return Ok(RollbackOutcome::Unsupported);
        }
        self.rollbacks.lock().unwrap().push(step.id.clone());
        Ok(RollbackOutcome::Reverted)
    }
}
