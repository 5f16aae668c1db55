use super::backoff::Backoff;
use super::dag::{Plan, StepSpec};
use crate::error::{OrchestratorError, StepError, ValidationError};
use crate::events::{Event, EventLog, EventType};
use crate::registry::{AdapterRegistry, RollbackOutcome, StepAdapter, StepContext, StepOutput};
use crate::secrets::{SecretBroker, SecretSet};
use crate::storage::{StateError, StateStore};
use crate::types::{FailureDetail, RunId, StepId, StepStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

/// Tunables shared by every step of a run
#[derive(Debug, Clone)]
pub struct StepExecutorConfig {
    /// Upper bound on a single backoff delay
    pub backoff_cap: Duration,
    pub jitter: bool,
    /// Applied to steps that declare no timeout
    pub default_timeout: Duration,
}

impl Default for StepExecutorConfig {
    fn default() -> Self {
        Self {
            backoff_cap: Duration::from_secs(60),
            jitter: true,
            default_timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// How a step left the executor
#[derive(Debug, Clone)]
pub enum StepOutcome {
    Succeeded {
        attempts: u32,
        /// Satisfied by an earlier success with the same idempotency key
        reused: bool,
    },
    Failed {
        attempts: u32,
        error: StepError,
    },
    /// The run was cancelled before the step could finish
    Cancelled,
}

/// Runs one ready step to a terminal state, retrying with backoff
pub struct StepExecutor {
    registry: Arc<AdapterRegistry>,
    state: Arc<dyn StateStore>,
    secrets: SecretBroker,
    event_log: Arc<dyn EventLog>,
    config: StepExecutorConfig,
}

impl StepExecutor {
    pub fn new(
        registry: Arc<AdapterRegistry>,
        state: Arc<dyn StateStore>,
        secrets: SecretBroker,
        event_log: Arc<dyn EventLog>,
        config: StepExecutorConfig,
    ) -> Self {
        Self {
            registry,
            state,
            secrets,
            event_log,
            config,
        }
    }

    pub fn config(&self) -> &StepExecutorConfig {
        &self.config
    }

    /// Execute a step that the controller has moved to Ready
    pub async fn execute(
        &self,
        plan: &Plan,
        run_id: RunId,
        step_id: &StepId,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, OrchestratorError> {
        let step = lookup_step(plan, step_id)?;
        let plan_id = plan.id();

        // Idempotent short-circuit
        if let Some(satisfied_by) = self
            .state
            .find_succeeded_by_key(plan_id, &step.idempotency_key)?
        {
            self.state.transition(
                plan_id,
                step_id,
                StepStatus::Ready,
                StepStatus::Succeeded,
                None,
            )?;
            tracing::info!(
                "Step {} already satisfied by {} (key {})",
                step_id,
                satisfied_by,
                step.idempotency_key
            );
            self.emit(
                run_id,
                EventType::StepReused {
                    step_id: step_id.clone(),
                    idempotency_key: step.idempotency_key.clone(),
                    satisfied_by,
                },
            )
            .await;
            return Ok(StepOutcome::Succeeded {
                attempts: 0,
                reused: true,
            });
        }

        let adapter = self
            .registry
            .get(&step.kind)
            .ok_or_else(|| ValidationError::UnknownKind {
                step: step.id.clone(),
                kind: step.kind.clone(),
            })?;

        let mut backoff = Backoff::new(&step.retry, self.config.backoff_cap, self.config.jitter);
        let mut from = StepStatus::Ready;

        loop {
            if cancel.is_cancelled() {
                return Ok(StepOutcome::Cancelled);
            }

            let record = match self.state.transition(
                plan_id,
                step_id,
                from,
                StepStatus::Running,
                None,
            ) {
                Ok(record) => record,
                // The controller skipped us while cancelling
                Err(StateError::Conflict { .. }) if cancel.is_cancelled() => {
                    return Ok(StepOutcome::Cancelled)
                }
                Err(e) => return Err(e.into()),
            };
            let attempt = record.attempts;

            tracing::info!(
                "Executing step {} (attempt {}/{}) for run {}",
                step_id,
                attempt,
                step.retry.max_attempts,
                run_id
            );
            self.emit(
                run_id,
                EventType::StepStarted {
                    step_id: step_id.clone(),
                    attempt,
                },
            )
            .await;

            let start = Instant::now();
            let (result, secrets) = self
                .attempt(plan, run_id, step, attempt, cancel, adapter.as_ref())
                .await;

            match result {
                Ok(output) => {
                    self.state.transition(
                        plan_id,
                        step_id,
                        StepStatus::Running,
                        StepStatus::Succeeded,
                        None,
                    )?;
                    let duration = start.elapsed();
                    tracing::info!("Step {} succeeded in {:?}", step_id, duration);
                    self.emit(
                        run_id,
                        EventType::StepSucceeded {
                            step_id: step_id.clone(),
                            attempt,
                            duration_ms: duration.as_millis() as u64,
                            output: output.summary.map(|s| secrets.redact(&s)),
                        },
                    )
                    .await;
                    return Ok(StepOutcome::Succeeded {
                        attempts: attempt,
                        reused: false,
                    });
                }
                Err(error) => {
                    let error = error.map_message(|m| secrets.redact(m));
                    let will_retry = error.is_retryable()
                        && attempt < step.retry.max_attempts
                        && !cancel.is_cancelled();

                    self.state.transition(
                        plan_id,
                        step_id,
                        StepStatus::Running,
                        StepStatus::Failed,
                        Some(FailureDetail::new(error.kind(), error.to_string(), attempt)),
                    )?;
                    tracing::warn!(
                        "Step {} failed on attempt {}: {} (retry: {})",
                        step_id,
                        attempt,
                        error,
                        will_retry
                    );
                    self.emit(
                        run_id,
                        EventType::StepFailed {
                            step_id: step_id.clone(),
                            kind: error.kind(),
                            error: error.to_string(),
                            attempt,
                            will_retry,
                        },
                    )
                    .await;

                    if !will_retry {
                        return Ok(StepOutcome::Failed {
                            attempts: attempt,
                            error,
                        });
                    }

                    let delay = backoff.next_delay();
                    self.emit(
                        run_id,
                        EventType::StepRetryScheduled {
                            step_id: step_id.clone(),
                            delay_ms: delay.as_millis() as u64,
                            next_attempt: attempt + 1,
                        },
                    )
                    .await;

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            tracing::warn!("Retry of step {} abandoned: run cancelled", step_id);
                            return Ok(StepOutcome::Cancelled);
                        }
                    }
                    from = StepStatus::Failed;
                }
            }
        }
    }

    /// Invoke the adapter's reverse action for a step
    pub async fn rollback(
        &self,
        plan: &Plan,
        run_id: RunId,
        step_id: &StepId,
        cancel: &CancellationToken,
    ) -> Result<RollbackOutcome, StepError> {
        let step = plan
            .step(step_id)
            .ok_or_else(|| StepError::permanent(format!("step '{}' is not in the plan", step_id)))?;
        let adapter = self.registry.get(&step.kind).ok_or_else(|| {
            StepError::permanent(format!("action kind '{}' is not registered", step.kind))
        })?;

        let secrets = self.secrets.resolve_all(&step.secrets).await?;
        let ctx = self.step_context(plan, run_id, 0, secrets.clone(), cancel);
        let limit = step.timeout.unwrap_or(self.config.default_timeout);

        match timeout(limit, adapter.rollback(step, &ctx)).await {
            Ok(result) => result.map_err(|e| e.map_message(|m| secrets.redact(m))),
            Err(_) => Err(StepError::TimedOut(limit)),
        }
    }

    /// One adapter invocation. Returns the secrets so the caller can mask with them.
    async fn attempt(
        &self,
        plan: &Plan,
        run_id: RunId,
        step: &StepSpec,
        attempt: u32,
        cancel: &CancellationToken,
        adapter: &dyn StepAdapter,
    ) -> (Result<StepOutput, StepError>, SecretSet) {
        let secrets = match self.secrets.resolve_all(&step.secrets).await {
            Ok(secrets) => secrets,
            Err(e) => return (Err(e.into()), SecretSet::default()),
        };

        let ctx = self.step_context(plan, run_id, attempt, secrets.clone(), cancel);
        let limit = step.timeout.unwrap_or(self.config.default_timeout);

        let result = match timeout(limit, adapter.execute(step, &ctx)).await {
            Ok(result) => result,
            Err(_) => Err(StepError::TimedOut(limit)),
        };
        (result, secrets)
    }

    fn step_context(
        &self,
        plan: &Plan,
        run_id: RunId,
        attempt: u32,
        secrets: SecretSet,
        cancel: &CancellationToken,
    ) -> StepContext {
        StepContext {
            plan_id: plan.id().clone(),
            run_id,
            attempt,
            context: plan.context().clone(),
            secrets,
            cancel: cancel.clone(),
        }
    }

    async fn emit(&self, run_id: RunId, event_type: EventType) {
        if let Err(e) = self.event_log.append(Event::new(run_id, event_type)).await {
            tracing::warn!("Failed to append event for run {}: {:#}", run_id, e);
        }
    }
}

fn lookup_step<'a>(plan: &'a Plan, step_id: &StepId) -> Result<&'a StepSpec, OrchestratorError> {
    plan.step(step_id).ok_or_else(|| {
        OrchestratorError::Internal(anyhow::anyhow!(
            "step '{}' is not part of plan {}",
            step_id,
            plan.id()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SecretUnavailable;
    use crate::events::EventType;
    use crate::manifest::StepDeclaration;
    use crate::secrets::StaticSecretSource;
    use crate::storage::{MemoryEventLog, MemoryStateStore};
    use crate::testing::{plan_of, ScriptedAdapter};
    use crate::types::ErrorKind;

    struct Harness {
        executor: StepExecutor,
        state: Arc<MemoryStateStore>,
        events: Arc<MemoryEventLog>,
        adapter: Arc<ScriptedAdapter>,
    }

    fn harness(adapter: ScriptedAdapter, secrets: SecretBroker) -> Harness {
        let adapter = Arc::new(adapter);
        let mut registry = AdapterRegistry::new();
        registry.register("scripted", adapter.clone());
        let state = Arc::new(MemoryStateStore::new());
        let events = Arc::new(MemoryEventLog::new());
        let executor = StepExecutor::new(
            Arc::new(registry),
            state.clone(),
            secrets,
            events.clone(),
            StepExecutorConfig {
                backoff_cap: Duration::from_secs(10),
                jitter: false,
                default_timeout: Duration::from_secs(5),
            },
        );
        Harness {
            executor,
            state,
            events,
            adapter,
        }
    }

    fn make_ready(state: &MemoryStateStore, plan: &Plan, id: &str) {
        state.register_plan(plan).unwrap();
        state
            .transition(
                plan.id(),
                &StepId::new(id),
                StepStatus::Pending,
                StepStatus::Ready,
                None,
            )
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_exhaust_attempts() {
        let h = harness(
            ScriptedAdapter::new().always_fail("deploy", StepError::transient("throttled")),
            SecretBroker::new(),
        );
        let plan = plan_of(vec![StepDeclaration::new("deploy", "scripted").retry(3, 100)]);
        make_ready(&h.state, &plan, "deploy");

        let outcome = h
            .executor
            .execute(&plan, RunId::new(), &StepId::new("deploy"), &CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(outcome, StepOutcome::Failed { attempts: 3, .. }));
        assert_eq!(h.adapter.calls("deploy"), 3);

        let times = h.adapter.call_times("deploy");
        let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(gaps.len(), 2);
        assert!(gaps[0] >= Duration::from_millis(100));
        assert!(gaps[1] >= Duration::from_millis(200));
        assert!(gaps[1] >= gaps[0]);

        let record = h
            .state
            .get_record(plan.id(), &StepId::new("deploy"))
            .unwrap()
            .unwrap();
        assert_eq!(record.status, StepStatus::Failed);
        assert_eq!(record.attempts, 3);
        assert_eq!(record.last_error.unwrap().kind, ErrorKind::Transient);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_is_not_retried() {
        let h = harness(
            ScriptedAdapter::new().always_fail("deploy", StepError::permanent("bad request")),
            SecretBroker::new(),
        );
        let plan = plan_of(vec![StepDeclaration::new("deploy", "scripted").retry(5, 100)]);
        make_ready(&h.state, &plan, "deploy");

        let outcome = h
            .executor
            .execute(&plan, RunId::new(), &StepId::new("deploy"), &CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(outcome, StepOutcome::Failed { attempts: 1, .. }));
        assert_eq!(h.adapter.calls("deploy"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failure() {
        let h = harness(
            ScriptedAdapter::new().fail_times("deploy", 1, StepError::transient("503")),
            SecretBroker::new(),
        );
        let plan = plan_of(vec![StepDeclaration::new("deploy", "scripted").retry(3, 50)]);
        make_ready(&h.state, &plan, "deploy");

        let outcome = h
            .executor
            .execute(&plan, RunId::new(), &StepId::new("deploy"), &CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            StepOutcome::Succeeded {
                attempts: 2,
                reused: false
            }
        ));
        let record = h
            .state
            .get_record(plan.id(), &StepId::new("deploy"))
            .unwrap()
            .unwrap();
        assert_eq!(record.status, StepStatus::Succeeded);
        assert!(record.last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_transient() {
        let h = harness(
            ScriptedAdapter::new().with_delay(Duration::from_secs(60)),
            SecretBroker::new(),
        );
        let mut declaration = StepDeclaration::new("deploy", "scripted").retry(2, 10);
        declaration.timeout_ms = Some(1_000);
        let plan = plan_of(vec![declaration]);
        make_ready(&h.state, &plan, "deploy");

        let outcome = h
            .executor
            .execute(&plan, RunId::new(), &StepId::new("deploy"), &CancellationToken::new())
            .await
            .unwrap();

        match outcome {
            StepOutcome::Failed { attempts, error } => {
                assert_eq!(attempts, 2);
                assert_eq!(error.kind(), ErrorKind::Timeout);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_secret_names_secret_only() {
        let broker = SecretBroker::new().with_source(Arc::new(
            StaticSecretSource::new().with("registry-token", "tok-abc"),
        ));
        let h = harness(ScriptedAdapter::new(), broker);
        let plan = plan_of(vec![StepDeclaration::new("create-secret", "scripted")
            .secret("registry-token")
            .secret("db-password")
            .retry(3, 10)]);
        make_ready(&h.state, &plan, "create-secret");

        let outcome = h
            .executor
            .execute(
                &plan,
                RunId::new(),
                &StepId::new("create-secret"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        match outcome {
            StepOutcome::Failed { attempts, error } => {
                assert_eq!(attempts, 1);
                match &error {
                    StepError::Secret(SecretUnavailable { name, .. }) => {
                        assert_eq!(name, "db-password")
                    }
                    other => panic!("unexpected error {:?}", other),
                }
                assert!(!error.to_string().contains("tok-abc"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        // The adapter is never reached without its secrets
        assert_eq!(h.adapter.calls("create-secret"), 0);

        let record = h
            .state
            .get_record(plan.id(), &StepId::new("create-secret"))
            .unwrap()
            .unwrap();
        let failure = record.last_error.unwrap();
        assert_eq!(failure.kind, ErrorKind::SecretUnavailable);
        assert!(failure.message.contains("db-password"));
    }

    #[tokio::test]
    async fn test_adapter_errors_are_masked() {
        let broker = SecretBroker::new().with_source(Arc::new(
            StaticSecretSource::new().with("db-password", "pa55word"),
        ));
        let h = harness(
            ScriptedAdapter::new()
                .always_fail("migrate", StepError::permanent("login failed for pa55word")),
            broker,
        );
        let plan = plan_of(vec![
            StepDeclaration::new("migrate", "scripted").secret("db-password")
        ]);
        make_ready(&h.state, &plan, "migrate");
        let run_id = RunId::new();

        h.executor
            .execute(&plan, run_id, &StepId::new("migrate"), &CancellationToken::new())
            .await
            .unwrap();

        let record = h
            .state
            .get_record(plan.id(), &StepId::new("migrate"))
            .unwrap()
            .unwrap();
        let serialized = serde_json::to_string(&record).unwrap();
        assert!(!serialized.contains("pa55word"));
        assert!(serialized.contains("[REDACTED]"));

        let events = serde_json::to_string(&h.events.get_run_events(run_id).await.unwrap())
            .unwrap();
        assert!(!events.contains("pa55word"));
    }

    #[tokio::test]
    async fn test_idempotency_key_short_circuits() {
        let h = harness(ScriptedAdapter::new(), SecretBroker::new());
        let mut first = StepDeclaration::new("import-api", "scripted");
        first.idempotency_key = Some("image:api:1.4.2".to_string());
        let mut second = StepDeclaration::new("import-api-again", "scripted").depends_on(&["import-api"]);
        second.idempotency_key = Some("image:api:1.4.2".to_string());
        let plan = plan_of(vec![first, second]);

        make_ready(&h.state, &plan, "import-api");
        let run_id = RunId::new();
        h.executor
            .execute(&plan, run_id, &StepId::new("import-api"), &CancellationToken::new())
            .await
            .unwrap();

        h.state
            .transition(
                plan.id(),
                &StepId::new("import-api-again"),
                StepStatus::Pending,
                StepStatus::Ready,
                None,
            )
            .unwrap();
        let outcome = h
            .executor
            .execute(
                &plan,
                run_id,
                &StepId::new("import-api-again"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(matches!(outcome, StepOutcome::Succeeded { reused: true, .. }));
        assert_eq!(h.adapter.calls("import-api-again"), 0);
        assert!(h
            .events
            .get_run_events(run_id)
            .await
            .unwrap()
            .iter()
            .any(|e| matches!(&e.event_type, EventType::StepReused { step_id, .. } if step_id.as_str() == "import-api-again")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_cuts_backoff_short() {
        let h = harness(
            ScriptedAdapter::new().always_fail("deploy", StepError::transient("throttled")),
            SecretBroker::new(),
        );
        let plan = plan_of(vec![StepDeclaration::new("deploy", "scripted").retry(5, 60_000)]);
        make_ready(&h.state, &plan, "deploy");

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let outcome = h
            .executor
            .execute(&plan, RunId::new(), &StepId::new("deploy"), &cancel)
            .await
            .unwrap();

        assert!(matches!(outcome, StepOutcome::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(60));
        assert_eq!(h.adapter.calls("deploy"), 1);
        assert_eq!(
            h.state
                .get_status(plan.id(), &StepId::new("deploy"))
                .unwrap(),
            StepStatus::Failed
        );
    }
}
