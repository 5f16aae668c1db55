//! Action kinds and the adapters that implement them.

use crate::error::{StepError, ValidationError};
use crate::secrets::SecretSet;
use crate::types::{GlobalContext, PlanId, RunId};
use crate::workflow::{Plan, StepSpec};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything an adapter may see during one attempt
#[derive(Debug, Clone)]
pub struct StepContext {
    pub plan_id: PlanId,
    pub run_id: RunId,
    pub attempt: u32,
    pub context: GlobalContext,
    pub secrets: SecretSet,
    /// Fired when the run is cancelled; adapters may use it to stop early
    pub cancel: CancellationToken,
}

/// What a successful invocation reports back
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutput {
    /// Short human-readable summary, masked before it is recorded
    pub summary: Option<String>,
}

impl StepOutput {
    pub fn summary(summary: impl Into<String>) -> Self {
        Self {
            summary: Some(summary.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackOutcome {
    Reverted,
    /// The adapter has no reverse action for this step
    Unsupported,
}

/// Implementation of one action kind
#[async_trait::async_trait]
pub trait StepAdapter: Send + Sync {
    /// Perform the step. Must be safe to call again for the same idempotency key.
    async fn execute(&self, step: &StepSpec, ctx: &StepContext) -> Result<StepOutput, StepError>;

    /// Undo a previously successful step
    async fn rollback(
        &self,
        _step: &StepSpec,
        _ctx: &StepContext,
    ) -> Result<RollbackOutcome, StepError> {
        Ok(RollbackOutcome::Unsupported)
    }
}

/// Registry of action kinds
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: BTreeMap<String, Arc<dyn StepAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the `shell` and `noop` adapters
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("shell", Arc::new(crate::adapters::ShellAdapter::new()));
        registry.register("noop", Arc::new(crate::adapters::NoopAdapter));
        registry
    }

    /// Register an adapter, replacing any previous one for `kind`
    pub fn register(&mut self, kind: impl Into<String>, adapter: Arc<dyn StepAdapter>) {
        self.adapters.insert(kind.into(), adapter);
    }

    /// Make `kind` resolve to the adapter already registered as `target`
    pub fn alias(&mut self, kind: impl Into<String>, target: &str) -> anyhow::Result<()> {
        let adapter = self
            .get(target)
            .ok_or_else(|| anyhow::anyhow!("cannot alias to unknown action kind '{}'", target))?;
        self.adapters.insert(kind.into(), adapter);
        Ok(())
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn StepAdapter>> {
        self.adapters.get(kind).cloned()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.adapters.contains_key(kind)
    }

    /// Registered kinds, sorted
    pub fn kinds(&self) -> Vec<&str> {
        self.adapters.keys().map(String::as_str).collect()
    }

    /// Reject plans that reference kinds nobody registered
    pub fn validate(&self, plan: &Plan) -> Result<(), ValidationError> {
        for step_id in plan.execution_order() {
            let Some(step) = plan.step(step_id) else {
                continue;
            };
            if !self.contains(&step.kind) {
                return Err(ValidationError::UnknownKind {
                    step: step.id.clone(),
                    kind: step.kind.clone(),
                });
            }
        }
        Ok(())
    }
}
