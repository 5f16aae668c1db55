use crate::error::StepError;
use crate::registry::{RollbackOutcome, StepAdapter, StepContext, StepOutput};
use crate::workflow::StepSpec;

/// Succeeds without side effects. Useful for sequencing and dry runs.
pub struct NoopAdapter;

#[async_trait::async_trait]
impl StepAdapter for NoopAdapter {
    async fn execute(&self, step: &StepSpec, _ctx: &StepContext) -> Result<StepOutput, StepError> {
        tracing::debug!("noop step {}", step.id);
        Ok(StepOutput::summary("nothing to do"))
    }

    async fn rollback(
        &self,
        _step: &StepSpec,
        _ctx: &StepContext,
    ) -> Result<RollbackOutcome, StepError> {
        Ok(RollbackOutcome::Reverted)
    }
}
