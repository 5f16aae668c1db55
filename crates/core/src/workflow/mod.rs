// Plan compilation and DAG execution

pub mod backoff;
pub mod dag;
pub mod executor;
pub mod step_executor;

pub use dag::{compile, Plan, StepSpec};
pub use executor::{
    Orchestrator, OrchestratorConfig, PlanStatus, RollbackReport, RunReport, StepReport,
    VerificationReport,
};
pub use step_executor::{StepExecutor, StepExecutorConfig, StepOutcome};
