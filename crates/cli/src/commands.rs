use crate::config::{AppState, RunwayConfig};
use crate::report;
use anyhow::{Context, Result};
use runway_core::events::EventLog;
use runway_core::storage::StateStore;
use runway_core::{GlobalContext, Manifest, OrchestratorError, Plan, PlanId, RunId, ValidationError};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Exit code for plan validation failures
const EXIT_INVALID: u8 = 3;

/// The manifest could not be read or parsed
#[derive(Debug, Error)]
#[error("invalid manifest {path}: {reason}")]
pub struct InvalidManifest {
    path: String,
    reason: String,
}

/// Context overrides from flags and `RUNWAY_*` environment variables
#[derive(clap::Args, Debug, Default, Clone)]
pub struct ContextArgs {
    #[arg(long, env = "RUNWAY_REGION")]
    region: Option<String>,

    #[arg(long, env = "RUNWAY_ENVIRONMENT")]
    environment: Option<String>,

    #[arg(long, env = "RUNWAY_RESOURCE_GROUP")]
    resource_group: Option<String>,

    #[arg(long, env = "RUNWAY_REGISTRY")]
    registry: Option<String>,

    #[arg(long, env = "RUNWAY_NODE_AFFINITY")]
    node_affinity: Option<String>,

    #[arg(long, env = "RUNWAY_DOMAIN_SUFFIX")]
    domain_suffix: Option<String>,

    /// Additional context value, repeatable
    #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    set: Vec<(String, String)>,
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in '{}'", raw));
    }
    Ok((key.to_string(), value.to_string()))
}

impl ContextArgs {
    fn into_context(self) -> GlobalContext {
        let mut context = GlobalContext {
            region: self.region,
            environment: self.environment,
            resource_group: self.resource_group,
            registry: self.registry,
            node_affinity: self.node_affinity,
            domain_suffix: self.domain_suffix,
            ..Default::default()
        };
        for (key, value) in self.set {
            match key.as_str() {
                "region" => context.region = Some(value),
                "environment" => context.environment = Some(value),
                "resource_group" => context.resource_group = Some(value),
                "registry" => context.registry = Some(value),
                "node_affinity" => context.node_affinity = Some(value),
                "domain_suffix" => context.domain_suffix = Some(value),
                _ => {
                    context.extra.insert(key, value);
                }
            }
        }
        context
    }
}

/// Map a command error to the process exit code
pub fn exit_code_for(error: &anyhow::Error) -> u8 {
    if error.downcast_ref::<InvalidManifest>().is_some()
        || error.downcast_ref::<ValidationError>().is_some()
    {
        return EXIT_INVALID;
    }
    if let Some(OrchestratorError::Validation(_)) = error.downcast_ref::<OrchestratorError>() {
        return EXIT_INVALID;
    }
    1
}

/// Load a manifest, overlay the context flags and compile it against the
/// configured action kinds
fn load_plan(config: &RunwayConfig, path: &Path, context: ContextArgs) -> Result<Plan> {
    let mut manifest = Manifest::load(path).map_err(|e| InvalidManifest {
        path: path.display().to_string(),
        reason: format!("{:#}", e),
    })?;
    manifest.context.merge(context.into_context());

    let plan = Plan::from_manifest(&manifest)?;
    config.registry()?.validate(&plan)?;

    tracing::debug!("Compiled plan {} with {} steps", plan.id(), plan.len());
    Ok(plan)
}

/// Resolve a full plan id or a unique prefix of one
fn resolve_plan_id(state: &dyn StateStore, raw: &str) -> Result<PlanId> {
    let matches: Vec<PlanId> = state
        .list_plans()?
        .into_iter()
        .map(|summary| summary.plan_id)
        .filter(|id| id.as_str().starts_with(raw))
        .collect();

    match matches.as_slice() {
        [id] => Ok(id.clone()),
        [] => anyhow::bail!("no stored plan matches '{}'", raw),
        _ => anyhow::bail!(
            "'{}' is ambiguous; it matches {} plans",
            raw,
            matches.len()
        ),
    }
}

pub fn plan(config: &RunwayConfig, manifest: &Path, context: ContextArgs, json: bool) -> Result<u8> {
    let plan = load_plan(config, manifest, context)?;

    if json {
        let rendered = serde_json::to_string_pretty(&report::plan_json(&plan))
            .context("Failed to serialize plan")?;
        println!("{}", rendered);
    } else {
        print!("{}", report::render_plan(&plan));
    }
    Ok(0)
}

pub async fn apply(
    config: &RunwayConfig,
    manifest: &Path,
    context: ContextArgs,
    cancel: CancellationToken,
) -> Result<u8> {
    let plan = load_plan(config, manifest, context)?;
    let app = AppState::new(config)?;

    let report = app.orchestrator.apply(Arc::new(plan), cancel).await?;
    print!("{}", report::render_run(&report));
    Ok(report.exit_code())
}

pub fn status(config: &RunwayConfig, plan_id: Option<&str>) -> Result<u8> {
    let app = AppState::new(config)?;

    let Some(raw) = plan_id else {
        let plans = app.state.list_plans()?;
        print!("{}", report::render_plan_list(&plans));
        return Ok(0);
    };

    let plan_id = resolve_plan_id(app.state.as_ref(), raw)?;
    let status = app
        .orchestrator
        .status(&plan_id)?
        .with_context(|| format!("plan {} has no stored state", plan_id))?;
    print!("{}", report::render_status(&status));
    Ok(0)
}

pub async fn rollback(
    config: &RunwayConfig,
    manifest: &Path,
    context: ContextArgs,
    cancel: CancellationToken,
) -> Result<u8> {
    let plan = load_plan(config, manifest, context)?;
    let app = AppState::new(config)?;

    let report = app.orchestrator.rollback(Arc::new(plan), cancel).await?;
    print!("{}", report::render_rollback(&report));
    Ok(report.exit_code())
}

pub fn purge(config: &RunwayConfig, plan_id: &str) -> Result<u8> {
    let app = AppState::new(config)?;
    let plan_id = resolve_plan_id(app.state.as_ref(), plan_id)?;

    let removed = app.state.purge(&plan_id)?;
    tracing::info!("Purged plan {}", plan_id);
    println!("Purged {} record(s) of plan {}", removed, plan_id);
    Ok(0)
}

pub async fn events(config: &RunwayConfig, run_id: &str) -> Result<u8> {
    let run_id = RunId::parse(run_id).with_context(|| format!("Invalid run id '{}'", run_id))?;
    let app = AppState::new(config)?;

    let events = app.event_log.get_run_events(run_id).await?;
    if events.is_empty() {
        anyhow::bail!("no events recorded for run {}", run_id);
    }
    print!("{}", report::render_events(&events));
    Ok(0)
}
