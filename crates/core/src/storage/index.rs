use super::state::{
    apply_transition, claim_lease, clear_lease, plan_registration, StateError, StateStore,
};
use crate::types::{
    ExecutionRecord, FailureDetail, PlanId, PlanSummary, RunId, RunLease, StepId, StepStatus,
};
use crate::workflow::Plan;
use anyhow::{Context, Result};
use redb::{Database, ReadableTable, TableDefinition};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Execution records keyed by `<plan-id>/<step-id>`
const RECORDS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("records");
/// Plan summaries keyed by `<plan-id>`
const PLANS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("plans");

fn record_key(plan_id: &PlanId, step_id: &StepId) -> String {
    format!("{}/{}", plan_id, step_id)
}

/// Half-open key range covering every record of a plan ('0' sorts right after '/')
fn plan_range(plan_id: &PlanId) -> (String, String) {
    (format!("{}/", plan_id), format!("{}0", plan_id))
}

/// Durable state store backed by a single redb file.
///
/// redb admits one write transaction at a time, so a read-compare-write inside a
/// write transaction is an atomic compare-and-swap across threads.
#[derive(Clone)]
pub struct RedbStateStore {
    db: Arc<Database>,
}

impl RedbStateStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create state directory")?;
        }

        let db = Database::create(&path).context("Failed to create redb database")?;

        // Initialize tables
        let write_txn = db.begin_write().context("Failed to begin write transaction")?;
        {
            let _records_table = write_txn
                .open_table(RECORDS_TABLE)
                .context("Failed to open records table")?;
            let _plans_table = write_txn
                .open_table(PLANS_TABLE)
                .context("Failed to open plans table")?;
        }
        write_txn.commit().context("Failed to commit transaction")?;

        Ok(Self { db: Arc::new(db) })
    }

    fn read_summary(&self, plan_id: &PlanId) -> Result<Option<PlanSummary>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(PLANS_TABLE).context("Failed to open table")?;

        let value = table.get(plan_id.as_str()).context("Failed to get plan")?;
        match value {
            Some(guard) => {
                let summary: PlanSummary = serde_json::from_slice(guard.value())
                    .context("Failed to deserialize plan summary")?;
                Ok(Some(summary))
            }
            None => Ok(None),
        }
    }

    fn read_record(&self, plan_id: &PlanId, step_id: &StepId) -> Result<Option<ExecutionRecord>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(RECORDS_TABLE).context("Failed to open table")?;

        let key = record_key(plan_id, step_id);
        let value = table.get(key.as_str()).context("Failed to get record")?;
        match value {
            Some(guard) => {
                let record: ExecutionRecord = serde_json::from_slice(guard.value())
                    .context("Failed to deserialize execution record")?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn read_records(&self, plan_id: &PlanId) -> Result<Vec<ExecutionRecord>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(RECORDS_TABLE).context("Failed to open table")?;

        let (start, end) = plan_range(plan_id);
        let mut records = Vec::new();
        for item in table
            .range(start.as_str()..end.as_str())
            .context("Failed to iterate records")?
        {
            let (_key, value) = item.context("Failed to read item")?;
            let record: ExecutionRecord = serde_json::from_slice(value.value())
                .context("Failed to deserialize execution record")?;
            records.push(record);
        }
        records.sort_by(|a, b| a.step_id.cmp(&b.step_id));

        Ok(records)
    }

    fn write_registration(&self, plan: &Plan) -> Result<PlanSummary> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        let summary = {
            let mut records = write_txn
                .open_table(RECORDS_TABLE)
                .context("Failed to open table")?;
            let mut plans = write_txn
                .open_table(PLANS_TABLE)
                .context("Failed to open table")?;

            let existing: Option<PlanSummary> = match plans
                .get(plan.id().as_str())
                .context("Failed to get plan")?
            {
                Some(guard) => Some(
                    serde_json::from_slice(guard.value())
                        .context("Failed to deserialize plan summary")?,
                ),
                None => None,
            };

            let mut present = Vec::new();
            for step in plan.steps() {
                let key = record_key(plan.id(), &step.id);
                if records
                    .get(key.as_str())
                    .context("Failed to get record")?
                    .is_some()
                {
                    present.push(step.id.clone());
                }
            }

            let (missing, summary) =
                plan_registration(plan, existing, |step_id| present.contains(step_id));

            for record in missing {
                let key = record_key(&record.plan_id, &record.step_id);
                let value = serde_json::to_vec(&record).context("Failed to serialize record")?;
                records
                    .insert(key.as_str(), value.as_slice())
                    .context("Failed to insert record")?;
            }

            let value = serde_json::to_vec(&summary).context("Failed to serialize plan summary")?;
            plans
                .insert(plan.id().as_str(), value.as_slice())
                .context("Failed to insert plan summary")?;

            summary
        };
        write_txn.commit().context("Failed to commit")?;
        Ok(summary)
    }

    /// Read-modify-write of a plan summary inside one write transaction.
    /// Returns `None` when the plan is not registered; an error from `update`
    /// aborts the transaction.
    fn update_summary<T>(
        &self,
        plan_id: &PlanId,
        update: impl FnOnce(&mut PlanSummary) -> Result<T, StateError>,
    ) -> Result<Option<T>, StateError> {
        let write_txn = self
            .db
            .begin_write()
            .context("Failed to begin write")?;
        let result = {
            let mut table = write_txn
                .open_table(PLANS_TABLE)
                .context("Failed to open table")?;

            let stored: Option<Vec<u8>> = table
                .get(plan_id.as_str())
                .context("Failed to get plan")?
                .map(|guard| guard.value().to_vec());
            let Some(bytes) = stored else {
                return Ok(None);
            };

            let mut summary: PlanSummary =
                serde_json::from_slice(&bytes).context("Failed to deserialize plan summary")?;
            let result = update(&mut summary)?;

            let value = serde_json::to_vec(&summary).context("Failed to serialize plan summary")?;
            table
                .insert(plan_id.as_str(), value.as_slice())
                .context("Failed to insert plan summary")?;
            result
        };
        write_txn.commit().context("Failed to commit")?;
        Ok(Some(result))
    }

    fn list_summaries(&self) -> Result<Vec<PlanSummary>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(PLANS_TABLE).context("Failed to open table")?;

        let mut plans = Vec::new();
        for item in table.iter().context("Failed to iterate plans")? {
            let (_key, value) = item.context("Failed to read item")?;
            let summary: PlanSummary = serde_json::from_slice(value.value())
                .context("Failed to deserialize plan summary")?;
            plans.push(summary);
        }

        // Most recently updated first
        plans.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

        Ok(plans)
    }

    fn remove_plan(&self, plan_id: &PlanId) -> Result<usize> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        let removed = {
            let mut records = write_txn
                .open_table(RECORDS_TABLE)
                .context("Failed to open table")?;

            let (start, end) = plan_range(plan_id);
            let mut keys = Vec::new();
            for item in records
                .range(start.as_str()..end.as_str())
                .context("Failed to iterate records")?
            {
                let (key, _value) = item.context("Failed to read item")?;
                keys.push(key.value().to_string());
            }
            for key in &keys {
                records
                    .remove(key.as_str())
                    .context("Failed to delete record")?;
            }

            let mut plans = write_txn
                .open_table(PLANS_TABLE)
                .context("Failed to open table")?;
            plans
                .remove(plan_id.as_str())
                .context("Failed to delete plan summary")?;

            keys.len()
        };
        write_txn.commit().context("Failed to commit")?;
        Ok(removed)
    }
}

impl StateStore for RedbStateStore {
    fn register_plan(&self, plan: &Plan) -> Result<PlanSummary, StateError> {
        Ok(self.write_registration(plan)?)
    }

    fn record_run(&self, plan_id: &PlanId, run_id: RunId) -> Result<(), StateError> {
        self.update_summary(plan_id, |summary| {
            summary.last_run = Some(run_id);
            summary.updated_at = chrono::Utc::now();
            Ok(())
        })?;
        Ok(())
    }

    fn plan_summary(&self, plan_id: &PlanId) -> Result<Option<PlanSummary>, StateError> {
        Ok(self.read_summary(plan_id)?)
    }

    fn list_plans(&self) -> Result<Vec<PlanSummary>, StateError> {
        Ok(self.list_summaries()?)
    }

    fn get_record(
        &self,
        plan_id: &PlanId,
        step_id: &StepId,
    ) -> Result<Option<ExecutionRecord>, StateError> {
        Ok(self.read_record(plan_id, step_id)?)
    }

    fn records(&self, plan_id: &PlanId) -> Result<Vec<ExecutionRecord>, StateError> {
        Ok(self.read_records(plan_id)?)
    }

    fn transition(
        &self,
        plan_id: &PlanId,
        step_id: &StepId,
        from: StepStatus,
        to: StepStatus,
        failure: Option<FailureDetail>,
    ) -> Result<ExecutionRecord, StateError> {
        let write_txn = self
            .db
            .begin_write()
            .context("Failed to begin write")?;
        let record = {
            let mut table = write_txn
                .open_table(RECORDS_TABLE)
                .context("Failed to open table")?;

            let key = record_key(plan_id, step_id);
            let stored: Option<Vec<u8>> = table
                .get(key.as_str())
                .context("Failed to get record")?
                .map(|guard| guard.value().to_vec());
            let bytes = stored.ok_or_else(|| StateError::NotFound {
                plan: plan_id.clone(),
                step: step_id.clone(),
            })?;

            let mut record: ExecutionRecord =
                serde_json::from_slice(&bytes).context("Failed to deserialize execution record")?;
            // On conflict the uncommitted transaction is dropped and aborts
            apply_transition(&mut record, from, to, failure)?;

            let value = serde_json::to_vec(&record).context("Failed to serialize record")?;
            table
                .insert(key.as_str(), value.as_slice())
                .context("Failed to insert record")?;
            record
        };
        write_txn.commit().context("Failed to commit")?;

        tracing::debug!(
            "plan {} step {}: {} -> {}",
            plan_id.short(),
            step_id,
            from,
            to
        );
        Ok(record)
    }

    fn acquire_lease(
        &self,
        plan_id: &PlanId,
        run_id: RunId,
        ttl: Duration,
    ) -> Result<RunLease, StateError> {
        self.update_summary(plan_id, |summary| claim_lease(summary, run_id, ttl))?
            .ok_or_else(|| StateError::UnknownPlan(plan_id.clone()))
    }

    fn release_lease(&self, plan_id: &PlanId, run_id: RunId) -> Result<(), StateError> {
        self.update_summary(plan_id, |summary| Ok(clear_lease(summary, run_id)))?;
        Ok(())
    }

    fn purge(&self, plan_id: &PlanId) -> Result<usize, StateError> {
        Ok(self.remove_plan(plan_id)?)
    }
}
