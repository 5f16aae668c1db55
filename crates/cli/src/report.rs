//! Plain-text rendering of plans, run reports and stored state

use runway_core::events::Event;
use runway_core::workflow::{PlanStatus, RollbackReport, RunReport, VerificationReport};
use runway_core::{ExecutionRecord, FailureDetail, Plan, PlanSummary};
use serde_json::json;
use std::fmt::Write;

/// Left-aligned columns separated by two spaces
fn table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.chars().count());
        }
    }

    let mut out = String::new();
    let mut push_row = |cells: Vec<&str>| {
        let line = cells
            .iter()
            .enumerate()
            .map(|(i, cell)| format!("{:<width$}", cell, width = widths[i]))
            .collect::<Vec<_>>()
            .join("  ");
        out.push_str(line.trim_end());
        out.push('\n');
    };

    push_row(headers.to_vec());
    for row in rows {
        push_row(row.iter().map(String::as_str).collect());
    }
    out
}

fn error_cell(error: &Option<FailureDetail>) -> String {
    match error {
        Some(detail) => {
            let first_line = detail.message.lines().next().unwrap_or_default();
            let mut shown: String = first_line.chars().take(80).collect();
            if first_line.chars().count() > 80 {
                shown.push_str("...");
            }
            format!("{}: {}", detail.kind, shown)
        }
        None => String::new(),
    }
}

pub fn plan_json(plan: &Plan) -> serde_json::Value {
    json!({
        "planId": plan.id(),
        "context": plan.context(),
        "health": plan.health(),
        "order": plan.execution_order(),
        "waves": plan.waves(),
        "steps": plan.execution_order()
            .iter()
            .filter_map(|id| plan.step(id))
            .collect::<Vec<_>>(),
    })
}

pub fn render_plan(plan: &Plan) -> String {
    let mut out = String::new();
    let waves = plan.waves();
    let _ = writeln!(out, "Plan {}", plan.id());
    let _ = writeln!(out, "{} step(s) in {} wave(s)", plan.len(), waves.len());

    let context = plan.context().entries();
    if !context.is_empty() {
        let _ = writeln!(out, "\nContext:");
        for (key, value) in context {
            let _ = writeln!(out, "  {} = {}", key, value);
        }
    }

    let _ = writeln!(out, "\nWaves:");
    for (i, wave) in waves.iter().enumerate() {
        let ids: Vec<&str> = wave.iter().map(|id| id.as_str()).collect();
        let _ = writeln!(out, "  {}. {}", i + 1, ids.join(", "));
    }

    let rows: Vec<Vec<String>> = plan
        .execution_order()
        .iter()
        .filter_map(|id| plan.step(id))
        .enumerate()
        .map(|(i, step)| {
            vec![
                (i + 1).to_string(),
                step.id.to_string(),
                step.kind.clone(),
                step.dependencies
                    .iter()
                    .map(|d| d.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
                step.retry.max_attempts.to_string(),
            ]
        })
        .collect();
    let _ = writeln!(out, "\nExecution order:");
    out.push_str(&table(&["#", "STEP", "KIND", "DEPENDS ON", "ATTEMPTS"], &rows));

    if let Some(health) = plan.health() {
        let _ = writeln!(
            out,
            "\nHealth: GET {} expecting {}",
            health.endpoint, health.expect_status
        );
    }
    out
}

pub fn render_run(report: &RunReport) -> String {
    let rows: Vec<Vec<String>> = report
        .steps
        .iter()
        .map(|step| {
            let status = if step.reused {
                format!("{} (reused)", step.status)
            } else {
                step.status.to_string()
            };
            vec![
                step.step_id.to_string(),
                step.kind.clone(),
                status,
                step.attempts.to_string(),
                error_cell(&step.last_error),
            ]
        })
        .collect();

    let mut out = table(&["STEP", "KIND", "STATUS", "ATTEMPTS", "ERROR"], &rows);
    let verification = match &report.verification {
        VerificationReport::NotConfigured => "not configured".to_string(),
        VerificationReport::Skipped => "skipped".to_string(),
        VerificationReport::Passed { attempts, elapsed } => {
            format!("passed after {} probe(s) in {:?}", attempts, elapsed)
        }
        VerificationReport::TimedOut(timeout) => timeout.to_string(),
        VerificationReport::Cancelled => "cancelled".to_string(),
    };
    let _ = writeln!(out, "\nVerification: {}", verification);
    let _ = writeln!(
        out,
        "Result: {} (plan {}, run {}, {:.1}s)",
        report.outcome,
        report.plan_id.short(),
        report.run_id,
        report.duration.as_secs_f64()
    );
    out
}

fn record_rows(records: &[ExecutionRecord]) -> Vec<Vec<String>> {
    records
        .iter()
        .map(|record| {
            vec![
                record.step_id.to_string(),
                record.status.to_string(),
                record.attempts.to_string(),
                record.updated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                error_cell(&record.last_error),
            ]
        })
        .collect()
}

pub fn render_status(status: &PlanStatus) -> String {
    let summary = &status.summary;
    let mut out = String::new();
    let _ = writeln!(out, "Plan {}", summary.plan_id);
    if let Some(run) = summary.last_run {
        let _ = writeln!(out, "Last run: {}", run);
    }
    let _ = writeln!(
        out,
        "Updated: {}\n",
        summary.updated_at.format("%Y-%m-%d %H:%M:%S")
    );

    // Records in execution order where the summary knows it
    let mut records = status.records.clone();
    records.sort_by_key(|r| {
        summary
            .steps
            .iter()
            .position(|s| s == &r.step_id)
            .unwrap_or(usize::MAX)
    });
    out.push_str(&table(
        &["STEP", "STATUS", "ATTEMPTS", "UPDATED", "LAST ERROR"],
        &record_rows(&records),
    ));
    out
}

pub fn render_plan_list(plans: &[PlanSummary]) -> String {
    if plans.is_empty() {
        return "No plans recorded\n".to_string();
    }
    let rows: Vec<Vec<String>> = plans
        .iter()
        .map(|plan| {
            vec![
                plan.plan_id.short().to_string(),
                plan.steps.len().to_string(),
                plan.last_run.map(|r| r.to_string()).unwrap_or_default(),
                plan.updated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            ]
        })
        .collect();
    table(&["PLAN", "STEPS", "LAST RUN", "UPDATED"], &rows)
}

pub fn render_rollback(report: &RollbackReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Rollback of plan {} (run {})", report.plan_id.short(), report.run_id);
    for step in &report.reverted {
        let _ = writeln!(out, "  reverted     {}", step);
    }
    for step in &report.unsupported {
        let _ = writeln!(out, "  unsupported  {}", step);
    }
    if let Some((step, error)) = &report.failed {
        let _ = writeln!(out, "  failed       {}: {}", step, error);
    }
    if report.cancelled {
        let _ = writeln!(out, "  cancelled before completion");
    }
    if report.reverted.is_empty() && report.unsupported.is_empty() && report.failed.is_none() {
        let _ = writeln!(out, "  nothing to roll back");
    }
    out
}

pub fn render_events(events: &[Event]) -> String {
    let mut out = String::new();
    for event in events {
        let mut payload = serde_json::to_value(&event.event_type).unwrap_or_default();
        let kind = payload
            .as_object_mut()
            .and_then(|fields| fields.remove("type"))
            .and_then(|t| t.as_str().map(str::to_string))
            .unwrap_or_default();
        let _ = writeln!(
            out,
            "{}  {:<24}  {}",
            event.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            kind,
            payload
        );
    }
    out
}
