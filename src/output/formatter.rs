use colored::{ColoredString, Colorize};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::validator::ValidationReport;
use crate::executor::progress::ProgressEvent;
use crate::executor::result::ExecutionResult;
use crate::planner::plan::{ChangeType, FieldChange, OperationStatus, OperationType, Plan, PlanStatus, PlannedOperation};
use crate::reconcile::drift::DriftDetectionResult;
use crate::reconcile::manager::{DriftOutcomeStatus, ReconciliationResult};
use crate::recovery::manager::RecoveryResult;

/// Print a success message.
pub fn print_success(msg: &str) {
    println!("{} {}", "✓".green().bold(), msg.green());
}

/// Print an error message.
pub fn print_error(msg: &str) {
    println!("{} {}", "✗".red().bold(), msg.red());
}

pub fn print_warning(msg: &str) {
    println!("{} {}", "!".yellow().bold(), msg.yellow());
}

pub fn print_validation(report: &ValidationReport) {
    for error in &report.errors {
        print_error(error);
    }
    for warning in &report.warnings {
        print_warning(warning);
    }
}

// ─── Plans ──────────────────────────────────────────────────────────────────

fn paint(op_type: OperationType, s: &str) -> ColoredString {
    match op_type {
        OperationType::Create => s.green(),
        OperationType::Update => s.yellow(),
        OperationType::Delete => s.red(),
        OperationType::NoChange => s.normal(),
    }
}

/// Print a plan, stage by stage, with field-level changes for updates.
pub fn print_plan(plan: &Plan) {
    println!();

    if !plan.has_changes() {
        println!("{}", "No changes. Project is up-to-date.".green());
        return;
    }

    println!("Resource actions are indicated with the following symbols:");
    let summary = plan.summary();
    if summary.creates > 0 {
        println!("  {} create", "+".green().bold());
    }
    if summary.updates > 0 {
        println!("  {} update in-place", "~".yellow().bold());
    }
    if summary.deletes > 0 {
        println!("  {} destroy", "-".red().bold());
    }
    println!();

    for stage in 0..=plan.max_stage {
        let ops: Vec<&PlannedOperation> = plan
            .stage_operations(stage)
            .filter(|op| op.op_type().is_mutation())
            .collect();
        if ops.is_empty() {
            continue;
        }
        println!("{}", format!("Stage {}:", stage).bold());
        for op in ops {
            print_operation(op);
        }
        println!();
    }

    println!("{}", summary.to_string().bold());
    println!();
}

fn print_operation(op: &PlannedOperation) {
    let op_type = op.op_type();
    let impact = op.impact();
    let mut line = format!("  {} {}", op_type.symbol(), op.address());
    if impact.is_destructive {
        line.push_str(" (destructive)");
    }
    if impact.requires_downtime {
        line.push_str(" (downtime)");
    }
    println!("{} {}", paint(op_type, &line), format!("[{} risk]", impact.risk_level).dimmed());

    for change in &op.operation.field_changes {
        print_field_change(change);
    }
}

fn print_field_change(change: &FieldChange) {
    let line = match change.change_type {
        ChangeType::Add => format!("      + {} = {}", change.path, format_value(change.new_value.as_ref())),
        ChangeType::Remove => format!("      - {} = {}", change.path, format_value(change.old_value.as_ref())),
        ChangeType::Modify => format!(
            "      ~ {} = {} -> {}",
            change.path,
            format_value(change.old_value.as_ref()),
            format_value(change.new_value.as_ref())
        ),
    };
    let colored = match change.change_type {
        ChangeType::Add => line.green(),
        ChangeType::Remove => line.red(),
        ChangeType::Modify => line.yellow(),
    };
    println!("{}", colored);
}

/// Format a JSON value for short inline display.
fn format_value(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => "null".to_string(),
        Some(Value::String(s)) => format!("\"{}\"", s),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Array(arr)) if arr.is_empty() => "[]".to_string(),
        Some(Value::Array(arr)) if arr.len() <= 4 && arr.iter().all(|v| v.is_string()) => {
            let items: Vec<String> = arr.iter().map(|v| format_value(Some(v))).collect();
            format!("[{}]", items.join(", "))
        }
        Some(Value::Array(arr)) => format!("[...{} items]", arr.len()),
        Some(Value::Object(obj)) if obj.is_empty() => "{}".to_string(),
        Some(Value::Object(obj)) => format!("{{...{} keys}}", obj.len()),
    }
}

// ─── Execution ──────────────────────────────────────────────────────────────

/// Print the outcome of an apply, including any recovery attempts.
pub fn print_execution_result(plan: &Plan, result: &ExecutionResult) {
    println!();
    for op in &plan.operations {
        let Some(outcome) = result.result(&op.id) else {
            continue;
        };
        if op.op_type() == OperationType::NoChange && outcome.status == OperationStatus::Completed {
            continue;
        }
        let status = match outcome.status {
            OperationStatus::Completed => "done".green(),
            OperationStatus::Skipped => "skipped".cyan(),
            OperationStatus::Failed => "failed".red().bold(),
            other => other.to_string().dimmed(),
        };
        let mut line = format!("  {} {}: {}", op.op_type().symbol(), op.address(), status);
        if let Some(note) = outcome.note() {
            line.push_str(&format!(" ({})", note));
        }
        if outcome.retried() {
            line.push_str(&format!(" after {} attempts", outcome.attempts));
        }
        println!("{}", line);
        if let Some(err) = &outcome.error {
            println!("      {}", err.to_string().red());
        }
        if let Some(recovery) = outcome
            .metadata
            .get("recovery")
            .and_then(|v| serde_json::from_value::<RecoveryResult>(v.clone()).ok())
        {
            print_recovery(&recovery);
        }
    }

    println!();
    let summary = format!("Apply {}: {}.", result.status, result.summary);
    match result.status {
        PlanStatus::Completed => print_success(&summary),
        PlanStatus::Cancelled => print_warning(&summary),
        _ => print_error(&summary),
    }
}

pub fn print_recovery(recovery: &RecoveryResult) {
    let header = format!(
        "      recovery: {} ({}) {}",
        recovery.strategy,
        recovery.failure_type,
        if recovery.success { "succeeded" } else { "did not succeed" }
    );
    if recovery.success {
        println!("{}", header.cyan());
    } else {
        println!("{}", header.magenta());
    }
    if !recovery.message.is_empty() {
        println!("        {}", recovery.message.dimmed());
    }
    if !recovery.resources_cleaned.is_empty() {
        println!("        cleaned: {}", recovery.resources_cleaned.join(", "));
    }
    for rec in &recovery.recommendations {
        println!("        {} {}", "→".bold(), rec.description);
        for step in &rec.next_actions {
            println!("          {}", step.dimmed());
        }
    }
}

/// Render progress events on a progress bar until the channel closes or the
/// plan completes.
pub fn spawn_progress_bar(mut rx: mpsc::Receiver<ProgressEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let bar = ProgressBar::hidden();
        if let Ok(style) = ProgressStyle::with_template("{spinner} [{bar:30}] {pos}/{len} {msg}") {
            bar.set_style(style.progress_chars("=> "));
        }
        while let Some(event) = rx.recv().await {
            match event {
                ProgressEvent::Start { total, .. } => {
                    bar.set_draw_target(indicatif::ProgressDrawTarget::stderr());
                    bar.set_length(total as u64);
                    bar.set_position(0);
                }
                ProgressEvent::Progress(progress) => {
                    bar.set_position((progress.completed + progress.failed) as u64);
                    bar.set_message(format!("stage {}/{}", progress.current_stage, progress.max_stage));
                }
                ProgressEvent::Operation { address, status, .. } => {
                    if status.is_terminal() {
                        bar.inc(1);
                    }
                    bar.set_message(format!("{} {}", address, status));
                }
                ProgressEvent::Error { message, .. } => {
                    bar.println(format!("{} {}", "✗".red(), message));
                }
                ProgressEvent::Complete { .. } => {
                    bar.finish_and_clear();
                    break;
                }
            }
        }
    })
}

// ─── Drift ──────────────────────────────────────────────────────────────────

pub fn print_drift_report(detection: &DriftDetectionResult) {
    println!();
    if !detection.has_drift() {
        println!("{}", "No drift. Live state matches the manifests.".green());
        return;
    }

    println!(
        "{} {} drift(s) in project {}",
        "Drift:".bold(),
        detection.drifts.len(),
        detection.project_id.bold()
    );
    for drift in &detection.drifts {
        let op_type = drift.operation.op_type;
        let line = format!("  {} {} [{}]", op_type.symbol(), drift.address(), drift.drift_type);
        println!(
            "{} {}",
            paint(op_type, &line),
            format!(
                "{} severity, {}, action {}{}",
                drift.severity,
                drift.complexity,
                drift.action,
                if drift.occurrences > 1 {
                    format!(", seen {} times", drift.occurrences)
                } else {
                    String::new()
                }
            )
            .dimmed()
        );
        for change in &drift.field_changes {
            print_field_change(change);
        }
    }

    let counts: Vec<String> = detection
        .counts_by_type()
        .iter()
        .map(|(drift_type, n)| format!("{} {}", n, drift_type))
        .collect();
    println!();
    println!("{} {}", "By type:".bold(), counts.join(", "));
    println!(
        "{} {} of {}",
        "Auto-fixable:".bold(),
        detection.auto_fixable().count(),
        detection.drifts.len()
    );
}

pub fn print_reconciliation_result(result: &ReconciliationResult) {
    println!();
    for outcome in &result.outcomes {
        let status = match outcome.status {
            DriftOutcomeStatus::Fixed => outcome.status.to_string().green(),
            DriftOutcomeStatus::Failed => outcome.status.to_string().red(),
            DriftOutcomeStatus::AwaitingApproval => outcome.status.to_string().yellow(),
            _ => outcome.status.to_string().normal(),
        };
        println!("  {}: {} {}", outcome.address, status, outcome.message.dimmed());
    }
    println!();
    println!(
        "{} {} fixed, {} awaiting approval, {} warned, {} manual, {} failed.",
        "Reconcile:".bold(),
        result.count(DriftOutcomeStatus::Fixed),
        result.count(DriftOutcomeStatus::AwaitingApproval),
        result.count(DriftOutcomeStatus::Warned),
        result.count(DriftOutcomeStatus::Manual),
        result.count(DriftOutcomeStatus::Failed),
    );
}
