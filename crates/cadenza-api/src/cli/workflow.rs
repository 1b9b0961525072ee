//! Workflow CLI command handlers.
//!
//! `validate`, `dry-run` and `visualize` operate purely on definition
//! files; `list`, `status`, `audit` and `cleanup` go through the SQLite
//! store.

use std::path::Path;

use anyhow::{Context, Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use cadenza_core::store::WorkflowStore;
use cadenza_core::workflow::definition::{self, LoadOptions};
use cadenza_core::workflow::dry_run::dry_run;
use cadenza_core::workflow::visualizer::workflow_to_mermaid;
use cadenza_infra::sqlite::pool::{DatabasePool, default_database_url};
use cadenza_infra::sqlite::workflow::SqliteWorkflowStore;
use cadenza_types::workflow::{StepStatus, WorkflowState, WorkflowStep};

// ---------------------------------------------------------------------------
// Validate
// ---------------------------------------------------------------------------

pub async fn handle_validate(
    file: &Path,
    tier: &str,
    strict: bool,
    workspace_root: Option<&Path>,
    json: bool,
) -> Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("cannot read {}", file.display()))?;
    let data = match definition::parse_document(&text) {
        Ok(data) => data,
        Err(e) => {
            if json {
                println!("{}", serde_json::json!({"valid": false, "errors": [e.to_string()]}));
            } else {
                eprintln!("  {} {e}", style("x").red().bold());
            }
            bail!("definition failed to parse");
        }
    };

    let (errors, warnings) = definition::validate_document(&data, tier, workspace_root);
    let effective_errors: Vec<&String> = if strict {
        errors.iter().chain(warnings.iter()).collect()
    } else {
        errors.iter().collect()
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "valid": effective_errors.is_empty(),
                "errors": errors,
                "warnings": warnings,
            }))?
        );
    } else if effective_errors.is_empty() {
        println!();
        println!(
            "  {} {} is valid",
            style("*").green().bold(),
            style(file.display()).cyan()
        );
        for warning in &warnings {
            println!("  {} {warning}", style("warning:").yellow());
        }
        println!();
    } else {
        println!();
        println!(
            "  {} {} failed validation:",
            style("x").red().bold(),
            style(file.display()).cyan()
        );
        for error in &effective_errors {
            println!("    - {error}");
        }
        println!();
    }

    if !effective_errors.is_empty() {
        bail!("{} validation error(s)", effective_errors.len());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Dry run
// ---------------------------------------------------------------------------

pub async fn handle_dry_run(file: &Path, tier: &str, json: bool) -> Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("cannot read {}", file.display()))?;
    let data = definition::parse_document(&text)
        .map_err(|e| anyhow::anyhow!("failed to parse definition: {e}"))?;

    let report = dry_run(&data, tier, None);

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        if !report.is_valid() {
            bail!("{} validation error(s)", report.errors.len());
        }
        return Ok(());
    }

    println!();
    if report.is_valid() {
        println!("  {} definition is valid", style("*").green().bold());
    } else {
        println!("  {} validation errors:", style("x").red().bold());
        for error in &report.errors {
            println!("    - {error}");
        }
    }

    println!();
    println!("  Predicted flow:");
    for line in &report.predicted_flow {
        let styled = if line.starts_with("SKIP") {
            style(line.as_str()).dim().to_string()
        } else {
            line.clone()
        };
        println!("    {styled}");
    }
    println!();

    if !report.is_valid() {
        bail!("{} validation error(s)", report.errors.len());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Visualize
// ---------------------------------------------------------------------------

pub async fn handle_visualize(file: &Path, tier: &str, json: bool) -> Result<()> {
    let workflow = definition::load_file(file, &LoadOptions::tier(tier))
        .map_err(|e| anyhow::anyhow!("failed to load definition: {e}"))?;

    let diagram = workflow_to_mermaid(&workflow, None);
    if json {
        println!("{}", serde_json::json!({"workflow": workflow.id, "mermaid": diagram}));
    } else {
        println!("```mermaid");
        println!("{diagram}");
        println!("```");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

pub async fn handle_list(state: Option<&str>, limit: u32, json: bool) -> Result<()> {
    let store = open_store().await?;

    let state_filter = state
        .map(|s| {
            s.parse::<WorkflowState>()
                .map_err(|e| anyhow::anyhow!(e))
        })
        .transpose()?;

    let workflows = store
        .list_workflows(state_filter, limit)
        .await
        .map_err(|e| anyhow::anyhow!("failed to list workflows: {e}"))?;

    if json {
        let out: Vec<_> = workflows
            .iter()
            .map(|w| {
                serde_json::json!({
                    "id": w.id,
                    "name": w.name,
                    "state": w.state.as_str(),
                    "current_step": w.current_step,
                    "steps": w.steps.len(),
                    "updated_at": w.updated_at.to_rfc3339(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if workflows.is_empty() {
        println!();
        println!("  No workflows stored.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("ID").fg(Color::Cyan),
            Cell::new("Name"),
            Cell::new("State"),
            Cell::new("Step"),
            Cell::new("Updated"),
        ]);

    for w in &workflows {
        table.add_row(vec![
            Cell::new(&w.id),
            Cell::new(&w.name),
            format_state(w.state),
            Cell::new(format!("{}/{}", w.current_step, w.steps.len())),
            Cell::new(w.updated_at.format("%Y-%m-%d %H:%M").to_string()),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

pub async fn handle_status(workflow_id: &str, json: bool) -> Result<()> {
    let store = open_store().await?;
    let workflow = store
        .load_workflow(workflow_id)
        .await
        .map_err(|e| anyhow::anyhow!("failed to load workflow: {e}"))?
        .ok_or_else(|| anyhow::anyhow!("workflow '{workflow_id}' not found"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&workflow)?);
        return Ok(());
    }

    println!();
    println!("  {} {}", style("Workflow:").bold(), style(&workflow.id).cyan());
    println!("  Name: {}", workflow.name);
    println!("  State: {}", workflow.state.as_str());
    println!("  Step: {}/{}", workflow.current_step, workflow.steps.len());
    if let Some(agent) = workflow.active_agent_type() {
        println!("  Active agent: {}", style(agent).cyan());
    }
    if let Some(completed) = workflow.completed_at {
        println!("  Completed: {}", completed.format("%Y-%m-%d %H:%M:%S"));
    }

    println!();
    for step in &workflow.steps {
        println!("  {}", format_step_line(step));
    }

    println!();
    println!("```mermaid");
    println!("{}", workflow_to_mermaid(&workflow, None));
    println!("```");
    println!();
    Ok(())
}

fn format_step_line(step: &WorkflowStep) -> String {
    let marker = match step.status {
        StepStatus::Completed => style("*").green().bold(),
        StepStatus::Running => style(">").blue().bold(),
        StepStatus::Failed => style("x").red().bold(),
        StepStatus::Skipped => style("~").yellow(),
        StepStatus::Pending => style("."),
    };
    let mut line = format!(
        "{marker} {}. {} [{}] ({})",
        step.step_num,
        step.name,
        step.status.as_str(),
        step.agent.name
    );
    if step.iteration > 0 {
        line.push_str(&format!(" iteration={}", step.iteration));
    }
    if let Some(ref error) = step.error {
        line.push_str(&format!(" error={error}"));
    }
    line
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

pub async fn handle_audit(workflow_id: &str, since: Option<&str>, json: bool) -> Result<()> {
    let store = open_store().await?;

    let since = since
        .map(|s| {
            chrono::DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&chrono::Utc))
                .with_context(|| format!("invalid --since timestamp: '{s}'"))
        })
        .transpose()?;

    let events = store
        .get_audit_log(workflow_id, since)
        .await
        .map_err(|e| anyhow::anyhow!("failed to read audit log: {e}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&events)?);
        return Ok(());
    }

    if events.is_empty() {
        println!();
        println!("  No audit events for '{workflow_id}'.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Timestamp").fg(Color::Cyan),
            Cell::new("Event"),
            Cell::new("Data"),
        ]);

    for event in &events {
        let data = serde_json::to_string(&event.data).unwrap_or_default();
        table.add_row(vec![
            Cell::new(event.timestamp.format("%Y-%m-%d %H:%M:%S").to_string()),
            Cell::new(&event.event_type),
            Cell::new(data.chars().take(60).collect::<String>()),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Cleanup
// ---------------------------------------------------------------------------

pub async fn handle_cleanup(older_than_days: u32, json: bool) -> Result<()> {
    let store = open_store().await?;
    let deleted = store
        .cleanup_old_workflows(older_than_days)
        .await
        .map_err(|e| anyhow::anyhow!("cleanup failed: {e}"))?;

    if json {
        println!("{}", serde_json::json!({"deleted": deleted}));
    } else {
        println!();
        println!(
            "  {} Deleted {deleted} workflow(s) older than {older_than_days} days",
            style("*").green().bold()
        );
        println!();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn open_store() -> Result<SqliteWorkflowStore> {
    let url = default_database_url();
    if let Some(dir) = url
        .strip_prefix("sqlite://")
        .and_then(|p| Path::new(p).parent())
    {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("cannot create data directory {}", dir.display()))?;
    }
    let pool = DatabasePool::open(&url)
        .await
        .with_context(|| format!("cannot open database at {url}"))?;
    Ok(SqliteWorkflowStore::new(pool))
}

fn format_state(state: WorkflowState) -> Cell {
    match state {
        WorkflowState::Pending => Cell::new("pending").fg(Color::Yellow),
        WorkflowState::Running => Cell::new("running").fg(Color::Blue),
        WorkflowState::Paused => Cell::new("paused").fg(Color::Magenta),
        WorkflowState::Completed => Cell::new("completed").fg(Color::Green),
        WorkflowState::Failed => Cell::new("failed").fg(Color::Red),
        WorkflowState::Cancelled => Cell::new("cancelled").fg(Color::DarkYellow),
    }
}
