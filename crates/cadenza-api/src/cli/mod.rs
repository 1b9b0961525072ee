//! CLI argument definitions.

pub mod workflow;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Workflow orchestration CLI.
#[derive(Parser)]
#[command(name = "cdz", version, about = "Cadenza workflow orchestration")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Emit machine-readable JSON instead of styled output.
    #[arg(long, global = true)]
    pub json: bool,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Only log errors.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Bridge tracing spans to OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a workflow definition file.
    Validate {
        /// Path to the workflow definition YAML.
        file: PathBuf,

        /// Tier variant to validate (e.g. "full", "fast-track").
        #[arg(long)]
        tier: Option<String>,

        /// Promote schema warnings to errors.
        #[arg(long)]
        strict: bool,

        /// Workspace root the completion glob must resolve inside.
        #[arg(long)]
        workspace_root: Option<PathBuf>,
    },

    /// Validate a definition and print the predicted execution flow.
    DryRun {
        /// Path to the workflow definition YAML.
        file: PathBuf,

        /// Tier variant to simulate.
        #[arg(long)]
        tier: Option<String>,
    },

    /// Render a definition as a Mermaid flowchart.
    Visualize {
        /// Path to the workflow definition YAML.
        file: PathBuf,

        /// Tier variant to render.
        #[arg(long)]
        tier: Option<String>,
    },

    /// List stored workflows.
    List {
        /// Filter by state (pending, running, paused, completed, failed,
        /// cancelled).
        #[arg(long)]
        state: Option<String>,

        /// Maximum number of workflows to display.
        #[arg(long, default_value = "50")]
        limit: u32,
    },

    /// Show a stored workflow's current status and step diagram.
    Status {
        /// Workflow id.
        workflow_id: String,
    },

    /// Print the audit log for a workflow.
    Audit {
        /// Workflow id.
        workflow_id: String,

        /// Only events at or after this RFC 3339 timestamp.
        #[arg(long)]
        since: Option<String>,
    },

    /// Delete terminal workflows older than the given age.
    Cleanup {
        /// Age threshold in days.
        #[arg(long, default_value = "30")]
        older_than_days: u32,
    },
}
