//! Cadenza CLI entry point.
//!
//! Binary name: `cdz`
//!
//! Parses CLI arguments, initializes tracing, then dispatches to the
//! workflow command handlers. Storage-backed commands open the SQLite
//! store lazily; validation and dry runs work purely on definition files.

mod cli;

use clap::Parser;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = cadenza_observe::tracing_setup::verbosity_filter(cli.verbose, cli.quiet);
    let _tracing = cadenza_observe::tracing_setup::init_tracing(filter, cli.otel)
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    match cli.command {
        Commands::Validate {
            file,
            tier,
            strict,
            workspace_root,
        } => {
            cli::workflow::handle_validate(
                &file,
                tier.as_deref().unwrap_or(""),
                strict,
                workspace_root.as_deref(),
                cli.json,
            )
            .await
        }
        Commands::DryRun { file, tier } => {
            cli::workflow::handle_dry_run(&file, tier.as_deref().unwrap_or(""), cli.json).await
        }
        Commands::Visualize { file, tier } => {
            cli::workflow::handle_visualize(&file, tier.as_deref().unwrap_or(""), cli.json).await
        }
        Commands::List { state, limit } => {
            cli::workflow::handle_list(state.as_deref(), limit, cli.json).await
        }
        Commands::Status { workflow_id } => {
            cli::workflow::handle_status(&workflow_id, cli.json).await
        }
        Commands::Audit { workflow_id, since } => {
            cli::workflow::handle_audit(&workflow_id, since.as_deref(), cli.json).await
        }
        Commands::Cleanup { older_than_days } => {
            cli::workflow::handle_cleanup(older_than_days, cli.json).await
        }
    }
}
