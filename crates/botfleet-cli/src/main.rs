mod cli;
mod commands;
mod completions;
mod output;
mod setup;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        completions::generate_completions(*shell);
        return Ok(());
    }

    let _log_guard = setup::init_logging(matches!(cli.command, Commands::Serve), cli.verbose)?;

    let core = setup::prepare_core(&cli)?;
    match cli.command {
        Commands::Serve => commands::serve::run(core).await,
        Commands::Bot { command } => commands::bot::run(core, command, cli.format).await,
        Commands::Webhook { command } => commands::webhook::run(core, command, cli.format).await,
        Commands::Health { bot_id } => commands::health::run(core, bot_id, cli.format),
        Commands::Completions { .. } => Ok(()),
    }
}
