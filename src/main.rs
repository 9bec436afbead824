use std::path::PathBuf;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};

use repairdesk_lib::Config;

#[derive(Debug, Parser)]
#[command(name = "repairdesk", version, about = "Repair shop management server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP API and background workers (default)
    Serve,
    /// Apply pending database migrations and exit
    Migrate,
    /// Write a snapshot of the whole database
    Backup {
        #[arg(short, long)]
        output: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load().map_err(|e| anyhow!(e)).context("invalid configuration")?;
    let _log_guard = repairdesk_lib::init_logging(&config.log_dir);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
            runtime.block_on(repairdesk_lib::serve(config))?;
        }
        Command::Migrate => {
            let version = repairdesk_lib::migrate(&config)?;
            println!("database at schema version {version}");
        }
        Command::Backup { output } => {
            repairdesk_lib::backup_database(&config, &output)
                .with_context(|| format!("backup to {} failed", output.display()))?;
            println!("snapshot written to {}", output.display());
        }
    }
    Ok(())
}
