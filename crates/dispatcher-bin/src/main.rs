//! Outbox dispatcher - forwards stored events to the webhook relay.

mod app;
mod config;
mod logging;
mod paths;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use config::Config;
use logging::init_logging;
use paths::Paths;

/// Outbox dispatcher command-line interface.
#[derive(Parser)]
#[command(name = "outbox-dispatcher")]
#[command(about = "Forwards outbox events to the webhook relay")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Base directory for runtime files (database, config). Defaults to ~/.outbox-dispatcher
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the dispatch loop
    Run,
    /// Append one event to the outbox
    Enqueue {
        /// Aggregate key the event belongs to
        #[arg(long)]
        aggregate: String,
        /// Event type label
        #[arg(long)]
        event_type: String,
        /// JSON payload (read from stdin when omitted)
        #[arg(long)]
        payload: Option<String>,
    },
    /// Show outbox status counts
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let paths = match cli.base_dir {
        Some(base) => Paths::with_base_dir(base),
        None => Paths::new()?,
    };
    let mut config = Config::load(&paths)?;
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }

    init_logging(&config.log_level, config.log_json);

    match cli.command {
        Some(Commands::Run) | None => {
            app::run_dispatcher(config, paths).await?;
        }
        Some(Commands::Enqueue {
            aggregate,
            event_type,
            payload,
        }) => {
            let payload = match payload {
                Some(p) => p,
                None => {
                    use std::io::Read;
                    let mut buf = String::new();
                    std::io::stdin().read_to_string(&mut buf)?;
                    buf
                }
            };
            app::enqueue_event(&paths, aggregate, event_type, payload).await?;
        }
        Some(Commands::Status) => {
            app::show_status(&paths).await?;
        }
    }

    Ok(())
}
