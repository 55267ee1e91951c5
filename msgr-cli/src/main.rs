//! Msgr CLI - run the inbox listener from a terminal.
//!
//! Hands a session cookie to the listener and prints every event it
//! emits until interrupted. Useful for debugging sessions and for piping
//! events into other tools as JSON lines.

mod commands;

use clap::{Parser, Subcommand};
use tracing::info;

use msgr_core::config::{AppConfig, ConfigHandle};
use msgr_core::error::MsgrResult;
use msgr_core::logging;

/// Msgr - real-time inbox listener.
#[derive(Parser)]
#[command(
    name = "msgr",
    version,
    about = "Real-time inbox listener CLI",
    long_about = "A command-line front end for the MQTT-over-WebSocket inbox listener.\n\
                   Bring your own session cookies; the listener never logs in by itself."
)]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging (debug level).
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output format (text, json).
    #[arg(short = 'f', long, global = true, default_value = "text")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

/// Output format for CLI responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    Text,
    /// One JSON object per line.
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and print events until Ctrl-C or a fatal error.
    Listen(commands::listen::ListenArgs),
    /// Inspect or create the configuration file.
    Config {
        #[command(subcommand)]
        action: commands::config::ConfigAction,
    },
}

#[tokio::main]
async fn main() -> MsgrResult<()> {
    let cli = Cli::parse();

    let config_path = cli.config.as_deref().map(std::path::Path::new);
    let config = match config_path {
        Some(path) => AppConfig::load_from_file(path)?,
        None => AppConfig::load_default()?,
    };

    let log_dir = config.effective_log_dir()?;
    let _guard = logging::init_logging(&config.logging, &log_dir, cli.verbose.then_some("debug"))?;

    let config_handle = ConfigHandle::new(config);

    info!("msgr CLI v{}", msgr_core::constants::APP_VERSION);

    match cli.command {
        Commands::Listen(args) => commands::listen::run(config_handle, args, cli.format).await,
        Commands::Config { action } => {
            commands::config::run(config_handle, action, config_path, cli.format).await
        }
    }
}
