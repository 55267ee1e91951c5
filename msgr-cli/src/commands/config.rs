//! Config commands.

use std::path::Path;

use clap::Subcommand;
use console::style;

use msgr_core::config::{AppConfig, ConfigHandle};
use msgr_core::error::{MsgrError, MsgrResult};

use crate::OutputFormat;

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration.
    Show,
    /// Print the configuration file location.
    Path,
    /// Write a default configuration file.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

pub async fn run(
    config: ConfigHandle,
    action: ConfigAction,
    path: Option<&Path>,
    format: OutputFormat,
) -> MsgrResult<()> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => AppConfig::default_config_path()?,
    };

    match action {
        ConfigAction::Show => {
            let cfg = config.read().await;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&*cfg)?),
                OutputFormat::Text => {
                    let rendered = toml::to_string_pretty(&*cfg)
                        .map_err(|e| MsgrError::Config(format!("failed to serialize config: {e}")))?;
                    println!("{rendered}");
                }
            }
        }
        ConfigAction::Path => println!("{}", path.display()),
        ConfigAction::Init { force } => {
            if path.exists() && !force {
                println!(
                    "{} {} already exists (use --force to overwrite)",
                    style("SKIP").yellow().bold(),
                    path.display()
                );
                return Ok(());
            }
            AppConfig::default().save_to_file(&path)?;
            println!("{} Wrote {}", style("OK").green().bold(), path.display());
        }
    }
    Ok(())
}
