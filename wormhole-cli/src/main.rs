//! CLI for wormhole host↔guest messaging.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

mod host;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tracing_subscriber::EnvFilter;
use wormhole::Config;

#[derive(Parser)]
#[command(name = "wormhole", version, about = "Self-healing host/guest messaging for VMs")]
struct Cli {
    /// Config file (defaults to the per-user config location).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Bind guest transports and relay messages until interrupted.
    Host(host::HostArgs),

    /// Show or initialize the configuration.
    Config {
        /// Write the defaults to the config file if it does not exist.
        #[arg(long)]
        init: bool,
    },

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = Cli::parse().dispatch().await {
        eprintln!("wormhole: {e:#}");
        std::process::exit(1);
    }
}

impl Cli {
    async fn dispatch(self) -> Result<()> {
        match self.command {
            Command::Host(args) => {
                let config = load(self.config.as_ref())?;
                host::run(args, config).await
            }
            Command::Config { init } => show_config(self.config, init),
            Command::Completion { shell } => {
                clap_complete::generate(shell, &mut Self::command(), "wormhole", &mut std::io::stdout());
                Ok(())
            }
        }
    }
}

/// Loads the config file, falling back to defaults when it is absent.
fn load(path: Option<&PathBuf>) -> Result<Config> {
    match path.cloned().or_else(Config::default_path) {
        Some(path) => Config::load_or_default(&path)
            .with_context(|| format!("failed to load {}", path.display())),
        None => Ok(Config::default()),
    }
}

fn show_config(path: Option<PathBuf>, init: bool) -> Result<()> {
    let path = path
        .or_else(Config::default_path)
        .ok_or_else(|| anyhow::anyhow!("no platform config directory"))?;
    if init && !path.exists() {
        Config::default()
            .save(&path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        eprintln!("wrote {}", path.display());
    }
    let config = Config::load_or_default(&path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn host_requires_a_peer() {
        assert!(Cli::try_parse_from(["wormhole", "host"]).is_err());
        assert!(Cli::try_parse_from(["wormhole", "host", "--peer", "vm1=/dev/null"]).is_ok());
    }
}
