//! wormhole guest agent: runs inside the VM and keeps a link to the host.
//!
//! Opens the virtual serial console, registers it as the host peer and
//! serves the built-in services until interrupted.
#![allow(clippy::print_stderr)]

#[cfg(not(unix))]
fn main() {
    eprintln!("wormhole-guest only runs inside a Unix guest");
    std::process::exit(1);
}

#[cfg(unix)]
fn main() -> anyhow::Result<()> {
    agent::run()
}

#[cfg(unix)]
mod agent {
    use std::path::PathBuf;
    use std::time::Duration;

    use anyhow::{Context, Result};
    use clap::Parser;
    use tracing_subscriber::EnvFilter;
    use wormhole::{Config, Error, Manager, Role, StatusService};

    /// Longest pause between attempts to open the serial device.
    const MAX_RETRY: Duration = Duration::from_secs(30);

    #[derive(Parser)]
    #[command(name = "wormhole-guest", version, about = "wormhole guest agent")]
    struct Args {
        /// Config file (defaults to the per-user config location).
        #[arg(long)]
        config: Option<PathBuf>,

        /// Serial device, overriding the config file.
        #[arg(long)]
        device: Option<PathBuf>,

        /// Line speed in baud, overriding the config file.
        #[arg(long)]
        baud: Option<u32>,
    }

    /// Entry point for the guest agent.
    pub(crate) fn run() -> Result<()> {
        let args = Args::parse();
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .with_writer(std::io::stderr)
            .init();

        let config = load_config(&args)?;
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to start runtime")?
            .block_on(serve(config))
    }

    /// Resolves the effective configuration.
    fn load_config(args: &Args) -> Result<Config> {
        let mut config = match args.config.clone().or_else(Config::default_path) {
            Some(path) => Config::load_or_default(&path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => Config::default(),
        };
        if let Some(device) = &args.device {
            config.serial.path.clone_from(device);
        }
        if let Some(baud) = args.baud {
            config.serial.baud = baud;
        }
        config.validate().context("invalid configuration")?;
        Ok(config)
    }

    /// Bootstraps the serial link and serves until Ctrl-C.
    async fn serve(config: Config) -> Result<()> {
        let manager = Manager::builder(Role::Guest)
            .config(config)
            .service::<StatusService>()
            .build()?;

        // The console may not exist yet while the VM is still booting.
        let mut delay = Duration::from_millis(250);
        loop {
            match manager.connect_serial() {
                Ok(()) | Err(Error::AlreadyBootstrapped) => break,
                Err(e) => {
                    tracing::warn!(error = %e, retry_ms = delay.as_millis(), "serial link unavailable");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(MAX_RETRY);
                }
            }
        }
        manager.activate();

        let mut connected = manager.connected();
        tokio::spawn(async move {
            while connected.changed().await.is_ok() {
                let up = *connected.borrow_and_update();
                tracing::info!(connected = up, "host link changed");
            }
        });

        tokio::signal::ctrl_c()
            .await
            .context("failed to wait for ctrl-c")?;
        tracing::info!("shutting down");
        manager.shutdown();
        Ok(())
    }
}
