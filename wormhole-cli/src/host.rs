//! `wormhole host`: binds guest transports to peers and relays between them.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Args;
use colored::Colorize;
use tokio::fs::File;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use wormhole::{Config, Manager, PeerId, Role, StatusClient, StatusService};

/// Arguments for `wormhole host`.
#[derive(Args)]
pub(crate) struct HostArgs {
    /// Guest transport, as `NAME=INPUT[:OUTPUT]`. Without OUTPUT the INPUT
    /// path is opened for both directions. Repeatable.
    #[arg(long = "peer", value_name = "NAME=INPUT[:OUTPUT]", required = true, value_parser = parse_peer)]
    peers: Vec<PeerSpec>,

    /// How long to wait for a guest's status report after it connects.
    #[arg(long, value_name = "MS", default_value_t = 2000)]
    status_timeout: u64,

    /// Do not relay propagating packets between guests.
    #[arg(long)]
    no_propagation: bool,
}

/// One `--peer` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PeerSpec {
    name: String,
    input: PathBuf,
    output: Option<PathBuf>,
}

fn parse_peer(s: &str) -> Result<PeerSpec> {
    let Some((name, paths)) = s.split_once('=') else {
        bail!("expected NAME=INPUT[:OUTPUT], got {s:?}");
    };
    if name.is_empty() {
        bail!("peer name must not be empty");
    }
    if name == wormhole::HOST_PEER {
        bail!("{name:?} is reserved for the host itself");
    }
    let (input, output) = match paths.split_once(':') {
        Some((input, output)) => (input, Some(PathBuf::from(output))),
        None => (paths, None),
    };
    if input.is_empty() || output.as_ref().is_some_and(|o| o.as_os_str().is_empty()) {
        bail!("empty transport path in {s:?}");
    }
    Ok(PeerSpec {
        name: name.to_owned(),
        input: input.into(),
        output,
    })
}

/// Runs the relay until Ctrl-C.
///
/// Transports are opened concurrently and each peer is bound as soon as its
/// own open completes, so a FIFO still waiting for its writer does not hold
/// up the others. Failing to open any transport ends the run.
pub(crate) async fn run(args: HostArgs, mut config: Config) -> Result<()> {
    if args.no_propagation {
        config.propagation = false;
    }
    let manager = Manager::builder(Role::Host)
        .config(config)
        .service::<StatusService>()
        .build()?;
    manager.activate();

    let (connected_tx, mut connected_rx) = mpsc::unbounded_channel();
    let mut opening = open_all(args.peers);
    let status = manager.client::<StatusClient>()?;
    let timeout = Duration::from_millis(args.status_timeout);
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to wait for ctrl-c")?;
                break;
            }
            Some(joined) = opening.join_next() => {
                let (spec, opened) = joined.context("transport open task failed")?;
                let (input, output) = opened?;
                bind(&manager, &spec, input, output, &connected_tx)?;
            }
            Some(peer) = connected_rx.recv() => {
                let status = status.clone();
                tokio::spawn(async move { report(&status, &peer, timeout).await });
            }
        }
    }

    manager.shutdown();
    println!("{}", "stopped".dimmed());
    Ok(())
}

/// Starts opening every peer's transport at once.
fn open_all(peers: Vec<PeerSpec>) -> JoinSet<(PeerSpec, Result<(File, File)>)> {
    let mut opening = JoinSet::new();
    for spec in peers {
        opening.spawn(async move {
            let opened = open(&spec).await;
            (spec, opened)
        });
    }
    opening
}

/// Registers an opened peer and reports its connections on `connected`.
fn bind(
    manager: &Manager,
    spec: &PeerSpec,
    input: File,
    output: File,
    connected: &mpsc::UnboundedSender<PeerId>,
) -> Result<()> {
    let peer = PeerId::new(&spec.name);
    manager.register(input, output, peer.clone());

    let tx = connected.clone();
    let name = peer.clone();
    manager.on_connected(&peer, move || {
        let _ = tx.send(name.clone());
    })?;
    println!("{} {} <- {}", "bound".cyan(), spec.name.bold(), describe(spec));
    Ok(())
}

/// Opens the transport files of one peer.
async fn open(spec: &PeerSpec) -> Result<(File, File)> {
    let mut options = tokio::fs::OpenOptions::new();
    options.read(true);
    let Some(output) = &spec.output else {
        let file = options
            .write(true)
            .open(&spec.input)
            .await
            .with_context(|| format!("failed to open {}", spec.input.display()))?;
        let writer = file
            .try_clone()
            .await
            .context("failed to duplicate transport handle")?;
        return Ok((file, writer));
    };

    let input = options
        .open(&spec.input)
        .await
        .with_context(|| format!("failed to open {}", spec.input.display()))?;
    let output = tokio::fs::OpenOptions::new()
        .write(true)
        .open(output)
        .await
        .with_context(|| format!("failed to open {}", output.display()))?;
    Ok((input, output))
}

fn describe(spec: &PeerSpec) -> String {
    match &spec.output {
        Some(output) => format!("{} / {}", spec.input.display(), output.display()),
        None => spec.input.display().to_string(),
    }
}

/// Prints the status of a freshly connected guest.
async fn report(status: &StatusClient, peer: &PeerId, timeout: Duration) {
    match status.query(peer, timeout).await {
        Ok(report) => println!(
            "{} {} wormhole {} up {}s",
            "connected".green().bold(),
            peer.as_str().bold(),
            report.version,
            report.uptime_ms / 1000,
        ),
        Err(e) => println!(
            "{} {} ({})",
            "connected".green().bold(),
            peer.as_str().bold(),
            format!("no status: {e}").yellow(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_split_transport() {
        let spec = parse_peer("vm1=/run/vm1.out:/run/vm1.in").unwrap();
        assert_eq!(spec.name, "vm1");
        assert_eq!(spec.input, PathBuf::from("/run/vm1.out"));
        assert_eq!(spec.output, Some(PathBuf::from("/run/vm1.in")));
    }

    #[test]
    fn parses_shared_transport() {
        let spec = parse_peer("vm2=/dev/pts/4").unwrap();
        assert_eq!(spec.output, None);
        assert_eq!(describe(&spec), "/dev/pts/4");
    }

    #[test]
    fn rejects_bad_specs() {
        for bad in ["vm1", "=/dev/x", "vm1=", "vm1=/a:", "host=/dev/x"] {
            assert!(parse_peer(bad).is_err(), "{bad}");
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn waiting_fifo_does_not_block_other_peers() {
        use nix::sys::stat::Mode;

        let dir = tempfile::tempdir().unwrap();
        let fifo = dir.path().join("slow.in");
        nix::unistd::mkfifo(fifo.as_path(), Mode::S_IRUSR | Mode::S_IWUSR).unwrap();
        let slow_out = dir.path().join("slow.out");
        std::fs::write(&slow_out, b"").unwrap();
        let fast = dir.path().join("fast");
        std::fs::write(&fast, b"").unwrap();

        let slow = PeerSpec {
            name: "slow".into(),
            input: fifo.clone(),
            output: Some(slow_out),
        };
        let quick = PeerSpec {
            name: "fast".into(),
            input: fast,
            output: None,
        };
        let mut opening = open_all(vec![slow, quick]);

        let (first, opened) = tokio::time::timeout(Duration::from_secs(5), opening.join_next())
            .await
            .expect("open blocked behind the fifo")
            .unwrap()
            .unwrap();
        assert_eq!(first.name, "fast");
        assert!(opened.is_ok());

        // Opening the write end releases the blocked reader.
        let writer = tokio::task::spawn_blocking(move || {
            std::fs::OpenOptions::new().write(true).open(fifo)
        });
        let (second, opened) = tokio::time::timeout(Duration::from_secs(5), opening.join_next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(second.name, "slow");
        assert!(opened.is_ok());
        writer.await.unwrap().unwrap();
    }
}
