//! Self-healing host↔guest messaging over a single byte stream.
//!
//! `wormhole` multiplexes typed messages between a VM host and the
//! processes running inside its guests, over one continuous transport per
//! guest (typically a virtual serial console). Each peer gets a [`Channel`]
//! that keeps the link alive with ping/pong heartbeats and transparently
//! restarts its reader when the transport hiccups; a [`Manager`] owns the
//! channels and offers typed send/subscribe on top.
//!
//! # Host
//!
//! ```no_run
//! use wormhole::{Manager, Role, StatusClient, StatusService};
//!
//! # async fn run(input: tokio::fs::File, output: tokio::fs::File) -> wormhole::Result<()> {
//! let manager = Manager::builder(Role::Host)
//!     .service::<StatusService>()
//!     .build()?;
//! manager.register(input, output, "guest-1");
//! manager.activate();
//!
//! let peer = "guest-1".into();
//! manager.wait_connected(&peer).await?;
//! let report = manager
//!     .client::<StatusClient>()?
//!     .query(&peer, std::time::Duration::from_secs(2))
//!     .await?;
//! println!("guest runs wormhole {}", report.version);
//! # Ok(())
//! # }
//! ```
//!
//! # Payloads
//!
//! Anything implementing [`Payload`] can be sent. Its [`Payload::TAG`]
//! selects the subscribers; [`Payload::PROPAGATE`] lets the host relay it
//! to every other guest, and [`Payload::RESEND_ON_RECONNECT`] re-sends it on
//! every reconnect of the target.

mod channel;
mod config;
mod error;
mod manager;
mod peer;
#[cfg(unix)]
mod serial;
mod service;
mod status;
#[cfg(test)]
mod testing;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use channel::{BoxReader, BoxWriter, Channel, Inbound, LinkState};
pub use config::{Config, Keepalive, Queues, SerialConfig};
pub use error::{ChannelError, Error, Result};
pub use manager::{Manager, ManagerBuilder, Role, Subscription};
pub use peer::{HOST_PEER, PeerId};
pub use service::{Client, Service, ServiceDescriptor, ServiceKind};
pub use status::{StatusClient, StatusService};
pub use wormhole_proto::{Packet, PacketKind, Payload, StatusReport, StatusRequest};

/// Locks `mutex`, recovering the data if a holder panicked.
///
/// None of the guarded state can be left half-updated by a panic.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
