//! Error types for wormhole operations.

use std::io;

use wormhole_proto::EncodeError;

use crate::PeerId;

/// Alias for `Result<T, wormhole::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by a single [`Channel`](crate::Channel).
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ChannelError {
    /// The channel was invalidated and performs no more I/O.
    #[error("channel has been invalidated")]
    Invalidated,

    /// Too many relayed packets are waiting for a peer that is not reading.
    #[error("relay queue full, packet dropped")]
    Backlogged,

    /// The packet could not be framed.
    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// Writing to the output stream failed.
    #[error("transport write failed: {0}")]
    Transport(#[from] io::Error),
}

/// Errors returned by the [`Manager`](crate::Manager) and services.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Delivery to one peer failed.
    #[error("peer {peer}: {source}")]
    Channel {
        /// The addressed peer.
        peer: PeerId,
        /// What went wrong on its channel.
        #[source]
        source: ChannelError,
    },

    /// A payload could not be serialized.
    #[error("payload serialization failed: {0}")]
    Serialize(#[from] postcard::Error),

    /// No channel is registered for the addressed peer.
    #[error("no channel registered for peer {0}")]
    UnknownPeer(PeerId),

    /// The caller broke an API contract (e.g. a guest addressing another guest).
    ///
    /// Returned only when the manager was built without
    /// [`strict_faults`](crate::ManagerBuilder::strict_faults); otherwise
    /// the violation panics.
    #[error("contract violation: {0}")]
    Fault(String),

    /// The requested service kind is not running on this manager.
    #[error("service {0} is not available")]
    ServiceUnavailable(&'static str),

    /// The guest serial link was already set up.
    #[error("serial link already bootstrapped")]
    AlreadyBootstrapped,

    /// A reply did not arrive in time.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// The manager has been shut down.
    #[error("manager has been shut down")]
    Closed,

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// An I/O error from configuration loading or the serial device.
    #[error(transparent)]
    Io(#[from] io::Error),
}
