//! Packets and the typed payload contract.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A message type that can travel through the wormhole.
///
/// The [`TAG`](Payload::TAG) is written into every packet so the receiver
/// can pick the right type to decode into. It must be identical on host and
/// guest builds and unique across all payload types.
pub trait Payload: Serialize + DeserializeOwned + Send + 'static {
    /// Stable wire tag identifying this payload type.
    const TAG: &'static str;

    /// Hold the message until the peer is connected, and send it again
    /// (freshly encoded) every time the peer reconnects.
    const RESEND_ON_RECONNECT: bool = false;

    /// Let the host relay this message from one guest to all other guests.
    const PROPAGATE: bool = false;
}

/// Distinguishes liveness control frames from application frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum PacketKind {
    /// Heartbeat request; the receiver answers with [`PacketKind::Pong`].
    Ping,
    /// Heartbeat reply.
    Pong,
    /// Application frame carrying a tagged payload.
    Message,
}

/// One framed unit on the wire.
///
/// Packets are immutable once built. Senders construct a fresh packet for
/// every transmission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    /// Control or application frame.
    kind: PacketKind,
    /// Payload type tag (empty for control frames).
    tag: String,
    /// Whether the host should relay this packet to other guests.
    propagate: bool,
    /// Postcard-encoded payload bytes.
    payload: Vec<u8>,
}

impl Packet {
    /// Builds a heartbeat ping.
    pub const fn ping() -> Self {
        Self::control(PacketKind::Ping)
    }

    /// Builds a heartbeat pong.
    pub const fn pong() -> Self {
        Self::control(PacketKind::Pong)
    }

    /// Builds an application packet from raw parts.
    pub fn message(tag: impl Into<String>, payload: Vec<u8>, propagate: bool) -> Self {
        Self {
            kind: PacketKind::Message,
            tag: tag.into(),
            propagate,
            payload,
        }
    }

    /// Serializes `payload` into a new application packet.
    pub fn from_payload<T: Payload>(payload: &T) -> postcard::Result<Self> {
        Ok(Self::message(
            T::TAG,
            postcard::to_allocvec(payload)?,
            T::PROPAGATE,
        ))
    }

    /// Decodes the payload as `T`.
    ///
    /// Returns `None` if this packet is not a `T` message.
    pub fn decode<T: Payload>(&self) -> Option<postcard::Result<T>> {
        self.is::<T>().then(|| postcard::from_bytes(&self.payload))
    }

    /// Returns `true` if this is an application packet tagged `T::TAG`.
    pub fn is<T: Payload>(&self) -> bool {
        self.kind == PacketKind::Message && self.tag == T::TAG
    }

    /// Frame kind.
    pub const fn kind(&self) -> PacketKind {
        self.kind
    }

    /// Payload type tag.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Whether the host relays this packet between guests.
    pub const fn propagate(&self) -> bool {
        self.propagate
    }

    /// Raw payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Builds an empty control frame.
    const fn control(kind: PacketKind) -> Self {
        Self {
            kind,
            tag: String::new(),
            propagate: false,
            payload: Vec::new(),
        }
    }
}
