//! Built-in payloads exchanged between every host and guest.

use serde::{Deserialize, Serialize};

use crate::Payload;

/// Asks a peer to describe itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRequest {
    /// Echoed back in the matching [`StatusReport`].
    pub nonce: u64,
}

impl Payload for StatusRequest {
    const TAG: &'static str = "wormhole.status.request";
}

/// Reply to [`StatusRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Nonce of the request being answered.
    pub nonce: u64,
    /// Crate version of the answering side.
    pub version: String,
    /// Whether the answering side runs inside the VM.
    pub guest: bool,
    /// Milliseconds since the answering manager was created.
    pub uptime_ms: u64,
}

impl Payload for StatusReport {
    const TAG: &'static str = "wormhole.status.report";
}
