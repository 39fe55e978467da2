//! Peer identities.

use std::fmt;
use std::sync::Arc;

/// Identity of the host peer, the same on every side of the wormhole.
pub const HOST_PEER: &str = "host";

/// Opaque identity of one endpoint (the host or a specific guest).
///
/// Cheap to clone. The registry is keyed by it; nothing else holds a direct
/// reference to a channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(Arc<str>);

impl PeerId {
    /// Creates an identity from any string.
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    /// The well-known host identity ([`HOST_PEER`]).
    pub fn host() -> Self {
        Self::new(HOST_PEER)
    }

    /// Returns `true` for the host identity.
    pub fn is_host(&self) -> bool {
        &*self.0 == HOST_PEER
    }

    /// The identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(Arc::from(id))
    }
}

impl PartialEq<str> for PeerId {
    fn eq(&self, other: &str) -> bool {
        &*self.0 == other
    }
}

impl PartialEq<&str> for PeerId {
    fn eq(&self, other: &&str) -> bool {
        &*self.0 == *other
    }
}
