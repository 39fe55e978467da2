//! Runtime configuration and JSON persistence.

use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{fs, io};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Top-level configuration shared by host and guest.
///
/// Every field has a default, so a config file only needs the values it
/// overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct Config {
    /// Liveness timing.
    pub keepalive: Keepalive,
    /// Guest serial device.
    pub serial: SerialConfig,
    /// Queue sizes.
    pub queues: Queues,
    /// Relay packets marked for propagation between guests (host only).
    pub propagation: bool,
}

/// Ping/pong timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct Keepalive {
    /// Interval between pings sent to every peer.
    pub ping_interval_ms: u64,
    /// Lateness of a ping tick that is tolerated without a diagnostic.
    pub ping_tolerance_ms: u64,
    /// Silence after which a peer counts as disconnected.
    pub connection_timeout_ms: u64,
    /// Pause before restarting a receive loop after a read failure.
    pub read_backoff_ms: u64,
}

/// Serial device used by the guest to reach the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct SerialConfig {
    /// Device node.
    pub path: PathBuf,
    /// Line speed in baud.
    pub baud: u32,
}

/// Capacities of the internal packet queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct Queues {
    /// Packets buffered between the channels and the router.
    pub inbound: usize,
    /// Packets buffered per subscriber before it starts lagging.
    pub subscriber: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            keepalive: Keepalive::default(),
            serial: SerialConfig::default(),
            queues: Queues::default(),
            propagation: true,
        }
    }
}

impl Default for Keepalive {
    fn default() -> Self {
        Self {
            ping_interval_ms: 2_000,
            ping_tolerance_ms: 500,
            connection_timeout_ms: 5_000,
            read_backoff_ms: 1_000,
        }
    }
}

impl Keepalive {
    /// See [`ping_interval_ms`](Self::ping_interval_ms).
    pub const fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    /// See [`ping_tolerance_ms`](Self::ping_tolerance_ms).
    pub const fn ping_tolerance(&self) -> Duration {
        Duration::from_millis(self.ping_tolerance_ms)
    }

    /// See [`connection_timeout_ms`](Self::connection_timeout_ms).
    pub const fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// See [`read_backoff_ms`](Self::read_backoff_ms).
    pub const fn read_backoff(&self) -> Duration {
        Duration::from_millis(self.read_backoff_ms)
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/dev/hvc0"),
            baud: 115_200,
        }
    }
}

impl Default for Queues {
    fn default() -> Self {
        Self {
            inbound: 1024,
            subscriber: 1024,
        }
    }
}

impl Config {
    /// Loads and validates a JSON config file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        let config: Self =
            serde_json::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path` if it exists, otherwise returns the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Persists the config as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(io::Error::other)?;
        Ok(())
    }

    /// Per-user config location (`{config_dir}/wormhole/config.json`).
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("wormhole").join("config.json"))
    }

    /// Checks the timing and queue invariants.
    pub fn validate(&self) -> Result<()> {
        let k = &self.keepalive;
        if k.ping_interval_ms == 0 {
            return Err(Error::Config("ping_interval_ms must be positive".into()));
        }
        if k.ping_tolerance_ms >= k.ping_interval_ms {
            return Err(Error::Config(
                "ping_tolerance_ms must be below ping_interval_ms".into(),
            ));
        }
        // One lost ping must not be enough to declare the peer gone.
        if k.connection_timeout_ms < k.ping_interval_ms.saturating_mul(2) {
            return Err(Error::Config(format!(
                "connection_timeout_ms ({}) must be at least twice ping_interval_ms ({})",
                k.connection_timeout_ms, k.ping_interval_ms
            )));
        }
        if self.queues.inbound == 0 || self.queues.subscriber == 0 {
            return Err(Error::Config("queue capacities must be positive".into()));
        }
        Ok(())
    }
}
