//! Configuration for the membership coordinator and the gossip layer.

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::event::MemberEvent;

/// Configuration handed to the gossip layer when it is started.
///
/// These parameters control the underlying SWIM-style failure detector.
/// Implementations of [`GossipLayer`](crate::gossip::GossipLayer) interpret
/// them as closely as their transport allows.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GossipConfig {
    /// Address the gossip layer binds to. Doubles as the local member's
    /// advertised endpoint.
    ///
    /// Default: 127.0.0.1:7946
    pub bind_addr: SocketAddr,

    /// Interval between liveness probes of peer nodes.
    ///
    /// Default: 1s
    pub probe_interval: Duration,

    /// How long a single probe waits before it counts as a miss.
    ///
    /// Default: 500ms
    pub probe_timeout: Duration,

    /// Number of consecutive missed probes before a peer is declared
    /// dead. Higher values tolerate more transient loss at the cost of
    /// slower failure detection.
    ///
    /// Default: 4
    pub suspicion_mult: u32,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7946".parse().expect("static addr"),
            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(500),
            suspicion_mult: 4,
        }
    }
}

impl GossipConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bind address (builder pattern).
    pub const fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the probe interval (builder pattern).
    pub const fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    /// Set the probe timeout (builder pattern).
    pub const fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Set the suspicion multiplier (builder pattern).
    pub const fn with_suspicion_mult(mut self, mult: u32) -> Self {
        self.suspicion_mult = mult;
        self
    }
}

/// Configuration for a membership coordinator.
///
/// The timeouts interact: a failed member stays eligible for reconnection
/// for `reconnect_timeout`, is then demoted to a tombstone, and the
/// tombstone is deleted `tombstone_timeout` after the demotion. Both are
/// enforced by the reaper, which runs every `reap_interval`.
#[derive(Debug, Clone)]
pub struct RosterConfig {
    /// Cluster-unique identity of the local node. Must not be empty.
    pub node_name: String,

    /// Opaque role tag attached to the local member record and gossiped
    /// to peers (for example "web" or "lb").
    ///
    /// Default: ""
    pub role: String,

    /// Optional sink for membership events. Delivery is best-effort and
    /// non-blocking: when the channel is full, events are dropped.
    ///
    /// Default: None
    pub event_tx: Option<async_channel::Sender<MemberEvent>>,

    /// Period of the reaper loop that ages out failed members, expired
    /// tombstones, and stale buffered intents.
    ///
    /// Default: 15s
    pub reap_interval: Duration,

    /// Period of the reconnector loop that attempts to re-contact one
    /// random failed member.
    ///
    /// Default: 30s
    pub reconnect_interval: Duration,

    /// How long a failed member remains eligible for reconnection before
    /// the reaper demotes it to a left tombstone.
    ///
    /// Default: 24h
    pub reconnect_timeout: Duration,

    /// How long a left member's tombstone remains in the table before the
    /// reaper deletes it. Tombstones keep late-arriving gossip from
    /// resurrecting departed members.
    ///
    /// Default: 24h
    pub tombstone_timeout: Duration,

    /// How long [`leave`](crate::roster::Roster::leave) waits for the
    /// intent to propagate, and how long a Leaving status persists before
    /// reverting to Alive.
    ///
    /// Default: 120s
    pub leave_timeout: Duration,

    /// Optional period for re-broadcasting retained leave intents, so
    /// that clusters with lossy gossip still converge. Disabled when
    /// `None`.
    ///
    /// Default: None
    pub rebroadcast_interval: Option<Duration>,

    /// Nested configuration of the gossip layer.
    pub gossip: GossipConfig,
}

impl Default for RosterConfig {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            role: String::new(),
            event_tx: None,
            reap_interval: Duration::from_secs(15),
            reconnect_interval: Duration::from_secs(30),
            reconnect_timeout: Duration::from_secs(24 * 60 * 60),
            tombstone_timeout: Duration::from_secs(24 * 60 * 60),
            leave_timeout: Duration::from_secs(120),
            rebroadcast_interval: None,
            gossip: GossipConfig::default(),
        }
    }
}

impl RosterConfig {
    /// Create a new configuration for the given node name, with default
    /// values for everything else.
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            ..Self::default()
        }
    }

    /// Configuration tuned for LAN clusters.
    ///
    /// - Aggressive probing for fast failure detection
    /// - Short reap and reconnect periods
    pub fn lan(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            reap_interval: Duration::from_secs(5),
            reconnect_interval: Duration::from_secs(10),
            reconnect_timeout: Duration::from_secs(60 * 60),
            tombstone_timeout: Duration::from_secs(60 * 60),
            leave_timeout: Duration::from_secs(15),
            gossip: GossipConfig {
                probe_interval: Duration::from_millis(500),
                probe_timeout: Duration::from_millis(200),
                suspicion_mult: 3,
                ..GossipConfig::default()
            },
            ..Self::default()
        }
    }

    /// Set the role tag (builder pattern).
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    /// Set the membership event sink (builder pattern).
    pub fn with_event_sink(mut self, tx: async_channel::Sender<MemberEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Set the reaper period (builder pattern).
    pub const fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    /// Set the reconnector period (builder pattern).
    pub const fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    /// Set the failed-member reconnection window (builder pattern).
    pub const fn with_reconnect_timeout(mut self, timeout: Duration) -> Self {
        self.reconnect_timeout = timeout;
        self
    }

    /// Set the tombstone retention window (builder pattern).
    pub const fn with_tombstone_timeout(mut self, timeout: Duration) -> Self {
        self.tombstone_timeout = timeout;
        self
    }

    /// Set the leave propagation timeout (builder pattern).
    pub const fn with_leave_timeout(mut self, timeout: Duration) -> Self {
        self.leave_timeout = timeout;
        self
    }

    /// Enable periodic intent rebroadcast (builder pattern).
    pub const fn with_rebroadcast_interval(mut self, interval: Duration) -> Self {
        self.rebroadcast_interval = Some(interval);
        self
    }

    /// Set the nested gossip configuration (builder pattern).
    pub fn with_gossip(mut self, gossip: GossipConfig) -> Self {
        self.gossip = gossip;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.node_name.is_empty() {
            return Err(Error::Config("node name must not be empty".to_string()));
        }
        if self.node_name.len() > crate::message::MAX_NODE_NAME_LEN {
            return Err(Error::Config(format!(
                "node name exceeds {} bytes",
                crate::message::MAX_NODE_NAME_LEN
            )));
        }
        if self.reap_interval.is_zero() {
            return Err(Error::Config("reap interval must be non-zero".to_string()));
        }
        if self.reconnect_interval.is_zero() {
            return Err(Error::Config(
                "reconnect interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
