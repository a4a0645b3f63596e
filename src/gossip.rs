//! Abstraction over the SWIM-style gossip layer.
//!
//! The coordinator consumes the gossip layer as a capability set: join a
//! set of seeds, broadcast a user message, announce a graceful departure,
//! shut down, and deliver delegate callbacks. Keeping the layer behind a
//! trait lets tests drive the coordinator through an in-memory
//! implementation (see [`testing`](crate::testing)) that injects join,
//! death, and user-message events directly.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;

use crate::config::GossipConfig;
use crate::error::Result;

/// A node as seen by the gossip layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GossipNode {
    /// Cluster-unique node name.
    pub name: String,
    /// The node's advertised endpoint.
    pub addr: SocketAddr,
    /// Opaque application metadata attached to the node. The coordinator
    /// stores the member's role tag here.
    pub meta: Bytes,
}

impl GossipNode {
    /// Create a new node descriptor.
    pub fn new(name: impl Into<String>, addr: SocketAddr, meta: Bytes) -> Self {
        Self {
            name: name.into(),
            addr,
            meta,
        }
    }
}

/// Callbacks delivered by the gossip layer.
///
/// Callbacks are invoked synchronously from the gossip layer's own
/// execution context. **They must return quickly**: the coordinator takes
/// its table lock only for the duration of the update and defers event
/// emission, and implementations of this trait should follow the same
/// discipline.
#[auto_impl::auto_impl(Box, Arc)]
pub trait GossipDelegate: Send + Sync + 'static {
    /// A node was observed alive, either for the first time or again
    /// after a failure.
    fn on_join(&self, node: GossipNode);

    /// A node is dead: it stopped answering probes, or it announced a
    /// graceful departure. The receiver disambiguates by the node's
    /// current membership status.
    fn on_dead(&self, name: &str);

    /// An opaque user message was received from the broadcast stream.
    fn on_user_msg(&self, payload: &[u8]);
}

/// Capability set the coordinator requires from a gossip layer.
///
/// Implementations bind lazily: construction is cheap and infallible,
/// while [`start`](Self::start) performs the bind and surfaces failures
/// to [`Roster::create`](crate::roster::Roster::create).
pub trait GossipLayer: Send + Sync + 'static {
    /// Bind the layer, attach the delegate, and begin probing.
    ///
    /// `local` describes the local node (name, advertised address, and
    /// metadata to gossip to peers). Fails if the configured address
    /// cannot be bound.
    fn start(
        &self,
        config: &GossipConfig,
        local: GossipNode,
        delegate: Arc<dyn GossipDelegate>,
    ) -> Result<()>;

    /// The address the layer is bound to, once started.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Contact each seed endpoint and merge cluster state with it.
    ///
    /// Returns the number of seeds successfully contacted; errs only when
    /// every seed failed. Membership discoveries arrive asynchronously
    /// through [`GossipDelegate::on_join`].
    fn join(&self, seeds: &[SocketAddr]) -> impl Future<Output = Result<usize>> + Send;

    /// Queue a user message for broadcast to all cluster members.
    ///
    /// When `notify` is provided, a unit is sent on it once the message
    /// has propagated to the current membership. Used by graceful leave
    /// to bound its wait.
    fn broadcast(&self, payload: Bytes, notify: Option<async_channel::Sender<()>>) -> Result<()>;

    /// Announce a graceful departure so that peers observe an intentional
    /// death rather than a probe failure.
    fn leave(&self) -> impl Future<Output = Result<()>> + Send;

    /// Stop probing and release the bind. Idempotent.
    fn shutdown(&self) -> impl Future<Output = Result<()>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gossip_node() {
        let node = GossipNode::new("node-a", "127.0.0.1:7946".parse().unwrap(), Bytes::new());
        assert_eq!(node.name, "node-a");
        assert_eq!(node.addr.port(), 7946);
    }
}
