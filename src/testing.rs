//! In-process gossip layer for driving coordinators in tests.
//!
//! [`LabNetwork`] is a process-local registry standing in for a real
//! SWIM transport: endpoints register under a socket address, joins merge
//! connected components and fan out join callbacks, broadcasts deliver
//! user messages to every live component member, and each endpoint runs a
//! probe loop that declares unresponsive peers dead after
//! `probe_interval x suspicion_mult`.
//!
//! No sockets are opened; everything happens through delegate callbacks,
//! which makes multi-coordinator scenarios (failure detection, reconnect,
//! administrative removal) deterministic enough for integration tests.
//!
//! ## Example
//!
//! ```ignore
//! use gossip_roster::{Roster, RosterConfig};
//! use gossip_roster::testing::{LabGossip, LabNetwork};
//!
//! let network = LabNetwork::new();
//! let a = Roster::create(config_a, LabGossip::new(&network)).await?;
//! let b = Roster::create(config_b, LabGossip::new(&network)).await?;
//! a.join(&[b_addr]).await?;
//! ```

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::FutureExt;
use futures_timer::Delay;
use parking_lot::{Mutex, RwLock};

use crate::config::GossipConfig;
use crate::error::{Error, Result};
use crate::gossip::{GossipDelegate, GossipLayer, GossipNode};

/// One registered endpoint in the lab network.
#[derive(Clone)]
struct Endpoint {
    node: GossipNode,
    delegate: Arc<dyn GossipDelegate>,
    alive: bool,
    /// Connected-component id; endpoints in the same component see each
    /// other's membership and broadcasts.
    cluster: u64,
}

#[derive(Default)]
struct LabNetworkInner {
    endpoints: RwLock<HashMap<SocketAddr, Endpoint>>,
    next_cluster: AtomicU64,
}

/// A process-local gossip fabric shared by a set of [`LabGossip`] layers.
///
/// Cloning is cheap; all clones refer to the same fabric.
#[derive(Clone, Default)]
pub struct LabNetwork {
    inner: Arc<LabNetworkInner>,
}

impl LabNetwork {
    /// Create an empty fabric.
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, node: GossipNode, delegate: Arc<dyn GossipDelegate>) -> Result<()> {
        let mut endpoints = self.inner.endpoints.write();
        if endpoints.get(&node.addr).is_some_and(|ep| ep.alive) {
            return Err(Error::Gossip(format!("address already in use: {}", node.addr)));
        }
        let cluster = self.inner.next_cluster.fetch_add(1, Ordering::Relaxed);
        endpoints.insert(
            node.addr,
            Endpoint {
                node,
                delegate,
                alive: true,
                cluster,
            },
        );
        Ok(())
    }

    /// Merge the components of `from` and `seed` and fan out join
    /// callbacks so every live member of the merged component learns
    /// about every other.
    fn connect(&self, from: SocketAddr, seed: SocketAddr) -> Result<()> {
        let callbacks = {
            let mut endpoints = self.inner.endpoints.write();
            let from_cluster = match endpoints.get(&from) {
                Some(ep) if ep.alive => ep.cluster,
                _ => return Err(Error::Gossip("layer is not started".to_string())),
            };
            let seed_cluster = match endpoints.get(&seed) {
                Some(ep) if ep.alive => ep.cluster,
                _ => return Err(Error::Gossip(format!("seed unreachable: {}", seed))),
            };
            if from_cluster != seed_cluster {
                for ep in endpoints.values_mut() {
                    if ep.cluster == seed_cluster {
                        ep.cluster = from_cluster;
                    }
                }
            }

            let members: Vec<Endpoint> = endpoints
                .values()
                .filter(|ep| ep.cluster == from_cluster && ep.alive)
                .cloned()
                .collect();
            let mut callbacks = Vec::new();
            for observer in &members {
                for subject in &members {
                    if observer.node.addr != subject.node.addr {
                        callbacks.push((observer.delegate.clone(), subject.node.clone()));
                    }
                }
            }
            callbacks
        };

        // Deliver outside the registry lock; receivers take their own
        // table locks and may call back into the network.
        for (delegate, node) in callbacks {
            delegate.on_join(node);
        }
        Ok(())
    }

    fn broadcast(&self, from: SocketAddr, payload: Bytes) -> Result<()> {
        let targets = {
            let endpoints = self.inner.endpoints.read();
            let cluster = match endpoints.get(&from) {
                Some(ep) if ep.alive => ep.cluster,
                _ => return Err(Error::Gossip("layer is not started".to_string())),
            };
            endpoints
                .values()
                .filter(|ep| ep.cluster == cluster && ep.alive && ep.node.addr != from)
                .map(|ep| ep.delegate.clone())
                .collect::<Vec<_>>()
        };

        for delegate in targets {
            delegate.on_user_msg(&payload);
        }
        Ok(())
    }

    /// Graceful departure: peers observe an intentional death right away
    /// instead of waiting for probes to miss.
    fn leave(&self, from: SocketAddr) {
        let (name, peers) = {
            let mut endpoints = self.inner.endpoints.write();
            let Some(ep) = endpoints.get_mut(&from) else {
                return;
            };
            ep.alive = false;
            // Detach into a fresh component so peers stop probing it.
            let cluster = std::mem::replace(
                &mut ep.cluster,
                self.inner.next_cluster.fetch_add(1, Ordering::Relaxed),
            );
            let name = ep.node.name.clone();
            let peers = endpoints
                .values()
                .filter(|peer| peer.cluster == cluster && peer.alive && peer.node.addr != from)
                .map(|peer| peer.delegate.clone())
                .collect::<Vec<_>>();
            (name, peers)
        };

        for delegate in peers {
            delegate.on_dead(&name);
        }
    }

    /// Hard stop: the endpoint goes silent and peers are left to their
    /// failure detectors.
    fn shutdown(&self, from: SocketAddr) {
        let mut endpoints = self.inner.endpoints.write();
        if let Some(ep) = endpoints.get_mut(&from) {
            ep.alive = false;
        }
    }

    fn component_of(&self, addr: SocketAddr) -> Vec<(String, SocketAddr, bool)> {
        let endpoints = self.inner.endpoints.read();
        let Some(cluster) = endpoints.get(&addr).map(|ep| ep.cluster) else {
            return Vec::new();
        };
        endpoints
            .values()
            .filter(|ep| ep.cluster == cluster)
            .map(|ep| (ep.node.name.clone(), ep.node.addr, ep.alive))
            .collect()
    }
}

struct LabState {
    name: String,
    addr: SocketAddr,
    shutdown_tx: async_channel::Sender<()>,
}

/// An in-memory [`GossipLayer`] backed by a [`LabNetwork`].
///
/// Construction is cheap; the layer registers with the fabric and starts
/// its probe loop when the coordinator calls
/// [`start`](GossipLayer::start).
pub struct LabGossip {
    network: LabNetwork,
    state: Mutex<Option<LabState>>,
}

impl LabGossip {
    /// Create a layer attached to the given fabric.
    pub fn new(network: &LabNetwork) -> Self {
        Self {
            network: network.clone(),
            state: Mutex::new(None),
        }
    }

    fn started_addr(&self) -> Result<SocketAddr> {
        self.state
            .lock()
            .as_ref()
            .map(|s| s.addr)
            .ok_or_else(|| Error::Gossip("layer is not started".to_string()))
    }
}

impl GossipLayer for LabGossip {
    fn start(
        &self,
        config: &GossipConfig,
        local: GossipNode,
        delegate: Arc<dyn GossipDelegate>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if state.is_some() {
            return Err(Error::Gossip("layer already started".to_string()));
        }
        self.network.register(local.clone(), delegate.clone())?;

        let (shutdown_tx, shutdown_rx) = async_channel::bounded(1);
        *state = Some(LabState {
            name: local.name.clone(),
            addr: local.addr,
            shutdown_tx,
        });

        let network = self.network.clone();
        let addr = local.addr;
        let probe_interval = config.probe_interval;
        let suspicion = config.suspicion_mult.max(1);
        tokio::spawn(async move {
            let mut missed: HashMap<String, u32> = HashMap::new();
            let mut declared: HashSet<String> = HashSet::new();
            let mut interval = Delay::new(probe_interval);
            loop {
                let shutdown = shutdown_rx.recv().fuse();
                futures::pin_mut!(shutdown);
                futures::select! {
                    _ = (&mut interval).fuse() => {
                        interval.reset(probe_interval);
                    }
                    _ = shutdown => break,
                }

                for (name, peer_addr, alive) in network.component_of(addr) {
                    if peer_addr == addr {
                        continue;
                    }
                    if alive {
                        missed.remove(&name);
                        declared.remove(&name);
                    } else if !declared.contains(&name) {
                        let misses = missed.entry(name.clone()).or_insert(0);
                        *misses += 1;
                        if *misses >= suspicion {
                            declared.insert(name.clone());
                            tracing::debug!(peer = %name, "probe target declared dead");
                            delegate.on_dead(&name);
                        }
                    }
                }
            }
        });
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.state.lock().as_ref().map(|s| s.addr)
    }

    async fn join(&self, seeds: &[SocketAddr]) -> Result<usize> {
        let addr = self.started_addr()?;
        let mut contacted = 0;
        for seed in seeds {
            match self.network.connect(addr, *seed) {
                Ok(()) => contacted += 1,
                Err(err) => tracing::debug!(seed = %seed, "join attempt failed: {}", err),
            }
        }
        if contacted == 0 {
            return Err(Error::NoPeers);
        }
        Ok(contacted)
    }

    fn broadcast(&self, payload: Bytes, notify: Option<async_channel::Sender<()>>) -> Result<()> {
        let addr = self.started_addr()?;
        self.network.broadcast(addr, payload)?;
        // In-process delivery is synchronous, so propagation is complete
        // by the time the broadcast returns.
        if let Some(tx) = notify {
            let _ = tx.try_send(());
        }
        Ok(())
    }

    async fn leave(&self) -> Result<()> {
        let addr = self.started_addr()?;
        self.network.leave(addr);
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        let state = self.state.lock().take();
        if let Some(state) = state {
            state.shutdown_tx.close();
            self.network.shutdown(state.addr);
            tracing::debug!(node = %state.name, "lab gossip layer stopped");
        }
        Ok(())
    }
}
