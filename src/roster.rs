//! The membership coordinator.
//!
//! [`Roster`] glues the gossip-layer callbacks, the user-facing operations,
//! and the event stream together around a single authoritative member
//! table. Two asynchronous sources of truth feed it: liveness observations
//! from the failure detector (join / dead callbacks) and explicit intents
//! from applications (leave, administrative removal). The reconciliation
//! rules are commutative modulo a Lamport-time tie-break, so coordinators
//! that see the same messages in different orders converge on the same
//! table.
//!
//! Locking discipline: one coarse `RwLock` guards the member table, the
//! intent buffer, and the failed/left queues together. Mutations take it
//! exclusively and only for the duration of the table update; events are
//! emitted after the lock is released, and gossip broadcasts are issued
//! without the lock held.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use bytes::Bytes;
use futures::future::FutureExt;
use futures_timer::Delay;
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;

use crate::clock::{LamportClock, LamportTime};
use crate::config::RosterConfig;
use crate::error::{Error, Result};
use crate::event::MemberEvent;
use crate::gossip::{GossipDelegate, GossipLayer, GossipNode};
use crate::members::{DeadOutcome, JoinOutcome, LeaveOutcome, Member, MemberStatus, Members};
use crate::message::LeaveMessage;

/// Lifecycle state of a coordinator.
///
/// The state is monotone: `Alive -> (Leaving -> Left)? -> Shutdown`, with
/// no backward transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RosterState {
    /// Participating in the cluster.
    Alive,
    /// A graceful leave is in flight.
    Leaving,
    /// The graceful leave completed; the gossip layer is still running.
    Left,
    /// Background loops and the gossip layer are stopped.
    Shutdown,
}

impl fmt::Display for RosterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RosterState::Alive => write!(f, "alive"),
            RosterState::Leaving => write!(f, "leaving"),
            RosterState::Left => write!(f, "left"),
            RosterState::Shutdown => write!(f, "shutdown"),
        }
    }
}

struct RosterInner<G> {
    /// Configuration, fixed at creation.
    config: RosterConfig,

    /// Logical clock stamping intents and member records.
    clock: LamportClock,

    /// Member table, intent buffer, and failed/left queues, all behind
    /// the coarse lock.
    members: RwLock<Members>,

    /// Coordinator lifecycle state.
    state: Mutex<RosterState>,

    /// Handle to the gossip layer.
    gossip: G,

    /// Shutdown flag for synchronous checks.
    shutdown: AtomicBool,

    /// Closing this sender releases every background loop and timer.
    shutdown_tx: async_channel::Sender<()>,

    /// Receiver side background loops select against.
    shutdown_rx: async_channel::Receiver<()>,

    /// Long-lived loop tasks, awaited by shutdown.
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl<G: GossipLayer> RosterInner<G> {
    /// Send events to the configured sink, non-blocking. A full channel
    /// drops the event; the member table remains authoritative.
    fn emit(&self, events: impl IntoIterator<Item = MemberEvent>) {
        let Some(tx) = &self.config.event_tx else {
            return;
        };
        for event in events {
            match tx.try_send(event) {
                Ok(()) => {}
                Err(async_channel::TrySendError::Full(event)) => {
                    tracing::debug!(
                        kind = %event.kind,
                        member = %event.member.name,
                        "event channel full, dropping membership event"
                    );
                }
                Err(async_channel::TrySendError::Closed(_)) => return,
            }
        }
    }

    fn handle_node_join(self: Arc<Self>, node: GossipNode) {
        let role = String::from_utf8_lossy(&node.meta).into_owned();
        let mut events: SmallVec<[MemberEvent; 2]> = SmallVec::new();
        let mut revert: Option<LamportTime> = None;
        {
            let mut members = self.members.write();
            let JoinOutcome {
                event,
                pending_intent,
            } = members.apply_join(&node.name, node.addr, role);
            events.extend(event);

            // Join first, then any buffered intent, so observers see the
            // arrival before the departure announcement.
            if let Some(ltime) = pending_intent {
                match members.apply_leave(&node.name, ltime, Instant::now()) {
                    LeaveOutcome::Leaving(event) => {
                        revert = Some(ltime);
                        events.push(event);
                    }
                    LeaveOutcome::Left(event) => events.push(event),
                    LeaveOutcome::Buffered | LeaveOutcome::Ignored => {}
                }
            }
        }
        self.emit(events);
        if let Some(ltime) = revert {
            self.schedule_leave_revert(node.name, ltime);
        }
    }

    fn handle_node_dead(&self, name: &str) {
        let outcome = self.members.write().apply_dead(name, Instant::now());
        match outcome {
            DeadOutcome::Failed(event) => self.emit([event]),
            DeadOutcome::CompletedLeave => {
                tracing::debug!(member = name, "graceful departure completed");
            }
            DeadOutcome::Ignored => {}
        }
    }

    /// Reconcile a leave intent with the table. See [`Members::apply_leave`]
    /// for the transition rules; this wrapper witnesses the intent time,
    /// emits events outside the lock, and arms the revert timer for
    /// members that entered Leaving.
    fn handle_leave_intent(self: Arc<Self>, intent: &LeaveMessage) {
        self.clock.witness(intent.ltime);
        let outcome = self
            .members
            .write()
            .apply_leave(&intent.node, intent.ltime, Instant::now());
        match outcome {
            LeaveOutcome::Leaving(event) => {
                self.emit([event]);
                self.schedule_leave_revert(intent.node.clone(), intent.ltime);
            }
            LeaveOutcome::Left(event) => self.emit([event]),
            LeaveOutcome::Buffered => {
                tracing::debug!(member = %intent.node, "buffered leave intent for unknown member");
            }
            LeaveOutcome::Ignored => {}
        }
    }

    /// Arm a timer that reverts a Leaving member to Alive if the departure
    /// is not observed within the leave timeout. The intent is presumed
    /// spurious or superseded at that point.
    fn schedule_leave_revert(self: Arc<Self>, name: String, ltime: LamportTime) {
        let timeout = self.config.leave_timeout;
        let inner = self;
        tokio::spawn(async move {
            let mut delay = Delay::new(timeout);
            let shutdown = inner.shutdown_rx.recv().fuse();
            futures::pin_mut!(shutdown);
            futures::select! {
                _ = (&mut delay).fuse() => {}
                _ = shutdown => return,
            }
            if inner.shutdown.load(Ordering::Acquire) {
                return;
            }
            if inner.members.write().revert_leave(&name, ltime) {
                tracing::debug!(member = %name, "leave intent expired without effect, reverting to alive");
            }
        });
    }

    /// Run the reaper loop: age failed members into tombstones, delete
    /// expired tombstones, and discard stale buffered intents. Removal is
    /// silent.
    async fn run_reaper(self: Arc<Self>) {
        let mut interval = Delay::new(self.config.reap_interval);
        loop {
            let shutdown = self.shutdown_rx.recv().fuse();
            futures::pin_mut!(shutdown);
            futures::select! {
                _ = (&mut interval).fuse() => {
                    interval.reset(self.config.reap_interval);
                }
                _ = shutdown => break,
            }
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }

            self.members.write().reap(
                Instant::now(),
                self.config.reconnect_timeout,
                self.config.tombstone_timeout,
                &self.config.node_name,
            );
        }
    }

    /// Run the reconnector loop: each period, pick one random failed
    /// member and ask the gossip layer for a direct contact at its last
    /// known address. Success arrives asynchronously as a join event;
    /// failure is silent.
    async fn run_reconnector(self: Arc<Self>) {
        let mut interval = Delay::new(self.config.reconnect_interval);
        loop {
            let shutdown = self.shutdown_rx.recv().fuse();
            futures::pin_mut!(shutdown);
            futures::select! {
                _ = (&mut interval).fuse() => {
                    interval.reset(self.config.reconnect_interval);
                }
                _ = shutdown => break,
            }
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }

            let target = self.members.read().random_failed();
            if let Some((name, addr)) = target {
                tracing::debug!(member = %name, %addr, "attempting reconnect to failed member");
                if let Err(err) = self.gossip.join(&[addr]).await {
                    tracing::debug!(member = %name, "reconnect attempt failed: {}", err);
                }
            }
        }
    }

    /// Run the optional intent-rebroadcast loop: periodically re-gossip
    /// retained leave intents with their original times, so that peers
    /// that missed the broadcast still converge. The time tie-break keeps
    /// re-deliveries idempotent.
    async fn run_rebroadcast(self: Arc<Self>, period: std::time::Duration) {
        let mut interval = Delay::new(period);
        loop {
            let shutdown = self.shutdown_rx.recv().fuse();
            futures::pin_mut!(shutdown);
            futures::select! {
                _ = (&mut interval).fuse() => {
                    interval.reset(period);
                }
                _ = shutdown => break,
            }
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }

            let intents = self.members.read().retained_intents();
            for (node, ltime) in intents {
                let msg = LeaveMessage::new(ltime, node);
                if let Err(err) = self.gossip.broadcast(msg.encode_to_bytes(), None) {
                    tracing::debug!("intent rebroadcast failed: {}", err);
                    break;
                }
            }
        }
    }
}

/// Delegate handed to the gossip layer; forwards callbacks into the
/// coordinator. Holds a weak reference so a dropped coordinator does not
/// keep receiving callbacks through the gossip layer.
struct RosterDelegate<G> {
    inner: Weak<RosterInner<G>>,
}

impl<G: GossipLayer> GossipDelegate for RosterDelegate<G> {
    fn on_join(&self, node: GossipNode) {
        if let Some(inner) = self.inner.upgrade() {
            inner.handle_node_join(node);
        }
    }

    fn on_dead(&self, name: &str) {
        if let Some(inner) = self.inner.upgrade() {
            inner.handle_node_dead(name);
        }
    }

    fn on_user_msg(&self, payload: &[u8]) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        match LeaveMessage::decode_from_slice(payload) {
            Some(msg) => inner.handle_leave_intent(&msg),
            None => tracing::warn!("failed to decode membership user message"),
        }
    }
}

/// A decentralized cluster-membership coordinator.
///
/// Each `Roster` owns one gossip layer and one member table. Multiple
/// instances may coexist in a process; cloning is cheap and all clones
/// share the same coordinator.
///
/// # Example
///
/// ```ignore
/// use gossip_roster::{Roster, RosterConfig};
/// use gossip_roster::testing::{LabGossip, LabNetwork};
///
/// let network = LabNetwork::new();
/// let config = RosterConfig::lan("node-a").with_role("web");
/// let roster = Roster::create(config, LabGossip::new(&network)).await?;
///
/// roster.join(&[seed_addr]).await?;
/// for member in roster.members() {
///     println!("{} is {}", member.name, member.status);
/// }
/// ```
pub struct Roster<G> {
    inner: Arc<RosterInner<G>>,
}

impl<G> Clone for Roster<G> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<G: GossipLayer> Roster<G> {
    /// Create a coordinator and start participating.
    ///
    /// Validates the configuration, seeds the table with the local member
    /// alive, starts the gossip layer with the delegate attached, and
    /// launches the background loops. Fails on an invalid configuration
    /// or when the gossip layer cannot bind.
    ///
    /// Must be called within a tokio runtime.
    pub async fn create(config: RosterConfig, gossip: G) -> Result<Self> {
        config.validate()?;

        let members = Members::with_local(
            config.node_name.clone(),
            config.gossip.bind_addr,
            config.role.clone(),
        );
        let (shutdown_tx, shutdown_rx) = async_channel::bounded(1);
        let inner = Arc::new(RosterInner {
            config,
            clock: LamportClock::new(),
            members: RwLock::new(members),
            state: Mutex::new(RosterState::Alive),
            gossip,
            shutdown: AtomicBool::new(false),
            shutdown_tx,
            shutdown_rx,
            tasks: Mutex::new(Vec::new()),
        });

        let delegate: Arc<dyn GossipDelegate> = Arc::new(RosterDelegate {
            inner: Arc::downgrade(&inner),
        });
        let local = GossipNode::new(
            inner.config.node_name.clone(),
            inner.config.gossip.bind_addr,
            Bytes::from(inner.config.role.clone().into_bytes()),
        );
        inner.gossip.start(&inner.config.gossip, local, delegate)?;

        {
            let mut tasks = inner.tasks.lock();
            tasks.push(tokio::spawn({
                let inner = Arc::clone(&inner);
                async move { inner.run_reaper().await }
            }));
            tasks.push(tokio::spawn({
                let inner = Arc::clone(&inner);
                async move { inner.run_reconnector().await }
            }));
            if let Some(period) = inner.config.rebroadcast_interval {
                tasks.push(tokio::spawn({
                    let inner = Arc::clone(&inner);
                    async move { inner.run_rebroadcast(period).await }
                }));
            }
        }

        Ok(Self { inner })
    }

    /// Contact seed endpoints and merge cluster state with them.
    ///
    /// Returns the number of seeds successfully contacted; errs only when
    /// every seed failed. Discovered members arrive asynchronously as
    /// join events.
    pub async fn join(&self, seeds: &[SocketAddr]) -> Result<usize> {
        if self.state() == RosterState::Shutdown {
            return Err(Error::NotRunning);
        }
        self.inner.gossip.join(seeds).await
    }

    /// Gracefully leave the cluster.
    ///
    /// Broadcasts a leave intent for the local node, waits up to the
    /// configured leave timeout for propagation, then announces the
    /// departure through the gossip layer. Returns
    /// [`Error::LeaveTimeout`] when propagation is not confirmed in time;
    /// the caller may retry or proceed to [`shutdown`](Self::shutdown).
    /// Idempotent after the first success.
    pub async fn leave(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            match *state {
                RosterState::Shutdown => return Err(Error::NotRunning),
                RosterState::Left => return Ok(()),
                RosterState::Alive | RosterState::Leaving => *state = RosterState::Leaving,
            }
        }

        let ltime = self.inner.clock.increment();
        let msg = LeaveMessage::new(ltime, self.inner.config.node_name.clone());
        // Apply locally first, under the lock, so the table agrees with
        // what is about to be broadcast.
        Arc::clone(&self.inner).handle_leave_intent(&msg);

        let (notify_tx, notify_rx) = async_channel::bounded(1);
        self.inner
            .gossip
            .broadcast(msg.encode_to_bytes(), Some(notify_tx))?;

        let mut timeout = Delay::new(self.inner.config.leave_timeout).fuse();
        let notified = notify_rx.recv().fuse();
        futures::pin_mut!(notified);
        let propagated = futures::select! {
            res = notified => res.is_ok(),
            _ = timeout => false,
        };
        if !propagated {
            return Err(Error::LeaveTimeout);
        }

        self.inner.gossip.leave().await?;
        self.inner
            .members
            .write()
            .finish_local_leave(&self.inner.config.node_name, Instant::now());
        {
            let mut state = self.inner.state.lock();
            if *state == RosterState::Leaving {
                *state = RosterState::Left;
            }
        }
        Ok(())
    }

    /// Remove a presumed-failed member as if it had gracefully left.
    ///
    /// Broadcasts a leave intent on the member's behalf and applies it
    /// locally, promoting the member from Failed to Left. Errs when the
    /// member is unknown, still alive, or the coordinator is not alive;
    /// a member already leaving or left is an idempotent success.
    pub async fn remove_failed_node(&self, name: &str) -> Result<()> {
        if self.state() != RosterState::Alive {
            return Err(Error::NotRunning);
        }
        {
            let members = self.inner.members.read();
            match members.status_of(name) {
                MemberStatus::None => return Err(Error::UnknownMember(name.to_string())),
                MemberStatus::Alive => return Err(Error::MemberAlive(name.to_string())),
                MemberStatus::Leaving | MemberStatus::Left => return Ok(()),
                MemberStatus::Failed => {}
            }
        }

        let ltime = self.inner.clock.increment();
        let msg = LeaveMessage::new(ltime, name);
        // Broadcast without the lock held, then apply locally.
        self.inner.gossip.broadcast(msg.encode_to_bytes(), None)?;
        Arc::clone(&self.inner).handle_leave_intent(&msg);
        Ok(())
    }

    /// Immutable snapshot of the current member table.
    pub fn members(&self) -> Vec<Member> {
        self.inner.members.read().snapshot()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RosterState {
        *self.inner.state.lock()
    }

    /// Name of the local node.
    pub fn local_name(&self) -> &str {
        &self.inner.config.node_name
    }

    /// Apply a leave intent as if it had been received from the gossip
    /// layer's user-message stream.
    ///
    /// This is the internal reconciliation path; it is exposed for
    /// embedders that route membership messages through their own
    /// transport, and for tests.
    pub fn handle_leave_intent(&self, intent: LeaveMessage) {
        Arc::clone(&self.inner).handle_leave_intent(&intent);
    }

    /// Stop the background loops and the gossip layer without
    /// broadcasting any intent. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if *state == RosterState::Shutdown {
                return Ok(());
            }
            *state = RosterState::Shutdown;
        }

        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.shutdown_tx.close();
        self.inner.gossip.shutdown().await?;

        let tasks: Vec<_> = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        Ok(())
    }
}
