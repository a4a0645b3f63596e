//! # gossip-roster
//!
//! Decentralized cluster membership on top of a SWIM-style gossip layer.
//!
//! A set of independent nodes discover one another, observe each other's
//! liveness, and propagate intentional leaves and administrative removals
//! so that every node converges on the same membership view. The view is
//! exposed as a queryable snapshot and as a best-effort event stream.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Application                               │
//! │            (join / leave / remove / members / events)            │
//! └────────────────────────────┬────────────────────────────────────┘
//! ┌────────────────────────────▼────────────────────────────────────┐
//! │                          Roster                                  │
//! │   (coordinator - reconciles liveness signals with intents)       │
//! ├──────────────┬──────────────┬──────────────┬────────────────────┤
//! │ Member Table │ Intent Buffer│ Failed/Left  │  Reaper/Reconnect  │
//! │  (statuses)  │  (pending)   │   Queues     │   /Rebroadcast     │
//! ├──────────────┴──────────────┴──────────────┴────────────────────┤
//! │                        GossipLayer                               │
//! │     (SWIM failure detector + broadcast - pluggable trait)        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Liveness observations (join / dead callbacks) and application intents
//! (leave messages) can arrive in any order; reconciliation is commutative
//! modulo a Lamport-time tie-break, so coordinators converge without
//! consensus. Intents whose target is not yet known are buffered and
//! re-applied when the target appears, departed members are retained as
//! tombstones so late gossip cannot resurrect them, and background loops
//! age out transient state and attempt to re-contact failed members.
//!
//! ## Example
//!
//! ```ignore
//! use gossip_roster::{MemberEvent, Roster, RosterConfig};
//! use gossip_roster::testing::{LabGossip, LabNetwork};
//!
//! let (event_tx, event_rx) = async_channel::bounded(64);
//! let network = LabNetwork::new();
//!
//! let config = RosterConfig::lan("node-a")
//!     .with_role("web")
//!     .with_event_sink(event_tx);
//! let roster = Roster::create(config, LabGossip::new(&network)).await?;
//!
//! roster.join(&[seed_addr]).await?;
//! while let Ok(MemberEvent { kind, member }) = event_rx.recv().await {
//!     println!("{}: {}", kind, member.name);
//! }
//! ```
//!
//! The gossip layer is consumed through the [`GossipLayer`] trait; the
//! [`testing`] module ships an in-process implementation for driving
//! multi-coordinator scenarios without sockets.

#![deny(missing_docs)]

mod clock;
mod config;
mod error;
mod event;
mod gossip;
mod members;
mod message;
mod roster;

pub mod testing;

pub use clock::{LamportClock, LamportTime};
pub use config::{GossipConfig, RosterConfig};
pub use error::{Error, Result};
pub use event::{MemberEvent, MemberEventKind};
pub use gossip::{GossipDelegate, GossipLayer, GossipNode};
pub use members::{Member, MemberStatus};
pub use message::{LeaveMessage, MessageTag, MAX_NODE_NAME_LEN};
pub use roster::{Roster, RosterState};
