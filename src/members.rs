//! The member table, intent buffer, and failed/left queues.
//!
//! All four structures live in [`Members`] and are mutated together under
//! the coordinator's coarse lock. The mutation methods here are pure with
//! respect to time and IO: they take explicit `Instant`s, never block, and
//! report resulting events back to the caller so emission can happen
//! outside the lock.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::clock::LamportTime;
use crate::event::{MemberEvent, MemberEventKind};

/// Membership status of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MemberStatus {
    /// Not in the table. Returned by lookups, never stored.
    None,
    /// Responding to probes.
    Alive,
    /// Announced an intent to leave; departure not yet observed.
    Leaving,
    /// Departed gracefully, retained as a tombstone.
    Left,
    /// Stopped responding to probes without announcing a departure.
    Failed,
}

impl fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberStatus::None => write!(f, "none"),
            MemberStatus::Alive => write!(f, "alive"),
            MemberStatus::Leaving => write!(f, "leaving"),
            MemberStatus::Left => write!(f, "left"),
            MemberStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A single member of the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Member {
    /// Cluster-unique node name.
    pub name: String,
    /// The member's advertised endpoint.
    pub addr: SocketAddr,
    /// Opaque application-assigned role tag.
    pub role: String,
    /// Current membership status.
    pub status: MemberStatus,
}

/// Table entry: the member plus bookkeeping the snapshot does not expose.
#[derive(Debug, Clone)]
pub(crate) struct MemberState {
    pub(crate) member: Member,
    /// Lamport time of the last intent applied to this member. Zero for
    /// members only ever observed through plain join events.
    pub(crate) status_time: LamportTime,
    /// Wall time the member entered Failed or Left.
    pub(crate) leave_time: Option<Instant>,
}

/// A buffered leave intent whose target is not yet in the table.
#[derive(Debug, Clone, Copy)]
pub(crate) struct NodeIntent {
    pub(crate) ltime: LamportTime,
    pub(crate) observed_at: Instant,
}

/// Entry of the failed or left queue.
#[derive(Debug, Clone)]
pub(crate) struct QueueEntry {
    pub(crate) name: String,
    pub(crate) at: Instant,
}

/// Result of applying a leave intent.
#[derive(Debug)]
pub(crate) enum LeaveOutcome {
    /// Target unknown; the intent was buffered for a later join.
    Buffered,
    /// An alive member was marked leaving. The caller schedules the
    /// revert timer and emits the event.
    Leaving(MemberEvent),
    /// A failed member was promoted to left.
    Left(MemberEvent),
    /// Stale or redundant; nothing changed.
    Ignored,
}

/// Result of applying a dead-node observation.
#[derive(Debug)]
pub(crate) enum DeadOutcome {
    /// An alive member failed.
    Failed(MemberEvent),
    /// A leaving member completed its departure. Silent: the leave event
    /// was already emitted when the intent was applied.
    CompletedLeave,
    /// Unknown member or already failed/left.
    Ignored,
}

/// Result of applying a join observation.
#[derive(Debug)]
pub(crate) struct JoinOutcome {
    /// Join event to emit, when the member is new or was not alive.
    pub(crate) event: Option<MemberEvent>,
    /// A buffered intent that outlived the join and must now be applied.
    pub(crate) pending_intent: Option<LamportTime>,
}

/// The authoritative local membership view.
///
/// Holds the name-keyed member table, the per-name intent buffer, and the
/// ordered failed/left queues consumed by the background loops.
#[derive(Debug, Default)]
pub(crate) struct Members {
    pub(crate) states: HashMap<String, MemberState>,
    pub(crate) recent_intents: HashMap<String, NodeIntent>,
    pub(crate) failed: Vec<QueueEntry>,
    pub(crate) left: Vec<QueueEntry>,
}

impl Members {
    /// Create a table seeded with the local member, alive.
    pub(crate) fn with_local(name: String, addr: SocketAddr, role: String) -> Self {
        let mut members = Self::default();
        members.states.insert(
            name.clone(),
            MemberState {
                member: Member {
                    name,
                    addr,
                    role,
                    status: MemberStatus::Alive,
                },
                status_time: 0,
                leave_time: None,
            },
        );
        members
    }

    /// Copy out the current membership.
    pub(crate) fn snapshot(&self) -> Vec<Member> {
        self.states.values().map(|s| s.member.clone()).collect()
    }

    /// Status of a named member, `None` if absent from the table.
    pub(crate) fn status_of(&self, name: &str) -> MemberStatus {
        self.states
            .get(name)
            .map(|s| s.member.status)
            .unwrap_or(MemberStatus::None)
    }

    /// Apply a join observation from the gossip layer.
    ///
    /// New members enter alive with `status_time` zero; known members are
    /// revived and have their endpoint and role refreshed. A join event is
    /// reported only when the member is new or was not previously alive.
    /// If a buffered intent is newer than the join it is handed back for
    /// application; stale buffered intents are discarded either way.
    pub(crate) fn apply_join(&mut self, name: &str, addr: SocketAddr, role: String) -> JoinOutcome {
        let state = self
            .states
            .entry(name.to_string())
            .or_insert_with(|| MemberState {
                member: Member {
                    name: name.to_string(),
                    addr,
                    role: String::new(),
                    status: MemberStatus::None,
                },
                status_time: 0,
                leave_time: None,
            });

        let previous = state.member.status;
        state.member.addr = addr;
        state.member.role = role;

        let event = if previous != MemberStatus::Alive {
            state.member.status = MemberStatus::Alive;
            state.leave_time = None;
            Some(MemberEvent::new(MemberEventKind::Join, state.member.clone()))
        } else {
            None
        };
        let status_time = state.status_time;
        if previous != MemberStatus::Alive {
            self.dequeue(name);
        }

        let pending_intent = match self.recent_intents.get(name) {
            Some(intent) if intent.ltime > status_time => {
                let ltime = intent.ltime;
                self.recent_intents.remove(name);
                Some(ltime)
            }
            Some(_) => {
                // Stale: the table entry already reflects something newer.
                self.recent_intents.remove(name);
                None
            }
            None => None,
        };

        JoinOutcome {
            event,
            pending_intent,
        }
    }

    /// Apply a leave intent.
    ///
    /// Unknown targets are buffered (keeping the newest intent per name).
    /// Known targets move `Alive -> Leaving` or `Failed -> Left`; anything
    /// not strictly newer than the entry's `status_time`, and any target
    /// already leaving or left, is ignored.
    pub(crate) fn apply_leave(
        &mut self,
        name: &str,
        ltime: LamportTime,
        now: Instant,
    ) -> LeaveOutcome {
        let Some(state) = self.states.get_mut(name) else {
            let buffered = self
                .recent_intents
                .entry(name.to_string())
                .or_insert(NodeIntent {
                    ltime,
                    observed_at: now,
                });
            if ltime > buffered.ltime {
                buffered.ltime = ltime;
                buffered.observed_at = now;
            }
            return LeaveOutcome::Buffered;
        };

        if ltime <= state.status_time {
            return LeaveOutcome::Ignored;
        }

        match state.member.status {
            MemberStatus::Alive => {
                state.member.status = MemberStatus::Leaving;
                state.status_time = ltime;
                LeaveOutcome::Leaving(MemberEvent::new(
                    MemberEventKind::Leave,
                    state.member.clone(),
                ))
            }
            MemberStatus::Failed => {
                state.member.status = MemberStatus::Left;
                state.status_time = ltime;
                state.leave_time = Some(now);
                let event = MemberEvent::new(MemberEventKind::Leave, state.member.clone());
                self.dequeue(name);
                self.left.push(QueueEntry {
                    name: name.to_string(),
                    at: now,
                });
                LeaveOutcome::Left(event)
            }
            MemberStatus::Leaving | MemberStatus::Left | MemberStatus::None => {
                LeaveOutcome::Ignored
            }
        }
    }

    /// Apply a dead-node observation from the gossip layer.
    ///
    /// A leaving member completes its departure; an alive member failed.
    pub(crate) fn apply_dead(&mut self, name: &str, now: Instant) -> DeadOutcome {
        let Some(state) = self.states.get_mut(name) else {
            return DeadOutcome::Ignored;
        };

        match state.member.status {
            MemberStatus::Leaving => {
                state.member.status = MemberStatus::Left;
                state.leave_time = Some(now);
                self.dequeue(name);
                self.left.push(QueueEntry {
                    name: name.to_string(),
                    at: now,
                });
                DeadOutcome::CompletedLeave
            }
            MemberStatus::Alive => {
                state.member.status = MemberStatus::Failed;
                state.leave_time = Some(now);
                let event = MemberEvent::new(MemberEventKind::Failed, state.member.clone());
                self.failed.push(QueueEntry {
                    name: name.to_string(),
                    at: now,
                });
                DeadOutcome::Failed(event)
            }
            MemberStatus::Failed | MemberStatus::Left | MemberStatus::None => DeadOutcome::Ignored,
        }
    }

    /// Revert a leaving member back to alive.
    ///
    /// Effective only while the member is still leaving with the same
    /// intent time that marked it; a newer intent keeps its effect.
    pub(crate) fn revert_leave(&mut self, name: &str, ltime: LamportTime) -> bool {
        match self.states.get_mut(name) {
            Some(state)
                if state.member.status == MemberStatus::Leaving
                    && state.status_time == ltime =>
            {
                state.member.status = MemberStatus::Alive;
                true
            }
            _ => false,
        }
    }

    /// Complete the local node's graceful leave.
    pub(crate) fn finish_local_leave(&mut self, name: &str, now: Instant) -> bool {
        match self.states.get_mut(name) {
            Some(state) if state.member.status == MemberStatus::Leaving => {
                state.member.status = MemberStatus::Left;
                state.leave_time = Some(now);
                true
            }
            _ => false,
        }
    }

    /// Age out failed members, expired tombstones, and stale intents.
    ///
    /// Failed-queue entries older than `reconnect_timeout` are demoted to
    /// left tombstones with a fresh leave time; left-queue entries older
    /// than `tombstone_timeout` are deleted from the table. The local
    /// member is never deleted. Removal is silent.
    pub(crate) fn reap(
        &mut self,
        now: Instant,
        reconnect_timeout: Duration,
        tombstone_timeout: Duration,
        local_name: &str,
    ) {
        let mut i = 0;
        while i < self.failed.len() {
            if now.duration_since(self.failed[i].at) >= reconnect_timeout {
                let entry = self.failed.remove(i);
                if let Some(state) = self.states.get_mut(&entry.name) {
                    if state.member.status == MemberStatus::Failed {
                        state.member.status = MemberStatus::Left;
                        state.leave_time = Some(now);
                        self.left.push(QueueEntry {
                            name: entry.name,
                            at: now,
                        });
                    }
                }
            } else {
                i += 1;
            }
        }

        let mut i = 0;
        while i < self.left.len() {
            if now.duration_since(self.left[i].at) >= tombstone_timeout {
                let entry = self.left.remove(i);
                if entry.name != local_name {
                    self.states.remove(&entry.name);
                }
            } else {
                i += 1;
            }
        }

        let intent_ttl = reconnect_timeout.max(tombstone_timeout);
        self.recent_intents
            .retain(|_, intent| now.duration_since(intent.observed_at) < intent_ttl);
    }

    /// Endpoint of a random failed member, for the reconnector.
    pub(crate) fn random_failed(&self) -> Option<(String, SocketAddr)> {
        if self.failed.is_empty() {
            return None;
        }
        let idx = rand::rng().random_range(0..self.failed.len());
        let name = &self.failed[idx].name;
        self.states
            .get(name)
            .map(|s| (name.clone(), s.member.addr))
    }

    /// Intents worth re-broadcasting: everything buffered, plus intents
    /// for members still leaving.
    pub(crate) fn retained_intents(&self) -> Vec<(String, LamportTime)> {
        let mut intents: Vec<(String, LamportTime)> = self
            .recent_intents
            .iter()
            .map(|(name, intent)| (name.clone(), intent.ltime))
            .collect();
        intents.extend(self.states.iter().filter_map(|(name, state)| {
            (state.member.status == MemberStatus::Leaving).then(|| (name.clone(), state.status_time))
        }));
        intents
    }

    /// Drop a name from both ordered queues.
    fn dequeue(&mut self, name: &str) {
        self.failed.retain(|e| e.name != name);
        self.left.retain(|e| e.name != name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn table() -> Members {
        Members::with_local("local".to_string(), addr(1), "core".to_string())
    }

    #[test]
    fn test_local_member_seeded_alive() {
        let members = table();
        assert_eq!(members.status_of("local"), MemberStatus::Alive);
        assert_eq!(members.snapshot().len(), 1);
    }

    #[test]
    fn test_join_new_member_emits_event() {
        let mut members = table();
        let outcome = members.apply_join("a", addr(2), "web".to_string());
        let event = outcome.event.unwrap();
        assert_eq!(event.kind, MemberEventKind::Join);
        assert_eq!(event.member.role, "web");
        assert!(outcome.pending_intent.is_none());
    }

    #[test]
    fn test_join_of_alive_member_is_silent() {
        let mut members = table();
        members.apply_join("a", addr(2), "web".to_string());
        let outcome = members.apply_join("a", addr(3), "lb".to_string());
        assert!(outcome.event.is_none());
        // Endpoint and role still refresh.
        let state = &members.states["a"];
        assert_eq!(state.member.addr, addr(3));
        assert_eq!(state.member.role, "lb");
    }

    #[test]
    fn test_leave_of_unknown_member_is_buffered() {
        let mut members = table();
        let now = Instant::now();
        assert!(matches!(
            members.apply_leave("ghost", 5, now),
            LeaveOutcome::Buffered
        ));
        assert_eq!(members.recent_intents["ghost"].ltime, 5);

        // Only the newest intent per name is retained.
        members.apply_leave("ghost", 3, now);
        assert_eq!(members.recent_intents["ghost"].ltime, 5);
        members.apply_leave("ghost", 8, now);
        assert_eq!(members.recent_intents["ghost"].ltime, 8);
    }

    #[test]
    fn test_buffered_intent_applies_on_join() {
        let mut members = table();
        members.apply_leave("a", 5, Instant::now());

        let outcome = members.apply_join("a", addr(2), String::new());
        assert!(outcome.event.is_some());
        assert_eq!(outcome.pending_intent, Some(5));
        assert!(members.recent_intents.is_empty());
    }

    #[test]
    fn test_leave_marks_alive_member_leaving() {
        let mut members = table();
        members.apply_join("a", addr(2), String::new());
        let outcome = members.apply_leave("a", 1, Instant::now());
        assert!(matches!(outcome, LeaveOutcome::Leaving(_)));
        assert_eq!(members.status_of("a"), MemberStatus::Leaving);
    }

    #[test]
    fn test_leave_is_idempotent() {
        let mut members = table();
        members.apply_join("a", addr(2), String::new());
        let now = Instant::now();
        assert!(matches!(
            members.apply_leave("a", 4, now),
            LeaveOutcome::Leaving(_)
        ));
        // Same intent again: no event, no change.
        assert!(matches!(
            members.apply_leave("a", 4, now),
            LeaveOutcome::Ignored
        ));
        assert_eq!(members.status_of("a"), MemberStatus::Leaving);
    }

    #[test]
    fn test_stale_leave_is_ignored() {
        let mut members = table();
        members.apply_join("a", addr(2), String::new());
        let now = Instant::now();
        members.apply_leave("a", 4, now);
        assert!(matches!(
            members.apply_leave("a", 2, now),
            LeaveOutcome::Ignored
        ));
    }

    #[test]
    fn test_leave_promotes_failed_member() {
        let mut members = table();
        members.apply_join("a", addr(2), String::new());
        let now = Instant::now();
        members.apply_dead("a", now);
        assert_eq!(members.failed.len(), 1);

        let outcome = members.apply_leave("a", 1, now);
        assert!(matches!(outcome, LeaveOutcome::Left(_)));
        assert_eq!(members.status_of("a"), MemberStatus::Left);
        assert!(members.failed.is_empty());
        assert_eq!(members.left.len(), 1);
    }

    #[test]
    fn test_dead_alive_member_fails() {
        let mut members = table();
        members.apply_join("a", addr(2), String::new());
        let outcome = members.apply_dead("a", Instant::now());
        assert!(matches!(outcome, DeadOutcome::Failed(_)));
        assert_eq!(members.status_of("a"), MemberStatus::Failed);
        assert_eq!(members.failed.len(), 1);
    }

    #[test]
    fn test_dead_leaving_member_completes_leave() {
        let mut members = table();
        members.apply_join("a", addr(2), String::new());
        let now = Instant::now();
        members.apply_leave("a", 1, now);

        let outcome = members.apply_dead("a", now);
        assert!(matches!(outcome, DeadOutcome::CompletedLeave));
        assert_eq!(members.status_of("a"), MemberStatus::Left);
        assert_eq!(members.left.len(), 1);
        assert!(members.failed.is_empty());
    }

    #[test]
    fn test_dead_is_idempotent() {
        let mut members = table();
        members.apply_join("a", addr(2), String::new());
        let now = Instant::now();
        members.apply_dead("a", now);
        assert!(matches!(members.apply_dead("a", now), DeadOutcome::Ignored));
        assert_eq!(members.failed.len(), 1);
    }

    #[test]
    fn test_rejoin_of_failed_member() {
        let mut members = table();
        members.apply_join("a", addr(2), String::new());
        members.apply_dead("a", Instant::now());

        let outcome = members.apply_join("a", addr(2), String::new());
        assert!(outcome.event.is_some());
        assert_eq!(members.status_of("a"), MemberStatus::Alive);
        assert!(members.failed.is_empty());
    }

    #[test]
    fn test_revert_leave() {
        let mut members = table();
        members.apply_join("a", addr(2), String::new());
        members.apply_leave("a", 3, Instant::now());

        // A newer intent arrived in the meantime; the old revert loses.
        assert!(!members.revert_leave("a", 2));
        assert!(members.revert_leave("a", 3));
        assert_eq!(members.status_of("a"), MemberStatus::Alive);
    }

    #[test]
    fn test_reap_promotes_and_deletes() {
        let mut members = table();
        members.apply_join("a", addr(2), String::new());
        let t0 = Instant::now();
        members.apply_dead("a", t0);

        // First pass: the failed entry outlived the reconnect window and
        // becomes a tombstone.
        let t1 = t0 + Duration::from_secs(10);
        members.reap(t1, Duration::from_secs(5), Duration::from_secs(5), "local");
        assert_eq!(members.status_of("a"), MemberStatus::Left);
        assert!(members.failed.is_empty());
        assert_eq!(members.left.len(), 1);

        // Second pass: the tombstone expires and the entry is deleted.
        let t2 = t1 + Duration::from_secs(10);
        members.reap(t2, Duration::from_secs(5), Duration::from_secs(5), "local");
        assert_eq!(members.status_of("a"), MemberStatus::None);
        assert!(members.left.is_empty());
    }

    #[test]
    fn test_reap_never_deletes_local() {
        let mut members = table();
        let now = Instant::now();
        members.apply_leave("local", 1, now);
        members.apply_dead("local", now);
        assert_eq!(members.status_of("local"), MemberStatus::Left);

        members.reap(
            now + Duration::from_secs(10),
            Duration::ZERO,
            Duration::ZERO,
            "local",
        );
        assert_eq!(members.status_of("local"), MemberStatus::Left);
    }

    #[test]
    fn test_reap_discards_stale_intents() {
        let mut members = table();
        let t0 = Instant::now();
        members.apply_leave("ghost", 1, t0);
        members.reap(
            t0 + Duration::from_secs(10),
            Duration::from_secs(5),
            Duration::from_secs(5),
            "local",
        );
        assert!(members.recent_intents.is_empty());
    }

    #[test]
    fn test_random_failed_returns_known_endpoint() {
        let mut members = table();
        members.apply_join("a", addr(9), String::new());
        members.apply_dead("a", Instant::now());

        let (name, endpoint) = members.random_failed().unwrap();
        assert_eq!(name, "a");
        assert_eq!(endpoint, addr(9));
    }

    #[test]
    fn test_retained_intents_cover_buffer_and_leaving() {
        let mut members = table();
        let now = Instant::now();
        members.apply_leave("ghost", 7, now);
        members.apply_join("a", addr(2), String::new());
        members.apply_leave("a", 9, now);

        let mut intents = members.retained_intents();
        intents.sort();
        assert_eq!(
            intents,
            vec![("a".to_string(), 9), ("ghost".to_string(), 7)]
        );
    }
}
