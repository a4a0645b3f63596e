//! Membership change events.
//!
//! Events are an optional, best-effort notification stream. The member
//! table remains authoritative; when the sink is full, events are dropped.

use std::fmt;

use crate::members::Member;

/// The kind of membership transition an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MemberEventKind {
    /// A member was observed alive for the first time, or came back
    /// after a failure or a tombstoned departure.
    Join,
    /// A member announced its intent to leave, or a failed member was
    /// administratively removed.
    Leave,
    /// A member stopped responding to the failure detector.
    Failed,
}

impl fmt::Display for MemberEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberEventKind::Join => write!(f, "member-join"),
            MemberEventKind::Leave => write!(f, "member-leave"),
            MemberEventKind::Failed => write!(f, "member-failed"),
        }
    }
}

/// A single membership transition, carrying the member record snapshot
/// taken at the time of the transition.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MemberEvent {
    /// What happened.
    pub kind: MemberEventKind,
    /// The member the transition applies to, as of the transition.
    pub member: Member,
}

impl MemberEvent {
    pub(crate) fn new(kind: MemberEventKind, member: Member) -> Self {
        Self { kind, member }
    }
}
