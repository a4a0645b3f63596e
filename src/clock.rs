//! Lamport clock for ordering membership intents.
//!
//! Wall clocks on different nodes are not comparable, so intents carry a
//! logical timestamp instead. The clock only moves forward: local intents
//! advance it, and every received intent time is witnessed so that later
//! local intents sort after anything this node has already seen.

use std::sync::atomic::{AtomicU64, Ordering};

/// Logical timestamp attached to leave intents and member records.
///
/// A value of zero means "no logical information"; member records created
/// from a plain join observation start at zero so that any buffered intent
/// compares as strictly newer.
pub type LamportTime = u64;

/// Thread-safe monotonic logical clock.
#[derive(Debug, Default)]
pub struct LamportClock {
    counter: AtomicU64,
}

impl LamportClock {
    /// Create a clock starting at time zero.
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }

    /// Current time without advancing the clock.
    pub fn time(&self) -> LamportTime {
        self.counter.load(Ordering::SeqCst)
    }

    /// Advance the clock and return the new time.
    pub fn increment(&self) -> LamportTime {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Fold an observed remote time into the clock.
    ///
    /// After witnessing `observed`, the next [`increment`](Self::increment)
    /// returns a time strictly greater than it.
    pub fn witness(&self, observed: LamportTime) {
        let mut current = self.counter.load(Ordering::SeqCst);
        while observed >= current {
            match self.counter.compare_exchange_weak(
                current,
                observed + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}
