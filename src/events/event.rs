//! # State-change events delivered by the local bus.
//!
//! A [`StateEvent`] is the in-process form of a state-change trigger: the opaque
//! state-type code, the active flag and the local deadline by which delivery
//! must complete.
//!
//! ## Ordering guarantees
//! Each event has a globally unique sequence number (`seq`) that increases
//! monotonically. The bus uses it to match the sentinel's completion signal to
//! the raise that is waiting for it.
//!
//! ## Example
//! ```rust
//! use std::time::Duration;
//! use tokio::time::Instant;
//! use statecast::StateEvent;
//!
//! let deadline = Instant::now() + Duration::from_secs(5);
//! let ev = StateEvent::new(1, true, deadline);
//!
//! assert_eq!(ev.state_type, 1);
//! assert!(ev.active);
//! assert!(!ev.is_expired());
//! ```

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{Duration, SystemTime};

use tokio::time::Instant;

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(1);

/// One cluster-state transition as seen by in-process handlers.
#[derive(Clone, Debug)]
pub struct StateEvent {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp (for logs).
    pub at: SystemTime,
    /// Opaque state-type code chosen by the coordinator.
    pub state_type: u8,
    /// Whether the state becomes active or inactive.
    pub active: bool,
    /// Local deadline for delivery plus acknowledgement.
    pub deadline: Instant,
}

impl StateEvent {
    /// Creates a new event with the current timestamp and next sequence number.
    pub fn new(state_type: u8, active: bool, deadline: Instant) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            state_type,
            active,
            deadline,
        }
    }

    /// Time left before the deadline.
    #[inline]
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    #[inline]
    pub fn is_expired(&self) -> bool {
        self.deadline <= Instant::now()
    }
}
