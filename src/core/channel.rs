//! # Liveness of the listener channel to the coordinator.
//!
//! [`ChannelState`] is the authoritative bit-set; [`ListenerPhase`] is the
//! derived, human-readable view used in logs and diagnostics.
//!
//! ```text
//! INIT ──► CONNECTING ──► LISTENING ──┬─► STOPPED  (STOP_REQUESTED)
//!              │  ▲                   ├─► FATAL    (inbound stream lost)
//!              └──┘ notify(DOWN)      └─► DOWN     (coordinator gone)
//! ```

use bitflags::bitflags;

bitflags! {
    /// Channel condition flags.
    ///
    /// `UP` means the listener session is established. `DOWN`, `FATAL` and
    /// `STOP_REQUESTED` are cancelling conditions, collectively "canceled".
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ChannelState: u32 {
        const UP = 1 << 0;
        const DOWN = 1 << 1;
        const FATAL = 1 << 2;
        const STOP_REQUESTED = 1 << 3;
    }
}

impl ChannelState {
    /// Conditions under which readiness waiters give up.
    pub const CANCELED: ChannelState = ChannelState::DOWN
        .union(ChannelState::FATAL)
        .union(ChannelState::STOP_REQUESTED);

    #[inline]
    pub fn is_up(&self) -> bool {
        self.contains(ChannelState::UP)
    }

    #[inline]
    pub fn is_canceled(&self) -> bool {
        self.intersects(ChannelState::CANCELED)
    }
}

/// Listener lifecycle as seen from outside.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListenerPhase {
    Init,
    Connecting,
    Listening,
    Stopped,
    Fatal,
    Down,
}

impl ListenerPhase {
    /// Derives the phase; terminal conditions win over `UP`.
    pub fn derive(state: ChannelState, started: bool) -> Self {
        if state.contains(ChannelState::DOWN) {
            ListenerPhase::Down
        } else if state.contains(ChannelState::FATAL) {
            ListenerPhase::Fatal
        } else if state.contains(ChannelState::STOP_REQUESTED) {
            ListenerPhase::Stopped
        } else if state.is_up() {
            ListenerPhase::Listening
        } else if started {
            ListenerPhase::Connecting
        } else {
            ListenerPhase::Init
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ListenerPhase::Init => "init",
            ListenerPhase::Connecting => "connecting",
            ListenerPhase::Listening => "listening",
            ListenerPhase::Stopped => "stopped",
            ListenerPhase::Fatal => "fatal",
            ListenerPhase::Down => "down",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_derivation() {
        let none = ChannelState::empty();
        assert_eq!(ListenerPhase::derive(none, false), ListenerPhase::Init);
        assert_eq!(ListenerPhase::derive(none, true), ListenerPhase::Connecting);
        assert_eq!(
            ListenerPhase::derive(ChannelState::UP, true),
            ListenerPhase::Listening
        );
        assert_eq!(
            ListenerPhase::derive(ChannelState::UP | ChannelState::STOP_REQUESTED, true),
            ListenerPhase::Stopped
        );
        assert_eq!(
            ListenerPhase::derive(ChannelState::UP | ChannelState::DOWN, true),
            ListenerPhase::Down
        );
    }

    #[test]
    fn canceled_covers_terminal_bits() {
        assert!(!ChannelState::UP.is_canceled());
        assert!(ChannelState::FATAL.is_canceled());
        assert!((ChannelState::UP | ChannelState::STOP_REQUESTED).is_canceled());
    }
}
