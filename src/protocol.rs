//! # Inbound trigger messages.
//!
//! The coordinator drives this module with a handful of trigger messages.
//! Argument order is fixed; every field is big-endian and fixed width:
//!
//! | id | trigger              | arguments                                              |
//! |----|----------------------|--------------------------------------------------------|
//! | 1  | channel-notify       | `state: u32` (`0` = DOWN, `1` = UP)                    |
//! | 2  | channel-up           | none                                                   |
//! | 3  | channel-down         | none                                                   |
//! | 4  | state-change-trigger | `state_type: u8, active: u8, sec: u64, nsec: u64`      |
//! | 5  | system-stop-trigger  | `status: u8` (`0` = abnormal, nonzero = normal)        |
//!
//! The outbound acknowledgement is a single `result: u8` written on a session
//! (see [`crate::transport::Session`]).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::clock::WireDeadline;

/// Channel-notify state value for "listener session not usable".
pub const CHANNEL_DOWN: u32 = 0;
/// Channel-notify state value for "listener session established".
pub const CHANNEL_UP: u32 = 1;

/// Numeric trigger identifiers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum TriggerId {
    ChannelNotify = 1,
    ChannelUp = 2,
    ChannelDown = 3,
    StateChange = 4,
    SystemStop = 5,
}

impl TryFrom<u16> for TriggerId {
    type Error = ProtocolError;

    fn try_from(v: u16) -> Result<Self, Self::Error> {
        Ok(match v {
            1 => TriggerId::ChannelNotify,
            2 => TriggerId::ChannelUp,
            3 => TriggerId::ChannelDown,
            4 => TriggerId::StateChange,
            5 => TriggerId::SystemStop,
            other => return Err(ProtocolError::UnknownTrigger(other)),
        })
    }
}

/// Decoding failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown trigger id {0}")]
    UnknownTrigger(u16),

    #[error("truncated {trigger:?} payload: need {need} bytes, got {got}")]
    Truncated {
        trigger: TriggerId,
        need: usize,
        got: usize,
    },
}

/// One inbound trigger from the coordinator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trigger {
    /// Listener session state report.
    ChannelNotify { state: u32 },
    /// Listener session established.
    ChannelUp,
    /// Coordinator process disappeared.
    ChannelDown,
    /// Apply a cluster-state transition and acknowledge.
    StateChange {
        state_type: u8,
        active: bool,
        deadline: WireDeadline,
    },
    /// Daemon shutdown has started.
    SystemStop { status: u8 },
}

impl Trigger {
    pub fn id(&self) -> TriggerId {
        match self {
            Trigger::ChannelNotify { .. } => TriggerId::ChannelNotify,
            Trigger::ChannelUp => TriggerId::ChannelUp,
            Trigger::ChannelDown => TriggerId::ChannelDown,
            Trigger::StateChange { .. } => TriggerId::StateChange,
            Trigger::SystemStop { .. } => TriggerId::SystemStop,
        }
    }

    /// Decodes the argument payload of trigger `id`. Trailing bytes are ignored.
    pub fn decode(id: u16, mut payload: &[u8]) -> Result<Self, ProtocolError> {
        let id = TriggerId::try_from(id)?;
        let need = match id {
            TriggerId::ChannelNotify => 4,
            TriggerId::ChannelUp | TriggerId::ChannelDown => 0,
            TriggerId::StateChange => 1 + 1 + 8 + 8,
            TriggerId::SystemStop => 1,
        };
        if payload.remaining() < need {
            return Err(ProtocolError::Truncated {
                trigger: id,
                need,
                got: payload.remaining(),
            });
        }

        Ok(match id {
            TriggerId::ChannelNotify => Trigger::ChannelNotify {
                state: payload.get_u32(),
            },
            TriggerId::ChannelUp => Trigger::ChannelUp,
            TriggerId::ChannelDown => Trigger::ChannelDown,
            TriggerId::StateChange => {
                let state_type = payload.get_u8();
                let active = payload.get_u8() != 0;
                let sec = payload.get_u64();
                let nsec = payload.get_u64();
                Trigger::StateChange {
                    state_type,
                    active,
                    deadline: WireDeadline::new(sec, nsec),
                }
            }
            TriggerId::SystemStop => Trigger::SystemStop {
                status: payload.get_u8(),
            },
        })
    }

    /// Encodes the argument payload (the coordinator's side of [`decode`](Self::decode)).
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match *self {
            Trigger::ChannelNotify { state } => buf.put_u32(state),
            Trigger::ChannelUp | Trigger::ChannelDown => {}
            Trigger::StateChange {
                state_type,
                active,
                deadline,
            } => {
                buf.put_u8(state_type);
                buf.put_u8(u8::from(active));
                buf.put_u64(deadline.sec);
                buf.put_u64(deadline.nsec);
            }
            Trigger::SystemStop { status } => buf.put_u8(status),
        }
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_change_argument_order() {
        let mut raw = vec![7u8, 1];
        raw.extend_from_slice(&42u64.to_be_bytes());
        raw.extend_from_slice(&500u64.to_be_bytes());

        let t = Trigger::decode(TriggerId::StateChange as u16, &raw).unwrap();
        assert_eq!(
            t,
            Trigger::StateChange {
                state_type: 7,
                active: true,
                deadline: WireDeadline::new(42, 500),
            }
        );
        assert_eq!(t.encode().as_ref(), raw.as_slice());
    }

    #[test]
    fn nonzero_active_byte_is_true() {
        let mut raw = vec![1u8, 9];
        raw.extend_from_slice(&[0u8; 16]);
        let t = Trigger::decode(4, &raw).unwrap();
        assert!(matches!(t, Trigger::StateChange { active: true, .. }));
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let err = Trigger::decode(4, &[1, 1, 0, 0]).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::Truncated {
                trigger: TriggerId::StateChange,
                need: 18,
                got: 4,
            }
        );
        assert_eq!(
            Trigger::decode(1, &[0, 0]).unwrap_err(),
            ProtocolError::Truncated {
                trigger: TriggerId::ChannelNotify,
                need: 4,
                got: 2,
            }
        );
    }

    #[test]
    fn unknown_and_empty_triggers() {
        assert_eq!(
            Trigger::decode(99, &[]).unwrap_err(),
            ProtocolError::UnknownTrigger(99)
        );
        assert_eq!(Trigger::decode(2, &[]).unwrap(), Trigger::ChannelUp);
        assert_eq!(Trigger::decode(3, &[]).unwrap(), Trigger::ChannelDown);
        assert_eq!(
            Trigger::decode(5, &[1]).unwrap(),
            Trigger::SystemStop { status: 1 }
        );
        assert_eq!(
            Trigger::decode(1, &CHANNEL_UP.to_be_bytes()).unwrap(),
            Trigger::ChannelNotify { state: CHANNEL_UP }
        );
    }
}
