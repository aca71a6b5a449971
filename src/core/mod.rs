//! Runtime core: listener, propagation worker and shutdown.
//!
//! The public entry point is [`Listener`], built with [`ListenerBuilder`].
//!
//! Internal modules:
//! - [`listener`]: trigger dispatch, channel liveness and readiness waits;
//! - [`worker`]: delivers one state change on the bus and acknowledges it;
//! - [`shutdown`]: stop trigger, finalize watchdog and [`Listener::close`];
//! - [`registry`]: outbound acknowledgement sessions with bulk cancellation;
//! - [`channel`]: channel flags and the derived lifecycle phase.

mod builder;
mod channel;
mod listener;
mod registry;
mod shutdown;
mod worker;

pub use builder::ListenerBuilder;
pub use channel::{ChannelState, ListenerPhase};
pub use listener::{Listener, PendingTransition};
pub use registry::{RegistrySession, SessionRegistry};
