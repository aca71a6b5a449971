//! # statecast
//!
//! **Statecast** propagates cluster-state changes from a central coordinator
//! into one worker module and reports back whether the change was applied.
//!
//! The coordinator sends a state-change trigger; the module fans the change out
//! to every locally registered [`Handler`], waits for all of them (bounded by
//! the trigger's deadline) and acknowledges success or failure. One change is
//! in flight at a time. Shutdown is cooperative and bounded.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!                ┌──────────────────────────────┐
//!                │          coordinator         │
//!                └──────┬────────────────▲──────┘
//!       triggers        │                │  ack(result: u8)
//!   (notify/up/down,    │                │
//!    state change,      ▼                │
//!    system stop)  ┌─────────────────────┴────────────────────┐
//!                  │  Listener                                │
//!                  │  - ChannelState (UP/DOWN/FATAL/STOP)     │
//!                  │  - PendingTransition (at most one)       │
//!                  │  - SessionRegistry (outbound acks)       │
//!                  └──────┬───────────────────────────────────┘
//!                         │ spawn per accepted change
//!                         ▼
//!                  ┌──────────────┐  raise(type, active, deadline)
//!                  │    worker    ├───────────────────────────────┐
//!                  └──────────────┘                               ▼
//!                                       ┌───────────────────────────────────┐
//!                                       │  LocalBus (single dispatcher)     │
//!                                       │  handler1 → handler2 → … → sentinel│
//!                                       └───────────────────────────────────┘
//! ```
//!
//! ### One state change
//! ```text
//! StateChange{type, active, deadline}
//!   ├─ stopping / finalizing ─► NACK, Canceled
//!   ├─ change in flight      ─► NACK, Busy
//!   └─ accept ─► worker:
//!        ├─► LocalBus::raise   Ok | TimedOut | Canceled | Busy
//!        ├─► ack(raise is Ok)  through a SessionRegistry session
//!        └─► clear PendingTransition
//! ```
//!
//! ### Shutdown
//! ```text
//! SystemStop ──► refuse new changes, in-flight change finishes, arm watchdog
//! close()    ──► cancel outbound acks ─► tear bus down ─► join tasks
//! ```
//!
//! ## Features
//! | Area              | Description                                              | Key types / traits                         |
//! |-------------------|----------------------------------------------------------|--------------------------------------------|
//! | **Handlers**      | React to state changes in priority order.                | [`Handler`], [`HandlerFn`], [`StateEvent`] |
//! | **Local bus**     | Synchronous fan-out with deadline and busy tracking.     | [`LocalBus`]                               |
//! | **Listener**      | Trigger dispatch, readiness and shutdown.                | [`Listener`], [`ListenerPhase`]            |
//! | **Sessions**      | Outbound sessions with bulk bounded cancellation.        | [`SessionRegistry`], [`RegistrySession`]   |
//! | **Transport**     | Seam for the RPC session layer plus a loopback.          | [`transport::Transport`]                   |
//! | **Errors**        | Typed outcomes for every wait.                           | [`PropagationError`], [`TransportError`]   |
//! | **Configuration** | Timeouts and the acknowledgement endpoint.               | [`Config`]                                 |
//!
//! ## Example
//! ```rust
//! use std::time::Duration;
//! use statecast::transport::memory::MemoryTransport;
//! use statecast::{Config, HandlerFn, Listener, StateEvent, Trigger, WireDeadline};
//! use tokio::sync::mpsc;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = MemoryTransport::new();
//!     let listener = Listener::builder(Config::default(), transport.clone())
//!         .with_handlers(vec![HandlerFn::arc("log", 0, |ev: StateEvent| async move {
//!             println!("state {} active={}", ev.state_type, ev.active);
//!             Ok::<_, anyhow::Error>(())
//!         })])
//!         .build()?;
//!
//!     let (tx, rx) = mpsc::channel(16);
//!     tx.send(Trigger::ChannelUp).await?;
//!     listener.start(rx).await?;
//!
//!     tx.send(Trigger::StateChange {
//!         state_type: 1,
//!         active: true,
//!         deadline: WireDeadline::after(Duration::from_secs(2)),
//!     })
//!     .await?;
//!     let acks = transport.wait_for_acks(1, Duration::from_secs(2)).await;
//!     assert_eq!(acks[0].result(), Some(1));
//!
//!     tx.send(Trigger::SystemStop { status: 1 }).await?;
//!     listener
//!         .close(tokio::time::Instant::now() + Duration::from_secs(1))
//!         .await?;
//!     Ok(())
//! }
//! ```

mod clock;
mod config;
mod core;
mod error;
mod events;
mod protocol;

pub mod transport;

// ---- Public re-exports ----

pub use clock::{WireDeadline, monotonic_now};
pub use config::Config;
pub use core::{
    ChannelState, Listener, ListenerBuilder, ListenerPhase, PendingTransition, RegistrySession,
    SessionRegistry,
};
pub use error::{PropagationError, TransportError};
pub use events::{Handler, HandlerFn, HandlerId, HandlerRef, LocalBus, StateEvent};
pub use protocol::{CHANNEL_DOWN, CHANNEL_UP, ProtocolError, Trigger, TriggerId};
