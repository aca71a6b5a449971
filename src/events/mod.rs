//! Local delivery of state changes: event type, handlers and the bus.
//!
//! ## Contents
//! - [`StateEvent`] the in-process form of a state-change trigger
//! - [`Handler`], [`HandlerFn`] the application extension point
//! - [`LocalBus`] single-dispatcher bus with "raise and wait" semantics
//!
//! ## Quick reference
//! - **Raisers**: the propagation worker (one outstanding raise at a time).
//! - **Consumers**: application handlers, then the bus's own completion sentinel.

mod bus;
mod event;
mod handler;
mod handler_set;

pub use bus::LocalBus;
pub use event::StateEvent;
pub use handler::{Handler, HandlerFn, HandlerRef};
pub use handler_set::HandlerId;
