//! # State-change handler trait.
//!
//! Provides [`Handler`], the extension point application code uses to react to
//! cluster-state transitions, and [`HandlerFn`], a closure-backed implementation.
//!
//! ## Contract
//! - Handlers run **sequentially** on the bus dispatcher, in ascending
//!   [`Handler::priority`] order; equal priorities keep registration order.
//! - A handler returning `Err` or panicking is logged and the walk continues:
//!   local failures are the handler's own responsibility.
//! - A handler that never returns holds the bus busy; the raising side times out
//!   on its own deadline.
//!
//! ## Example
//! ```rust
//! use async_trait::async_trait;
//! use statecast::{Handler, StateEvent};
//!
//! struct Routes;
//!
//! #[async_trait]
//! impl Handler for Routes {
//!     async fn on_event(&self, ev: &StateEvent) -> anyhow::Result<()> {
//!         if ev.active {
//!             // program routes...
//!         }
//!         Ok(())
//!     }
//!
//!     fn name(&self) -> &'static str { "routes" }
//!     fn priority(&self) -> i32 { 10 }
//! }
//! ```

use std::borrow::Cow;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::events::StateEvent;

/// Shared handle to a handler.
pub type HandlerRef = Arc<dyn Handler>;

/// In-process reaction to a cluster-state transition.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Applies one transition locally.
    async fn on_event(&self, event: &StateEvent) -> anyhow::Result<()>;

    /// Name used in logs.
    ///
    /// The default uses `type_name::<Self>()`, which can be verbose.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Position in the walk; lower runs earlier.
    ///
    /// Values at or above `i32::MAX` are clamped just below it: the last slot
    /// belongs to the bus's completion sentinel.
    fn priority(&self) -> i32 {
        0
    }
}

/// Closure-backed handler.
///
/// Wraps `F: Fn(StateEvent) -> Fut`, producing a fresh future per event.
/// If state must be shared between events, capture an `Arc<...>` explicitly.
pub struct HandlerFn<F> {
    name: Cow<'static, str>,
    priority: i32,
    f: F,
}

impl<F> HandlerFn<F> {
    pub fn new(name: impl Into<Cow<'static, str>>, priority: i32, f: F) -> Self {
        Self {
            name: name.into(),
            priority,
            f,
        }
    }

    /// Creates the handler and returns it as a shared handle.
    ///
    /// ## Example
    /// ```rust
    /// use statecast::{HandlerFn, HandlerRef, StateEvent};
    ///
    /// let h: HandlerRef = HandlerFn::arc("audit", 0, |ev: StateEvent| async move {
    ///     let _ = ev.state_type;
    ///     Ok::<_, anyhow::Error>(())
    /// });
    /// assert_eq!(h.name(), "audit");
    /// ```
    pub fn arc(name: impl Into<Cow<'static, str>>, priority: i32, f: F) -> Arc<Self> {
        Arc::new(Self::new(name, priority, f))
    }
}

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(StateEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn on_event(&self, event: &StateEvent) -> anyhow::Result<()> {
        (self.f)(event.clone()).await
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }
}
