//! # Local event bus: raise a state change and wait for every handler.
//!
//! [`LocalBus`] delivers one [`StateEvent`] at a time to the registered
//! [`Handler`](crate::Handler)s on a single dispatcher task and lets the caller
//! block until delivery is provably complete or a deadline passes.
//!
//! ## Architecture
//! ```text
//! raise(type, active, deadline)
//!     │  lock: check FINALIZED/STOPPING → Canceled
//!     │        check BUSY              → Busy
//!     │        check deadline          → TimedOut (nothing posted)
//!     │        post event, set BUSY(seq)
//!     ▼
//!  [post queue] ──► dispatcher task ──► h1 ─► h2 ─► ... ─► sentinel
//!     │                                                      │
//!     │                               lock: clear BUSY(seq), notify
//!     ▼                                                      │
//!  wait on Notify ◄──────────────────────────────────────────┘
//!     ├─ BUSY cleared          → Ok(())
//!     ├─ FINALIZED (finalize)  → Canceled
//!     └─ deadline elapsed      → TimedOut
//! ```
//!
//! ## Rules
//! - At most one raise is outstanding; BUSY is set exactly while a delivery is.
//! - After a `TimedOut` raise BUSY stays set until the sentinel really runs:
//!   the walk is still executing and a new raise would overlap it.
//! - The sentinel holds the last slot (`i32::MAX`), so "complete" is never
//!   signalled before every application handler returned.
//! - Handlers run outside every lock held by the bus.

use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;

use crate::error::PropagationError;

use super::handler_set::{HandlerSet, walk};
use super::{Handler, HandlerId, HandlerRef, StateEvent};

#[derive(Debug, Default)]
struct BusState {
    /// Sequence of the delivery currently outstanding (BUSY).
    busy: Option<u64>,
    /// Shutdown in progress: new raises are refused.
    stopping: bool,
    /// Torn down: new raises are refused and waiters are woken.
    finalized: bool,
}

struct Shared {
    state: Mutex<BusState>,
    changed: Notify,
    handlers: RwLock<HandlerSet>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Lowest-priority handler: marks the delivery of `event.seq` complete.
struct Sentinel {
    shared: Weak<Shared>,
}

#[async_trait]
impl Handler for Sentinel {
    async fn on_event(&self, event: &StateEvent) -> anyhow::Result<()> {
        let Some(shared) = self.shared.upgrade() else {
            return Ok(());
        };
        let mut st = shared.lock();
        if st.busy == Some(event.seq) {
            st.busy = None;
        }
        drop(st);
        shared.changed.notify_waiters();
        Ok(())
    }

    fn name(&self) -> &str {
        "sentinel"
    }
}

/// Single-dispatcher event bus with synchronous completion.
///
/// Cheap to share behind an `Arc`; one instance per module.
pub struct LocalBus {
    shared: Arc<Shared>,
    tx: mpsc::Sender<StateEvent>,
    token: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl LocalBus {
    /// Creates the bus and spawns its dispatcher task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(capacity: usize) -> Arc<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(BusState::default()),
            changed: Notify::new(),
            handlers: RwLock::new(HandlerSet::default()),
        });
        let sentinel = Arc::new(Sentinel {
            shared: Arc::downgrade(&shared),
        });
        shared
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert_sentinel(sentinel);

        let (tx, rx) = mpsc::channel(capacity.max(1));
        let token = CancellationToken::new();
        let dispatcher = tokio::spawn(dispatch_loop(Arc::clone(&shared), rx, token.clone()));

        Arc::new(Self {
            shared,
            tx,
            token,
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    /// Registers an application handler.
    ///
    /// Returns `Canceled` once the bus is finalized.
    pub fn register(&self, handler: HandlerRef) -> Result<HandlerId, PropagationError> {
        if self.shared.lock().finalized {
            return Err(PropagationError::Canceled);
        }
        let name = handler.name().to_string();
        let priority = handler.priority();
        let id = self.handlers_mut().insert(handler);
        tracing::debug!(handler = %name, priority, "state handler registered");
        Ok(id)
    }

    /// Removes a handler. Returns `false` if it was not registered.
    pub fn unregister(&self, id: HandlerId) -> bool {
        self.handlers_mut().remove(id)
    }

    /// Number of registered application handlers.
    pub fn handler_count(&self) -> usize {
        self.shared
            .handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// True while a delivery is outstanding.
    pub fn is_busy(&self) -> bool {
        self.shared.lock().busy.is_some()
    }

    /// Delivers a state change to every handler and waits for completion.
    ///
    /// ### Outcomes
    /// - `Ok(())`: the sentinel ran, so every handler observed the event
    /// - `Busy`: another delivery is outstanding
    /// - `Canceled`: the bus is stopping or finalized (also when finalized mid-wait)
    /// - `TimedOut`: `deadline` passed (immediately, without posting, if already past)
    /// - `Closed`: the dispatcher is gone
    pub async fn raise(
        &self,
        state_type: u8,
        active: bool,
        deadline: Instant,
    ) -> Result<(), PropagationError> {
        let event = StateEvent::new(state_type, active, deadline);
        let seq = event.seq;

        {
            let mut st = self.shared.lock();
            if st.finalized || st.stopping {
                return Err(PropagationError::Canceled);
            }
            if st.busy.is_some() {
                return Err(PropagationError::Busy);
            }
            if event.is_expired() {
                return Err(PropagationError::TimedOut);
            }
            self.tx.try_send(event).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => PropagationError::Busy,
                mpsc::error::TrySendError::Closed(_) => PropagationError::Closed,
            })?;
            st.busy = Some(seq);
        }

        tracing::debug!(seq, state_type, active, "state change raised");
        self.wait_delivered(seq, deadline).await
    }

    async fn wait_delivered(&self, seq: u64, deadline: Instant) -> Result<(), PropagationError> {
        loop {
            let mut notified = pin!(self.shared.changed.notified());
            notified.as_mut().enable();

            {
                let st = self.shared.lock();
                if st.busy != Some(seq) {
                    return Ok(());
                }
                if st.finalized {
                    return Err(PropagationError::Canceled);
                }
            }

            if timeout_at(deadline, notified).await.is_err() {
                tracing::warn!(seq, "state change delivery exceeded its deadline");
                return Err(PropagationError::TimedOut);
            }
        }
    }

    /// Refuses new raises; an outstanding raise keeps running to completion.
    pub fn request_shutdown(&self) {
        self.shared.lock().stopping = true;
    }

    /// Tears the bus down: wakes any blocked raise with `Canceled`, drops all
    /// handlers and stops the dispatcher. Idempotent.
    pub fn finalize(&self) {
        {
            let mut st = self.shared.lock();
            if st.finalized {
                return;
            }
            st.finalized = true;
        }
        self.shared.changed.notify_waiters();
        self.handlers_mut().clear();
        self.token.cancel();
        tracing::debug!("local bus finalized");
    }

    /// Waits for the dispatcher task to exit after [`finalize`](Self::finalize).
    pub async fn join(&self) {
        let handle = self
            .dispatcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(h) = handle {
            let _ = h.await;
        }
    }

    fn handlers_mut(&self) -> std::sync::RwLockWriteGuard<'_, HandlerSet> {
        self.shared
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for LocalBus {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Dispatcher: one event at a time, handlers in walk order.
async fn dispatch_loop(
    shared: Arc<Shared>,
    mut rx: mpsc::Receiver<StateEvent>,
    token: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => break,
            ev = rx.recv() => match ev {
                Some(ev) => ev,
                None => break,
            },
        };

        let handlers = shared
            .handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .snapshot();

        tokio::select! {
            _ = token.cancelled() => break,
            _ = walk(&handlers, &event) => {}
        }
    }
}
