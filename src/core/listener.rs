//! # Listener: inbound trigger surface and channel liveness.
//!
//! The [`Listener`] owns everything the coordinator can ask of this module:
//! liveness of the listener channel, state-change triggers and the stop trigger.
//!
//! ## Architecture
//! ```text
//! coordinator ──► [Trigger stream] ──► Listener::serve() ──► dispatch(trigger)
//!                                                              │
//!    ChannelNotify(UP) / ChannelUp ── set UP, wake wait_ready ─┤
//!    ChannelNotify(DOWN)          ── log, stay CONNECTING ─────┤
//!    ChannelDown                  ── set DOWN, wake (Canceled) ┤
//!    SystemStop                   ── shutdown coordinator ─────┤
//!    StateChange ──┬─ stopping/finalizing → NACK, Canceled     │
//!                  ├─ pending/worker     → NACK, Busy          │
//!                  └─ else PendingTransition + spawn worker ───┘
//!                             └──► LocalBus::raise ──► acknowledge(result)
//! ```
//!
//! ## Rules
//! - All state transitions and every task handle live under one mutex.
//! - NACKs are sent from their own task; dispatch never waits on the coordinator.
//! - At most one [`PendingTransition`] exists; a second trigger is rejected,
//!   never queued: state changes are not commutative and the coordinator orders them.
//! - Every wait takes an absolute deadline and ends in `Ok`, `TimedOut` or `Canceled`.

use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Notify, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::clock::{WireDeadline, deadline_after};
use crate::config::Config;
use crate::core::builder::ListenerBuilder;
use crate::core::channel::{ChannelState, ListenerPhase};
use crate::core::registry::SessionRegistry;
use crate::core::worker;
use crate::error::PropagationError;
use crate::events::LocalBus;
use crate::protocol::{CHANNEL_DOWN, CHANNEL_UP, Trigger};
use crate::transport::TransportRef;

/// The one state change currently being applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingTransition {
    /// Opaque state-type code.
    pub state_type: u8,
    /// Active/inactive flag.
    pub active: bool,
    /// Local deadline for delivery plus acknowledgement.
    pub deadline: Instant,
}

#[derive(Default)]
pub(crate) struct ListenerState {
    pub channel: ChannelState,
    pub started: bool,
    pub pending: Option<PendingTransition>,
    pub worker: Option<JoinHandle<()>>,
    pub timer: Option<JoinHandle<()>>,
    /// Negative acknowledgements still being sent.
    pub nacks: JoinSet<()>,
    /// Set by [`Listener::close`]; the module's STOP bit.
    pub finalizing: bool,
}

pub(crate) struct Inner {
    pub cfg: Config,
    pub transport: TransportRef,
    pub registry: Arc<SessionRegistry>,
    pub bus: Arc<LocalBus>,
    pub state: Mutex<ListenerState>,
    pub changed: Notify,
    pub serve_token: CancellationToken,
    pub serve: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    pub fn lock(&self) -> MutexGuard<'_, ListenerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Inbound side of the propagation protocol.
///
/// Constructed once per module with [`Listener::builder`] and finalized with
/// [`Listener::close`]. Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct Listener {
    pub(crate) inner: Arc<Inner>,
}

impl Listener {
    /// Starts building a listener for `transport`.
    pub fn builder(cfg: Config, transport: TransportRef) -> ListenerBuilder {
        ListenerBuilder::new(cfg, transport)
    }

    pub(crate) fn from_parts(
        cfg: Config,
        transport: TransportRef,
        registry: Arc<SessionRegistry>,
        bus: Arc<LocalBus>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                cfg,
                transport,
                registry,
                bus,
                state: Mutex::new(ListenerState::default()),
                changed: Notify::new(),
                serve_token: CancellationToken::new(),
                serve: Mutex::new(None),
            }),
        }
    }

    /// Local bus state changes are delivered on.
    pub fn bus(&self) -> &Arc<LocalBus> {
        &self.inner.bus
    }

    /// Registry acknowledgement sessions are drawn from.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.inner.registry
    }

    pub fn config(&self) -> &Config {
        &self.inner.cfg
    }

    /// Snapshot of the channel flags.
    pub fn channel_state(&self) -> ChannelState {
        self.inner.lock().channel
    }

    /// Snapshot of the lifecycle phase.
    pub fn phase(&self) -> ListenerPhase {
        let st = self.inner.lock();
        ListenerPhase::derive(st.channel, st.started)
    }

    /// The transition currently in flight, if any.
    pub fn pending(&self) -> Option<PendingTransition> {
        self.inner.lock().pending
    }

    /// Spawns [`serve`](Self::serve) over `triggers` and waits, up to the
    /// configured connect timeout, for the channel to come up.
    pub async fn start(&self, triggers: mpsc::Receiver<Trigger>) -> Result<(), PropagationError> {
        self.inner.lock().started = true;

        let me = self.clone();
        let handle = tokio::spawn(async move { me.serve(triggers).await }.in_current_span());
        *self
            .inner
            .serve
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);

        let deadline = deadline_after(self.inner.cfg.connect_timeout());
        self.wait_ready(deadline).await.inspect_err(|e| {
            tracing::error!(label = e.as_label(), "listener channel never came up");
        })
    }

    /// Dispatches inbound triggers until the stream ends or [`close`](Self::close) runs.
    ///
    /// An unexpected end of the stream (no stop requested) marks the channel `FATAL`.
    pub async fn serve(&self, mut triggers: mpsc::Receiver<Trigger>) {
        self.inner.lock().started = true;

        loop {
            let next = tokio::select! {
                _ = self.inner.serve_token.cancelled() => break,
                t = triggers.recv() => t,
            };

            match next {
                Some(trigger) => {
                    if let Err(e) = self.dispatch(trigger).await {
                        tracing::debug!(label = e.as_label(), trigger = ?trigger.id(), "trigger rejected");
                    }
                }
                None => {
                    let mut st = self.inner.lock();
                    let expected = st.finalizing || st.channel.contains(ChannelState::STOP_REQUESTED);
                    if !expected {
                        st.channel |= ChannelState::FATAL;
                    }
                    drop(st);
                    if !expected {
                        tracing::error!(fatal = true, "trigger stream closed unexpectedly");
                    }
                    self.inner.changed.notify_waiters();
                    break;
                }
            }
        }
    }

    /// Handles one inbound trigger.
    pub async fn dispatch(&self, trigger: Trigger) -> Result<(), PropagationError> {
        match trigger {
            Trigger::ChannelNotify { state } => {
                self.on_channel_notify(state);
                Ok(())
            }
            Trigger::ChannelUp => {
                self.on_channel_up();
                Ok(())
            }
            Trigger::ChannelDown => {
                self.on_channel_down();
                Ok(())
            }
            Trigger::StateChange {
                state_type,
                active,
                deadline,
            } => self.on_state_change(state_type, active, deadline),
            Trigger::SystemStop { status } => {
                self.on_system_stop(status);
                Ok(())
            }
        }
    }

    fn on_channel_notify(&self, state: u32) {
        match state {
            CHANNEL_UP => self.on_channel_up(),
            CHANNEL_DOWN => {
                tracing::info!(phase = self.phase().as_str(), "listener session not usable yet");
            }
            other => {
                tracing::warn!(state = other, "ignoring channel notify with unknown state");
            }
        }
    }

    fn on_channel_up(&self) {
        let mut st = self.inner.lock();
        if st.channel.is_canceled() {
            tracing::debug!(channel = ?st.channel, "channel up after cancel ignored");
            return;
        }
        if st.channel.is_up() {
            return;
        }
        st.channel |= ChannelState::UP;
        drop(st);
        tracing::info!("listener channel up");
        self.inner.changed.notify_waiters();
    }

    fn on_channel_down(&self) {
        self.inner.lock().channel |= ChannelState::DOWN;
        tracing::error!(fatal = true, "coordinator disappeared; listener channel down");
        self.inner.changed.notify_waiters();
    }

    fn on_state_change(
        &self,
        state_type: u8,
        active: bool,
        deadline: WireDeadline,
    ) -> Result<(), PropagationError> {
        let transition = PendingTransition {
            state_type,
            active,
            deadline: deadline.to_instant(),
        };

        let mut st = self.inner.lock();
        let err = if st.finalizing || st.channel.contains(ChannelState::STOP_REQUESTED) {
            PropagationError::Canceled
        } else if st.pending.is_some() || st.worker.is_some() {
            PropagationError::Busy
        } else {
            st.pending = Some(transition);
            let inner = Arc::clone(&self.inner);
            st.worker = Some(tokio::spawn(worker::run(inner, transition).in_current_span()));
            drop(st);
            tracing::debug!(state_type, active, "state change accepted");
            return Ok(());
        };

        // The NACK must not hold up the triggers queued behind this one.
        while st.nacks.try_join_next().is_some() {}
        let inner = Arc::clone(&self.inner);
        st.nacks.spawn(
            async move {
                if let Err(e) = worker::acknowledge(&inner, false).await {
                    worker::report_ack_failure(&e);
                }
            }
            .in_current_span(),
        );
        drop(st);

        tracing::warn!(state_type, active, label = err.as_label(), "state change rejected");
        Err(err)
    }

    /// Waits until the channel is up.
    ///
    /// Returns `Canceled` if the channel goes down, fails or a stop is requested,
    /// `TimedOut` if `deadline` passes first.
    pub async fn wait_ready(&self, deadline: Instant) -> Result<(), PropagationError> {
        loop {
            let mut notified = pin!(self.inner.changed.notified());
            notified.as_mut().enable();

            {
                let st = self.inner.lock();
                if st.channel.is_canceled() {
                    return Err(PropagationError::Canceled);
                }
                if st.channel.is_up() {
                    return Ok(());
                }
            }

            if timeout_at(deadline, notified).await.is_err() {
                return Err(PropagationError::TimedOut);
            }
        }
    }
}
