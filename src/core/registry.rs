//! # Session registry - outbound sessions with bulk, bounded cancellation.
//!
//! Every outbound call this module makes to the coordinator (acknowledgements)
//! goes through a [`RegistrySession`] obtained from [`SessionRegistry::create`].
//! During shutdown [`SessionRegistry::finalize`] cancels them all and waits,
//! up to a deadline, for their owners to let go.
//!
//! ## Architecture
//! ```text
//! create(transport, addr)
//!     ├─► connect + open_session          (no lock held)
//!     └─► lock: disabled? → drop session, Canceled
//!               else      → link id → CancellationToken
//!
//! RegistrySession::invoke()  ── select ─┬─ session.invoke()
//!                                       └─ token.cancelled() → Canceled
//!
//! drop(RegistrySession)
//!     ├─► lock: unlink id, notify        (invisible to finalize from here)
//!     └─► session, then connection, released without the lock
//!
//! finalize(deadline)
//!     ├─► lock: disabled already? → Canceled; set disabled; snapshot tokens
//!     ├─► cancel every snapshot token     (no lock held)
//!     └─► wait until empty, or deadline → TimedOut
//! ```
//!
//! ## Rules
//! - Once disabled, no entry is ever linked again.
//! - The lock guards list linkage only, never I/O.

use std::collections::HashMap;
use std::pin::pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;

use crate::error::{PropagationError, TransportError};
use crate::transport::{Connection, ServiceAddr, Session, Transport};

#[derive(Default)]
struct RegistryState {
    disabled: bool,
    entries: HashMap<u64, CancellationToken>,
}

/// Registry of live outbound sessions.
#[derive(Default)]
pub struct SessionRegistry {
    state: Mutex<RegistryState>,
    drained: Notify,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Opens a session to `addr` and links it into the registry.
    ///
    /// Fails with `Canceled` once [`finalize`](Self::finalize) has begun, even
    /// if the connection was established concurrently with it.
    pub async fn create(
        self: &Arc<Self>,
        transport: &dyn Transport,
        addr: &ServiceAddr,
    ) -> Result<RegistrySession, PropagationError> {
        if self.is_disabled() {
            return Err(PropagationError::Canceled);
        }

        let conn = transport.connect(addr).await?;
        let session = conn.open_session(addr).await?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        {
            let mut st = self.lock();
            if st.disabled {
                drop(st);
                drop(session);
                drop(conn);
                tracing::debug!(service = %addr, "registry disabled; session discarded");
                return Err(PropagationError::Canceled);
            }
            st.entries.insert(id, cancel.clone());
        }

        Ok(RegistrySession {
            session,
            _conn: conn,
            registry: Arc::clone(self),
            id,
            cancel,
            service: addr.clone(),
        })
    }

    /// Disables the registry, cancels every linked session and waits for all of
    /// them to be released.
    ///
    /// Returns `Canceled` if finalization already started (no further work is
    /// done), `TimedOut` if some session was still linked at `deadline`.
    pub async fn finalize(&self, deadline: Instant) -> Result<(), PropagationError> {
        let tokens: Vec<CancellationToken> = {
            let mut st = self.lock();
            if st.disabled {
                return Err(PropagationError::Canceled);
            }
            st.disabled = true;
            st.entries.values().cloned().collect()
        };

        tracing::debug!(sessions = tokens.len(), "cancelling outbound sessions");
        for t in &tokens {
            t.cancel();
        }

        loop {
            let mut notified = pin!(self.drained.notified());
            notified.as_mut().enable();

            let pending = self.lock().entries.len();
            if pending == 0 {
                return Ok(());
            }

            if timeout_at(deadline, notified).await.is_err() {
                let pending = self.len();
                if pending == 0 {
                    return Ok(());
                }
                tracing::warn!(pending, "at least one outbound request never completed");
                return Err(PropagationError::TimedOut);
            }
        }
    }

    /// True once finalization began.
    pub fn is_disabled(&self) -> bool {
        self.lock().disabled
    }

    /// Number of linked sessions.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn unlink(&self, id: u64) {
        let removed = self.lock().entries.remove(&id).is_some();
        if removed {
            self.drained.notify_waiters();
        }
    }
}

/// One linked outbound session; unlinked when dropped.
pub struct RegistrySession {
    // Field order matters: the session is released before its connection.
    session: Box<dyn Session>,
    _conn: Box<dyn Connection>,
    registry: Arc<SessionRegistry>,
    id: u64,
    cancel: CancellationToken,
    service: ServiceAddr,
}

impl RegistrySession {
    pub fn service(&self) -> &ServiceAddr {
        &self.service
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.session.set_timeout(timeout);
    }

    pub fn write_u8(&mut self, value: u8) -> Result<(), TransportError> {
        self.session.write_u8(value)
    }

    /// Invokes the session; returns `Canceled` as soon as the registry cancels it.
    pub async fn invoke(&mut self) -> Result<u32, TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Canceled);
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(TransportError::Canceled),
            res = self.session.invoke() => res,
        }
    }

    /// Unlinks and releases the session.
    pub fn release(self) {}
}

impl Drop for RegistrySession {
    fn drop(&mut self) {
        // Unlink first; the fields (session, then connection) are released afterwards.
        self.registry.unlink(self.id);
    }
}
