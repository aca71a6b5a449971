//! # In-process loopback transport.
//!
//! [`MemoryTransport`] plays the coordinator's side of the acknowledgement
//! endpoint inside the same process. Every successful invoke is recorded as an
//! [`Ack`]; faults can be injected to exercise the failure paths.
//!
//! ## Example
//! ```rust
//! use statecast::transport::memory::MemoryTransport;
//!
//! let transport = MemoryTransport::new();
//! transport.respond_with(0);
//! assert!(transport.acks().is_empty());
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::{Instant, timeout, timeout_at};

use super::{Connection, ServiceAddr, Session, Transport};
use crate::error::TransportError;

type AckHook = Arc<dyn Fn(&Ack) + Send + Sync>;

/// One recorded acknowledgement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ack {
    /// Endpoint the session was opened on.
    pub service: ServiceAddr,
    /// Arguments written before invoke.
    pub args: Vec<u8>,
}

impl Ack {
    /// The boolean result byte, if one was written.
    pub fn result(&self) -> Option<u8> {
        self.args.first().copied()
    }
}

#[derive(Default)]
struct Faults {
    fail_connect: bool,
    hang_invoke: bool,
    response_code: u32,
}

#[derive(Default)]
struct Inner {
    acks: Mutex<Vec<Ack>>,
    faults: Mutex<Faults>,
    hook: Mutex<Option<AckHook>>,
    recorded: Notify,
    connects: AtomicUsize,
    live_sessions: AtomicUsize,
}

impl Inner {
    fn faults(&self) -> MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Loopback [`Transport`] recording acknowledgements.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    inner: Arc<Inner>,
}

impl MemoryTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes every subsequent `connect` fail.
    pub fn fail_connect(&self, fail: bool) {
        self.inner.faults().fail_connect = fail;
    }

    /// Makes every subsequent `invoke` block until its session timeout.
    pub fn hang_invoke(&self, hang: bool) {
        self.inner.faults().hang_invoke = hang;
    }

    /// Response code returned by `invoke` (0 = accepted).
    pub fn respond_with(&self, code: u32) {
        self.inner.faults().response_code = code;
    }

    /// Called synchronously inside `invoke`, before the ack is recorded.
    pub fn on_ack(&self, hook: impl Fn(&Ack) + Send + Sync + 'static) {
        *self.inner.hook.lock().unwrap_or_else(|p| p.into_inner()) = Some(Arc::new(hook));
    }

    /// Acknowledgements recorded so far.
    pub fn acks(&self) -> Vec<Ack> {
        self.inner
            .acks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Result bytes recorded so far.
    pub fn results(&self) -> Vec<u8> {
        self.acks().iter().filter_map(Ack::result).collect()
    }

    /// Waits until at least `n` acknowledgements were recorded or `within` elapses.
    pub async fn wait_for_acks(&self, n: usize, within: Duration) -> Vec<Ack> {
        let deadline = Instant::now() + within;
        loop {
            let mut notified = std::pin::pin!(self.inner.recorded.notified());
            notified.as_mut().enable();
            let acks = self.acks();
            if acks.len() >= n {
                return acks;
            }
            if timeout_at(deadline, notified).await.is_err() {
                return self.acks();
            }
        }
    }

    /// Number of `connect` calls that succeeded.
    pub fn connects(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Sessions opened and not yet dropped.
    pub fn live_sessions(&self) -> usize {
        self.inner.live_sessions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, addr: &ServiceAddr) -> Result<Box<dyn Connection>, TransportError> {
        if self.inner.faults().fail_connect {
            return Err(TransportError::Connect {
                service: addr.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryConnection {
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct MemoryConnection {
    inner: Arc<Inner>,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn open_session(&self, addr: &ServiceAddr) -> Result<Box<dyn Session>, TransportError> {
        self.inner.live_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySession {
            inner: Arc::clone(&self.inner),
            service: addr.clone(),
            timeout: None,
            args: Vec::new(),
        }))
    }
}

struct MemorySession {
    inner: Arc<Inner>,
    service: ServiceAddr,
    timeout: Option<Duration>,
    args: Vec<u8>,
}

impl MemorySession {
    async fn exchange(&mut self) -> Result<u32, TransportError> {
        let (hang, code) = {
            let f = self.inner.faults();
            (f.hang_invoke, f.response_code)
        };
        if hang {
            std::future::pending::<()>().await;
        }

        let ack = Ack {
            service: self.service.clone(),
            args: std::mem::take(&mut self.args),
        };
        let hook = self
            .inner
            .hook
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        if let Some(hook) = hook {
            hook(&ack);
        }
        self.inner
            .acks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(ack);
        self.inner.recorded.notify_waiters();
        Ok(code)
    }
}

#[async_trait]
impl Session for MemorySession {
    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = Some(timeout);
    }

    fn write_u8(&mut self, value: u8) -> Result<(), TransportError> {
        self.args.push(value);
        Ok(())
    }

    async fn invoke(&mut self) -> Result<u32, TransportError> {
        match self.timeout {
            Some(d) => timeout(d, self.exchange())
                .await
                .map_err(|_| TransportError::TimedOut)?,
            None => self.exchange().await,
        }
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.inner.live_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}
