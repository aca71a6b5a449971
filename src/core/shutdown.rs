//! # Shutdown coordination.
//!
//! Two entry points, driven by two different parties:
//!
//! - the coordinator's **system-stop trigger** ([`Listener::dispatch`] with
//!   [`Trigger::SystemStop`](crate::protocol::Trigger::SystemStop)): refuse new
//!   work, let in-flight work finish, arm a watchdog that reports a fatal error
//!   if nobody finalizes the module within `finalize_ceiling`;
//! - the host's **finalization** ([`Listener::close`]): tear everything down
//!   within a caller deadline.
//!
//! ```text
//! stop trigger ──► channel |= STOP_REQUESTED ──► bus.request_shutdown()
//!                      │                          (deferred to the worker while
//!                      │                           a change is in flight)
//!                      └─► spawn watchdog (once, unless already finalizing)
//!                              └─ wait finalizing ─┬─ set   → exit quietly
//!                                                  └─ ceiling → error!(fatal)
//!
//! close(deadline)
//!   ├─► finalizing = true                (second call → Canceled)
//!   ├─► registry.finalize(deadline)      cancel outbound acks, wait release
//!   ├─► bus.finalize()                   wakes a worker blocked in raise
//!   ├─► notify                           wakes watchdog and readiness waiters
//!   ├─► join worker, watchdog, NACKs     bounded by deadline
//!   └─► stop serve loop, join dispatcher
//! ```

use std::pin::pin;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};
use tracing::Instrument;

use crate::clock::deadline_after;
use crate::core::channel::ChannelState;
use crate::core::listener::{Inner, Listener};
use crate::error::PropagationError;

impl Listener {
    pub(crate) fn on_system_stop(&self, status: u8) {
        let (spawned, in_flight) = {
            let mut st = self.inner.lock();
            st.channel |= ChannelState::STOP_REQUESTED;
            let spawned = if st.finalizing || st.timer.is_some() {
                false
            } else {
                let inner = Arc::clone(&self.inner);
                st.timer = Some(tokio::spawn(finalize_watchdog(inner).in_current_span()));
                true
            };
            (spawned, st.pending.is_some())
        };
        // An accepted change may not have reached the bus yet; the worker
        // closes the bus itself once it is done.
        if !in_flight {
            self.inner.bus.request_shutdown();
        }
        self.inner.changed.notify_waiters();

        if status == 0 {
            tracing::warn!(status, watchdog = spawned, "abnormal system stop requested");
        } else {
            tracing::info!(status, watchdog = spawned, "system stop requested");
        }
    }

    /// Finalizes the module: cancels outstanding acknowledgements, tears the
    /// bus down and joins every task this listener spawned.
    ///
    /// ### Outcomes
    /// - `Ok(())`: everything released before `deadline`
    /// - `TimedOut`: some session or task was still alive at `deadline`
    ///   (teardown still completes for everything else)
    /// - `Canceled`: finalization already ran
    pub async fn close(&self, deadline: Instant) -> Result<(), PropagationError> {
        {
            let mut st = self.inner.lock();
            if st.finalizing {
                return Err(PropagationError::Canceled);
            }
            st.finalizing = true;
        }
        tracing::info!("finalizing listener");

        let mut outcome = self.inner.registry.finalize(deadline).await;

        self.inner.bus.finalize();
        self.inner.changed.notify_waiters();

        let (worker, timer, mut nacks) = {
            let mut st = self.inner.lock();
            (st.worker.take(), st.timer.take(), std::mem::take(&mut st.nacks))
        };
        for (what, handle) in [("worker", worker), ("watchdog", timer)] {
            if let Err(e) = join_before(what, handle, deadline).await {
                outcome = outcome.and(Err(e));
            }
        }
        let drained = timeout_at(deadline, async {
            while nacks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            // Dropping the set aborts whatever is left.
            tracing::warn!(
                pending = nacks.len(),
                "negative acknowledgements still running at finalize deadline"
            );
            outcome = outcome.and(Err(PropagationError::TimedOut));
        }

        self.inner.serve_token.cancel();
        let serve = self
            .inner
            .serve
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Err(e) = join_before("serve loop", serve, deadline).await {
            outcome = outcome.and(Err(e));
        }
        if timeout_at(deadline, self.inner.bus.join()).await.is_err() {
            tracing::warn!("bus dispatcher still running at finalize deadline");
            outcome = outcome.and(Err(PropagationError::TimedOut));
        }

        match &outcome {
            Ok(()) => tracing::info!("listener finalized"),
            Err(e) => tracing::warn!(label = e.as_label(), "listener finalized late"),
        }
        outcome
    }
}

async fn join_before(
    what: &'static str,
    handle: Option<JoinHandle<()>>,
    deadline: Instant,
) -> Result<(), PropagationError> {
    let Some(handle) = handle else {
        return Ok(());
    };
    match timeout_at(deadline, handle).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            tracing::error!(task = what, error = %e, "task ended abnormally");
            Ok(())
        }
        Err(_) => {
            tracing::warn!(task = what, "task still running at finalize deadline");
            Err(PropagationError::TimedOut)
        }
    }
}

async fn finalize_watchdog(inner: Arc<Inner>) {
    let ceiling = inner.cfg.finalize_ceiling();
    let deadline = deadline_after(ceiling);
    loop {
        let mut notified = pin!(inner.changed.notified());
        notified.as_mut().enable();

        if inner.lock().finalizing {
            return;
        }
        if timeout_at(deadline, notified).await.is_err() {
            tracing::error!(
                fatal = true,
                ceiling_ms = ceiling.as_millis() as u64,
                "module was not finalized after system stop"
            );
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tracing_test::traced_test;

    use super::*;
    use crate::clock::WireDeadline;
    use crate::config::Config;
    use crate::core::channel::ListenerPhase;
    use crate::events::{HandlerFn, StateEvent};
    use crate::protocol::Trigger;
    use crate::transport::memory::MemoryTransport;

    fn listener(cfg: Config) -> (Listener, Arc<MemoryTransport>) {
        let transport = MemoryTransport::new();
        let l = Listener::builder(cfg, transport.clone()).build().unwrap();
        (l, transport)
    }

    fn soon(ms: u64) -> Instant {
        Instant::now() + Duration::from_millis(ms)
    }

    #[tokio::test]
    async fn close_twice_is_canceled() {
        let (l, _t) = listener(Config::default());
        l.close(soon(1_000)).await.unwrap();
        assert!(matches!(
            l.close(soon(1_000)).await,
            Err(PropagationError::Canceled)
        ));
        assert!(l.registry().is_disabled());
    }

    #[tokio::test]
    async fn stop_rejects_new_changes_with_nack() {
        let (l, transport) = listener(Config::default());
        l.dispatch(Trigger::SystemStop { status: 1 }).await.unwrap();
        assert_eq!(l.phase(), ListenerPhase::Stopped);

        let err = l
            .dispatch(Trigger::StateChange {
                state_type: 2,
                active: true,
                deadline: WireDeadline::after(Duration::from_secs(5)),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PropagationError::Canceled));
        transport.wait_for_acks(1, Duration::from_secs(5)).await;
        assert_eq!(transport.results(), vec![0]);

        l.close(soon(1_000)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn watchdog_reports_missing_finalize() {
        let cfg = Config {
            finalize_ceiling_ms: 100,
            ..Config::default()
        };
        let (l, _t) = listener(cfg);
        l.dispatch(Trigger::SystemStop { status: 0 }).await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(logs_contain("module was not finalized after system stop"));
        assert!(logs_contain("abnormal system stop requested"));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn finalize_disarms_watchdog() {
        let cfg = Config {
            finalize_ceiling_ms: 100,
            ..Config::default()
        };
        let (l, _t) = listener(cfg);
        l.dispatch(Trigger::SystemStop { status: 1 }).await.unwrap();
        l.close(soon(50)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!logs_contain("module was not finalized after system stop"));
    }

    #[tokio::test]
    async fn close_without_stop_skips_watchdog() {
        let (l, _t) = listener(Config::default());
        l.close(soon(1_000)).await.unwrap();

        l.on_system_stop(1);
        assert!(l.inner.lock().timer.is_none());
    }

    async fn idle(l: &Listener) {
        while l.pending().is_some() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn stop_before_worker_runs_still_delivers() {
        let (l, transport) = listener(Config::default());
        l.bus()
            .register(HandlerFn::arc("noop", 0, |_e: StateEvent| async move {
                Ok::<_, anyhow::Error>(())
            }))
            .unwrap();

        // Current-thread runtime: the worker has not been polled when the stop lands.
        l.dispatch(Trigger::StateChange {
            state_type: 6,
            active: true,
            deadline: WireDeadline::after(Duration::from_secs(5)),
        })
        .await
        .unwrap();
        l.dispatch(Trigger::SystemStop { status: 1 }).await.unwrap();

        let acks = transport.wait_for_acks(1, Duration::from_secs(5)).await;
        assert_eq!(acks[0].result(), Some(1));

        idle(&l).await;
        assert!(matches!(
            l.bus().raise(7, true, soon(1_000)).await,
            Err(PropagationError::Canceled)
        ));
        l.close(soon(1_000)).await.unwrap();
    }

    #[tokio::test]
    async fn hung_nack_does_not_hold_up_later_triggers() {
        let (l, transport) = listener(Config::default());
        l.dispatch(Trigger::SystemStop { status: 1 }).await.unwrap();
        transport.hang_invoke(true);

        let rejected = tokio::time::timeout(
            Duration::from_millis(500),
            l.dispatch(Trigger::StateChange {
                state_type: 2,
                active: false,
                deadline: WireDeadline::after(Duration::from_secs(5)),
            }),
        )
        .await
        .expect("rejection returned without waiting for the NACK");
        assert!(matches!(rejected, Err(PropagationError::Canceled)));

        l.dispatch(Trigger::ChannelDown).await.unwrap();
        assert_eq!(l.phase(), ListenerPhase::Down);

        let began = Instant::now();
        l.close(soon(2_000)).await.unwrap();
        assert!(began.elapsed() < Duration::from_secs(1));
        assert!(l.registry().is_empty());
        assert!(transport.acks().is_empty());
    }

    #[tokio::test]
    async fn huge_configured_timeouts_do_not_overflow() {
        let cfg = Config {
            connect_timeout_ms: u64::MAX,
            finalize_ceiling_ms: u64::MAX,
            ..Config::default()
        };
        let (l, _t) = listener(cfg);
        let (tx, rx) = tokio::sync::mpsc::channel(4);
        tx.send(Trigger::ChannelUp).await.unwrap();
        l.start(rx).await.unwrap();

        l.dispatch(Trigger::SystemStop { status: 1 }).await.unwrap();
        assert!(l.inner.lock().timer.is_some());
        l.close(soon(1_000)).await.unwrap();
    }
}
