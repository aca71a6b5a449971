//! # Propagation worker.
//!
//! One short-lived task per accepted state change:
//!
//! ```text
//! run(transition)
//!   ├─► LocalBus::raise(state_type, active, deadline)   success = raise is Ok
//!   ├─► acknowledge(success)
//!   │     ├─► registry.create(coordinator ack endpoint)
//!   │     ├─► set_timeout(ack_timeout) / write_u8(success)
//!   │     └─► invoke (nonzero response logged, not retried)
//!   ├─► lock: clear pending; clear own handle unless close() is joining it
//!   └─► stop already requested → close the bus to new raises
//! ```

use std::sync::Arc;

use crate::core::channel::ChannelState;
use crate::core::listener::{Inner, PendingTransition};
use crate::error::PropagationError;

pub(crate) async fn run(inner: Arc<Inner>, transition: PendingTransition) {
    let PendingTransition {
        state_type,
        active,
        deadline,
    } = transition;

    let success = match inner.bus.raise(state_type, active, deadline).await {
        Ok(()) => {
            tracing::debug!(state_type, active, "state change delivered");
            true
        }
        Err(e) => {
            tracing::warn!(state_type, active, label = e.as_label(), "state change not delivered");
            false
        }
    };

    if let Err(e) = acknowledge(&inner, success).await {
        report_ack_failure(&e);
    }

    let stop_requested = {
        let mut st = inner.lock();
        st.pending = None;
        if !st.finalizing {
            // Dropping our own handle detaches it.
            st.worker = None;
        }
        st.channel.contains(ChannelState::STOP_REQUESTED)
    };
    if stop_requested {
        inner.bus.request_shutdown();
    }
}

/// Sends one acknowledgement carrying `success` to the coordinator.
pub(crate) async fn acknowledge(inner: &Inner, success: bool) -> Result<(), PropagationError> {
    let addr = inner.cfg.ack_endpoint();
    let mut session = inner
        .registry
        .create(inner.transport.as_ref(), &addr)
        .await
        .map_err(desync)?;
    session.set_timeout(inner.cfg.ack_timeout());
    session
        .write_u8(u8::from(success))
        .map_err(|e| desync(e.into()))?;

    let code = session.invoke().await.map_err(|e| desync(e.into()))?;
    if code != 0 {
        tracing::warn!(code, service = %addr, "unexpected acknowledgement response");
    }
    session.release();
    Ok(())
}

/// Transport failures mean this module and the coordinator no longer agree on
/// the protocol state; shutdown-induced ones pass through unchanged.
fn desync(err: PropagationError) -> PropagationError {
    if err.is_shutdown() {
        err
    } else {
        PropagationError::desync(err.to_string())
    }
}

pub(crate) fn report_ack_failure(err: &PropagationError) {
    if err.is_shutdown() {
        tracing::warn!(label = err.as_label(), "acknowledgement abandoned during shutdown");
    } else {
        tracing::error!(fatal = true, label = err.as_label(), error = %err, "acknowledgement failed");
    }
}
