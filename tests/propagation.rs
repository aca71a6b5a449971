use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use statecast::transport::memory::MemoryTransport;
use statecast::{
    Config, HandlerFn, HandlerRef, Listener, ListenerPhase, PropagationError, StateEvent, Trigger,
    WireDeadline,
};
use tokio::sync::mpsc;
use tokio::time::Instant;

struct Harness {
    listener: Listener,
    transport: Arc<MemoryTransport>,
    tx: mpsc::Sender<Trigger>,
}

async fn started(handlers: Vec<HandlerRef>) -> Harness {
    let transport = MemoryTransport::new();
    let listener = Listener::builder(Config::default(), transport.clone())
        .with_handlers(handlers)
        .build()
        .unwrap();

    let (tx, rx) = mpsc::channel(16);
    tx.send(Trigger::ChannelNotify { state: statecast::CHANNEL_DOWN })
        .await
        .unwrap();
    tx.send(Trigger::ChannelUp).await.unwrap();
    listener.start(rx).await.unwrap();

    Harness {
        listener,
        transport,
        tx,
    }
}

fn change(state_type: u8, within: Duration) -> Trigger {
    Trigger::StateChange {
        state_type,
        active: true,
        deadline: WireDeadline::after(within),
    }
}

fn soon(ms: u64) -> Instant {
    Instant::now() + Duration::from_millis(ms)
}

fn stuck() -> HandlerRef {
    HandlerFn::arc("stuck", 0, |_e: StateEvent| async move {
        std::future::pending::<()>().await;
        Ok::<_, anyhow::Error>(())
    })
}

#[tokio::test]
async fn fast_handler_is_acknowledged_true() {
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    let h = started(vec![HandlerFn::arc("count", 0, move |ev: StateEvent| {
        let counter = Arc::clone(&counter);
        async move {
            assert_eq!(ev.state_type, 1);
            assert!(ev.active);
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, anyhow::Error>(())
        }
    })])
    .await;
    assert_eq!(h.listener.phase(), ListenerPhase::Listening);

    let sent = Instant::now();
    h.tx.send(change(1, Duration::from_secs(5))).await.unwrap();
    let acks = h.transport.wait_for_acks(1, Duration::from_secs(5)).await;

    assert!(sent.elapsed() < Duration::from_secs(1));
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].result(), Some(1));
    assert_eq!(seen.load(Ordering::SeqCst), 1);

    h.listener.close(soon(1_000)).await.unwrap();
}

#[tokio::test]
async fn stuck_handler_is_acknowledged_false_at_deadline() {
    let h = started(vec![stuck()]).await;

    let sent = Instant::now();
    h.tx.send(change(1, Duration::from_millis(100))).await.unwrap();
    let acks = h.transport.wait_for_acks(1, Duration::from_secs(5)).await;

    let took = sent.elapsed();
    assert!(took >= Duration::from_millis(90), "acked after {took:?}");
    assert!(took < Duration::from_secs(2), "acked after {took:?}");
    assert_eq!(acks[0].result(), Some(0));

    h.listener.close(soon(1_000)).await.unwrap();
}

#[tokio::test]
async fn every_handler_runs_before_the_ack() {
    let flags: Vec<Arc<AtomicBool>> = (0..3).map(|_| Arc::new(AtomicBool::new(false))).collect();
    let handlers = flags
        .iter()
        .enumerate()
        .map(|(i, flag)| {
            let flag = Arc::clone(flag);
            HandlerFn::arc(format!("h{i}"), i as i32, move |_e: StateEvent| {
                let flag = Arc::clone(&flag);
                async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    flag.store(true, Ordering::SeqCst);
                    Ok::<_, anyhow::Error>(())
                }
            }) as HandlerRef
        })
        .collect();
    let h = started(handlers).await;

    let all_ran_before_ack = Arc::new(AtomicBool::new(false));
    {
        let flags = flags.clone();
        let out = Arc::clone(&all_ran_before_ack);
        h.transport.on_ack(move |_ack| {
            out.store(flags.iter().all(|f| f.load(Ordering::SeqCst)), Ordering::SeqCst);
        });
    }

    h.tx.send(change(4, Duration::from_secs(5))).await.unwrap();
    let acks = h.transport.wait_for_acks(1, Duration::from_secs(5)).await;
    assert_eq!(acks[0].result(), Some(1));
    assert!(all_ran_before_ack.load(Ordering::SeqCst));

    h.listener.close(soon(1_000)).await.unwrap();
}

#[tokio::test]
async fn second_change_in_flight_is_rejected_busy() {
    let h = started(vec![stuck()]).await;

    h.listener
        .dispatch(change(1, Duration::from_millis(300)))
        .await
        .unwrap();
    let err = h
        .listener
        .dispatch(change(2, Duration::from_secs(5)))
        .await
        .unwrap_err();
    assert!(matches!(err, PropagationError::Busy));

    let acks = h.transport.wait_for_acks(2, Duration::from_secs(5)).await;
    assert_eq!(h.transport.results(), vec![0, 0]);
    assert_eq!(acks.len(), 2);

    h.listener.close(soon(1_000)).await.unwrap();
}

#[tokio::test]
async fn stop_lets_inflight_change_finish_and_refuses_the_next() {
    let (release_tx, release_rx) = tokio::sync::watch::channel(false);
    let h = started(vec![HandlerFn::arc("gate", 0, move |_e: StateEvent| {
        let mut rx = release_rx.clone();
        async move {
            let _ = rx.wait_for(|open| *open).await;
            Ok::<_, anyhow::Error>(())
        }
    })])
    .await;

    h.listener
        .dispatch(change(1, Duration::from_secs(5)))
        .await
        .unwrap();
    h.listener
        .dispatch(Trigger::SystemStop { status: 1 })
        .await
        .unwrap();
    assert_eq!(h.listener.phase(), ListenerPhase::Stopped);

    release_tx.send(true).unwrap();
    let acks = h.transport.wait_for_acks(1, Duration::from_secs(5)).await;
    assert_eq!(acks[0].result(), Some(1));

    let err = h
        .listener
        .dispatch(change(2, Duration::from_secs(5)))
        .await
        .unwrap_err();
    assert!(matches!(err, PropagationError::Canceled));
    h.transport.wait_for_acks(2, Duration::from_secs(5)).await;
    assert_eq!(h.transport.results(), vec![1, 0]);

    h.listener.close(soon(1_000)).await.unwrap();
    assert!(matches!(
        h.listener.close(soon(1_000)).await,
        Err(PropagationError::Canceled)
    ));
}

#[tokio::test]
async fn close_interrupts_a_blocked_worker() {
    let h = started(vec![stuck()]).await;

    h.listener
        .dispatch(change(1, Duration::from_secs(30)))
        .await
        .unwrap();
    h.listener
        .dispatch(Trigger::SystemStop { status: 1 })
        .await
        .unwrap();

    let began = Instant::now();
    h.listener.close(soon(2_000)).await.unwrap();
    assert!(began.elapsed() < Duration::from_secs(1));

    // The registry was disabled first, so the interrupted change is never acknowledged.
    assert!(h.transport.acks().is_empty());
    assert!(h.listener.registry().is_empty());
}

#[tokio::test]
async fn far_future_deadline_keeps_the_serve_loop_alive() {
    let h = started(vec![HandlerFn::arc("noop", 0, |_e: StateEvent| async move {
        Ok::<_, anyhow::Error>(())
    })])
    .await;

    h.tx.send(Trigger::StateChange {
        state_type: 1,
        active: true,
        deadline: WireDeadline::new(u64::MAX, 0),
    })
    .await
    .unwrap();
    let acks = h.transport.wait_for_acks(1, Duration::from_secs(5)).await;
    assert_eq!(acks[0].result(), Some(1));

    h.tx.send(Trigger::SystemStop { status: 1 }).await.unwrap();
    let until = soon(5_000);
    while h.listener.phase() != ListenerPhase::Stopped && Instant::now() < until {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(h.listener.phase(), ListenerPhase::Stopped);

    h.listener.close(soon(1_000)).await.unwrap();
}

#[tokio::test]
async fn readiness_is_canceled_when_coordinator_goes_down() {
    let transport = MemoryTransport::new();
    let listener = Listener::builder(Config::default(), transport)
        .build()
        .unwrap();

    let (tx, rx) = mpsc::channel(4);
    let starting = {
        let listener = listener.clone();
        tokio::spawn(async move { listener.start(rx).await })
    };
    tx.send(Trigger::ChannelDown).await.unwrap();

    assert!(matches!(
        starting.await.unwrap(),
        Err(PropagationError::Canceled)
    ));
    assert_eq!(listener.phase(), ListenerPhase::Down);
    listener.close(soon(1_000)).await.unwrap();
}
