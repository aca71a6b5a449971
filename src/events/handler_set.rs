//! # Priority-ordered handler walk.
//!
//! [`HandlerSet`] keeps registered handlers sorted by ascending priority and
//! runs them one after another for each event.
//!
//! ## Diagram
//! ```text
//! walk(&StateEvent)
//!     ├──► h(prio -5).on_event()
//!     ├──► h(prio  0).on_event()   (registration order within a priority)
//!     ├──► h(prio 10).on_event()
//!     └──► sentinel  .on_event()   (always last: i32::MAX)
//! ```
//!
//! ## Panic handling
//! Each handler future is wrapped in `catch_unwind`; a panic is logged and the
//! walk continues with the next handler. `AssertUnwindSafe` is used, so a
//! handler panicking while holding its own lock may leave that state poisoned.

use std::panic::AssertUnwindSafe;

use futures::FutureExt;

use super::{HandlerRef, StateEvent};

/// Priority reserved for the completion sentinel.
pub(crate) const SENTINEL_PRIORITY: i32 = i32::MAX;

/// Identifier returned by [`LocalBus::register`](crate::LocalBus::register).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandlerId(pub(crate) u64);

#[derive(Clone)]
struct Entry {
    id: HandlerId,
    priority: i32,
    handler: HandlerRef,
}

/// Ordered collection of handlers.
#[derive(Default)]
pub(crate) struct HandlerSet {
    entries: Vec<Entry>,
    next_id: u64,
}

impl HandlerSet {
    /// Inserts `handler` after every entry with a priority `<=` its own.
    pub fn insert(&mut self, handler: HandlerRef) -> HandlerId {
        let priority = handler.priority().min(SENTINEL_PRIORITY - 1);
        self.insert_at(handler, priority)
    }

    /// Installs the completion sentinel in the last slot.
    pub fn insert_sentinel(&mut self, handler: HandlerRef) -> HandlerId {
        self.insert_at(handler, SENTINEL_PRIORITY)
    }

    fn insert_at(&mut self, handler: HandlerRef, priority: i32) -> HandlerId {
        self.next_id += 1;
        let id = HandlerId(self.next_id);
        let pos = self.entries.partition_point(|e| e.priority <= priority);
        self.entries.insert(
            pos,
            Entry {
                id,
                priority,
                handler,
            },
        );
        id
    }

    /// Removes a handler; the sentinel cannot be removed this way.
    pub fn remove(&mut self, id: HandlerId) -> bool {
        match self.entries.iter().position(|e| e.id == id) {
            Some(pos) if self.entries[pos].priority != SENTINEL_PRIORITY => {
                self.entries.remove(pos);
                true
            }
            _ => false,
        }
    }

    /// Drops every handler, sentinel included.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of application handlers (sentinel excluded).
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.priority != SENTINEL_PRIORITY)
            .count()
    }

    /// Copies the current walk order so it can run without holding a lock.
    pub fn snapshot(&self) -> Vec<HandlerRef> {
        self.entries.iter().map(|e| e.handler.clone()).collect()
    }
}

/// Runs `handlers` in order for `event`, isolating errors and panics.
pub(crate) async fn walk(handlers: &[HandlerRef], event: &StateEvent) {
    for h in handlers {
        match AssertUnwindSafe(h.on_event(event)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(
                    handler = h.name(),
                    seq = event.seq,
                    state_type = event.state_type,
                    error = %e,
                    "state handler failed"
                );
            }
            Err(panic_err) => {
                let any = &*panic_err;
                let info = if let Some(msg) = any.downcast_ref::<&'static str>() {
                    (*msg).to_string()
                } else if let Some(msg) = any.downcast_ref::<String>() {
                    msg.clone()
                } else {
                    "unknown panic".to_string()
                };
                tracing::error!(
                    handler = h.name(),
                    seq = event.seq,
                    state_type = event.state_type,
                    panic = %info,
                    "state handler panicked"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use tokio::time::Instant;

    use super::*;
    use crate::events::HandlerFn;

    fn recorder(
        name: &'static str,
        priority: i32,
        log: &Arc<Mutex<Vec<&'static str>>>,
    ) -> HandlerRef {
        let log = Arc::clone(log);
        HandlerFn::arc(name, priority, move |_ev: StateEvent| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push(name);
                Ok::<_, anyhow::Error>(())
            }
        })
    }

    #[tokio::test]
    async fn walk_is_ascending_and_stable() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut set = HandlerSet::default();
        set.insert_sentinel(recorder("sentinel", 0, &log));
        set.insert(recorder("b0", 0, &log));
        set.insert(recorder("late", 10, &log));
        set.insert(recorder("early", -5, &log));
        set.insert(recorder("b1", 0, &log));
        set.insert(recorder("max", i32::MAX, &log));

        walk(&set.snapshot(), &StateEvent::new(1, true, Instant::now())).await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["early", "b0", "b1", "late", "max", "sentinel"]
        );
        assert_eq!(set.len(), 5);
    }

    #[tokio::test]
    #[allow(unreachable_code)]
    async fn failures_do_not_abort_the_walk() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut set = HandlerSet::default();
        set.insert(HandlerFn::arc("fails", 0, |_ev: StateEvent| async {
            Err::<(), _>(anyhow::anyhow!("no route table"))
        }));
        set.insert(HandlerFn::arc("panics", 1, |_ev: StateEvent| async {
            panic!("handler bug");
            Ok::<_, anyhow::Error>(())
        }));
        set.insert(recorder("after", 2, &log));

        walk(&set.snapshot(), &StateEvent::new(2, false, Instant::now())).await;

        assert_eq!(*log.lock().unwrap(), vec!["after"]);
    }

    #[test]
    fn sentinel_cannot_be_removed() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut set = HandlerSet::default();
        let sentinel = set.insert_sentinel(recorder("sentinel", 0, &log));
        let app = set.insert(recorder("app", 0, &log));

        assert!(!set.remove(sentinel));
        assert!(set.remove(app));
        assert!(!set.remove(app));
        assert_eq!(set.len(), 0);
        assert_eq!(set.snapshot().len(), 1);
    }
}
