//! Recurring timed events on a shared min-heap.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Returned by an event handler to decide its own fate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventAction {
    /// Fire again after another period.
    Keep,
    /// Uninstall the event.
    Remove,
}

type Handler = Box<dyn FnMut() -> EventAction + Send>;

/// A heap of recurring events keyed by their next-fire deadline, driven
/// by a single background task.
///
/// The driver task starts lazily on the first [`Timer::schedule`] call,
/// which therefore must happen inside a tokio runtime.
#[derive(Clone)]
pub struct Timer {
    inner: Arc<TimerInner>,
}

struct TimerInner {
    state: Mutex<TimerState>,
    notify: Notify,
    shutdown: AtomicBool,
    driver_started: AtomicBool,
}

struct TimerState {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    entries: HashMap<u64, Entry>,
    next_id: u64,
}

struct Entry {
    period: Duration,
    handler: Handler,
}

impl Timer {
    pub fn new() -> Timer {
        Timer {
            inner: Arc::new(TimerInner {
                state: Mutex::new(TimerState {
                    heap: BinaryHeap::new(),
                    entries: HashMap::new(),
                    next_id: 1,
                }),
                notify: Notify::new(),
                shutdown: AtomicBool::new(false),
                driver_started: AtomicBool::new(false),
            }),
        }
    }

    /// Install a recurring event. The handler runs on the driver task;
    /// returning [`EventAction::Remove`] uninstalls it.
    pub fn schedule<F>(&self, period: Duration, handler: F) -> u64
    where
        F: FnMut() -> EventAction + Send + 'static,
    {
        let id = {
            let mut state = self.inner.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.entries.insert(
                id,
                Entry {
                    period,
                    handler: Box::new(handler),
                },
            );
            state.heap.push(Reverse((Instant::now() + period, id)));
            id
        };
        self.ensure_driver();
        self.inner.notify.notify_one();
        id
    }

    /// Uninstall an event. Returns `false` when the id is unknown (or
    /// the event already removed itself).
    pub fn remove(&self, id: u64) -> bool {
        self.inner.state.lock().entries.remove(&id).is_some()
    }

    /// Number of installed events.
    pub fn installed(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    /// Stop the driver; installed events never fire again.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    fn ensure_driver(&self) {
        if self.inner.driver_started.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            drive(inner).await;
        });
    }
}

impl Default for Timer {
    fn default() -> Self {
        Timer::new()
    }
}

async fn drive(inner: Arc<TimerInner>) {
    loop {
        if inner.shutdown.load(Ordering::Acquire) {
            return;
        }
        let next = inner.state.lock().heap.peek().map(|Reverse((at, _))| *at);
        match next {
            None => {
                let notified = inner.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if inner.shutdown.load(Ordering::Acquire) {
                    return;
                }
                if !inner.state.lock().heap.is_empty() {
                    continue;
                }
                notified.await;
            }
            Some(at) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(at) => fire_due(&inner),
                    _ = inner.notify.notified() => {}
                }
            }
        }
    }
}

fn fire_due(inner: &Arc<TimerInner>) {
    let now = Instant::now();
    loop {
        // pull one due entry out, run its handler unlocked
        let (id, mut entry) = {
            let mut state = inner.state.lock();
            match state.heap.peek() {
                Some(Reverse((at, _))) if *at <= now => {
                    let Reverse((_, id)) = state.heap.pop().unwrap();
                    match state.entries.remove(&id) {
                        Some(entry) => (id, entry),
                        // removed while scheduled: stale heap slot
                        None => continue,
                    }
                }
                _ => return,
            }
        };

        let action = (entry.handler)();
        if action == EventAction::Keep {
            let mut state = inner.state.lock();
            let at = Instant::now() + entry.period;
            state.entries.insert(id, entry);
            state.heap.push(Reverse((at, id)));
        }
    }
}
