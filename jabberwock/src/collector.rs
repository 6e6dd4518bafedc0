//! One-off stanza collection.
//!
//! A [`StanzaCollector`] buffers inbound elements matching a filter until
//! the caller consumes them, typically to await the single response to a
//! request. Collectors see the raw inbound element flow, including
//! negotiation elements, so the engine itself uses them to wait for bind
//! results and stream management responses.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::warn;
use minidom::Element;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::dispatch::StanzaFilter;
use crate::error::Error;

/// Elements buffered per collector before the oldest is dropped.
const DEFAULT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CollectorId(u64);

struct Shared {
    queue: Mutex<VecDeque<Element>>,
    notify: Notify,
    closed: AtomicBool,
    capacity: usize,
}

/// Receiving end of a registered collector.
///
/// Dropping it without calling [`StanzaCollector::cancel`] leaves the
/// registration in place until the connection tears down; prefer
/// cancelling explicitly when giving up early.
pub struct StanzaCollector {
    id: CollectorId,
    shared: Arc<Shared>,
    registry: Arc<CollectorRegistry>,
}

impl StanzaCollector {
    /// Waits for the next buffered element, up to `timeout`.
    ///
    /// Buffered elements are drained before a closed connection is
    /// reported, so responses that arrived just before teardown are not
    /// lost.
    pub async fn next(&mut self, timeout: Duration) -> Result<Element, Error> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register with the Notify before checking the queue;
            // notify_waiters only wakes already-registered waiters.
            let mut notified = std::pin::pin!(self.shared.notify.notified());
            notified.as_mut().enable();
            if let Some(el) = self.shared.queue.lock().unwrap().pop_front() {
                return Ok(el);
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return Err(Error::NotConnected);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(Error::NoResponse);
            }
        }
    }

    /// Pops a buffered element without waiting.
    pub fn try_next(&mut self) -> Option<Element> {
        self.shared.queue.lock().unwrap().pop_front()
    }

    /// Unregisters the collector and drops anything still buffered.
    pub fn cancel(self) {
        self.registry.unregister(self.id);
    }
}

struct Registration {
    id: CollectorId,
    filter: StanzaFilter,
    shared: Arc<Shared>,
}

/// All live collectors for one connection.
pub(crate) struct CollectorRegistry {
    entries: Mutex<Vec<Registration>>,
    next_id: AtomicU64,
}

impl CollectorRegistry {
    pub(crate) fn new() -> Arc<CollectorRegistry> {
        Arc::new(CollectorRegistry {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        })
    }

    pub(crate) fn register(self: &Arc<Self>, filter: StanzaFilter) -> StanzaCollector {
        self.register_with_capacity(filter, DEFAULT_CAPACITY)
    }

    pub(crate) fn register_with_capacity(
        self: &Arc<Self>,
        filter: StanzaFilter,
        capacity: usize,
    ) -> StanzaCollector {
        let id = CollectorId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            capacity,
        });
        self.entries.lock().unwrap().push(Registration {
            id,
            filter,
            shared: Arc::clone(&shared),
        });
        StanzaCollector {
            id,
            shared,
            registry: Arc::clone(self),
        }
    }

    fn unregister(&self, id: CollectorId) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(pos) = entries.iter().position(|r| r.id == id) {
            let reg = entries.swap_remove(pos);
            // Wake a pending next() so it observes the closed flag.
            reg.shared.closed.store(true, Ordering::Release);
            reg.shared.notify.notify_waiters();
        }
    }

    /// Offers an inbound element to every matching collector.
    pub(crate) fn offer(&self, element: &Element) {
        let entries = self.entries.lock().unwrap();
        for reg in entries.iter() {
            if reg.filter.matches(element) {
                let mut queue = reg.shared.queue.lock().unwrap();
                if queue.len() >= reg.shared.capacity {
                    warn!(
                        "collector buffer full ({} elements), dropping oldest",
                        queue.len()
                    );
                    queue.pop_front();
                }
                queue.push_back(element.clone());
                drop(queue);
                reg.shared.notify.notify_waiters();
            }
        }
    }

    /// Closes every collector. Buffered elements remain consumable.
    pub(crate) fn close_all(&self) {
        let entries = self.entries.lock().unwrap();
        for reg in entries.iter() {
            reg.shared.closed.store(true, Ordering::Release);
            reg.shared.notify.notify_waiters();
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}
