//! Stanza listener registry.
//!
//! Listeners pair a [`StanzaFilter`] with a handler and one of three
//! execution modes: synchronous (inline on the reader task, in
//! registration order), asynchronous (spawned, unordered), or
//! asynchronous-but-ordered (spawned, serialized per sender bare JID).

mod ordered;

pub use ordered::AsyncButOrdered;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use jid::{BareJid, Jid};
use minidom::Element;

/// Predicate over inbound stanzas.
#[derive(Clone)]
pub struct StanzaFilter {
    predicate: Arc<dyn Fn(&Element) -> bool + Send + Sync>,
}

impl fmt::Debug for StanzaFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StanzaFilter(..)")
    }
}

impl StanzaFilter {
    pub fn new<F>(predicate: F) -> StanzaFilter
    where
        F: Fn(&Element) -> bool + Send + Sync + 'static,
    {
        StanzaFilter {
            predicate: Arc::new(predicate),
        }
    }

    /// Matches every stanza.
    pub fn any() -> StanzaFilter {
        StanzaFilter::new(|_| true)
    }

    /// Matches on the local element name, e.g. `"message"` or `"iq"`.
    pub fn stanza_name(name: &str) -> StanzaFilter {
        let name = name.to_owned();
        StanzaFilter::new(move |el| el.name() == name)
    }

    /// Matches on local name and namespace.
    pub fn element(name: &str, ns: &str) -> StanzaFilter {
        let name = name.to_owned();
        let ns = ns.to_owned();
        StanzaFilter::new(move |el| el.is(name.as_str(), ns.as_str()))
    }

    /// Matches the `id` attribute exactly.
    pub fn id(id: &str) -> StanzaFilter {
        let id = id.to_owned();
        StanzaFilter::new(move |el| el.attr("id") == Some(id.as_str()))
    }

    /// Matches the `type` attribute exactly.
    pub fn typ(typ: &str) -> StanzaFilter {
        let typ = typ.to_owned();
        StanzaFilter::new(move |el| el.attr("type") == Some(typ.as_str()))
    }

    /// Matches stanzas whose `from` attribute parses to the given JID.
    pub fn from(jid: Jid) -> StanzaFilter {
        StanzaFilter::new(move |el| {
            el.attr("from")
                .and_then(|f| f.parse::<Jid>().ok())
                .map(|f| f == jid)
                .unwrap_or(false)
        })
    }

    /// Matches stanzas whose `from` attribute has the given bare JID.
    pub fn from_bare(jid: BareJid) -> StanzaFilter {
        StanzaFilter::new(move |el| {
            el.attr("from")
                .and_then(|f| f.parse::<Jid>().ok())
                .map(|f| f.to_bare() == jid)
                .unwrap_or(false)
        })
    }

    pub fn and(self, other: StanzaFilter) -> StanzaFilter {
        StanzaFilter::new(move |el| (self.predicate)(el) && (other.predicate)(el))
    }

    pub fn or(self, other: StanzaFilter) -> StanzaFilter {
        StanzaFilter::new(move |el| (self.predicate)(el) || (other.predicate)(el))
    }

    pub fn not(self) -> StanzaFilter {
        StanzaFilter::new(move |el| !(self.predicate)(el))
    }

    pub fn matches(&self, stanza: &Element) -> bool {
        (self.predicate)(stanza)
    }
}

/// Handle returned by listener registration, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// How a listener's handler is executed relative to the reader task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerMode {
    /// Inline on the reader task, in registration order. Must not block.
    Sync,
    /// Spawned onto the runtime; no ordering across invocations.
    Async,
    /// Spawned, but serialized per sender bare JID.
    AsyncOrdered,
}

type SyncHandler = Box<dyn FnMut(&Element) + Send>;
type AsyncHandler = Arc<dyn Fn(Element) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Clone)]
enum HandlerKind {
    Sync(Arc<Mutex<SyncHandler>>),
    Async(AsyncHandler),
    Ordered(AsyncHandler),
}

#[derive(Clone)]
struct ListenerEntry {
    id: ListenerId,
    filter: StanzaFilter,
    handler: HandlerKind,
}

/// The listener registry, shared between the reader task and user code.
pub struct Dispatcher {
    entries: Mutex<Vec<ListenerEntry>>,
    ordered: AsyncButOrdered<BareJid>,
    next_id: AtomicU64,
    /// Key for ordered delivery of stanzas without a usable `from`,
    /// i.e. stanzas from the server itself.
    fallback_key: BareJid,
}

impl Dispatcher {
    pub fn new(fallback_key: BareJid) -> Dispatcher {
        Dispatcher {
            entries: Mutex::new(Vec::new()),
            ordered: AsyncButOrdered::new(),
            next_id: AtomicU64::new(0),
            fallback_key,
        }
    }

    fn insert(&self, filter: StanzaFilter, handler: HandlerKind) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().unwrap().push(ListenerEntry {
            id,
            filter,
            handler,
        });
        id
    }

    /// Registers a synchronous listener, run inline on the reader task.
    pub fn add_sync<F>(&self, filter: StanzaFilter, handler: F) -> ListenerId
    where
        F: FnMut(&Element) + Send + 'static,
    {
        self.insert(filter, HandlerKind::Sync(Arc::new(Mutex::new(Box::new(handler)))))
    }

    /// Registers an asynchronous listener.
    pub fn add_async<F>(&self, filter: StanzaFilter, mode: ListenerMode, handler: F) -> ListenerId
    where
        F: Fn(Element) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        let handler: AsyncHandler = Arc::new(handler);
        match mode {
            ListenerMode::Sync => panic!("synchronous listeners take an FnMut, use add_sync"),
            ListenerMode::Async => self.insert(filter, HandlerKind::Async(handler)),
            ListenerMode::AsyncOrdered => self.insert(filter, HandlerKind::Ordered(handler)),
        }
    }

    /// Removes a listener. Returns false if the id was already gone.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    /// Delivers a stanza to every matching listener.
    ///
    /// The entry list is cloned out of the lock before any handler runs,
    /// so handlers may register or remove listeners without deadlocking;
    /// such changes take effect from the next stanza.
    pub fn dispatch(&self, stanza: &Element) {
        let matching: Vec<ListenerEntry> = {
            let entries = self.entries.lock().unwrap();
            entries
                .iter()
                .filter(|entry| entry.filter.matches(stanza))
                .cloned()
                .collect()
        };
        for entry in matching {
            match entry.handler {
                HandlerKind::Sync(handler) => {
                    (handler.lock().unwrap())(stanza);
                }
                HandlerKind::Async(handler) => {
                    tokio::spawn(handler(stanza.clone()));
                }
                HandlerKind::Ordered(handler) => {
                    let key = stanza
                        .attr("from")
                        .and_then(|f| f.parse::<Jid>().ok())
                        .map(|f| f.to_bare())
                        .unwrap_or_else(|| self.fallback_key.clone());
                    self.ordered.enqueue(key, handler(stanza.clone()));
                }
            }
        }
    }
}
