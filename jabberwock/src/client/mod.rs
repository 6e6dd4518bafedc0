//! The connection engine: lifecycle, reader task, send path.
//!
//! `Client::connect` runs resolve → TCP → TLS → SASL inline, then
//! spawns a reader task and finishes the session (bind, stream
//! management) through packet collectors, the same mechanism users get
//! for their own request/response pairs. One writer handle is shared
//! between the user-facing send path and the reader's ack replies.

mod config;
mod login;

pub use config::{Config, ConnectionState, FailureStage, Reconnect, Timeouts};

pub use crate::tls::TlsPolicy;

use std::str::FromStr;
use std::sync::{Arc, Mutex as StdMutex};

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use jabberwock_sasl::ChannelBinding;
use jid::{BareJid, Jid};
use log::{debug, info, warn};
use minidom::Element;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::collector::{CollectorRegistry, StanzaCollector};
use crate::connect::AsyncReadAndWrite;
use crate::dispatch::{Dispatcher, ListenerId, ListenerMode, StanzaFilter};
use crate::error::{Error, ProtocolError};
use crate::event::Event;
use crate::ns;
use crate::proto::{add_stanza_id, make_id, nonza, Packet, XmppStream};
use crate::sm::SmState;

use login::{set_state, StateHandle};

type Transport = Box<dyn AsyncReadAndWrite>;
type Writer = Arc<Mutex<SplitSink<XmppStream<Transport>, Packet>>>;

/// State both halves of the connection see.
struct Shared {
    state: StateHandle,
    sm: StdMutex<SmState>,
    collectors: Arc<CollectorRegistry>,
    dispatcher: Dispatcher,
    events: mpsc::UnboundedSender<Event>,
}

/// An XMPP client session.
pub struct Client {
    config: Config,
    shared: Arc<Shared>,
    writer: Writer,
    events: mpsc::UnboundedReceiver<Event>,
    reader: JoinHandle<()>,
    bound_jid: Jid,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("bound_jid", &self.bound_jid)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Connects, authenticates and binds a fresh session.
    pub async fn connect(config: Config) -> Result<Client, Error> {
        let state: StateHandle = Arc::new(StdMutex::new(ConnectionState::Disconnected));
        let stream = match login::establish(&config, &state).await {
            Ok(stream) => stream,
            Err((stage, e)) => {
                set_state(&state, ConnectionState::Failed(stage));
                return Err(e);
            }
        };
        Client::session(config, state, stream).await
    }

    /// Builds a session over a caller-provided transport, skipping
    /// resolution and TLS. The stream header exchange and SASL run as
    /// usual. Meant for in-memory transports in tests and for tunnels
    /// that already provide their own encryption.
    pub async fn connect_with_stream<S>(config: Config, stream: S) -> Result<Client, Error>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let state: StateHandle = Arc::new(StdMutex::new(ConnectionState::StreamOpening));
        let domain = config.jid.domain().to_string();
        let transport: Transport = Box::new(stream);
        let result = async {
            let stream = XmppStream::start(transport, domain, ns::CLIENT.to_owned())
                .await
                .map_err(|e| (FailureStage::Stream, e))?;
            set_state(&state, ConnectionState::Authenticating);
            login::authenticate(stream, &config, ChannelBinding::None)
                .await
                .map_err(|e| (FailureStage::Sasl, e))
        }
        .await;
        match result {
            Ok(stream) => Client::session(config, state, stream).await,
            Err((stage, e)) => {
                set_state(&state, ConnectionState::Failed(stage));
                Err(e)
            }
        }
    }

    /// Post-auth session setup: spawn the reader, bind, enable SM.
    async fn session(
        config: Config,
        state: StateHandle,
        stream: XmppStream<Transport>,
    ) -> Result<Client, Error> {
        let sm_offered = stream.features.sm;
        let fallback_key = server_key(&config.jid)?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            state,
            sm: StdMutex::new(SmState::new()),
            collectors: CollectorRegistry::new(),
            dispatcher: Dispatcher::new(fallback_key),
            events: events_tx,
        });
        let (sink, source) = stream.split();
        let writer: Writer = Arc::new(Mutex::new(sink));
        let reader = tokio::spawn(reader_loop(
            source,
            Arc::clone(&shared),
            Arc::clone(&writer),
        ));

        let bound_jid = match bind(&config, &shared, &writer).await {
            Ok(jid) => jid,
            Err(e) => {
                set_state(&shared.state, ConnectionState::Failed(FailureStage::Binding));
                reader.abort();
                return Err(e);
            }
        };
        info!("bound as {}", bound_jid);
        enable_sm(&config, &shared, &writer, sm_offered).await?;

        set_state(&shared.state, ConnectionState::Connected);
        let _ = shared.events.send(Event::Online {
            bound_jid: bound_jid.clone(),
            resumed: false,
        });
        Ok(Client {
            config,
            shared,
            writer,
            events: events_rx,
            reader,
            bound_jid,
        })
    }

    /// Reconnects after transport loss, resuming the previous session
    /// when the ledger still carries a live resumption token and the
    /// server plays along; falls back to a fresh bind otherwise. Either
    /// way no buffered stanza is silently dropped: resumption replays
    /// them, a fresh session hands them back in [`Reconnect::Fresh`].
    pub async fn resume(&mut self) -> Result<Reconnect, Error> {
        if matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Resumed
        ) {
            return Err(Error::Protocol(ProtocolError::UnexpectedElement(
                "resume on a live connection".to_owned(),
            )));
        }
        let stream = match login::establish(&self.config, &self.shared.state).await {
            Ok(stream) => stream,
            Err((stage, e)) => {
                set_state(&self.shared.state, ConnectionState::Failed(stage));
                return Err(e);
            }
        };
        let sm_offered = stream.features.sm;
        let (sink, source) = stream.split();
        *self.writer.lock().await = sink;
        self.reader = tokio::spawn(reader_loop(
            source,
            Arc::clone(&self.shared),
            Arc::clone(&self.writer),
        ));

        let token = {
            let sm = self.shared.sm.lock().unwrap();
            if sm_offered && sm.can_resume() {
                sm.resume_info().map(|info| (info.id.clone(), sm.inbound_h()))
            } else {
                None
            }
        };
        if let Some((previd, inbound_h)) = token {
            match self.try_resume(&previd, inbound_h).await {
                Ok(Some(replay)) => {
                    // Replayed stanzas are fresh sends as far as the
                    // counters go; the server counts them again.
                    for stanza in replay {
                        self.shared.sm.lock().unwrap().on_sent(stanza.clone());
                        send_raw(&self.writer, stanza).await?;
                    }
                    set_state(&self.shared.state, ConnectionState::Resumed);
                    let _ = self.shared.events.send(Event::Online {
                        bound_jid: self.bound_jid.clone(),
                        resumed: true,
                    });
                    return Ok(Reconnect::Resumed);
                }
                Ok(None) => debug!("server declined resumption, binding fresh"),
                Err(e) => {
                    set_state(
                        &self.shared.state,
                        ConnectionState::Failed(FailureStage::Resumption),
                    );
                    return Err(e);
                }
            }
        }

        // Fresh session; whatever the old one never confirmed is
        // surfaced to the caller.
        let lost = {
            let mut sm = self.shared.sm.lock().unwrap();
            let lost = sm.take_lost();
            *sm = SmState::new();
            lost
        };
        let bound_jid = bind(&self.config, &self.shared, &self.writer).await?;
        enable_sm(&self.config, &self.shared, &self.writer, sm_offered).await?;
        self.bound_jid = bound_jid.clone();
        set_state(&self.shared.state, ConnectionState::Connected);
        let _ = self.shared.events.send(Event::Online {
            bound_jid,
            resumed: false,
        });
        Ok(Reconnect::Fresh { lost })
    }

    /// `Ok(Some(replay))` resumed, `Ok(None)` declined by the server.
    async fn try_resume(
        &self,
        previd: &str,
        inbound_h: u32,
    ) -> Result<Option<Vec<Element>>, Error> {
        let filter = StanzaFilter::element("resumed", ns::SM)
            .or(StanzaFilter::element("failed", ns::SM));
        let mut collector = self.shared.collectors.register(filter);
        send_raw(&self.writer, nonza::sm_resume(previd, inbound_h)).await?;
        let response = collector.next(self.config.timeouts.bind).await;
        collector.cancel();
        match nonza::parse_sm(&response?) {
            Some(nonza::SmNonza::Resumed { previd: got, h }) => {
                if got != previd {
                    return Err(ProtocolError::UnexpectedElement(format!(
                        "resumed with previd {}",
                        got
                    ))
                    .into());
                }
                let replay = self.shared.sm.lock().unwrap().on_resumed(h)?;
                info!("session resumed, replaying {} stanzas", replay.len());
                Ok(Some(replay))
            }
            Some(nonza::SmNonza::Failed { h }) => {
                if let Some(h) = h {
                    // Best effort: trim what the old session did confirm.
                    let _ = self.shared.sm.lock().unwrap().remote_acked(h);
                }
                Ok(None)
            }
            _ => Err(ProtocolError::UnexpectedElement("resume response".to_owned()).into()),
        }
    }

    /// Sends one stanza, giving it an id when it lacks one. Counted and
    /// buffered by the SM ledger when the session has SM enabled.
    pub async fn send_stanza(&self, stanza: Element) -> Result<(), Error> {
        if !matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Resumed
        ) {
            return Err(Error::NotConnected);
        }
        let stanza = add_stanza_id(stanza, ns::CLIENT);
        let ack_due = {
            let mut sm = self.shared.sm.lock().unwrap();
            if sm.is_enabled() && is_stanza(&stanza) {
                sm.on_sent(stanza.clone());
                sm.ack_due(self.config.sm.ack_request_interval)
            } else {
                false
            }
        };
        send_raw(&self.writer, stanza).await?;
        if ack_due {
            send_raw(&self.writer, nonza::sm_request()).await?;
        }
        Ok(())
    }

    /// Closes the stream: sends the footer, waits for the peer's (or
    /// the grace timeout), cancels collectors. The SM ledger survives
    /// so [`Client::resume`] can pick the session back up.
    pub async fn disconnect(&mut self) -> Result<(), Error> {
        set_state(&self.shared.state, ConnectionState::Disconnecting);
        {
            let mut writer = self.writer.lock().await;
            writer.send(Packet::StreamEnd).await?;
        }
        if tokio::time::timeout(self.config.timeouts.disconnect_grace, &mut self.reader)
            .await
            .is_err()
        {
            debug!("peer did not close the stream in time");
            self.reader.abort();
            teardown(&self.shared, Error::Disconnected);
        }
        set_state(&self.shared.state, ConnectionState::Disconnected);
        Ok(())
    }

    /// The next lifecycle or stanza event. `None` once the client is
    /// torn down for good.
    pub async fn next_event(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock().unwrap()
    }

    /// Full JID the server bound this session to.
    pub fn bound_jid(&self) -> &Jid {
        &self.bound_jid
    }

    /// Whether XEP-0198 acking is live on this session.
    pub fn stream_management_enabled(&self) -> bool {
        self.shared.sm.lock().unwrap().is_enabled()
    }

    /// Outbound stanzas the peer has not acked yet.
    pub fn unacked_stanzas(&self) -> usize {
        self.shared.sm.lock().unwrap().unacked_len()
    }

    /// Registers a synchronous listener, run inline on the reader task
    /// in registration order. Must not block.
    pub fn add_listener_sync<F>(&self, filter: StanzaFilter, handler: F) -> ListenerId
    where
        F: FnMut(&Element) + Send + 'static,
    {
        self.shared.dispatcher.add_sync(filter, handler)
    }

    /// Registers an asynchronous listener ([`ListenerMode::Async`] or
    /// [`ListenerMode::AsyncOrdered`]).
    pub fn add_listener<F>(&self, filter: StanzaFilter, mode: ListenerMode, handler: F) -> ListenerId
    where
        F: Fn(Element) -> futures::future::BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        self.shared.dispatcher.add_async(filter, mode, handler)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.shared.dispatcher.remove(id)
    }

    /// Registers a collector. Create it *before* sending the request it
    /// correlates with, or the response can slip past.
    pub fn create_collector(&self, filter: StanzaFilter) -> StanzaCollector {
        self.shared.collectors.register(filter)
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.config.timeouts
    }
}

fn server_key(jid: &Jid) -> Result<BareJid, Error> {
    Ok(BareJid::from_str(jid.domain().as_str())?)
}

fn is_stanza(element: &Element) -> bool {
    element.is("message", ns::CLIENT)
        || element.is("presence", ns::CLIENT)
        || element.is("iq", ns::CLIENT)
}

async fn send_raw(writer: &Writer, element: Element) -> Result<(), Error> {
    writer.lock().await.send(Packet::Stanza(element)).await
}

/// Resource binding through a collector registered before the request
/// goes out.
async fn bind(config: &Config, shared: &Arc<Shared>, writer: &Writer) -> Result<Jid, Error> {
    set_state(&shared.state, ConnectionState::ResourceBinding);
    let id = make_id();
    let filter = StanzaFilter::stanza_name("iq").and(StanzaFilter::id(&id));
    let mut collector = shared.collectors.register(filter);
    send_raw(writer, nonza::bind_request(&id, config.requested_resource().as_deref())).await?;
    let response = collector.next(config.timeouts.bind).await;
    collector.cancel();
    nonza::parse_bind_response(&response?)
}

/// Negotiates `<enable/>` when the server offers SM. Refusal is logged,
/// not fatal; the session just runs unacked.
async fn enable_sm(
    config: &Config,
    shared: &Arc<Shared>,
    writer: &Writer,
    offered: bool,
) -> Result<(), Error> {
    if !offered {
        debug!("server does not offer stream management");
        return Ok(());
    }
    let filter = StanzaFilter::element("enabled", ns::SM)
        .or(StanzaFilter::element("failed", ns::SM));
    let mut collector = shared.collectors.register(filter);
    send_raw(writer, nonza::sm_enable(config.sm.request_resumption)).await?;
    let response = collector.next(config.timeouts.bind).await;
    collector.cancel();
    match nonza::parse_sm(&response?) {
        Some(nonza::SmNonza::Enabled { id, resume, max }) => {
            shared.sm.lock().unwrap().on_enabled(id, resume, max);
            debug!("stream management enabled (resume: {})", resume);
        }
        _ => warn!("server refused stream management"),
    }
    Ok(())
}

async fn reader_loop(
    mut source: SplitStream<XmppStream<Transport>>,
    shared: Arc<Shared>,
    writer: Writer,
) {
    let reason = loop {
        match source.next().await {
            Some(Ok(Packet::Stanza(element))) => {
                if let Err(e) = handle_element(&element, &shared, &writer).await {
                    break e;
                }
            }
            Some(Ok(Packet::StreamEnd)) => break Error::Disconnected,
            Some(Ok(Packet::StreamStart(_))) => {
                break ProtocolError::UnexpectedElement("stream:stream".to_owned()).into()
            }
            Some(Err(e)) => break e,
            None => break Error::Disconnected,
        }
    };
    teardown(&shared, reason);
}

fn teardown(shared: &Shared, reason: Error) {
    set_state(&shared.state, ConnectionState::Disconnected);
    shared.sm.lock().unwrap().on_disconnect();
    shared.collectors.close_all();
    let _ = shared.events.send(Event::Disconnected(reason));
}

/// Routes one inbound element: SM bookkeeping first, then collectors,
/// listeners, and the event stream. Collectors see nonzas too; that is
/// how bind/enable/resume wait for their answers.
async fn handle_element(
    element: &Element,
    shared: &Arc<Shared>,
    writer: &Writer,
) -> Result<(), Error> {
    if element.is("error", ns::STREAM) {
        warn!("stream error from server: {:?}", element);
        return Err(Error::Disconnected);
    }
    if element.has_ns(ns::SM) {
        match nonza::parse_sm(element) {
            Some(nonza::SmNonza::R) => {
                let h = shared.sm.lock().unwrap().inbound_h();
                send_raw(writer, nonza::sm_ack(h)).await?;
            }
            // Counter desync is unrecoverable; the ledger cannot know
            // what the peer has.
            Some(nonza::SmNonza::Ack(h)) => shared.sm.lock().unwrap().remote_acked(h)?,
            _ => {}
        }
        shared.collectors.offer(element);
        return Ok(());
    }
    if is_stanza(element) {
        shared.sm.lock().unwrap().inbound_incr();
    }
    shared.collectors.offer(element);
    shared.dispatcher.dispatch(element);
    if is_stanza(element) {
        let _ = shared.events.send(Event::Stanza(element.clone()));
    }
    Ok(())
}
