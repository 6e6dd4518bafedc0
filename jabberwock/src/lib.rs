//! XMPP client connection engine for tokio.
//!
//! Covers everything between "I have a JID and a password" and "stanzas
//! flow": SRV discovery with optional DNSSEC/DANE gating, the TCP →
//! STARTTLS → SASL → bind lifecycle, XEP-0198 stream management with an
//! unacknowledged-stanza replay buffer, filtered stanza listeners with
//! per-conversation ordering, and blocking request/response collectors.
//!
//! Stanza payloads are opaque [`minidom::Element`]s; anything above the
//! stanza layer (rosters, chat semantics, extension payloads) is out of
//! scope and consumes this crate through [`Client::send_stanza`],
//! [`Client::add_listener`] and [`Client::create_collector`].

pub mod client;
pub mod collector;
pub mod connect;
pub mod dispatch;
mod error;
mod event;
pub mod ns;
pub mod proto;
pub mod sm;
pub mod tls;

pub use crate::client::{Client, Config, ConnectionState, FailureStage, Reconnect, Timeouts, TlsPolicy};
pub use crate::collector::StanzaCollector;
pub use crate::connect::dns::{DnsConfig, DnssecMode, Endpoint};
pub use crate::dispatch::{ListenerId, ListenerMode, StanzaFilter};
pub use crate::error::{
    AuthError, EndpointFailure, Error, ProtocolError, ResolutionError, TlsVerificationError,
};
pub use crate::event::Event;

// Re-exported for downstream type compatibility.
pub use jabberwock_sasl as sasl;
pub use jid;
pub use minidom;
