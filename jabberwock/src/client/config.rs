//! Client configuration and connection lifecycle types.

use std::time::Duration;

use jabberwock_sasl::Registry;
use jid::Jid;
use minidom::Element;

use crate::connect::dns::{DnsConfig, DnssecMode};
use crate::sm::SmConfig;
use crate::tls::TlsPolicy;

/// Deadlines for each negotiation phase.
#[derive(Debug, Clone)]
pub struct Timeouts {
    /// Per endpoint, covering every address raced for it.
    pub tcp_connect: Duration,
    /// TLS handshake, STARTTLS round-trip included.
    pub tls: Duration,
    /// Each SASL round-trip.
    pub sasl: Duration,
    /// Resource binding and SM enable/resume responses.
    pub bind: Duration,
    /// Default for [`crate::StanzaCollector::next`] via the client.
    pub collector_default: Duration,
    /// How long `disconnect()` waits for the peer's stream footer.
    pub disconnect_grace: Duration,
}

impl Default for Timeouts {
    fn default() -> Timeouts {
        Timeouts {
            tcp_connect: Duration::from_secs(10),
            tls: Duration::from_secs(10),
            sasl: Duration::from_secs(30),
            bind: Duration::from_secs(30),
            collector_default: Duration::from_secs(30),
            disconnect_grace: Duration::from_secs(5),
        }
    }
}

/// Everything [`crate::Client::connect`] needs.
#[derive(Clone)]
pub struct Config {
    /// Account JID; a resourcepart here acts like `resource`
    pub jid: Jid,
    pub password: String,
    /// Requested resource; `None` lets the server assign one
    pub resource: Option<String>,
    /// Authorization identity, for acting on behalf of another account
    pub authzid: Option<String>,
    /// Where to connect; `None` resolves SRV for the JID domain
    pub dns: Option<DnsConfig>,
    pub dnssec: DnssecMode,
    pub tls: TlsPolicy,
    /// Pin the server certificate via TLSA records. Needs a DNSSEC mode
    /// other than `None` to get validated records.
    pub dane: bool,
    pub timeouts: Timeouts,
    pub sm: SmConfig,
    /// SASL mechanism registry; defaults to everything but ANONYMOUS
    pub sasl: Registry,
}

impl Config {
    pub fn new<P: Into<String>>(jid: Jid, password: P) -> Config {
        Config {
            jid,
            password: password.into(),
            resource: None,
            authzid: None,
            dns: None,
            dnssec: DnssecMode::None,
            tls: TlsPolicy::Required,
            dane: false,
            timeouts: Timeouts::default(),
            sm: SmConfig::default(),
            sasl: Registry::new(),
        }
    }

    pub(crate) fn dns_config(&self) -> DnsConfig {
        self.dns
            .clone()
            .unwrap_or_else(|| DnsConfig::srv_default_client(self.jid.domain().as_str()))
    }

    pub(crate) fn requested_resource(&self) -> Option<String> {
        self.resource
            .clone()
            .or_else(|| self.jid.resource().map(|r| r.to_string()))
    }
}

/// Phase that brought a connection down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    Dns,
    Tcp,
    Tls,
    Sasl,
    Binding,
    Resumption,
    Stream,
}

/// Where the connection currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    TcpConnecting,
    StreamOpening,
    TlsUpgrading,
    Authenticating,
    ResourceBinding,
    Connected,
    /// Connected again through XEP-0198 resumption.
    Resumed,
    Disconnecting,
    Failed(FailureStage),
}

/// Outcome of [`crate::Client::resume`].
#[derive(Debug)]
pub enum Reconnect {
    /// The session came back; unacked stanzas were replayed in order.
    Resumed,
    /// Resumption failed or was unavailable; a fresh session was bound.
    /// Stanzas the old session never got confirmed are handed back
    /// rather than silently dropped.
    Fresh {
        /// Possibly-lost outbound stanzas, oldest first.
        lost: Vec<Element>,
    },
}
