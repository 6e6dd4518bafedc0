//! SRV resolution with optional DNSSEC validation.

use std::net::{IpAddr, SocketAddr};

use hickory_resolver::config::LookupIpStrategy;
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::rr::{RData, RecordType};
use hickory_resolver::TokioAsyncResolver;
use log::{debug, warn};
use rand::Rng;

use crate::error::{Error, ResolutionError};
use crate::tls::TlsaRecord;

/// How strongly DNSSEC participates in resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnssecMode {
    /// Plain lookups only.
    None,
    /// Validate when possible, fall back to plain lookups otherwise.
    /// Fallback results are never marked secure.
    Request,
    /// Validation failures abort the connection attempt.
    Require,
}

/// Where to connect.
#[derive(Clone, Debug)]
pub enum DnsConfig {
    /// Resolve `_xmpp-client._tcp` (and `_xmpps-client._tcp` for direct
    /// TLS) SRV records for the domain.
    UseSrv {
        /// Domain to resolve
        host: String,
        /// Port to use when no SRV records exist
        fallback_port: u16,
    },
    /// Skip SRV, resolve host directly
    NoSrv {
        /// Server host name
        host: String,
        /// Server port
        port: u16,
    },
    /// Literal IP:port
    Addr {
        /// IP:port
        addr: String,
    },
}

impl std::fmt::Display for DnsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UseSrv { host, .. } => write!(f, "{}", host),
            Self::NoSrv { host, port } => write!(f, "{}:{}", host, port),
            Self::Addr { addr } => write!(f, "{}", addr),
        }
    }
}

impl DnsConfig {
    /// Constructor for the default SRV resolution strategy for clients
    pub fn srv_default_client(host: &str) -> Self {
        Self::UseSrv {
            host: host.to_string(),
            fallback_port: 5222,
        }
    }

    /// Constructor for DnsConfig::NoSrv variant
    pub fn no_srv(host: &str, port: u16) -> Self {
        Self::NoSrv {
            host: host.to_string(),
            port,
        }
    }

    /// Constructor for DnsConfig::Addr variant
    pub fn addr(addr: &str) -> Self {
        Self::Addr {
            addr: addr.to_string(),
        }
    }
}

/// One candidate server, in connection order.
#[derive(Clone, Debug)]
pub struct Endpoint {
    /// SRV target (or the bare domain for fallback endpoints)
    pub host: String,
    pub port: u16,
    /// Resolved addresses, raced in parallel on connect
    pub addresses: Vec<IpAddr>,
    pub priority: u16,
    pub weight: u16,
    /// Whether every lookup that produced this endpoint validated
    pub dnssec_secure: bool,
    /// From `_xmpps-client._tcp`: TLS from the first byte, no STARTTLS
    pub direct_tls: bool,
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)?;
        if self.direct_tls {
            write!(f, " (direct TLS)")?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct SrvEntry {
    priority: u16,
    weight: u16,
    target: String,
    port: u16,
    direct_tls: bool,
}

/// Stub resolver frontend. Holds a plain resolver and, outside
/// [`DnssecMode::None`], a validating one.
pub struct Resolver {
    plain: TokioAsyncResolver,
    validating: Option<TokioAsyncResolver>,
    mode: DnssecMode,
}

impl Resolver {
    pub fn from_system_conf(mode: DnssecMode) -> Result<Resolver, Error> {
        let (config, mut options) = hickory_resolver::system_conf::read_system_conf()
            .map_err(|e| ResolutionError::Dns(e.into()))?;
        options.ip_strategy = LookupIpStrategy::Ipv4AndIpv6;
        let plain = TokioAsyncResolver::new(
            config.clone(),
            options.clone(),
            TokioConnectionProvider::default(),
        );
        let validating = match mode {
            DnssecMode::None => None,
            DnssecMode::Request | DnssecMode::Require => {
                options.validate = true;
                Some(TokioAsyncResolver::new(
                    config,
                    options,
                    TokioConnectionProvider::default(),
                ))
            }
        };
        Ok(Resolver {
            plain,
            validating,
            mode,
        })
    }

    /// SRV lookup honoring the DNSSEC mode. Returns the records and
    /// whether they validated. NoRecordsFound is an empty set, not an
    /// error.
    async fn srv(&self, name: &str, direct_tls: bool) -> Result<(Vec<SrvEntry>, bool), Error> {
        let (lookup, secure) = match (&self.validating, self.mode) {
            (Some(validating), DnssecMode::Require) => {
                let lookup = validating
                    .srv_lookup(name)
                    .await
                    .map(Some)
                    .or_else(no_records_is_empty)
                    .map_err(|e| {
                        ResolutionError::DnssecUnavailable(format!("{}: {}", name, e))
                    })?;
                (lookup, true)
            }
            (Some(validating), _) => match validating.srv_lookup(name).await {
                Ok(lookup) => (Some(lookup), true),
                Err(e) if is_no_records(&e) => (None, true),
                Err(e) => {
                    debug!("validated SRV lookup of {} failed ({}), retrying plain", name, e);
                    (
                        self.plain
                            .srv_lookup(name)
                            .await
                            .map(Some)
                            .or_else(no_records_is_empty)
                            .map_err(ResolutionError::Dns)?,
                        false,
                    )
                }
            },
            (None, _) => (
                self.plain
                    .srv_lookup(name)
                    .await
                    .map(Some)
                    .or_else(no_records_is_empty)
                    .map_err(ResolutionError::Dns)?,
                false,
            ),
        };
        let entries = lookup
            .iter()
            .flat_map(|l| l.iter())
            .map(|srv| SrvEntry {
                priority: srv.priority(),
                weight: srv.weight(),
                target: srv.target().to_ascii(),
                port: srv.port(),
                direct_tls,
            })
            .collect();
        Ok((entries, secure))
    }

    async fn lookup_addresses(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        // Address lookups go through the plain resolver; endpoint
        // authenticity rests on TLS, not on A/AAAA integrity.
        Ok(self.plain.lookup_ip(host).await?.into_iter().collect())
    }

    /// Resolves the configuration to an ordered endpoint list.
    pub async fn resolve_endpoints(&self, config: &DnsConfig) -> Result<Vec<Endpoint>, Error> {
        match config {
            DnsConfig::UseSrv {
                host,
                fallback_port,
            } => self.resolve_srv(host, *fallback_port).await,
            DnsConfig::NoSrv { host, port } => {
                let ascii = idna::domain_to_ascii(host).map_err(ResolutionError::from)?;
                if let Ok(ip) = ascii.parse::<IpAddr>() {
                    return Ok(vec![literal_endpoint(ip, *port)]);
                }
                let addresses = self
                    .lookup_addresses(&ascii)
                    .await
                    .map_err(ResolutionError::Dns)?;
                Ok(vec![Endpoint {
                    host: ascii,
                    port: *port,
                    addresses,
                    priority: 0,
                    weight: 0,
                    dnssec_secure: false,
                    direct_tls: false,
                }])
            }
            DnsConfig::Addr { addr } => {
                let addr: SocketAddr = addr.parse()?;
                Ok(vec![literal_endpoint(addr.ip(), addr.port())])
            }
        }
    }

    async fn resolve_srv(&self, host: &str, fallback_port: u16) -> Result<Vec<Endpoint>, Error> {
        let ascii = idna::domain_to_ascii(host).map_err(ResolutionError::from)?;
        if let Ok(ip) = ascii.parse::<IpAddr>() {
            return Ok(vec![literal_endpoint(ip, fallback_port)]);
        }

        let (mut entries, starttls_secure) = self
            .srv(&format!("_xmpp-client._tcp.{}.", ascii), false)
            .await?;
        let (tls_entries, direct_secure) = self
            .srv(&format!("_xmpps-client._tcp.{}.", ascii), true)
            .await?;
        entries.extend(tls_entries);

        if !entries.is_empty() && entries.iter().all(|e| e.target == ".") {
            return Err(ResolutionError::ServiceDeclined.into());
        }
        entries.retain(|e| e.target != ".");

        let secure = starttls_secure && direct_secure;
        if entries.is_empty() {
            // No SRV records at all: RFC 6120 §3.2.2 fallback to the bare
            // domain.
            debug!("no SRV records for {}, using fallback port {}", ascii, fallback_port);
            let addresses = self
                .lookup_addresses(&ascii)
                .await
                .map_err(ResolutionError::Dns)?;
            return Ok(vec![Endpoint {
                host: ascii,
                port: fallback_port,
                addresses,
                priority: 0,
                weight: 0,
                dnssec_secure: secure,
                direct_tls: false,
            }]);
        }

        let ordered = order_srv_entries(entries, &mut rand::thread_rng());
        let mut endpoints = Vec::with_capacity(ordered.len());
        for entry in ordered {
            let target = entry.target.trim_end_matches('.').to_owned();
            let addresses = match self.lookup_addresses(&entry.target).await {
                Ok(addresses) => addresses,
                Err(e) => {
                    warn!("address lookup for SRV target {} failed: {}", target, e);
                    Vec::new()
                }
            };
            endpoints.push(Endpoint {
                host: target,
                port: entry.port,
                addresses,
                priority: entry.priority,
                weight: entry.weight,
                dnssec_secure: secure,
                direct_tls: entry.direct_tls,
            });
        }
        if endpoints.is_empty() {
            return Err(ResolutionError::NoRecords.into());
        }
        Ok(endpoints)
    }

    /// Fetches validated TLSA records for `host`/`port`.
    ///
    /// Only records that survived DNSSEC validation are usable for DANE,
    /// so this always goes through the validating resolver.
    pub async fn lookup_tlsa(&self, host: &str, port: u16) -> Result<Vec<TlsaRecord>, Error> {
        let validating = self
            .validating
            .as_ref()
            .ok_or(crate::error::TlsVerificationError::TlsaUnavailable)?;
        let name = format!("_{}._tcp.{}.", port, host);
        let lookup = match validating.lookup(name.as_str(), RecordType::TLSA).await {
            Ok(lookup) => lookup,
            Err(e) if is_no_records(&e) => return Ok(Vec::new()),
            Err(e) => return Err(ResolutionError::Dns(e).into()),
        };
        let records = lookup
            .iter()
            .filter_map(|rdata| match rdata {
                RData::TLSA(tlsa) => Some(TlsaRecord {
                    usage: u8::from(tlsa.cert_usage()),
                    selector: u8::from(tlsa.selector()),
                    matching: u8::from(tlsa.matching()),
                    data: tlsa.cert_data().to_vec(),
                }),
                _ => None,
            })
            .collect();
        Ok(records)
    }
}

fn literal_endpoint(ip: IpAddr, port: u16) -> Endpoint {
    Endpoint {
        host: ip.to_string(),
        port,
        addresses: vec![ip],
        priority: 0,
        weight: 0,
        dnssec_secure: false,
        direct_tls: false,
    }
}

fn is_no_records(e: &ResolveError) -> bool {
    matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. })
}

fn no_records_is_empty(
    e: ResolveError,
) -> Result<Option<hickory_resolver::lookup::SrvLookup>, ResolveError> {
    if is_no_records(&e) {
        Ok(None)
    } else {
        Err(e)
    }
}

/// Orders SRV entries per RFC 2782: ascending priority, then a weighted
/// random selection within each priority group, zero-weight entries
/// considered first.
fn order_srv_entries<R: Rng>(mut entries: Vec<SrvEntry>, rng: &mut R) -> Vec<SrvEntry> {
    entries.sort_by_key(|e| e.priority);
    let mut ordered = Vec::with_capacity(entries.len());
    let mut rest = &mut entries[..];
    while !rest.is_empty() {
        let priority = rest[0].priority;
        let group_len = rest.iter().take_while(|e| e.priority == priority).count();
        let (group, tail) = rest.split_at_mut(group_len);
        let mut group: Vec<SrvEntry> = group.to_vec();
        // Zero weights in front so they have a chance of selection when
        // the running sum lands on zero.
        group.sort_by_key(|e| e.weight != 0);
        while !group.is_empty() {
            let total: u32 = group.iter().map(|e| u32::from(e.weight)).sum();
            let pick = rng.gen_range(0..=total);
            let mut sum = 0u32;
            let mut index = group.len() - 1;
            for (i, entry) in group.iter().enumerate() {
                sum += u32::from(entry.weight);
                if sum >= pick {
                    index = i;
                    break;
                }
            }
            ordered.push(group.remove(index));
        }
        rest = tail;
    }
    ordered
}
