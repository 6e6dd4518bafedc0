//! Pre-session negotiation: resolve, connect, encrypt, authenticate.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use jabberwock_sasl::{ChannelBinding, Credentials, SaslCondition};
use log::{debug, info, warn};

use crate::client::config::{Config, ConnectionState, FailureStage};
use crate::connect::{
    connect_endpoints, tls_connect, upgrade_starttls, AsyncReadAndWrite, Resolver,
};
use crate::error::{AuthError, Error, ProtocolError, TlsVerificationError};
use crate::ns;
use crate::proto::{nonza, Packet, XmppStream};
use crate::tls::{TlsaRecord, TlsPolicy};

pub(crate) type StateHandle = Arc<Mutex<ConnectionState>>;

pub(crate) fn set_state(state: &StateHandle, next: ConnectionState) {
    *state.lock().unwrap() = next;
}

type Transport = Box<dyn AsyncReadAndWrite>;
type Stage<T> = Result<T, (FailureStage, Error)>;

fn at<E: Into<Error>>(stage: FailureStage) -> impl FnOnce(E) -> (FailureStage, Error) {
    move |e| (stage, e.into())
}

async fn deadline<T, F>(limit: Duration, fut: F) -> Result<T, Error>
where
    F: Future<Output = Result<T, Error>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| Error::NoResponse)?
}

/// Runs the full pre-session pipeline and returns an authenticated
/// stream with post-auth features. Each phase tags its errors with the
/// [`FailureStage`] it belongs to.
pub(crate) async fn establish(
    config: &Config,
    state: &StateHandle,
) -> Stage<XmppStream<Transport>> {
    let domain = config.jid.domain().to_string();

    set_state(state, ConnectionState::TcpConnecting);
    let resolver = Resolver::from_system_conf(config.dnssec).map_err(at(FailureStage::Dns))?;
    let endpoints = resolver
        .resolve_endpoints(&config.dns_config())
        .await
        .map_err(at(FailureStage::Dns))?;
    let (tcp, endpoint) = connect_endpoints(&endpoints, config.timeouts.tcp_connect)
        .await
        .map_err(at(FailureStage::Tcp))?;

    // DANE only means something over a validated SRV path (RFC 7672);
    // when it is required and validation fell through, fail closed.
    let tlsa: Option<Vec<TlsaRecord>> = if config.dane {
        if !endpoint.dnssec_secure {
            return Err(at(FailureStage::Tls)(TlsVerificationError::TlsaUnavailable));
        }
        let records = resolver
            .lookup_tlsa(&endpoint.host, endpoint.port)
            .await
            .map_err(at(FailureStage::Tls))?;
        if records.is_empty() {
            return Err(at(FailureStage::Tls)(TlsVerificationError::TlsaUnavailable));
        }
        Some(records)
    } else {
        None
    };

    let mut transport: Transport = Box::new(tcp);
    let mut binding = ChannelBinding::None;
    let mut encrypted = false;
    if endpoint.direct_tls && config.tls != TlsPolicy::Disabled {
        set_state(state, ConnectionState::TlsUpgrading);
        // SNI and certificate names go by the XMPP domain, never the SRV
        // target.
        let (tls, b) = deadline(config.timeouts.tls, tls_connect(transport, &domain, tlsa.clone()))
            .await
            .map_err(at(FailureStage::Tls))?;
        transport = tls;
        binding = b;
        encrypted = true;
    }

    set_state(state, ConnectionState::StreamOpening);
    let mut stream = XmppStream::start(transport, domain.clone(), ns::CLIENT.to_owned())
        .await
        .map_err(at(FailureStage::Stream))?;

    if !encrypted && config.tls != TlsPolicy::Disabled {
        if stream.features.can_starttls() {
            set_state(state, ConnectionState::TlsUpgrading);
            let (tls, b) = deadline(
                config.timeouts.tls,
                upgrade_starttls(stream, &domain, tlsa),
            )
            .await
            .map_err(at(FailureStage::Tls))?;
            binding = b;
            // Anything the server claimed before encryption is
            // attacker-controlled; a fresh header gets fresh features.
            stream = XmppStream::start(tls, domain.clone(), ns::CLIENT.to_owned())
                .await
                .map_err(at(FailureStage::Stream))?;
        } else if config.tls == TlsPolicy::Required {
            return Err(at(FailureStage::Tls)(Error::from(ProtocolError::NoTls)));
        } else {
            warn!("{} offers no STARTTLS, continuing in the clear", domain);
        }
    }

    set_state(state, ConnectionState::Authenticating);
    let stream = authenticate(stream, config, binding)
        .await
        .map_err(at(FailureStage::Sasl))?;
    Ok(stream)
}

/// SASL authentication over an open stream, restarting it on success.
///
/// On `invalid-mechanism` and `mechanism-too-weak` the next-best
/// mechanism is tried; credential failures abort immediately so a
/// misconfigured account does not hammer every mechanism in turn.
pub(crate) async fn authenticate(
    mut stream: XmppStream<Transport>,
    config: &Config,
    binding: ChannelBinding,
) -> Result<XmppStream<Transport>, Error> {
    let mut creds = Credentials::default()
        .with_username(
            config
                .jid
                .node()
                .map(|node| node.to_string())
                .unwrap_or_default(),
        )
        .with_password(config.password.clone())
        .with_channel_binding(binding);
    if let Some(authzid) = &config.authzid {
        creds = creds.with_authzid(authzid.clone());
    }
    let domain = stream.domain.clone();
    let mut advertised: HashSet<String> = stream.features.mechanisms.clone();

    loop {
        let kind = config
            .sasl
            .select(&advertised, &creds)
            .ok_or(AuthError::NoMechanism)?;
        info!("authenticating with {}", kind.name());
        let mut mechanism = config.sasl.start(kind, &creds, &domain)?;
        stream
            .send_stanza(nonza::sasl_auth(kind.name(), mechanism.initial()?))
            .await?;

        'exchange: loop {
            let element = loop {
                let step = deadline(config.timeouts.sasl, async {
                    stream.next().await.unwrap_or(Err(Error::Disconnected))
                })
                .await?;
                match step {
                    Packet::Stanza(element) => break element,
                    Packet::StreamEnd => return Err(Error::Disconnected),
                    Packet::StreamStart(_) => {
                        return Err(ProtocolError::UnexpectedElement("stream:stream".into()).into())
                    }
                }
            };
            match nonza::parse_sasl(&element)? {
                Some(nonza::SaslStep::Challenge(challenge)) => {
                    let response = mechanism.respond(&challenge)?;
                    stream.send_stanza(nonza::sasl_response(&response)).await?;
                }
                Some(nonza::SaslStep::Success(data)) => {
                    mechanism.verify_success(&data)?;
                    debug!("authenticated, restarting stream");
                    return stream.restart().await;
                }
                Some(nonza::SaslStep::Failure { condition, text }) => {
                    warn!(
                        "{} failed: {}{}",
                        kind.name(),
                        condition,
                        text.map(|t| format!(" ({})", t)).unwrap_or_default()
                    );
                    match condition {
                        SaslCondition::InvalidMechanism | SaslCondition::MechanismTooWeak => {
                            advertised.remove(kind.name());
                            break 'exchange;
                        }
                        other => return Err(AuthError::Fail(other).into()),
                    }
                }
                None => {
                    return Err(
                        ProtocolError::UnexpectedElement(element.name().to_owned()).into(),
                    )
                }
            }
        }
    }
}
