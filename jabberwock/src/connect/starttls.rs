//! TLS establishment: `<starttls/>` upgrade and XEP-0368 direct TLS.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use jabberwock_sasl::ChannelBinding;
use log::{debug, warn};
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{Error as RustlsError, ProtocolVersion};
use tokio_rustls::TlsConnector;

use crate::connect::AsyncReadAndWrite;
use crate::error::{Error, ProtocolError};
use crate::proto::{nonza, Packet, XmppStream};
use crate::tls::{client_config, dane_client_config, TlsaRecord};

/// Negotiates `<starttls/>` on an open stream and hands the transport
/// to the TLS stack. The caller must restart the stream afterwards;
/// pre-TLS features are attacker-controlled and must be forgotten.
pub(crate) async fn upgrade_starttls(
    mut stream: XmppStream<Box<dyn AsyncReadAndWrite>>,
    domain: &str,
    tlsa: Option<Vec<TlsaRecord>>,
) -> Result<(Box<dyn AsyncReadAndWrite>, ChannelBinding), Error> {
    stream.send(Packet::Stanza(nonza::starttls_request())).await?;
    loop {
        match stream.next().await {
            Some(Ok(Packet::Stanza(el))) if nonza::is_starttls_proceed(&el) => break,
            Some(Ok(Packet::Stanza(el))) if nonza::is_starttls_failure(&el) => {
                return Err(ProtocolError::TlsRefused.into());
            }
            Some(Ok(_)) => (),
            Some(Err(e)) => return Err(e),
            None => return Err(Error::Disconnected),
        }
    }
    tls_connect(stream.into_inner(), domain, tlsa).await
}

/// TLS handshake over an already-connected transport. Used directly for
/// XEP-0368 endpoints, via [`upgrade_starttls`] otherwise.
pub(crate) async fn tls_connect(
    stream: Box<dyn AsyncReadAndWrite>,
    domain: &str,
    tlsa: Option<Vec<TlsaRecord>>,
) -> Result<(Box<dyn AsyncReadAndWrite>, ChannelBinding), Error> {
    let server_name = ServerName::try_from(domain.to_owned())
        .map_err(|e| RustlsError::General(format!("invalid server name {}: {}", domain, e)))?;
    let config = match tlsa {
        Some(records) => {
            debug!("verifying {} against {} TLSA records", domain, records.len());
            dane_client_config(records, domain.to_owned())?
        }
        None => client_config()?,
    };
    let tls_stream = TlsConnector::from(Arc::new(config))
        .connect(server_name, stream)
        .await?;
    let binding = channel_binding(&tls_stream)?;
    Ok((Box::new(tls_stream), binding))
}

/// Derives SASL channel binding data from the session.
///
/// TLS 1.3 has no tls-unique; the exporter (RFC 9266) is the only
/// binding available there.
fn channel_binding(
    stream: &TlsStream<Box<dyn AsyncReadAndWrite>>,
) -> Result<ChannelBinding, Error> {
    let (_, connection) = stream.get_ref();
    match connection.protocol_version() {
        Some(ProtocolVersion::TLSv1_3) => {
            let data = connection
                .export_keying_material(vec![0u8; 32], b"EXPORTER-Channel-Binding", None)
                .map_err(Error::Tls)?;
            Ok(ChannelBinding::TlsExporter(data))
        }
        version => {
            warn!("no channel binding available for {:?}", version);
            Ok(ChannelBinding::None)
        }
    }
}
