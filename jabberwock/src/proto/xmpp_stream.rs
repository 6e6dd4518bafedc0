//! `XmppStream` provides encoding/decoding for XMPP

use futures::{
    sink::{Send, SinkExt},
    stream::StreamExt,
    task::Poll,
    Sink, Stream,
};
use minidom::Element;
use rand::{thread_rng, Rng};
use std::pin::Pin;
use std::task::Context;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use crate::error::{Error, ProtocolError};
use crate::ns;
use crate::proto::{Packet, StreamFeatures, XmppCodec};

pub(crate) fn make_id() -> String {
    let id: u64 = thread_rng().gen();
    format!("{}", id)
}

/// Gives outbound stanzas without an `id` a random one; responses could
/// not be correlated otherwise.
pub(crate) fn add_stanza_id(mut stanza: Element, default_ns: &str) -> Element {
    if stanza.is("iq", default_ns)
        || stanza.is("message", default_ns)
        || stanza.is("presence", default_ns)
    {
        if stanza.attr("id").is_none() {
            stanza.set_attr("id", make_id());
        }
    }

    stanza
}

/// Wraps a binary stream (tokio's `AsyncRead + AsyncWrite`) to decode
/// and encode XMPP packets.
///
/// Implements `Sink + Stream`
pub struct XmppStream<S: AsyncRead + AsyncWrite + Unpin> {
    /// Codec instance
    pub stream: Framed<S, XmppCodec>,
    /// `<stream:features/>` for XMPP version 1.0
    pub features: StreamFeatures,
    /// Domain the header was addressed to; reused on restart
    pub domain: String,
    /// Root namespace
    pub ns: String,
    /// Stream `id` attribute
    pub id: String,
}

impl<S: AsyncRead + AsyncWrite + Unpin> XmppStream<S> {
    /// Sends the `<stream:stream>` header, waits for the peer's header and
    /// its `<stream:features/>`.
    pub async fn start(stream: S, domain: String, ns: String) -> Result<Self, Error> {
        let mut stream = Framed::new(stream, XmppCodec::new(ns.clone()));
        let attrs = [
            ("to".to_owned(), domain.clone()),
            ("version".to_owned(), "1.0".to_owned()),
            ("xmlns".to_owned(), ns.clone()),
            ("xmlns:stream".to_owned(), ns::STREAM.to_owned()),
        ]
        .into_iter()
        .collect();
        stream.send(Packet::StreamStart(attrs)).await?;

        let stream_attrs;
        loop {
            match stream.next().await {
                Some(Ok(Packet::StreamStart(attrs))) => {
                    stream_attrs = attrs;
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e),
                None => return Err(Error::Disconnected),
            }
        }

        stream_attrs
            .get("xmlns")
            .ok_or(ProtocolError::NoStreamNamespace)?;
        let stream_id = stream_attrs
            .get("id")
            .ok_or(ProtocolError::NoStreamId)?
            .clone();

        loop {
            match stream.next().await {
                Some(Ok(Packet::Stanza(element))) if element.is("features", ns::STREAM) => {
                    let features = StreamFeatures::parse(&element);
                    return Ok(XmppStream {
                        stream,
                        features,
                        domain,
                        ns,
                        id: stream_id,
                    });
                }
                Some(Ok(Packet::Stanza(element))) => {
                    return Err(ProtocolError::UnexpectedElement(element.name().to_owned()).into())
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e),
                None => return Err(Error::Disconnected),
            }
        }
    }

    /// Unwraps the inner stream
    pub fn into_inner(self) -> S {
        self.stream.into_inner()
    }

    /// Re-run `start()`, as required after STARTTLS and after SASL.
    ///
    /// Everything learned from the previous `<stream:features/>` is
    /// discarded with the old stream state.
    pub async fn restart(self) -> Result<Self, Error> {
        let domain = self.domain.clone();
        let ns = self.ns.clone();
        Self::start(self.stream.into_inner(), domain, ns).await
    }

    /// Convenience method
    pub fn send_stanza<E: Into<Element>>(&mut self, e: E) -> Send<'_, Self, Packet> {
        self.send(Packet::Stanza(e.into()))
    }
}

/// Proxy to self.stream
impl<S: AsyncRead + AsyncWrite + Unpin> Sink<Packet> for XmppStream<S> {
    type Error = Error;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.stream).poll_ready(cx)
    }

    fn start_send(mut self: Pin<&mut Self>, item: Packet) -> Result<(), Self::Error> {
        Pin::new(&mut self.stream).start_send(item)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.stream).poll_close(cx)
    }
}

/// Proxy to self.stream
impl<S: AsyncRead + AsyncWrite + Unpin> Stream for XmppStream<S> {
    type Item = Result<Packet, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.stream).poll_next(cx)
    }
}
