//! Framed codec turning the byte stream into [`Packet`]s.

use std::collections::HashMap;

use bytes::{Buf, BufMut, BytesMut};
use minidom::Element;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;
use crate::proto::frame::{extract_frame, RawFrame};

/// Anything that can come down or go up an XMPP stream.
#[derive(Debug, Clone)]
pub enum Packet {
    /// `<stream:stream …>` header; attributes as read or to be written.
    StreamStart(HashMap<String, String>),
    /// A complete top-level element: stanza or nonza.
    Stanza(Element),
    /// `</stream:stream>` footer.
    StreamEnd,
}

/// Encodes/decodes [`Packet`]s for use with [`tokio_util::codec::Framed`].
pub struct XmppCodec {
    /// Default namespace of this stream, re-injected into extracted
    /// elements so they parse standalone.
    ns: String,
}

impl XmppCodec {
    pub fn new<S: Into<String>>(ns: S) -> Self {
        XmppCodec { ns: ns.into() }
    }
}

impl Decoder for XmppCodec {
    type Item = Packet;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Packet>, Error> {
        let Some((frame, consumed)) = extract_frame(buf, &self.ns)? else {
            return Ok(None);
        };
        buf.advance(consumed);
        match frame {
            RawFrame::StreamStart(attrs) => {
                log::debug!("<< stream header {:?}", attrs);
                Ok(Some(Packet::StreamStart(attrs)))
            }
            RawFrame::StreamEnd => Ok(Some(Packet::StreamEnd)),
            RawFrame::Element(xml) => {
                let stanza: Element = xml.parse()?;
                log::trace!("<< {}", xml);
                Ok(Some(Packet::Stanza(stanza)))
            }
        }
    }
}

impl Encoder<Packet> for XmppCodec {
    type Error = Error;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Error> {
        match item {
            Packet::StreamStart(attrs) => {
                let mut header = String::from("<?xml version='1.0'?><stream:stream");
                // Deterministic attribute order keeps the wire diffable.
                let mut attrs: Vec<_> = attrs.into_iter().collect();
                attrs.sort();
                for (name, value) in attrs {
                    header.push_str(&format!(
                        " {}='{}'",
                        name,
                        quick_xml::escape::escape(&value)
                    ));
                }
                header.push('>');
                log::debug!(">> {}", header);
                dst.put_slice(header.as_bytes());
            }
            Packet::Stanza(stanza) => {
                stanza.write_to(&mut dst.writer())?;
                log::trace!(">> {:?}", stanza);
            }
            Packet::StreamEnd => {
                dst.put_slice(b"</stream:stream>");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ns;

    fn decode_all(codec: &mut XmppCodec, bytes: &[u8]) -> Vec<Packet> {
        let mut buf = BytesMut::from(bytes);
        let mut out = Vec::new();
        while let Some(packet) = codec.decode(&mut buf).expect("decode error") {
            out.push(packet);
        }
        out
    }

    #[test]
    fn decodes_header_features_and_stanza() {
        let mut codec = XmppCodec::new(ns::CLIENT);
        let packets = decode_all(
            &mut codec,
            b"<?xml version='1.0'?><stream:stream xmlns='jabber:client' \
              xmlns:stream='http://etherx.jabber.org/streams' id='s1' version='1.0'>\
              <stream:features><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></stream:features>\
              <message from='romeo@example.net'><body>hi</body></message>",
        );
        assert_eq!(packets.len(), 3);
        assert!(matches!(packets[0], Packet::StreamStart(_)));
        match &packets[1] {
            Packet::Stanza(el) => assert!(el.is("features", ns::STREAM)),
            other => panic!("wrong packet: {other:?}"),
        }
        match &packets[2] {
            Packet::Stanza(el) => {
                assert!(el.is("message", ns::CLIENT));
                assert_eq!(el.attr("from"), Some("romeo@example.net"));
            }
            other => panic!("wrong packet: {other:?}"),
        }
    }

    #[test]
    fn split_reads_reassemble() {
        let mut codec = XmppCodec::new(ns::CLIENT);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"<presence from='juliet@exam");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"ple.com'/>");
        let packet = codec.decode(&mut buf).unwrap().unwrap();
        match packet {
            Packet::Stanza(el) => assert_eq!(el.attr("from"), Some("juliet@example.com")),
            other => panic!("wrong packet: {other:?}"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn footer_decodes_to_stream_end() {
        let mut codec = XmppCodec::new(ns::CLIENT);
        let packets = decode_all(&mut codec, b"</stream:stream>");
        assert!(matches!(packets[..], [Packet::StreamEnd]));
    }

    #[test]
    fn encoded_stanza_decodes_back() {
        let mut codec = XmppCodec::new(ns::CLIENT);
        let el: Element = "<iq xmlns='jabber:client' type='get' id='x1'/>"
            .parse()
            .unwrap();
        let mut buf = BytesMut::new();
        codec.encode(Packet::Stanza(el), &mut buf).unwrap();
        let packet = codec.decode(&mut buf).unwrap().unwrap();
        match packet {
            Packet::Stanza(el) => {
                assert!(el.is("iq", ns::CLIENT));
                assert_eq!(el.attr("id"), Some("x1"));
            }
            other => panic!("wrong packet: {other:?}"),
        }
    }

    #[test]
    fn header_encoding_escapes_values() {
        let mut codec = XmppCodec::new(ns::CLIENT);
        let mut buf = BytesMut::new();
        let attrs = [("to".to_owned(), "a&b.example".to_owned())]
            .into_iter()
            .collect();
        codec.encode(Packet::StreamStart(attrs), &mut buf).unwrap();
        let text = String::from_utf8(buf.to_vec()).unwrap();
        assert!(text.contains("to='a&amp;b.example'"), "{text}");
        assert!(text.starts_with("<?xml version='1.0'?><stream:stream"));
        assert!(text.ends_with('>'));
    }
}
