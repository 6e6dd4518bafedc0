//! Stanza boundary detection on a raw byte stream.
//!
//! XMPP frames are not length-prefixed: the only way to find a stanza
//! boundary is to parse. The incremental parse below tracks element depth
//! and hands back one complete top-level element at a time, leaving
//! partial data in the buffer. The `<stream:stream>` header and footer
//! never close / never open, so both get special treatment.

use std::collections::HashMap;

use quick_xml::errors::SyntaxError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::ProtocolError;
use crate::ns;

/// One complete frame cut out of the byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawFrame {
    /// `<stream:stream …>` header with its attributes.
    StreamStart(HashMap<String, String>),
    /// `</stream:stream>` footer.
    StreamEnd,
    /// A complete top-level element, rewritten to parse standalone (see
    /// [`standalone_xml`]).
    Element(String),
}

fn is_stream_root(start: &BytesStart) -> bool {
    start.name().as_ref() == b"stream:stream" || start.name().local_name().as_ref() == b"stream"
}

fn attributes(start: &BytesStart) -> HashMap<String, String> {
    let mut attrs = HashMap::new();
    for attr in start.attributes().flatten() {
        attrs.insert(
            String::from_utf8_lossy(attr.key.as_ref()).into_owned(),
            String::from_utf8_lossy(&attr.value).into_owned(),
        );
    }
    attrs
}

fn bytes_to_string(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Rewrites an extracted element so it parses as a standalone document.
///
/// Inside the stream, `<stream:features>` relies on the `xmlns:stream`
/// declaration of the stream header, and unprefixed stanzas inherit the
/// stream's default namespace. Both declarations are gone once the element
/// is cut out, so they are re-injected here.
fn standalone_xml(raw: &str, default_ns: &str) -> String {
    let (body, inject_ns) = if raw.starts_with("<stream:") {
        // Strip the stream: prefix everywhere; check "</stream:" before
        // "<stream:" since the latter is a prefix of the former.
        let mut result = String::with_capacity(raw.len());
        let mut remaining = raw;
        while !remaining.is_empty() {
            if let Some(rest) = remaining.strip_prefix("</stream:") {
                result.push_str("</");
                remaining = rest;
            } else if let Some(rest) = remaining.strip_prefix("<stream:") {
                result.push('<');
                remaining = rest;
            } else {
                let mut chars = remaining.chars();
                // unwrap can't fail, remaining is non-empty
                result.push(chars.next().unwrap());
                remaining = chars.as_str();
            }
        }
        (result, ns::STREAM)
    } else {
        (raw.to_owned(), default_ns)
    };

    // Inject xmlns on the root tag unless it already declares one. Only
    // the root tag (up to the first '>') matters.
    let root_tag_end = body.find('>').unwrap_or(body.len());
    if body[..root_tag_end].contains("xmlns=") {
        return body;
    }
    match body.find([' ', '>', '/']) {
        Some(pos) => {
            let mut rewritten = String::with_capacity(body.len() + inject_ns.len() + 9);
            rewritten.push_str(&body[..pos]);
            rewritten.push_str(&format!(" xmlns='{}'", inject_ns));
            rewritten.push_str(&body[pos..]);
            rewritten
        }
        None => body,
    }
}

/// Extracts a single complete frame from `buffer`.
///
/// Returns `Ok(None)` when the buffer holds no complete frame yet; the
/// caller keeps the bytes and retries after the next read. On success the
/// second tuple field is the number of bytes consumed.
pub fn extract_frame(
    buffer: &[u8],
    default_ns: &str,
) -> Result<Option<(RawFrame, usize)>, ProtocolError> {
    // The footer shows up without a matching opening tag in the buffer, so
    // the depth tracking below would misread it.
    if let Some(start) = buffer
        .iter()
        .position(|&b| !matches!(b, b' ' | b'\t' | b'\n' | b'\r'))
    {
        const FOOTER: &[u8] = b"</stream:stream>";
        if buffer[start..].starts_with(FOOTER) {
            return Ok(Some((RawFrame::StreamEnd, start + FOOTER.len())));
        }
    }

    let mut reader = Reader::from_reader(buffer);
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = false;

    let mut depth: u32 = 0;
    let mut stanza_start: Option<usize> = None;

    loop {
        let pos = reader.buffer_position() as usize;

        match reader.read_event() {
            // Stream-level prolog, nothing to emit.
            Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::Comment(_))
            | Ok(Event::DocType(_)) => continue,
            Ok(Event::Start(e)) => {
                if depth == 0 && stanza_start.is_none() && is_stream_root(&e) {
                    let consumed = reader.buffer_position() as usize;
                    return Ok(Some((RawFrame::StreamStart(attributes(&e)), consumed)));
                }
                if depth == 0 {
                    stanza_start = Some(pos);
                }
                depth += 1;
            }
            Ok(Event::Empty(e)) => {
                if depth == 0 {
                    let consumed = reader.buffer_position() as usize;
                    if is_stream_root(&e) {
                        return Ok(Some((RawFrame::StreamStart(attributes(&e)), consumed)));
                    }
                    let raw = bytes_to_string(&buffer[pos..consumed]);
                    return Ok(Some((
                        RawFrame::Element(standalone_xml(&raw, default_ns)),
                        consumed,
                    )));
                }
            }
            // Inter-stanza whitespace (keepalives) and text content.
            Ok(Event::Text(_)) | Ok(Event::CData(_)) => {}
            Ok(Event::End(_)) => {
                if depth == 0 {
                    // A lone end tag here is the footer in a prefix form
                    // the byte check above did not catch.
                    return Ok(Some((RawFrame::StreamEnd, reader.buffer_position() as usize)));
                }
                depth -= 1;
                if depth == 0 {
                    if let Some(start) = stanza_start {
                        let consumed = reader.buffer_position() as usize;
                        let raw = bytes_to_string(&buffer[start..consumed]);
                        return Ok(Some((
                            RawFrame::Element(standalone_xml(&raw, default_ns)),
                            consumed,
                        )));
                    }
                }
            }
            // Incomplete data, wait for the next read.
            Ok(Event::Eof) => return Ok(None),
            Err(quick_xml::Error::Syntax(SyntaxError::UnclosedTag)) => return Ok(None),
            Err(e) => {
                log::error!("XML parse error in inbound stream: {e}");
                return Err(ProtocolError::InvalidToken);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract(buf: &[u8]) -> Option<(RawFrame, usize)> {
        extract_frame(buf, ns::CLIENT).expect("parse error")
    }

    #[test]
    fn stream_header_yields_attributes() {
        let buf = b"<?xml version='1.0'?><stream:stream xmlns='jabber:client' \
                    xmlns:stream='http://etherx.jabber.org/streams' id='c2s-1' version='1.0'>";
        let (frame, consumed) = extract(buf).unwrap();
        assert_eq!(consumed, buf.len());
        match frame {
            RawFrame::StreamStart(attrs) => {
                assert_eq!(attrs.get("id").map(String::as_str), Some("c2s-1"));
                assert_eq!(attrs.get("xmlns").map(String::as_str), Some("jabber:client"));
            }
            other => panic!("wrong frame: {other:?}"),
        }
    }

    #[test]
    fn footer_is_detected() {
        let (frame, consumed) = extract(b"  </stream:stream>").unwrap();
        assert_eq!(frame, RawFrame::StreamEnd);
        assert_eq!(consumed, 18);
    }

    #[test]
    fn self_closing_stanza() {
        let (frame, consumed) = extract(b"<presence/>").unwrap();
        assert_eq!(
            frame,
            RawFrame::Element("<presence xmlns='jabber:client'/>".to_owned())
        );
        assert_eq!(consumed, 11);
    }

    #[test]
    fn nested_stanza_consumed_whole() {
        let buf = b"<iq type='result' id='b1'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>\
                    <jid>juliet@example.com/balcony</jid></bind></iq>";
        let (frame, consumed) = extract(buf).unwrap();
        assert_eq!(consumed, buf.len());
        match frame {
            RawFrame::Element(xml) => {
                assert!(xml.starts_with("<iq xmlns='jabber:client'"));
                assert!(xml.contains("balcony"));
            }
            other => panic!("wrong frame: {other:?}"),
        }
    }

    #[test]
    fn partial_stanza_waits_for_more_data() {
        assert_eq!(extract(b"<message to='a@b'><bo"), None);
        assert_eq!(extract(b"<message to='a@"), None);
        assert_eq!(extract(b"<mess"), None);
    }

    #[test]
    fn whitespace_keepalive_is_not_a_frame() {
        assert_eq!(extract(b" \n\t "), None);
        assert_eq!(extract(b""), None);
    }

    #[test]
    fn multiple_stanzas_come_out_one_at_a_time() {
        let buf: &[u8] = b"<presence/><message><body>hi</body></message>";
        let (first, consumed) = extract(buf).unwrap();
        assert!(matches!(first, RawFrame::Element(ref xml) if xml.contains("presence")));
        let (second, rest) = extract(&buf[consumed..]).unwrap();
        assert!(matches!(second, RawFrame::Element(ref xml) if xml.contains("hi")));
        assert_eq!(consumed + rest, buf.len());
    }

    #[test]
    fn stream_prefix_is_rewritten() {
        let buf = b"<stream:features><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
                    <mechanism>PLAIN</mechanism></mechanisms></stream:features>";
        let (frame, _) = extract(buf).unwrap();
        match frame {
            RawFrame::Element(xml) => {
                assert!(
                    xml.starts_with("<features xmlns='http://etherx.jabber.org/streams'>"),
                    "{xml}"
                );
                assert!(xml.ends_with("</features>"));
                let parsed: minidom::Element = xml.parse().unwrap();
                assert!(parsed.is("features", ns::STREAM));
            }
            other => panic!("wrong frame: {other:?}"),
        }
    }

    #[test]
    fn existing_xmlns_is_left_alone() {
        let buf = b"<enabled xmlns='urn:xmpp:sm:3' id='tok' resume='true'/>";
        let (frame, _) = extract(buf).unwrap();
        assert_eq!(
            frame,
            RawFrame::Element(String::from_utf8_lossy(buf).into_owned())
        );
    }
}
