//! Typed views over the negotiation elements (RFC 6120 STARTTLS/SASL/bind,
//! XEP-0198 stream management).
//!
//! Stanza payloads stay opaque [`Element`]s; only what the engine itself
//! negotiates gets a typed form.

use std::collections::HashSet;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use jabberwock_sasl::SaslCondition;
use jid::Jid;
use minidom::Element;

use crate::error::{Error, ProtocolError};
use crate::ns;

/// What the server advertised in `<stream:features/>`.
#[derive(Debug, Clone, Default)]
pub struct StreamFeatures {
    /// STARTTLS offered; `Some(true)` means the server requires it.
    pub starttls: Option<StartTlsFeature>,
    /// Advertised SASL mechanism names.
    pub mechanisms: HashSet<String>,
    /// Resource binding offered.
    pub bind: bool,
    /// XEP-0198 stream management offered.
    pub sm: bool,
}

#[derive(Debug, Clone)]
pub struct StartTlsFeature {
    pub required: bool,
}

impl StreamFeatures {
    /// Tolerant parse: unknown feature children are ignored.
    pub fn parse(element: &Element) -> StreamFeatures {
        let mut features = StreamFeatures::default();
        for child in element.children() {
            if child.is("starttls", ns::TLS) {
                features.starttls = Some(StartTlsFeature {
                    required: child.get_child("required", ns::TLS).is_some(),
                });
            } else if child.is("mechanisms", ns::SASL) {
                features.mechanisms = child
                    .children()
                    .filter(|mechanism| mechanism.is("mechanism", ns::SASL))
                    .map(|mechanism| mechanism.text())
                    .collect();
            } else if child.is("bind", ns::BIND) {
                features.bind = true;
            } else if child.is("sm", ns::SM) {
                features.sm = true;
            }
        }
        features
    }

    pub fn can_starttls(&self) -> bool {
        self.starttls.is_some()
    }
}

pub fn starttls_request() -> Element {
    Element::builder("starttls", ns::TLS).build()
}

pub fn is_starttls_proceed(element: &Element) -> bool {
    element.is("proceed", ns::TLS)
}

pub fn is_starttls_failure(element: &Element) -> bool {
    element.is("failure", ns::TLS)
}

fn encode_sasl_payload(data: &[u8]) -> String {
    // RFC 6120 §6.4.2: a present-but-empty initial response is a single
    // `=` so it remains distinguishable from an absent one.
    if data.is_empty() {
        "=".to_owned()
    } else {
        BASE64.encode(data)
    }
}

fn decode_sasl_payload(element: &Element) -> Result<Vec<u8>, Error> {
    let text = element.text();
    let text = text.trim();
    if text.is_empty() || text == "=" {
        return Ok(Vec::new());
    }
    BASE64
        .decode(text)
        .map_err(|e| Error::from(jabberwock_sasl::MechanismError::Base64(e)))
}

/// `<auth/>`, with `initial` absent for server-first mechanisms.
pub fn sasl_auth(mechanism: &str, initial: Option<Vec<u8>>) -> Element {
    let builder = Element::builder("auth", ns::SASL).attr("mechanism", mechanism);
    match initial {
        Some(data) => builder.append(encode_sasl_payload(&data)).build(),
        None => builder.build(),
    }
}

pub fn sasl_response(payload: &[u8]) -> Element {
    Element::builder("response", ns::SASL)
        .append(encode_sasl_payload(payload))
        .build()
}

pub fn sasl_abort() -> Element {
    Element::builder("abort", ns::SASL).build()
}

/// One server turn of the SASL exchange.
#[derive(Debug)]
pub enum SaslStep {
    Challenge(Vec<u8>),
    Success(Vec<u8>),
    Failure {
        condition: SaslCondition,
        text: Option<String>,
    },
}

/// `Ok(None)` when the element is not part of the SASL exchange.
pub fn parse_sasl(element: &Element) -> Result<Option<SaslStep>, Error> {
    if element.is("challenge", ns::SASL) {
        return Ok(Some(SaslStep::Challenge(decode_sasl_payload(element)?)));
    }
    if element.is("success", ns::SASL) {
        return Ok(Some(SaslStep::Success(decode_sasl_payload(element)?)));
    }
    if element.is("failure", ns::SASL) {
        let condition = element
            .children()
            .find(|child| child.name() != "text")
            .map(|child| SaslCondition::from_wire(child.name()))
            .unwrap_or(SaslCondition::NotAuthorized);
        let text = element
            .children()
            .find(|child| child.name() == "text")
            .map(|child| child.text());
        return Ok(Some(SaslStep::Failure { condition, text }));
    }
    Ok(None)
}

fn parse_bool(value: Option<&str>) -> bool {
    matches!(value, Some("true") | Some("1"))
}

fn parse_h(element: &Element) -> Option<u32> {
    element.attr("h").and_then(|h| h.parse().ok())
}

pub fn sm_enable(resume: bool) -> Element {
    let builder = Element::builder("enable", ns::SM);
    if resume {
        builder.attr("resume", "true").build()
    } else {
        builder.build()
    }
}

/// `<r/>`, asking the peer for an ack.
pub fn sm_request() -> Element {
    Element::builder("r", ns::SM).build()
}

/// `<a/>`, acking `h` inbound stanzas.
pub fn sm_ack(h: u32) -> Element {
    Element::builder("a", ns::SM).attr("h", h.to_string()).build()
}

pub fn sm_resume(previd: &str, h: u32) -> Element {
    Element::builder("resume", ns::SM)
        .attr("previd", previd)
        .attr("h", h.to_string())
        .build()
}

/// Inbound XEP-0198 nonzas.
#[derive(Debug, PartialEq, Eq)]
pub enum SmNonza {
    Enabled {
        id: Option<String>,
        resume: bool,
        max: Option<u64>,
    },
    /// The peer asks us to ack.
    R,
    /// The peer acks `h` of our stanzas.
    Ack(u32),
    Resumed {
        previd: String,
        h: u32,
    },
    Failed {
        h: Option<u32>,
    },
}

/// `None` when the element is not a stream management nonza (or carries a
/// counter that does not parse; the caller treats that as absent).
pub fn parse_sm(element: &Element) -> Option<SmNonza> {
    if element.is("enabled", ns::SM) {
        return Some(SmNonza::Enabled {
            id: element.attr("id").map(str::to_owned),
            resume: parse_bool(element.attr("resume")),
            max: element.attr("max").and_then(|max| max.parse().ok()),
        });
    }
    if element.is("r", ns::SM) {
        return Some(SmNonza::R);
    }
    if element.is("a", ns::SM) {
        return parse_h(element).map(SmNonza::Ack);
    }
    if element.is("resumed", ns::SM) {
        let previd = element.attr("previd")?.to_owned();
        return parse_h(element).map(|h| SmNonza::Resumed { previd, h });
    }
    if element.is("failed", ns::SM) {
        return Some(SmNonza::Failed {
            h: parse_h(element),
        });
    }
    None
}

/// Resource binding request, RFC 6120 §7. With no `resource` the server
/// assigns one.
pub fn bind_request(id: &str, resource: Option<&str>) -> Element {
    let mut bind = Element::builder("bind", ns::BIND);
    if let Some(resource) = resource {
        bind = bind.append(
            Element::builder("resource", ns::BIND)
                .append(resource.to_owned())
                .build(),
        );
    }
    Element::builder("iq", ns::CLIENT)
        .attr("type", "set")
        .attr("id", id)
        .append(bind.build())
        .build()
}

pub fn parse_bind_response(element: &Element) -> Result<Jid, Error> {
    if !element.is("iq", ns::CLIENT) || element.attr("type") != Some("result") {
        return Err(ProtocolError::InvalidBindResponse.into());
    }
    let jid = element
        .get_child("bind", ns::BIND)
        .and_then(|bind| bind.get_child("jid", ns::BIND))
        .ok_or(ProtocolError::InvalidBindResponse)?;
    Ok(jid.text().parse()?)
}
