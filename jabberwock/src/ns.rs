//! XML namespaces used during stream establishment.

/// RFC 6120 `<stream:stream>` and `<stream:features>`.
pub const STREAM: &str = "http://etherx.jabber.org/streams";

/// Default namespace of a client-to-server stream.
pub const CLIENT: &str = "jabber:client";

/// RFC 6120 STARTTLS.
pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";

/// RFC 6120 SASL.
pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";

/// RFC 6120 resource binding.
pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";

/// XEP-0198 stream management, revision 3.
pub const SM: &str = "urn:xmpp:sm:3";
