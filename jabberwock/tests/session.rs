//! End-to-end session test against a scripted in-memory server.

use std::str::FromStr;
use std::time::Duration;

use jabberwock::minidom::Element;
use jabberwock::{Client, Config, ConnectionState, Event, StanzaFilter, TlsPolicy};
use jid::Jid;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

const SASL_NS: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
const SM_NS: &str = "urn:xmpp:sm:3";

struct ScriptedServer {
    stream: DuplexStream,
    buf: String,
}

impl ScriptedServer {
    fn new(stream: DuplexStream) -> ScriptedServer {
        ScriptedServer {
            stream,
            buf: String::new(),
        }
    }

    /// Reads until the inbound text contains `needle`, then drains and
    /// returns everything read so far.
    async fn expect(&mut self, needle: &str) -> String {
        let mut chunk = [0u8; 4096];
        while !self.buf.contains(needle) {
            let n = self
                .stream
                .read(&mut chunk)
                .await
                .unwrap_or_else(|e| panic!("read while waiting for {needle:?}: {e}"));
            assert!(n > 0, "eof while waiting for {needle:?}, got {:?}", self.buf);
            self.buf.push_str(&String::from_utf8_lossy(&chunk[..n]));
        }
        std::mem::take(&mut self.buf)
    }

    async fn send(&mut self, xml: &str) {
        self.stream.write_all(xml.as_bytes()).await.unwrap();
    }

    fn attr(xml: &str, element: &str, name: &str) -> String {
        let start = xml.find(&format!("<{element}")).expect(element);
        let rest = &xml[start..];
        let key = format!("{name}=");
        let at = rest.find(&key).unwrap_or_else(|| panic!("no {name} in {rest}"));
        let rest = &rest[at + key.len()..];
        let quote = rest.chars().next().unwrap();
        rest[1..].split(quote).next().unwrap().to_owned()
    }
}

/// Plays the server side of: header, SASL PLAIN, restart, bind, SM
/// enable. Returns once the client session is fully established.
async fn negotiate(server: &mut ScriptedServer) {
    server.expect("<stream:stream").await;
    server
        .send(
            "<?xml version='1.0'?><stream:stream xmlns='jabber:client' \
             xmlns:stream='http://etherx.jabber.org/streams' id='s1' version='1.0'>\
             <stream:features><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
             <mechanism>PLAIN</mechanism></mechanisms></stream:features>",
        )
        .await;

    let auth = server.expect("</auth>").await;
    assert!(auth.contains("mechanism='PLAIN'") || auth.contains("mechanism=\"PLAIN\""));
    server
        .send(&format!("<success xmlns='{SASL_NS}'/>"))
        .await;

    server.expect("<stream:stream").await;
    server
        .send(
            "<?xml version='1.0'?><stream:stream xmlns='jabber:client' \
             xmlns:stream='http://etherx.jabber.org/streams' id='s2' version='1.0'>\
             <stream:features><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/>\
             <sm xmlns='urn:xmpp:sm:3'/></stream:features>",
        )
        .await;

    let bind = server.expect("</iq>").await;
    let id = ScriptedServer::attr(&bind, "iq", "id");
    server
        .send(&format!(
            "<iq type='result' id='{id}'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>\
             <jid>juliet@example.com/balcony</jid></bind></iq>"
        ))
        .await;

    let enable = server.expect("<enable").await;
    assert!(enable.contains("resume='true'") || enable.contains("resume=\"true\""));
    server
        .send(&format!(
            "<enabled xmlns='{SM_NS}' id='token-1' resume='true'/>"
        ))
        .await;
}

fn config() -> Config {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut config = Config::new(Jid::from_str("juliet@example.com").unwrap(), "s3cr3t");
    config.tls = TlsPolicy::Disabled;
    config.timeouts.bind = Duration::from_secs(5);
    config.timeouts.sasl = Duration::from_secs(5);
    // Ask for an ack after every stanza so the script can observe it.
    config.sm.ack_request_interval = 1;
    config
}

#[tokio::test]
async fn full_session_lifecycle() {
    let (client_side, server_side) = tokio::io::duplex(16384);
    let mut server = ScriptedServer::new(server_side);

    let client = tokio::spawn(Client::connect_with_stream(config(), client_side));
    negotiate(&mut server).await;
    let mut client = client.await.unwrap().unwrap();

    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(
        client.bound_jid().to_string(),
        "juliet@example.com/balcony"
    );
    assert!(client.stream_management_enabled());
    match client.next_event().await.unwrap() {
        Event::Online { bound_jid, resumed } => {
            assert!(!resumed);
            assert_eq!(bound_jid.to_string(), "juliet@example.com/balcony");
        }
        other => panic!("expected Online, got {other:?}"),
    }

    // Outbound stanza: counted, buffered, followed by an ack request.
    let message: Element =
        "<message xmlns='jabber:client' to='romeo@example.com'><body>hi</body></message>"
            .parse()
            .unwrap();
    client.send_stanza(message).await.unwrap();
    let sent = server.expect("<r xmlns").await;
    assert!(sent.contains("<body>hi</body>"));
    // Stanzas without an id get one on the way out.
    assert!(ScriptedServer::attr(&sent, "message", "id").len() > 1);
    assert_eq!(client.unacked_stanzas(), 1);

    // Server acks; the ledger drains.
    server.send(&format!("<a xmlns='{SM_NS}' h='1'/>")).await;

    // Inbound stanza surfaces as an event and bumps the inbound count.
    server
        .send(
            "<message xmlns='jabber:client' from='romeo@example.com' id='m1'>\
             <body>oh</body></message>",
        )
        .await;
    match client.next_event().await.unwrap() {
        Event::Stanza(el) => assert_eq!(el.attr("id"), Some("m1")),
        other => panic!("expected Stanza, got {other:?}"),
    }

    // The server's <r/> gets an immediate <a h='1'/> for the one stanza
    // received so far.
    server.send(&format!("<r xmlns='{SM_NS}'/>")).await;
    let ack = server.expect("<a ").await;
    assert_eq!(ScriptedServer::attr(&ack, "a", "h"), "1");

    // The earlier ack has been applied by now (it precedes the <r/>
    // answer in stream order).
    assert_eq!(client.unacked_stanzas(), 0);

    // Request/response through a collector.
    let collector_filter = StanzaFilter::stanza_name("iq").and(StanzaFilter::id("ping-1"));
    let mut collector = client.create_collector(collector_filter);
    let ping: Element =
        "<iq xmlns='jabber:client' type='get' id='ping-1' to='example.com'/>"
            .parse()
            .unwrap();
    client.send_stanza(ping).await.unwrap();
    server.expect("ping-1").await;
    server
        .send("<iq xmlns='jabber:client' type='result' id='ping-1' from='example.com'/>")
        .await;
    let pong = collector
        .next(Duration::from_secs(5))
        .await
        .expect("collector response");
    assert_eq!(pong.attr("type"), Some("result"));
    collector.cancel();

    // Clean shutdown: footer out, peer footer back.
    let disconnect = tokio::spawn(async move {
        client.disconnect().await.unwrap();
        client
    });
    server.expect("</stream:stream>").await;
    server.send("</stream:stream>").await;
    let client = disconnect.await.unwrap();
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn sasl_failure_surfaces_the_condition() {
    let (client_side, server_side) = tokio::io::duplex(16384);
    let mut server = ScriptedServer::new(server_side);

    let client = tokio::spawn(Client::connect_with_stream(config(), client_side));

    server.expect("<stream:stream").await;
    server
        .send(
            "<?xml version='1.0'?><stream:stream xmlns='jabber:client' \
             xmlns:stream='http://etherx.jabber.org/streams' id='s1' version='1.0'>\
             <stream:features><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
             <mechanism>PLAIN</mechanism></mechanisms></stream:features>",
        )
        .await;
    server.expect("</auth>").await;
    server
        .send(&format!(
            "<failure xmlns='{SASL_NS}'><not-authorized/></failure>"
        ))
        .await;

    let err = client.await.unwrap().unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("not-authorized"), "{msg}");
}

#[tokio::test]
async fn no_usable_mechanism_fails_fast() {
    let (client_side, server_side) = tokio::io::duplex(16384);
    let mut server = ScriptedServer::new(server_side);

    // A server advertising no mechanisms must produce an immediate
    // error, not a hang until the SASL timeout.
    let client = tokio::spawn(Client::connect_with_stream(config(), client_side));

    server.expect("<stream:stream").await;
    server
        .send(
            "<?xml version='1.0'?><stream:stream xmlns='jabber:client' \
             xmlns:stream='http://etherx.jabber.org/streams' id='s1' version='1.0'>\
             <stream:features/>",
        )
        .await;

    let err = client.await.unwrap().unwrap_err();
    assert!(err.to_string().contains("no matching SASL mechanism"));
}
