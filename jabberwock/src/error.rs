use std::error::Error as StdError;
use std::fmt;
use std::io::Error as IoError;
use std::net::AddrParseError;
use std::str::Utf8Error;

use hickory_resolver::error::ResolveError as DnsResolveError;
use jabberwock_sasl::{MechanismError as SaslMechanismError, SaslCondition};
use tokio_rustls::rustls::Error as RustlsError;

use crate::sm::SmError;

/// Top-level error type
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(IoError),
    /// Error parsing Jabber-Id
    JidParse(jid::Error),
    /// Protocol-level error
    Protocol(ProtocolError),
    /// Authentication error
    Auth(AuthError),
    /// Host resolution failed; carries every endpoint that was tried
    Resolve(ResolutionError),
    /// The TLS stack rejected the handshake
    Tls(RustlsError),
    /// Certificate checks applied on top of the handshake failed
    TlsVerification(TlsVerificationError),
    /// Stream management counters went out of sync
    StreamManagement(SmError),
    /// A response wait expired
    NoResponse,
    /// An operation needs an established session and there is none
    NotConnected,
    /// Connection closed
    Disconnected,
    /// Invalid IP/port address
    Addr(AddrParseError),
    /// Utf8 error
    Utf8(Utf8Error),
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(e) => write!(fmt, "IO error: {}", e),
            Error::JidParse(e) => write!(fmt, "jid parse error: {}", e),
            Error::Protocol(e) => write!(fmt, "protocol error: {}", e),
            Error::Auth(e) => write!(fmt, "authentication error: {}", e),
            Error::Resolve(e) => write!(fmt, "resolution error: {}", e),
            Error::Tls(e) => write!(fmt, "TLS error: {}", e),
            Error::TlsVerification(e) => write!(fmt, "TLS verification error: {}", e),
            Error::StreamManagement(e) => write!(fmt, "stream management error: {}", e),
            Error::NoResponse => write!(fmt, "no response within the deadline"),
            Error::NotConnected => write!(fmt, "not connected"),
            Error::Disconnected => write!(fmt, "disconnected"),
            Error::Addr(e) => write!(fmt, "wrong network address: {}", e),
            Error::Utf8(e) => write!(fmt, "Utf8 error: {}", e),
        }
    }
}

impl StdError for Error {}

impl From<IoError> for Error {
    fn from(e: IoError) -> Self {
        Error::Io(e)
    }
}

impl From<jid::Error> for Error {
    fn from(e: jid::Error) -> Self {
        Error::JidParse(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::Protocol(e)
    }
}

impl From<AuthError> for Error {
    fn from(e: AuthError) -> Self {
        Error::Auth(e)
    }
}

impl From<ResolutionError> for Error {
    fn from(e: ResolutionError) -> Self {
        Error::Resolve(e)
    }
}

impl From<RustlsError> for Error {
    fn from(e: RustlsError) -> Self {
        Error::Tls(e)
    }
}

impl From<TlsVerificationError> for Error {
    fn from(e: TlsVerificationError) -> Self {
        Error::TlsVerification(e)
    }
}

impl From<SmError> for Error {
    fn from(e: SmError) -> Self {
        Error::StreamManagement(e)
    }
}

impl From<AddrParseError> for Error {
    fn from(e: AddrParseError) -> Self {
        Error::Addr(e)
    }
}

impl From<Utf8Error> for Error {
    fn from(e: Utf8Error) -> Self {
        Error::Utf8(e)
    }
}

impl From<minidom::Error> for Error {
    fn from(e: minidom::Error) -> Self {
        ProtocolError::Parser(e).into()
    }
}

/// XMPP protocol-level error
#[derive(Debug)]
pub enum ProtocolError {
    /// XML parser error
    Parser(minidom::Error),
    /// Encountered an unexpected XML token
    InvalidToken,
    /// Server offers no TLS and policy requires it
    NoTls,
    /// `<starttls/>` was answered with `<failure/>`
    TlsRefused,
    /// Invalid response to resource binding
    InvalidBindResponse,
    /// No xmlns attribute in `<stream:stream>`
    NoStreamNamespace,
    /// No id attribute in `<stream:stream>`
    NoStreamId,
    /// A negotiation step got an element it cannot interpret
    UnexpectedElement(String),
    /// `<enabled/>` was expected and `<failed/>` came back
    SmEnableFailed,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProtocolError::Parser(e) => write!(fmt, "XML parser error: {}", e),
            ProtocolError::InvalidToken => write!(fmt, "encountered an unexpected XML token"),
            ProtocolError::NoTls => write!(fmt, "no TLS available"),
            ProtocolError::TlsRefused => write!(fmt, "server refused STARTTLS"),
            ProtocolError::InvalidBindResponse => {
                write!(fmt, "invalid response to resource binding")
            }
            ProtocolError::NoStreamNamespace => {
                write!(fmt, "no xmlns attribute in <stream:stream>")
            }
            ProtocolError::NoStreamId => write!(fmt, "no id attribute in <stream:stream>"),
            ProtocolError::UnexpectedElement(name) => {
                write!(fmt, "unexpected element {}", name)
            }
            ProtocolError::SmEnableFailed => write!(fmt, "server failed to enable stream management"),
        }
    }
}

impl StdError for ProtocolError {}

impl From<minidom::Error> for ProtocolError {
    fn from(e: minidom::Error) -> Self {
        ProtocolError::Parser(e)
    }
}

/// Authentication error
#[derive(Debug)]
pub enum AuthError {
    /// No matching SASL mechanism available
    NoMechanism,
    /// Local SASL implementation error
    Sasl(SaslMechanismError),
    /// Failure from server
    Fail(SaslCondition),
}

impl StdError for AuthError {}

impl fmt::Display for AuthError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AuthError::NoMechanism => write!(fmt, "no matching SASL mechanism available"),
            AuthError::Sasl(s) => write!(fmt, "local SASL implementation error: {}", s),
            AuthError::Fail(c) => write!(fmt, "failure from the server: {}", c),
        }
    }
}

impl From<SaslMechanismError> for AuthError {
    fn from(e: SaslMechanismError) -> Self {
        AuthError::Sasl(e)
    }
}

impl From<SaslMechanismError> for Error {
    fn from(e: SaslMechanismError) -> Self {
        Error::Auth(AuthError::Sasl(e))
    }
}

/// One endpoint that was tried and the reason it did not work out.
#[derive(Debug)]
pub struct EndpointFailure {
    pub host: String,
    pub port: u16,
    pub error: String,
}

impl fmt::Display for EndpointFailure {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}:{}: {}", self.host, self.port, self.error)
    }
}

/// Host resolution / endpoint exhaustion error
#[derive(Debug)]
pub enum ResolutionError {
    /// DNS resolution error
    Dns(DnsResolveError),
    /// DNS label conversion error, no details available from module `idna`
    Idna,
    /// Lookup succeeded but produced nothing connectable
    NoRecords,
    /// The SRV record set is a lone `.` target: the service is explicitly
    /// not provided at this domain
    ServiceDeclined,
    /// DNSSEC validation was required and could not be established
    DnssecUnavailable(String),
    /// Every resolved endpoint failed; one entry per attempt
    AllEndpointsFailed(Vec<EndpointFailure>),
}

impl fmt::Display for ResolutionError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ResolutionError::Dns(e) => write!(fmt, "DNS error: {}", e),
            ResolutionError::Idna => write!(fmt, "IDNA error"),
            ResolutionError::NoRecords => write!(fmt, "no connectable records"),
            ResolutionError::ServiceDeclined => {
                write!(fmt, "the domain explicitly declines XMPP service")
            }
            ResolutionError::DnssecUnavailable(detail) => {
                write!(fmt, "DNSSEC validation unavailable: {}", detail)
            }
            ResolutionError::AllEndpointsFailed(attempts) => {
                write!(fmt, "all {} endpoints failed:", attempts.len())?;
                for attempt in attempts {
                    write!(fmt, " [{}]", attempt)?;
                }
                Ok(())
            }
        }
    }
}

impl StdError for ResolutionError {}

impl From<DnsResolveError> for ResolutionError {
    fn from(e: DnsResolveError) -> Self {
        ResolutionError::Dns(e)
    }
}

impl From<idna::Errors> for ResolutionError {
    fn from(_: idna::Errors) -> Self {
        ResolutionError::Idna
    }
}

/// Certificate checks layered on top of the TLS handshake
#[derive(Debug)]
pub enum TlsVerificationError {
    /// The presented certificate covers none of the expected names
    HostnameMismatch {
        /// Name the connection was made for
        expected: String,
        /// Names the certificate presented
        presented: Vec<String>,
    },
    /// DANE was required and no TLSA record matched the certificate
    NoTlsaMatch {
        /// Number of usable TLSA records that were checked
        records: usize,
    },
    /// DANE was required but no validated TLSA records exist
    TlsaUnavailable,
    /// The certificate could not be parsed far enough to check it
    BadCertificate(String),
}

impl fmt::Display for TlsVerificationError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TlsVerificationError::HostnameMismatch { expected, presented } => write!(
                fmt,
                "certificate names {:?} do not cover {}",
                presented, expected
            ),
            TlsVerificationError::NoTlsaMatch { records } => {
                write!(fmt, "none of {} TLSA records match the certificate", records)
            }
            TlsVerificationError::TlsaUnavailable => {
                write!(fmt, "DANE required but no validated TLSA records available")
            }
            TlsVerificationError::BadCertificate(detail) => {
                write!(fmt, "malformed certificate: {}", detail)
            }
        }
    }
}

impl StdError for TlsVerificationError {}
