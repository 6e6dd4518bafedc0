//! Client-side SASL for XMPP connections.
//!
//! The crate is sans-IO: a [`Registry`] picks a [`MechanismKind`] out of the
//! set a server advertises, [`MechanismKind::start`] produces a per-attempt
//! [`Mechanism`] state machine, and the caller shuttles its byte payloads
//! over whatever transport it owns. Base64 framing is the transport's
//! business, not ours.

mod digest_md5;
mod error;
mod mechanism;
mod scram;

pub use crate::error::{MechanismError, SaslCondition};
pub use crate::mechanism::{Mechanism, MechanismKind, Registry};

/// How the TLS layer is (or is not) woven into authentication.
///
/// The `-PLUS` SCRAM variants refuse to start without binding data.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum ChannelBinding {
    /// No channel binding data available (cleartext or unbound TLS).
    #[default]
    None,
    /// `tls-unique` (RFC 5929) binding data.
    TlsUnique(Vec<u8>),
    /// `tls-exporter` (RFC 9266) binding data, the TLS 1.3 mechanism.
    TlsExporter(Vec<u8>),
}

impl ChannelBinding {
    /// The gs2 channel binding flag for this binding, sans authzid.
    pub fn gs2_flag(&self) -> &'static str {
        match *self {
            ChannelBinding::None => "n",
            ChannelBinding::TlsUnique(_) => "p=tls-unique",
            ChannelBinding::TlsExporter(_) => "p=tls-exporter",
        }
    }

    /// The raw binding data appended to the gs2 header in `c=`.
    pub fn data(&self) -> &[u8] {
        match *self {
            ChannelBinding::None => &[],
            ChannelBinding::TlsUnique(ref data) => data,
            ChannelBinding::TlsExporter(ref data) => data,
        }
    }
}

/// What the client authenticates with.
#[derive(Clone, Debug, Default)]
pub struct Credentials {
    /// Authentication identity (localpart for XMPP).
    pub authcid: String,
    /// Password, absent for EXTERNAL and ANONYMOUS.
    pub password: Option<String>,
    /// Authorization identity, rarely used by clients.
    pub authzid: Option<String>,
    /// TLS channel binding data for the `-PLUS` mechanisms.
    pub channel_binding: ChannelBinding,
}

impl Credentials {
    pub fn with_username<S: Into<String>>(mut self, authcid: S) -> Credentials {
        self.authcid = authcid.into();
        self
    }

    pub fn with_password<S: Into<String>>(mut self, password: S) -> Credentials {
        self.password = Some(password.into());
        self
    }

    pub fn with_authzid<S: Into<String>>(mut self, authzid: S) -> Credentials {
        self.authzid = Some(authzid.into());
        self
    }

    pub fn with_channel_binding(mut self, channel_binding: ChannelBinding) -> Credentials {
        self.channel_binding = channel_binding;
        self
    }
}

/// String preparation hook applied to usernames and passwords before they
/// are fed into a mechanism. Defaults to the identity function; callers
/// that need SASLprep (RFC 4013) plug their own in via
/// [`Registry::with_normalizer`].
pub type Normalizer = fn(&str) -> String;

pub(crate) fn identity_normalizer(s: &str) -> String {
    s.to_owned()
}
