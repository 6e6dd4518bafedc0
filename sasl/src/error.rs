use std::error::Error as StdError;
use std::fmt;

/// A mechanism could not start or a step of the exchange went wrong.
///
/// These are client-side failures; a server rejection arrives separately as
/// a [`SaslCondition`] inside the transport's `<failure/>`.
#[derive(Debug)]
pub enum MechanismError {
    /// The selected mechanism needs a password and none was supplied.
    NoPassword,
    /// An authzid was supplied to a mechanism that cannot carry one.
    AuthzidNotSupported(&'static str),
    /// A `-PLUS` mechanism was started without channel binding data.
    ChannelBindingRequired(&'static str),
    /// The server sent a challenge the mechanism cannot parse.
    InvalidChallenge(String),
    /// A required challenge attribute was missing.
    MissingAttribute(&'static str),
    /// Challenge bytes were not valid UTF-8.
    InvalidUtf8,
    /// Base64 inside a challenge attribute failed to decode.
    Base64(base64::DecodeError),
    /// Nonce generation failed.
    Rng(getrandom::Error),
    /// A derived key had the wrong length for the underlying primitive.
    InvalidKeyLength,
    /// The server's final signature did not verify; the server does not
    /// actually know the password. Treat the session as compromised.
    ServerSignatureMismatch,
    /// DIGEST-MD5 `rspauth` did not match.
    RspauthMismatch,
    /// The server asked for a qop we do not do (`auth-int`, `auth-conf`).
    UnsupportedQop(String),
    /// A step arrived after the exchange already concluded.
    ExchangeAlreadyComplete,
}

impl fmt::Display for MechanismError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MechanismError::NoPassword => write!(fmt, "mechanism requires a password"),
            MechanismError::AuthzidNotSupported(name) => {
                write!(fmt, "{name} does not support an authorization identity")
            }
            MechanismError::ChannelBindingRequired(name) => {
                write!(fmt, "{name} requires TLS channel binding data")
            }
            MechanismError::InvalidChallenge(detail) => {
                write!(fmt, "malformed challenge: {detail}")
            }
            MechanismError::MissingAttribute(attr) => {
                write!(fmt, "challenge is missing the {attr}= attribute")
            }
            MechanismError::InvalidUtf8 => write!(fmt, "challenge is not valid UTF-8"),
            MechanismError::Base64(e) => write!(fmt, "base64 decode error: {e}"),
            MechanismError::Rng(e) => write!(fmt, "nonce generation failed: {e}"),
            MechanismError::InvalidKeyLength => write!(fmt, "invalid key length"),
            MechanismError::ServerSignatureMismatch => {
                write!(fmt, "server signature did not verify")
            }
            MechanismError::RspauthMismatch => write!(fmt, "rspauth did not verify"),
            MechanismError::UnsupportedQop(qop) => {
                write!(fmt, "server offered no supported qop (got {qop:?})")
            }
            MechanismError::ExchangeAlreadyComplete => {
                write!(fmt, "challenge received after the exchange concluded")
            }
        }
    }
}

impl StdError for MechanismError {}

impl From<base64::DecodeError> for MechanismError {
    fn from(e: base64::DecodeError) -> MechanismError {
        MechanismError::Base64(e)
    }
}

impl From<getrandom::Error> for MechanismError {
    fn from(e: getrandom::Error) -> MechanismError {
        MechanismError::Rng(e)
    }
}

impl From<hmac::digest::InvalidLength> for MechanismError {
    fn from(_: hmac::digest::InvalidLength) -> MechanismError {
        MechanismError::InvalidKeyLength
    }
}

impl From<std::str::Utf8Error> for MechanismError {
    fn from(_: std::str::Utf8Error) -> MechanismError {
        MechanismError::InvalidUtf8
    }
}

/// SASL failure conditions defined by RFC 6120 §6.5.
///
/// Hyphenated on the wire; `from_wire` keeps unknown conditions instead of
/// flattening them so diagnostics survive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SaslCondition {
    Aborted,
    AccountDisabled,
    CredentialsExpired,
    EncryptionRequired,
    IncorrectEncoding,
    InvalidAuthzid,
    InvalidMechanism,
    MalformedRequest,
    MechanismTooWeak,
    NotAuthorized,
    TemporaryAuthFailure,
    Other(String),
}

impl SaslCondition {
    pub fn from_wire(name: &str) -> SaslCondition {
        match name {
            "aborted" => SaslCondition::Aborted,
            "account-disabled" => SaslCondition::AccountDisabled,
            "credentials-expired" => SaslCondition::CredentialsExpired,
            "encryption-required" => SaslCondition::EncryptionRequired,
            "incorrect-encoding" => SaslCondition::IncorrectEncoding,
            "invalid-authzid" => SaslCondition::InvalidAuthzid,
            "invalid-mechanism" => SaslCondition::InvalidMechanism,
            "malformed-request" => SaslCondition::MalformedRequest,
            "mechanism-too-weak" => SaslCondition::MechanismTooWeak,
            "not-authorized" => SaslCondition::NotAuthorized,
            "temporary-auth-failure" => SaslCondition::TemporaryAuthFailure,
            other => SaslCondition::Other(other.to_owned()),
        }
    }

    pub fn wire_name(&self) -> &str {
        match self {
            SaslCondition::Aborted => "aborted",
            SaslCondition::AccountDisabled => "account-disabled",
            SaslCondition::CredentialsExpired => "credentials-expired",
            SaslCondition::EncryptionRequired => "encryption-required",
            SaslCondition::IncorrectEncoding => "incorrect-encoding",
            SaslCondition::InvalidAuthzid => "invalid-authzid",
            SaslCondition::InvalidMechanism => "invalid-mechanism",
            SaslCondition::MalformedRequest => "malformed-request",
            SaslCondition::MechanismTooWeak => "mechanism-too-weak",
            SaslCondition::NotAuthorized => "not-authorized",
            SaslCondition::TemporaryAuthFailure => "temporary-auth-failure",
            SaslCondition::Other(name) => name,
        }
    }
}

impl fmt::Display for SaslCondition {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str(self.wire_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_round_trips_through_wire_names() {
        for name in [
            "aborted",
            "account-disabled",
            "credentials-expired",
            "encryption-required",
            "incorrect-encoding",
            "invalid-authzid",
            "invalid-mechanism",
            "malformed-request",
            "mechanism-too-weak",
            "not-authorized",
            "temporary-auth-failure",
        ] {
            let cond = SaslCondition::from_wire(name);
            assert!(!matches!(cond, SaslCondition::Other(_)), "{name} not recognized");
            assert_eq!(cond.wire_name(), name);
        }
    }

    #[test]
    fn unknown_condition_is_preserved() {
        let cond = SaslCondition::from_wire("server-on-fire");
        assert_eq!(cond, SaslCondition::Other("server-on-fire".to_owned()));
        assert_eq!(cond.wire_name(), "server-on-fire");
    }
}
