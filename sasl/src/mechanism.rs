use std::collections::HashSet;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use crate::digest_md5::DigestMd5Client;
use crate::error::MechanismError;
use crate::scram::{ScramAlgo, ScramClient};
use crate::{identity_normalizer, ChannelBinding, Credentials, Normalizer};

/// Every mechanism this crate can negotiate.
///
/// A closed enum instead of a trait object: the set of mechanisms a client
/// ships is a compile-time fact, and the capability table below is what the
/// negotiator keys on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MechanismKind {
    ScramSha256Plus,
    ScramSha1Plus,
    ScramSha256,
    ScramSha1,
    DigestMd5,
    Plain,
    Anonymous,
    External,
}

impl MechanismKind {
    pub const ALL: [MechanismKind; 8] = [
        MechanismKind::ScramSha256Plus,
        MechanismKind::ScramSha1Plus,
        MechanismKind::ScramSha256,
        MechanismKind::ScramSha1,
        MechanismKind::DigestMd5,
        MechanismKind::Plain,
        MechanismKind::Anonymous,
        MechanismKind::External,
    ];

    /// The IANA-registered mechanism name as it appears in stream features.
    pub fn name(self) -> &'static str {
        match self {
            MechanismKind::ScramSha256Plus => "SCRAM-SHA-256-PLUS",
            MechanismKind::ScramSha1Plus => "SCRAM-SHA-1-PLUS",
            MechanismKind::ScramSha256 => "SCRAM-SHA-256",
            MechanismKind::ScramSha1 => "SCRAM-SHA-1",
            MechanismKind::DigestMd5 => "DIGEST-MD5",
            MechanismKind::Plain => "PLAIN",
            MechanismKind::Anonymous => "ANONYMOUS",
            MechanismKind::External => "EXTERNAL",
        }
    }

    /// Preference weight; lower is better. Channel-bound SCRAM beats plain
    /// SCRAM beats the legacy digest beats cleartext.
    pub fn priority(self) -> i32 {
        match self {
            MechanismKind::ScramSha256Plus => 90,
            MechanismKind::ScramSha1Plus => 100,
            MechanismKind::ScramSha256 => 105,
            MechanismKind::ScramSha1 => 110,
            MechanismKind::DigestMd5 => 210,
            MechanismKind::Plain => 410,
            MechanismKind::Anonymous => 500,
            MechanismKind::External => 510,
        }
    }

    pub fn supports_authzid(self) -> bool {
        !matches!(self, MechanismKind::Anonymous)
    }

    pub fn requires_channel_binding(self) -> bool {
        matches!(
            self,
            MechanismKind::ScramSha256Plus | MechanismKind::ScramSha1Plus
        )
    }

    pub fn requires_password(self) -> bool {
        !matches!(self, MechanismKind::Anonymous | MechanismKind::External)
    }

    pub fn from_name(name: &str) -> Option<MechanismKind> {
        MechanismKind::ALL.iter().copied().find(|kind| kind.name() == name)
    }
}

fn random_nonce() -> Result<String, MechanismError> {
    let mut bytes = [0u8; 24];
    getrandom::getrandom(&mut bytes)?;
    Ok(BASE64.encode(bytes))
}

/// Which mechanisms a client is willing to use, and in what preference.
///
/// Selection takes the intersection of the registered set with what the
/// server advertises, drops mechanisms the credentials cannot drive, and
///// picks the lowest [`MechanismKind::priority`] value. Equal priorities
/// resolve to the earliest registration.
#[derive(Clone)]
pub struct Registry {
    mechanisms: Vec<MechanismKind>,
    normalizer: Normalizer,
}

impl Default for Registry {
    fn default() -> Registry {
        Registry::new()
    }
}

impl Registry {
    /// A registry with every mechanism except ANONYMOUS registered.
    pub fn new() -> Registry {
        let mut registry = Registry::empty();
        for kind in MechanismKind::ALL {
            if kind != MechanismKind::Anonymous {
                registry.register(kind);
            }
        }
        registry
    }

    pub fn empty() -> Registry {
        Registry {
            mechanisms: Vec::new(),
            normalizer: identity_normalizer,
        }
    }

    /// Installs a string-preparation function (e.g. SASLprep) applied to
    /// usernames and passwords. The default passes strings through.
    pub fn with_normalizer(mut self, normalizer: Normalizer) -> Registry {
        self.normalizer = normalizer;
        self
    }

    pub fn register(&mut self, kind: MechanismKind) {
        if !self.mechanisms.contains(&kind) {
            self.mechanisms.push(kind);
        }
    }

    pub fn unregister(&mut self, kind: MechanismKind) {
        self.mechanisms.retain(|k| *k != kind);
    }

    pub fn is_empty(&self) -> bool {
        self.mechanisms.is_empty()
    }

    /// Picks the best mechanism out of what the server advertised, or
    /// `None` when nothing usable overlaps.
    pub fn select(
        &self,
        advertised: &HashSet<String>,
        creds: &Credentials,
    ) -> Option<MechanismKind> {
        self.mechanisms
            .iter()
            .copied()
            .filter(|kind| advertised.contains(kind.name()))
            .filter(|kind| {
                if kind.requires_channel_binding()
                    && creds.channel_binding == ChannelBinding::None
                {
                    return false;
                }
                if kind.requires_password() && creds.password.is_none() {
                    return false;
                }
                if creds.authzid.is_some() && !kind.supports_authzid() {
                    return false;
                }
                true
            })
            .min_by_key(|kind| kind.priority())
    }

    /// Starts a fresh authentication attempt. `service_host` is the XMPP
    /// domain, used by mechanisms that bind a digest-uri.
    pub fn start(
        &self,
        kind: MechanismKind,
        creds: &Credentials,
        service_host: &str,
    ) -> Result<Mechanism, MechanismError> {
        if creds.authzid.is_some() && !kind.supports_authzid() {
            debug_assert!(false, "authzid passed to {}", kind.name());
            return Err(MechanismError::AuthzidNotSupported(kind.name()));
        }
        let mechanism = match kind {
            MechanismKind::ScramSha256Plus => Mechanism::Scram(
                kind,
                ScramClient::new(ScramAlgo::Sha256, true, creds, self.normalizer, random_nonce()?)?,
            ),
            MechanismKind::ScramSha1Plus => Mechanism::Scram(
                kind,
                ScramClient::new(ScramAlgo::Sha1, true, creds, self.normalizer, random_nonce()?)?,
            ),
            MechanismKind::ScramSha256 => Mechanism::Scram(
                kind,
                ScramClient::new(ScramAlgo::Sha256, false, creds, self.normalizer, random_nonce()?)?,
            ),
            MechanismKind::ScramSha1 => Mechanism::Scram(
                kind,
                ScramClient::new(ScramAlgo::Sha1, false, creds, self.normalizer, random_nonce()?)?,
            ),
            MechanismKind::DigestMd5 => Mechanism::DigestMd5(DigestMd5Client::new(
                creds,
                format!("xmpp/{service_host}"),
                random_nonce()?,
            )?),
            MechanismKind::Plain => {
                let password = creds.password.as_deref().ok_or(MechanismError::NoPassword)?;
                let normalize = self.normalizer;
                let mut payload = Vec::new();
                if let Some(authzid) = &creds.authzid {
                    payload.extend_from_slice(authzid.as_bytes());
                }
                payload.push(0);
                payload.extend_from_slice(normalize(&creds.authcid).as_bytes());
                payload.push(0);
                payload.extend_from_slice(normalize(password).as_bytes());
                Mechanism::Plain(Some(payload))
            }
            MechanismKind::Anonymous => Mechanism::Anonymous,
            MechanismKind::External => {
                let payload = creds
                    .authzid
                    .as_ref()
                    .map(|authzid| authzid.as_bytes().to_vec())
                    .unwrap_or_default();
                Mechanism::External(Some(payload))
            }
        };
        Ok(mechanism)
    }
}

/// One authentication attempt in flight. Consumed step by step; a fresh one
/// must be started for every attempt.
pub enum Mechanism {
    Plain(Option<Vec<u8>>),
    External(Option<Vec<u8>>),
    Anonymous,
    Scram(MechanismKind, ScramClient),
    DigestMd5(DigestMd5Client),
}

impl Mechanism {
    pub fn kind(&self) -> MechanismKind {
        match self {
            Mechanism::Plain(_) => MechanismKind::Plain,
            Mechanism::External(_) => MechanismKind::External,
            Mechanism::Anonymous => MechanismKind::Anonymous,
            Mechanism::Scram(kind, _) => *kind,
            Mechanism::DigestMd5(_) => MechanismKind::DigestMd5,
        }
    }

    /// The initial response, if the mechanism is client-first. `Some` with
    /// an empty vec means "send an empty initial response" (`=` on the
    /// XMPP wire); `None` means the server speaks first.
    pub fn initial(&mut self) -> Result<Option<Vec<u8>>, MechanismError> {
        match self {
            Mechanism::Plain(payload) | Mechanism::External(payload) => payload
                .take()
                .map(Some)
                .ok_or(MechanismError::ExchangeAlreadyComplete),
            Mechanism::Anonymous => Ok(Some(Vec::new())),
            Mechanism::Scram(_, client) => Ok(Some(client.initial())),
            Mechanism::DigestMd5(_) => Ok(None),
        }
    }

    pub fn respond(&mut self, challenge: &[u8]) -> Result<Vec<u8>, MechanismError> {
        match self {
            Mechanism::Plain(_) | Mechanism::External(_) | Mechanism::Anonymous => {
                Err(MechanismError::InvalidChallenge(format!(
                    "{} is single-shot and takes no challenge",
                    self.kind().name()
                )))
            }
            Mechanism::Scram(_, client) => client.respond(challenge),
            Mechanism::DigestMd5(client) => client.respond(challenge),
        }
    }

    /// Called with the additional data from the server's success message.
    /// Mechanisms with a server signature fail here when it does not
    /// verify and the whole session must be torn down.
    pub fn verify_success(&mut self, data: &[u8]) -> Result<(), MechanismError> {
        match self {
            Mechanism::Plain(_) | Mechanism::External(_) | Mechanism::Anonymous => Ok(()),
            Mechanism::Scram(_, client) => client.verify_success(data),
            Mechanism::DigestMd5(client) => client.verify_success(data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn advertised(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| (*s).to_owned()).collect()
    }

    fn password_creds() -> Credentials {
        Credentials::default()
            .with_username("juliet")
            .with_password("s3cr3t")
    }

    #[test]
    fn scram_beats_plain_and_digest() {
        let registry = Registry::new();
        let picked = registry.select(
            &advertised(&["PLAIN", "DIGEST-MD5", "SCRAM-SHA-1", "SCRAM-SHA-256"]),
            &password_creds(),
        );
        assert_eq!(picked, Some(MechanismKind::ScramSha256));
    }

    #[test]
    fn plus_requires_binding_data() {
        let registry = Registry::new();
        let offer = advertised(&["SCRAM-SHA-256-PLUS", "SCRAM-SHA-256"]);
        assert_eq!(
            registry.select(&offer, &password_creds()),
            Some(MechanismKind::ScramSha256)
        );
        let bound = password_creds()
            .with_channel_binding(ChannelBinding::TlsExporter(vec![1, 2, 3]));
        assert_eq!(
            registry.select(&offer, &bound),
            Some(MechanismKind::ScramSha256Plus)
        );
    }

    #[test]
    fn no_overlap_yields_none() {
        let registry = Registry::new();
        assert_eq!(
            registry.select(&advertised(&["X-GOOGLE-TOKEN"]), &password_creds()),
            None
        );
    }

    #[test]
    fn password_mechanisms_need_a_password() {
        let registry = Registry::new();
        let creds = Credentials::default().with_username("juliet");
        assert_eq!(registry.select(&advertised(&["PLAIN"]), &creds), None);
        assert_eq!(
            registry.select(&advertised(&["PLAIN", "EXTERNAL"]), &creds),
            Some(MechanismKind::External)
        );
    }

    #[test]
    fn selection_is_deterministic() {
        let registry = Registry::new();
        let offer = advertised(&["SCRAM-SHA-1", "SCRAM-SHA-256", "PLAIN"]);
        let first = registry.select(&offer, &password_creds());
        for _ in 0..10 {
            assert_eq!(registry.select(&offer, &password_creds()), first);
        }
    }

    #[test]
    fn plain_payload_layout() {
        let registry = Registry::new();
        let mut mech = registry
            .start(MechanismKind::Plain, &password_creds(), "example.com")
            .unwrap();
        assert_eq!(
            mech.initial().unwrap(),
            Some(b"\0juliet\0s3cr3t".to_vec())
        );
        // Single-shot: a second initial is refused.
        assert!(mech.initial().is_err());
    }

    #[test]
    fn plain_payload_carries_authzid() {
        let registry = Registry::new();
        let creds = password_creds().with_authzid("romeo@example.com");
        let mut mech = registry
            .start(MechanismKind::Plain, &creds, "example.com")
            .unwrap();
        assert_eq!(
            mech.initial().unwrap(),
            Some(b"romeo@example.com\0juliet\0s3cr3t".to_vec())
        );
    }

    #[test]
    fn digest_md5_is_server_first() {
        let registry = Registry::new();
        let mut mech = registry
            .start(MechanismKind::DigestMd5, &password_creds(), "example.com")
            .unwrap();
        assert_eq!(mech.initial().unwrap(), None);
    }

    #[test]
    fn anonymous_is_not_registered_by_default() {
        let registry = Registry::new();
        assert_eq!(
            registry.select(&advertised(&["ANONYMOUS"]), &Credentials::default()),
            None
        );
        let mut registry = Registry::empty();
        registry.register(MechanismKind::Anonymous);
        assert_eq!(
            registry.select(&advertised(&["ANONYMOUS"]), &Credentials::default()),
            Some(MechanismKind::Anonymous)
        );
    }

    #[test]
    fn mechanism_names_round_trip() {
        for kind in MechanismKind::ALL {
            assert_eq!(MechanismKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(MechanismKind::from_name("GSSAPI"), None);
    }
}
