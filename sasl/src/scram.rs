//! SCRAM-SHA-1 and SCRAM-SHA-256 clients (RFC 5802, RFC 7677), with the
//! `-PLUS` channel-bound variants.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use sha1::{Digest, Sha1};
use sha2::Sha256;

use crate::error::MechanismError;
use crate::{ChannelBinding, Credentials, Normalizer};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ScramAlgo {
    Sha1,
    Sha256,
}

impl ScramAlgo {
    fn h(self, data: &[u8]) -> Vec<u8> {
        match self {
            ScramAlgo::Sha1 => Sha1::digest(data).to_vec(),
            ScramAlgo::Sha256 => Sha256::digest(data).to_vec(),
        }
    }

    fn hmac(self, key: &[u8], data: &[u8]) -> Result<Vec<u8>, MechanismError> {
        match self {
            ScramAlgo::Sha1 => {
                let mut mac = Hmac::<Sha1>::new_from_slice(key)?;
                mac.update(data);
                Ok(mac.finalize().into_bytes().to_vec())
            }
            ScramAlgo::Sha256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(key)?;
                mac.update(data);
                Ok(mac.finalize().into_bytes().to_vec())
            }
        }
    }

    fn hi(self, password: &[u8], salt: &[u8], iterations: u32) -> Result<Vec<u8>, MechanismError> {
        match self {
            ScramAlgo::Sha1 => {
                let mut out = vec![0u8; 20];
                pbkdf2::pbkdf2::<Hmac<Sha1>>(password, salt, iterations, &mut out)?;
                Ok(out)
            }
            ScramAlgo::Sha256 => {
                let mut out = vec![0u8; 32];
                pbkdf2::pbkdf2::<Hmac<Sha256>>(password, salt, iterations, &mut out)?;
                Ok(out)
            }
        }
    }
}

/// `saslname` escaping: `,` and `=` are not allowed verbatim.
fn escape_saslname(name: &str) -> String {
    name.replace('=', "=3D").replace(',', "=2C")
}

fn xor(lhs: &[u8], rhs: &[u8]) -> Vec<u8> {
    lhs.iter().zip(rhs.iter()).map(|(a, b)| a ^ b).collect()
}

/// Splits `key=value,key=value` SCRAM message attributes. Values may
/// themselves contain `=` (base64), so only the first `=` counts.
fn parse_attrs(message: &str) -> Vec<(&str, &str)> {
    message
        .split(',')
        .filter_map(|part| part.split_once('='))
        .collect()
}

fn attr<'a>(attrs: &[(&str, &'a str)], key: &'static str) -> Result<&'a str, MechanismError> {
    attrs
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, v)| *v)
        .ok_or(MechanismError::MissingAttribute(key))
}

enum State {
    Fresh,
    SentClientFirst { client_first_bare: String },
    SentClientFinal { server_signature: Vec<u8> },
    Complete,
}

pub struct ScramClient {
    algo: ScramAlgo,
    username: String,
    password: String,
    gs2_header: String,
    binding_data: Vec<u8>,
    cnonce: String,
    state: State,
}

impl std::fmt::Debug for ScramClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScramClient")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl ScramClient {
    /// `plus` selects the channel-bound variant; without it, available
    /// binding data still downgrades the gs2 flag to `y` so a server
    /// stripping `-PLUS` from its mechanism list gets caught.
    pub(crate) fn new(
        algo: ScramAlgo,
        plus: bool,
        creds: &Credentials,
        normalize: Normalizer,
        cnonce: String,
    ) -> Result<ScramClient, MechanismError> {
        let password = creds.password.as_deref().ok_or(MechanismError::NoPassword)?;
        let flag = if plus {
            match creds.channel_binding {
                ChannelBinding::None => {
                    let name = match algo {
                        ScramAlgo::Sha1 => "SCRAM-SHA-1-PLUS",
                        ScramAlgo::Sha256 => "SCRAM-SHA-256-PLUS",
                    };
                    return Err(MechanismError::ChannelBindingRequired(name));
                }
                _ => creds.channel_binding.gs2_flag(),
            }
        } else if creds.channel_binding == ChannelBinding::None {
            "n"
        } else {
            "y"
        };
        let gs2_header = match &creds.authzid {
            Some(authzid) => format!("{},a={},", flag, escape_saslname(authzid)),
            None => format!("{},,", flag),
        };
        // cbind-data is only part of the proof for the p= flag.
        let binding_data = if plus {
            creds.channel_binding.data().to_vec()
        } else {
            Vec::new()
        };
        Ok(ScramClient {
            algo,
            username: escape_saslname(&normalize(&creds.authcid)),
            password: normalize(password),
            gs2_header,
            binding_data,
            cnonce,
            state: State::Fresh,
        })
    }

    pub(crate) fn initial(&mut self) -> Vec<u8> {
        let client_first_bare = format!("n={},r={}", self.username, self.cnonce);
        let message = format!("{}{}", self.gs2_header, client_first_bare);
        self.state = State::SentClientFirst { client_first_bare };
        message.into_bytes()
    }

    pub(crate) fn respond(&mut self, challenge: &[u8]) -> Result<Vec<u8>, MechanismError> {
        let challenge = std::str::from_utf8(challenge)?;
        match std::mem::replace(&mut self.state, State::Complete) {
            State::SentClientFirst { client_first_bare } => {
                let attrs = parse_attrs(challenge);
                if let Ok(error) = attr(&attrs, "e") {
                    return Err(MechanismError::InvalidChallenge(format!(
                        "server error: {error}"
                    )));
                }
                let nonce = attr(&attrs, "r")?;
                if !nonce.starts_with(&self.cnonce) || nonce.len() <= self.cnonce.len() {
                    return Err(MechanismError::InvalidChallenge(
                        "server nonce does not extend ours".to_owned(),
                    ));
                }
                let salt = BASE64.decode(attr(&attrs, "s")?)?;
                let iterations: u32 = attr(&attrs, "i")?.parse().map_err(|_| {
                    MechanismError::InvalidChallenge("iteration count is not a number".to_owned())
                })?;

                let mut cbind_input = self.gs2_header.clone().into_bytes();
                cbind_input.extend_from_slice(&self.binding_data);
                let client_final_bare =
                    format!("c={},r={}", BASE64.encode(&cbind_input), nonce);

                let salted = self.algo.hi(self.password.as_bytes(), &salt, iterations)?;
                let client_key = self.algo.hmac(&salted, b"Client Key")?;
                let stored_key = self.algo.h(&client_key);
                let auth_message =
                    format!("{client_first_bare},{challenge},{client_final_bare}");
                let client_signature =
                    self.algo.hmac(&stored_key, auth_message.as_bytes())?;
                let proof = xor(&client_key, &client_signature);

                let server_key = self.algo.hmac(&salted, b"Server Key")?;
                let server_signature = self.algo.hmac(&server_key, auth_message.as_bytes())?;
                self.state = State::SentClientFinal { server_signature };

                Ok(format!("{},p={}", client_final_bare, BASE64.encode(&proof)).into_bytes())
            }
            // Some servers carry the server-final message in one more
            // challenge instead of in the success payload.
            state @ State::SentClientFinal { .. } => {
                self.state = state;
                self.check_server_final(challenge.as_bytes())?;
                Ok(Vec::new())
            }
            State::Fresh => Err(MechanismError::InvalidChallenge(
                "challenge before the initial response".to_owned(),
            )),
            State::Complete => Err(MechanismError::ExchangeAlreadyComplete),
        }
    }

    pub(crate) fn verify_success(&mut self, data: &[u8]) -> Result<(), MechanismError> {
        match self.state {
            State::Complete => Ok(()),
            State::SentClientFinal { .. } => self.check_server_final(data),
            _ => Err(MechanismError::InvalidChallenge(
                "success before the exchange finished".to_owned(),
            )),
        }
    }

    fn check_server_final(&mut self, data: &[u8]) -> Result<(), MechanismError> {
        let expected = match &self.state {
            State::SentClientFinal { server_signature } => server_signature.clone(),
            _ => return Err(MechanismError::ExchangeAlreadyComplete),
        };
        let data = std::str::from_utf8(data)?;
        let attrs = parse_attrs(data);
        if let Ok(error) = attr(&attrs, "e") {
            return Err(MechanismError::InvalidChallenge(format!(
                "server error: {error}"
            )));
        }
        let verifier = BASE64.decode(attr(&attrs, "v")?)?;
        if verifier != expected {
            return Err(MechanismError::ServerSignatureMismatch);
        }
        self.state = State::Complete;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity_normalizer;

    fn creds(password: &str) -> Credentials {
        Credentials::default()
            .with_username("user")
            .with_password(password)
    }

    // RFC 5802 §5, the "pencil" exchange.
    #[test]
    fn rfc5802_sha1_vector() {
        let mut client = ScramClient::new(
            ScramAlgo::Sha1,
            false,
            &creds("pencil"),
            identity_normalizer,
            "fyko+d2lbbFgONRv9qkxdawL".to_owned(),
        )
        .unwrap();
        assert_eq!(
            client.initial(),
            b"n,,n=user,r=fyko+d2lbbFgONRv9qkxdawL".to_vec()
        );
        let response = client
            .respond(
                b"r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,s=QSXCR+Q6sek8bf92,i=4096",
            )
            .unwrap();
        assert_eq!(
            String::from_utf8(response).unwrap(),
            "c=biws,r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,\
             p=v0X8v3Bz2T0CJGbJQyF0X+HI4Ts="
        );
        client
            .verify_success(b"v=rmF9pqV8S7suAoZWja4dJRkFsKQ=")
            .unwrap();
    }

    // RFC 7677 §3.
    #[test]
    fn rfc7677_sha256_vector() {
        let mut client = ScramClient::new(
            ScramAlgo::Sha256,
            false,
            &creds("pencil"),
            identity_normalizer,
            "rOprNGfwEbeRWgbNEkqO".to_owned(),
        )
        .unwrap();
        assert_eq!(
            client.initial(),
            b"n,,n=user,r=rOprNGfwEbeRWgbNEkqO".to_vec()
        );
        let response = client
            .respond(
                b"r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,\
s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096",
            )
            .unwrap();
        assert_eq!(
            String::from_utf8(response).unwrap(),
            "c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,\
             p=dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ="
        );
        client
            .verify_success(b"v=6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4=")
            .unwrap();
    }

    #[test]
    fn rejects_wrong_server_signature() {
        let mut client = ScramClient::new(
            ScramAlgo::Sha1,
            false,
            &creds("pencil"),
            identity_normalizer,
            "fyko+d2lbbFgONRv9qkxdawL".to_owned(),
        )
        .unwrap();
        let _ = client.initial();
        let _ = client
            .respond(
                b"r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,s=QSXCR+Q6sek8bf92,i=4096",
            )
            .unwrap();
        assert!(matches!(
            client.verify_success(b"v=cm1GOXBxVjhTN3N1QW9aV2phNGRKUg=="),
            Err(MechanismError::ServerSignatureMismatch)
        ));
    }

    #[test]
    fn rejects_server_nonce_that_drops_ours() {
        let mut client = ScramClient::new(
            ScramAlgo::Sha1,
            false,
            &creds("pencil"),
            identity_normalizer,
            "abcdef".to_owned(),
        )
        .unwrap();
        let _ = client.initial();
        let err = client
            .respond(b"r=zzzzzz12345,s=QSXCR+Q6sek8bf92,i=4096")
            .unwrap_err();
        assert!(matches!(err, MechanismError::InvalidChallenge(_)));
    }

    #[test]
    fn plus_variant_requires_binding_data() {
        let err = ScramClient::new(
            ScramAlgo::Sha256,
            true,
            &creds("pencil"),
            identity_normalizer,
            "abcdef".to_owned(),
        )
        .unwrap_err();
        assert!(matches!(err, MechanismError::ChannelBindingRequired(_)));
    }

    #[test]
    fn plus_variant_binds_exporter_data_into_proof() {
        let creds = creds("pencil").with_channel_binding(ChannelBinding::TlsExporter(vec![
            0xde, 0xad, 0xbe, 0xef,
        ]));
        let mut client = ScramClient::new(
            ScramAlgo::Sha256,
            true,
            &creds,
            identity_normalizer,
            "rOprNGfwEbeRWgbNEkqO".to_owned(),
        )
        .unwrap();
        let first = String::from_utf8(client.initial()).unwrap();
        assert!(first.starts_with("p=tls-exporter,,"), "{first}");
        let response = client
            .respond(
                b"r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,\
s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096",
            )
            .unwrap();
        let response = String::from_utf8(response).unwrap();
        // c= carries gs2 header plus the binding bytes.
        let expected_c = BASE64.encode(b"p=tls-exporter,,\xde\xad\xbe\xef");
        assert!(response.starts_with(&format!("c={expected_c},")), "{response}");
    }

    #[test]
    fn usernames_are_escaped() {
        assert_eq!(escape_saslname("a=b,c"), "a=3Db=2Cc");
    }
}
