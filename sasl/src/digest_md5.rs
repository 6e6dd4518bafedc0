//! DIGEST-MD5 client (RFC 2831). Obsolete but still advertised by a lot of
//! deployed servers; only the `auth` qop is implemented, which is all XMPP
//! ever uses.

use md5::{Digest, Md5};

use crate::error::MechanismError;
use crate::Credentials;

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn md5(data: &[u8]) -> Vec<u8> {
    Md5::digest(data).to_vec()
}

/// Parses a digest-challenge: comma-separated `key=value` pairs where the
/// value may be a quoted string with backslash escapes.
fn parse_challenge(input: &str) -> Result<Vec<(String, String)>, MechanismError> {
    let mut pairs = Vec::new();
    let mut chars = input.chars().peekable();
    loop {
        while matches!(chars.peek(), Some(' ' | '\t' | ',')) {
            chars.next();
        }
        if chars.peek().is_none() {
            return Ok(pairs);
        }
        let mut key = String::new();
        for c in chars.by_ref() {
            if c == '=' {
                break;
            }
            key.push(c);
        }
        if key.is_empty() {
            return Err(MechanismError::InvalidChallenge(
                "empty attribute name".to_owned(),
            ));
        }
        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            loop {
                match chars.next() {
                    Some('\\') => match chars.next() {
                        Some(c) => value.push(c),
                        None => {
                            return Err(MechanismError::InvalidChallenge(
                                "unterminated escape".to_owned(),
                            ))
                        }
                    },
                    Some('"') => break,
                    Some(c) => value.push(c),
                    None => {
                        return Err(MechanismError::InvalidChallenge(
                            "unterminated quoted value".to_owned(),
                        ))
                    }
                }
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c == ',' {
                    break;
                }
                value.push(c);
                chars.next();
            }
        }
        pairs.push((key, value));
    }
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

enum State {
    Fresh,
    SentResponse { rspauth: String },
    Complete,
}

pub struct DigestMd5Client {
    username: String,
    password: String,
    authzid: Option<String>,
    digest_uri: String,
    cnonce: String,
    state: State,
}

impl DigestMd5Client {
    pub(crate) fn new(
        creds: &Credentials,
        digest_uri: String,
        cnonce: String,
    ) -> Result<DigestMd5Client, MechanismError> {
        let password = creds.password.clone().ok_or(MechanismError::NoPassword)?;
        Ok(DigestMd5Client {
            username: creds.authcid.clone(),
            password,
            authzid: creds.authzid.clone(),
            digest_uri,
            cnonce,
            state: State::Fresh,
        })
    }

    pub(crate) fn respond(&mut self, challenge: &[u8]) -> Result<Vec<u8>, MechanismError> {
        let challenge = std::str::from_utf8(challenge)?;
        match &self.state {
            State::Fresh => self.first_response(challenge),
            State::SentResponse { rspauth } => {
                let pairs = parse_challenge(challenge)?;
                let got = pairs
                    .iter()
                    .find(|(k, _)| k == "rspauth")
                    .map(|(_, v)| v.as_str())
                    .ok_or(MechanismError::MissingAttribute("rspauth"))?;
                if got != rspauth {
                    return Err(MechanismError::RspauthMismatch);
                }
                self.state = State::Complete;
                Ok(Vec::new())
            }
            State::Complete => Err(MechanismError::ExchangeAlreadyComplete),
        }
    }

    pub(crate) fn verify_success(&mut self, data: &[u8]) -> Result<(), MechanismError> {
        match &self.state {
            State::Complete => Ok(()),
            State::SentResponse { rspauth } => {
                // Some servers put the rspauth into the success payload
                // instead of a final empty challenge.
                let data = std::str::from_utf8(data)?;
                let pairs = parse_challenge(data)?;
                match pairs.iter().find(|(k, _)| k == "rspauth") {
                    Some((_, got)) if got == rspauth => {
                        self.state = State::Complete;
                        Ok(())
                    }
                    _ => Err(MechanismError::RspauthMismatch),
                }
            }
            State::Fresh => Err(MechanismError::InvalidChallenge(
                "success before any challenge".to_owned(),
            )),
        }
    }

    fn first_response(&mut self, challenge: &str) -> Result<Vec<u8>, MechanismError> {
        let pairs = parse_challenge(challenge)?;
        let get = |key: &str| {
            pairs
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        };
        let nonce = get("nonce").ok_or(MechanismError::MissingAttribute("nonce"))?;
        let realm = get("realm").unwrap_or("");
        if let Some(algorithm) = get("algorithm") {
            if algorithm != "md5-sess" {
                return Err(MechanismError::InvalidChallenge(format!(
                    "unknown algorithm {algorithm:?}"
                )));
            }
        }
        let qop = get("qop").unwrap_or("auth");
        if !qop.split(',').map(str::trim).any(|q| q == "auth") {
            return Err(MechanismError::UnsupportedQop(qop.to_owned()));
        }

        let nc = "00000001";
        let response = self.digest(realm, nonce, nc, "AUTHENTICATE");
        let rspauth = self.digest(realm, nonce, nc, "");

        let mut out = format!(
            "username={},realm={},nonce={},cnonce={},nc={},qop=auth,digest-uri={},response={},charset=utf-8",
            quote(&self.username),
            quote(realm),
            quote(nonce),
            quote(&self.cnonce),
            nc,
            quote(&self.digest_uri),
            response,
        );
        if let Some(authzid) = &self.authzid {
            out.push_str(&format!(",authzid={}", quote(authzid)));
        }
        self.state = State::SentResponse { rspauth };
        Ok(out.into_bytes())
    }

    /// RFC 2831 §2.1.2.1. `method` is "AUTHENTICATE" for the client
    /// response and empty for the server's rspauth.
    fn digest(&self, realm: &str, nonce: &str, nc: &str, method: &str) -> String {
        let mut a1 = md5(
            format!("{}:{}:{}", self.username, realm, self.password).as_bytes(),
        );
        a1.extend_from_slice(format!(":{}:{}", nonce, self.cnonce).as_bytes());
        if let Some(authzid) = &self.authzid {
            a1.extend_from_slice(format!(":{authzid}").as_bytes());
        }
        let ha1 = hex(&md5(&a1));
        let ha2 = hex(&md5(format!("{}:{}", method, self.digest_uri).as_bytes()));
        hex(&md5(
            format!("{ha1}:{nonce}:{nc}:{}:auth:{ha2}", self.cnonce).as_bytes(),
        ))
    }
}
