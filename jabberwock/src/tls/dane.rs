//! DANE (RFC 6698/7672) certificate pinning via TLSA records.

use std::sync::Arc;

use log::{debug, warn};
use sha2::{Digest, Sha256, Sha512};
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::client::WebPkiServerVerifier;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{DigitallySignedStruct, Error as RustlsError, SignatureScheme};

use crate::error::TlsVerificationError;
use crate::tls::{verify, x509};

/// One TLSA record, already DNSSEC-validated by the resolver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsaRecord {
    /// Certificate usage: only 1 (PKIX-EE) and 3 (DANE-EE) are acted on
    pub usage: u8,
    /// 0 = full certificate, 1 = SubjectPublicKeyInfo
    pub selector: u8,
    /// 0 = exact, 1 = SHA-256, 2 = SHA-512
    pub matching: u8,
    pub data: Vec<u8>,
}

impl TlsaRecord {
    fn usable(&self) -> bool {
        matches!(self.usage, 1 | 3)
            && matches!(self.selector, 0 | 1)
            && matches!(self.matching, 0 | 1 | 2)
    }
}

/// Checks one record against the end-entity certificate.
pub fn match_tlsa(record: &TlsaRecord, cert_der: &[u8], spki: &[u8]) -> bool {
    let content = match record.selector {
        0 => cert_der,
        1 => spki,
        _ => return false,
    };
    match record.matching {
        0 => record.data == content,
        1 => record.data == Sha256::digest(content).as_slice(),
        2 => record.data == Sha512::digest(content).as_slice(),
        _ => false,
    }
}

/// Certificate verifier driven by TLSA records.
///
/// DANE-EE (usage 3) accepts a pinned certificate outright, with our own
/// hostname check since the chain never gets consulted. PKIX-EE
/// (usage 1) pins the end entity but still demands a valid chain, which
/// is delegated to the stock webpki verifier. Usages 0 and 2 (CA
/// constraints) are not implemented and never satisfy verification on
/// their own.
#[derive(Debug)]
pub struct DaneVerifier {
    records: Vec<TlsaRecord>,
    hostname: String,
    pkix: Option<Arc<WebPkiServerVerifier>>,
}

impl DaneVerifier {
    pub fn new(
        records: Vec<TlsaRecord>,
        hostname: String,
        pkix: Option<Arc<WebPkiServerVerifier>>,
    ) -> DaneVerifier {
        for record in records.iter().filter(|r| !r.usable()) {
            warn!(
                "ignoring TLSA record with unsupported parameters {} {} {}",
                record.usage, record.selector, record.matching
            );
        }
        DaneVerifier {
            records,
            hostname,
            pkix,
        }
    }
}

fn verification_error(e: TlsVerificationError) -> RustlsError {
    RustlsError::General(e.to_string())
}

impl ServerCertVerifier for DaneVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, RustlsError> {
        let usable: Vec<&TlsaRecord> = self.records.iter().filter(|r| r.usable()).collect();
        if usable.is_empty() {
            return Err(verification_error(TlsVerificationError::TlsaUnavailable));
        }
        let parsed = x509::parse(end_entity.as_ref()).map_err(verification_error)?;
        for record in &usable {
            if !match_tlsa(record, end_entity.as_ref(), parsed.spki) {
                continue;
            }
            match record.usage {
                3 => {
                    verify::verify_hostname(&parsed, &self.hostname)
                        .map_err(verification_error)?;
                    debug!("certificate pinned by DANE-EE TLSA record");
                    return Ok(ServerCertVerified::assertion());
                }
                1 => {
                    let pkix = self.pkix.as_ref().ok_or_else(|| {
                        verification_error(TlsVerificationError::TlsaUnavailable)
                    })?;
                    pkix.verify_server_cert(
                        end_entity,
                        intermediates,
                        server_name,
                        ocsp_response,
                        now,
                    )?;
                    debug!("certificate pinned by PKIX-EE TLSA record, chain verified");
                    return Ok(ServerCertVerified::assertion());
                }
                _ => unreachable!("filtered by usable()"),
            }
        }
        Err(verification_error(TlsVerificationError::NoTlsaMatch {
            records: usable.len(),
        }))
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        tokio_rustls::rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &tokio_rustls::rustls::crypto::ring::default_provider()
                .signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        tokio_rustls::rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &tokio_rustls::rustls::crypto::ring::default_provider()
                .signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        tokio_rustls::rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::x509::testutil::{fake_certificate, tlv};

    fn record(usage: u8, selector: u8, matching: u8, data: Vec<u8>) -> TlsaRecord {
        TlsaRecord {
            usage,
            selector,
            matching,
            data,
        }
    }

    fn cert_and_spki() -> (Vec<u8>, Vec<u8>) {
        let cert = fake_certificate(None, &["xmpp.example.com"], b"public-key");
        let spki = tlv(0x30, b"public-key");
        (cert, spki)
    }

    #[test]
    fn selector_and_matching_combinations() {
        let (cert, spki) = cert_and_spki();
        // 3 0 0: exact full certificate
        assert!(match_tlsa(&record(3, 0, 0, cert.clone()), &cert, &spki));
        // 3 1 1: SHA-256 of SPKI
        let digest = Sha256::digest(&spki).to_vec();
        assert!(match_tlsa(&record(3, 1, 1, digest), &cert, &spki));
        // 3 0 2: SHA-512 of full certificate
        let digest = Sha512::digest(&cert).to_vec();
        assert!(match_tlsa(&record(3, 0, 2, digest), &cert, &spki));
        // Wrong digest does not match
        assert!(!match_tlsa(
            &record(3, 1, 1, vec![0u8; 32]),
            &cert,
            &spki
        ));
    }

    fn verify(verifier: &DaneVerifier, cert: &[u8]) -> Result<ServerCertVerified, RustlsError> {
        verifier.verify_server_cert(
            &CertificateDer::from(cert.to_vec()),
            &[],
            &ServerName::try_from("xmpp.example.com").unwrap(),
            &[],
            UnixTime::now(),
        )
    }

    #[test]
    fn dane_ee_accepts_a_pinned_certificate() {
        let (cert, spki) = cert_and_spki();
        let digest = Sha256::digest(&spki).to_vec();
        let verifier = DaneVerifier::new(
            vec![record(3, 1, 1, digest)],
            "xmpp.example.com".to_owned(),
            None,
        );
        assert!(verify(&verifier, &cert).is_ok());
    }

    #[test]
    fn dane_ee_still_checks_the_hostname() {
        let (cert, spki) = cert_and_spki();
        let digest = Sha256::digest(&spki).to_vec();
        let verifier = DaneVerifier::new(
            vec![record(3, 1, 1, digest)],
            "other.example.com".to_owned(),
            None,
        );
        assert!(verify(&verifier, &cert).is_err());
    }

    #[test]
    fn unmatched_records_fail_closed() {
        let (cert, _) = cert_and_spki();
        let verifier = DaneVerifier::new(
            vec![record(3, 1, 1, vec![0u8; 32])],
            "xmpp.example.com".to_owned(),
            None,
        );
        assert!(verify(&verifier, &cert).is_err());
    }

    #[test]
    fn ca_constraint_usages_alone_fail_closed() {
        let (cert, spki) = cert_and_spki();
        let digest = Sha256::digest(&spki).to_vec();
        let verifier = DaneVerifier::new(
            vec![record(0, 1, 1, digest.clone()), record(2, 1, 1, digest)],
            "xmpp.example.com".to_owned(),
            None,
        );
        assert!(verify(&verifier, &cert).is_err());
    }
}
