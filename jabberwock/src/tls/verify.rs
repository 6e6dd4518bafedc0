//! RFC 6125 hostname checks for the DANE-EE path.
//!
//! The default PKIX path lets the TLS stack verify names; this check
//! only runs when a DANE-EE TLSA record pins the certificate and the
//! chain is not consulted at all.

use crate::error::TlsVerificationError;
use crate::tls::x509::ParsedCertificate;

/// Checks that the certificate covers `expected`.
///
/// SAN dNSNames are authoritative; the subject CN is consulted only
/// when the certificate carries no SAN at all. A wildcard is honored in
/// the leftmost label only and matches exactly one label.
pub fn verify_hostname(
    cert: &ParsedCertificate<'_>,
    expected: &str,
) -> Result<(), TlsVerificationError> {
    let names: &[String] = if cert.san_dns_names.is_empty() {
        &cert.subject_common_names
    } else {
        &cert.san_dns_names
    };
    let expected_normalized = expected.trim_end_matches('.');
    if names
        .iter()
        .any(|name| name_matches(name, expected_normalized))
    {
        return Ok(());
    }
    Err(TlsVerificationError::HostnameMismatch {
        expected: expected.to_owned(),
        presented: names.to_vec(),
    })
}

fn name_matches(pattern: &str, hostname: &str) -> bool {
    let pattern = pattern.trim_end_matches('.');
    if let Some(suffix) = pattern.strip_prefix("*.") {
        // The wildcard stands for exactly one label.
        match hostname.split_once('.') {
            Some((label, rest)) => !label.is_empty() && rest.eq_ignore_ascii_case(suffix),
            None => false,
        }
    } else {
        pattern.eq_ignore_ascii_case(hostname)
    }
}
