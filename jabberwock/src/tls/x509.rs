//! Just enough DER to pull names and the SPKI out of a certificate.
//!
//! DANE matching and the DANE-EE hostname check need three things from
//! the end-entity certificate: the subjectAltName dNSNames, the subject
//! common names, and the raw subjectPublicKeyInfo bytes. Full X.509
//! validation stays with the TLS stack; this module never judges a
//! certificate, it only locates those fields.

use crate::error::TlsVerificationError;

/// id-ce-subjectAltName, 2.5.29.17
const OID_SUBJECT_ALT_NAME: &[u8] = &[0x55, 0x1D, 0x11];
/// id-at-commonName, 2.5.4.3
const OID_COMMON_NAME: &[u8] = &[0x55, 0x04, 0x03];

#[derive(Debug)]
pub struct ParsedCertificate<'a> {
    /// dNSName entries of the subjectAltName extension, in order
    pub san_dns_names: Vec<String>,
    /// CN attributes of the subject, used only when no SAN exists
    pub subject_common_names: Vec<String>,
    /// Complete subjectPublicKeyInfo, header included
    pub spki: &'a [u8],
}

struct Der<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Der<'a> {
    fn new(input: &'a [u8]) -> Der<'a> {
        Der { input, pos: 0 }
    }

    fn done(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn peek_tag(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn byte(&mut self) -> Result<u8, TlsVerificationError> {
        let b = self
            .input
            .get(self.pos)
            .copied()
            .ok_or_else(|| bad("truncated"))?;
        self.pos += 1;
        Ok(b)
    }

    fn length(&mut self) -> Result<usize, TlsVerificationError> {
        let first = self.byte()?;
        if first < 0x80 {
            return Ok(first as usize);
        }
        let count = (first & 0x7F) as usize;
        if count == 0 || count > 4 {
            return Err(bad("unsupported length encoding"));
        }
        let mut len = 0usize;
        for _ in 0..count {
            len = (len << 8) | self.byte()? as usize;
        }
        Ok(len)
    }

    /// Reads one TLV, returning (tag, value).
    fn tlv(&mut self) -> Result<(u8, &'a [u8]), TlsVerificationError> {
        let tag = self.byte()?;
        let len = self.length()?;
        let start = self.pos;
        let end = start.checked_add(len).ok_or_else(|| bad("length overflow"))?;
        if end > self.input.len() {
            return Err(bad("value extends past the buffer"));
        }
        self.pos = end;
        Ok((tag, &self.input[start..end]))
    }

    /// Reads one TLV and returns its full encoding, header included.
    fn raw_tlv(&mut self) -> Result<&'a [u8], TlsVerificationError> {
        let start = self.pos;
        self.tlv()?;
        Ok(&self.input[start..self.pos])
    }

    fn expect(&mut self, tag: u8) -> Result<&'a [u8], TlsVerificationError> {
        let (got, value) = self.tlv()?;
        if got != tag {
            return Err(bad("unexpected tag"));
        }
        Ok(value)
    }
}

fn bad(detail: &str) -> TlsVerificationError {
    TlsVerificationError::BadCertificate(detail.to_owned())
}

/// Extracts the fields DANE needs from a DER certificate.
pub fn parse(cert: &[u8]) -> Result<ParsedCertificate<'_>, TlsVerificationError> {
    let mut outer = Der::new(cert);
    let mut cert_seq = Der::new(outer.expect(0x30)?);
    let mut tbs = Der::new(cert_seq.expect(0x30)?);

    // version [0] EXPLICIT, optional
    if tbs.peek_tag() == Some(0xA0) {
        tbs.tlv()?;
    }
    // serialNumber
    tbs.expect(0x02)?;
    // signature AlgorithmIdentifier
    tbs.expect(0x30)?;
    // issuer
    tbs.expect(0x30)?;
    // validity
    tbs.expect(0x30)?;
    let subject = tbs.expect(0x30)?;
    let spki = tbs.raw_tlv()?;

    let mut san_dns_names = Vec::new();
    while !tbs.done() {
        let (tag, value) = tbs.tlv()?;
        // extensions [3] EXPLICIT
        if tag == 0xA3 {
            san_dns_names = parse_extensions(value)?;
        }
        // issuerUniqueID [1] / subjectUniqueID [2] are skipped
    }

    Ok(ParsedCertificate {
        san_dns_names,
        subject_common_names: parse_subject_common_names(subject)?,
        spki,
    })
}

/// Walks the Name structure (SEQUENCE of SET of AttributeTypeAndValue)
/// collecting CN values.
fn parse_subject_common_names(subject: &[u8]) -> Result<Vec<String>, TlsVerificationError> {
    let mut names = Vec::new();
    let mut rdns = Der::new(subject);
    while !rdns.done() {
        let mut set = Der::new(rdns.expect(0x31)?);
        while !set.done() {
            let mut atv = Der::new(set.expect(0x30)?);
            let oid = atv.expect(0x06)?;
            if atv.done() {
                return Err(bad("attribute without a value"));
            }
            let (_, value) = atv.tlv()?;
            if oid == OID_COMMON_NAME {
                if let Ok(s) = std::str::from_utf8(value) {
                    names.push(s.to_owned());
                }
            }
        }
    }
    Ok(names)
}

/// Finds the subjectAltName extension and collects its dNSNames.
fn parse_extensions(explicit: &[u8]) -> Result<Vec<String>, TlsVerificationError> {
    let mut wrapper = Der::new(explicit);
    let mut extensions = Der::new(wrapper.expect(0x30)?);
    while !extensions.done() {
        let mut extension = Der::new(extensions.expect(0x30)?);
        let oid = extension.expect(0x06)?;
        if extension.peek_tag() == Some(0x01) {
            // critical BOOLEAN
            extension.tlv()?;
        }
        let value = extension.expect(0x04)?;
        if oid == OID_SUBJECT_ALT_NAME {
            return parse_general_names(value);
        }
    }
    Ok(Vec::new())
}

fn parse_general_names(value: &[u8]) -> Result<Vec<String>, TlsVerificationError> {
    let mut names = Vec::new();
    let mut outer = Der::new(value);
    let mut general_names = Der::new(outer.expect(0x30)?);
    while !general_names.done() {
        let (tag, name) = general_names.tlv()?;
        // dNSName is [2] IMPLICIT IA5String
        if tag == 0x82 {
            if let Ok(s) = std::str::from_utf8(name) {
                names.push(s.to_owned());
            }
        }
    }
    Ok(names)
}


#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;

    #[test]
    fn extracts_san_names_and_spki() {
        let cert = fake_certificate(
            Some("fallback.example"),
            &["example.com", "*.example.com"],
            b"public-key-bytes",
        );
        let parsed = parse(&cert).unwrap();
        assert_eq!(parsed.san_dns_names, vec!["example.com", "*.example.com"]);
        assert_eq!(parsed.subject_common_names, vec!["fallback.example"]);
        // The SPKI slice includes its own SEQUENCE header.
        assert_eq!(parsed.spki, tlv(0x30, b"public-key-bytes").as_slice());
    }

    #[test]
    fn certificate_without_san_still_yields_cn() {
        let cert = fake_certificate(Some("example.org"), &[], b"k");
        let parsed = parse(&cert).unwrap();
        assert!(parsed.san_dns_names.is_empty());
        assert_eq!(parsed.subject_common_names, vec!["example.org"]);
    }

    #[test]
    fn truncated_input_is_rejected() {
        let cert = fake_certificate(Some("x"), &["example.com"], b"k");
        let err = parse(&cert[..cert.len() / 2]).unwrap_err();
        assert!(matches!(err, TlsVerificationError::BadCertificate(_)));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse(&[0xFF, 0x10, 0x00]).is_err());
        assert!(parse(&[]).is_err());
    }

    #[test]
    fn long_form_lengths_are_handled() {
        // A SAN list long enough to force 0x81/0x82 length encodings.
        let many: Vec<String> = (0..40).map(|i| format!("host{}.example.com", i)).collect();
        let refs: Vec<&str> = many.iter().map(String::as_str).collect();
        let cert = fake_certificate(None, &refs, b"k");
        let parsed = parse(&cert).unwrap();
        assert_eq!(parsed.san_dns_names.len(), 40);
        assert_eq!(parsed.san_dns_names[39], "host39.example.com");
    }
}
