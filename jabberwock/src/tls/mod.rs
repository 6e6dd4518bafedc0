//! TLS policy, trust roots, and DANE verification.

mod dane;
mod verify;
pub(crate) mod x509;

pub use dane::{match_tlsa, DaneVerifier, TlsaRecord};
pub use verify::verify_hostname;

use std::sync::Arc;

use tokio_rustls::rustls::client::WebPkiServerVerifier;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};

use crate::error::Error;

/// Whether and how the stream gets encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsPolicy {
    /// Abort if the server offers no TLS. The default.
    Required,
    /// Use TLS when offered, proceed in the clear otherwise.
    Opportunistic,
    /// Never negotiate TLS. For tests and localhost debugging only.
    Disabled,
}

/// Builds the trust root store from the enabled certificate sources.
pub(crate) fn root_store() -> Result<RootCertStore, Error> {
    let mut root_store = RootCertStore::empty();
    #[cfg(feature = "tls-webpki-roots")]
    {
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }
    #[cfg(feature = "rustls-native-certs")]
    {
        root_store.add_parsable_certificates(rustls_native_certs::load_native_certs()?);
    }
    Ok(root_store)
}

/// Stock PKIX client configuration.
pub(crate) fn client_config() -> Result<ClientConfig, Error> {
    Ok(ClientConfig::builder()
        .with_root_certificates(root_store()?)
        .with_no_client_auth())
}

/// Client configuration with certificate verification replaced by DANE.
pub(crate) fn dane_client_config(
    records: Vec<TlsaRecord>,
    hostname: String,
) -> Result<ClientConfig, Error> {
    // PKIX-EE records still need a chain verifier to delegate to; build
    // one unless the trust store is empty.
    let roots = root_store()?;
    let pkix = if roots.is_empty() {
        None
    } else {
        WebPkiServerVerifier::builder(Arc::new(roots)).build().ok()
    };
    let verifier = DaneVerifier::new(records, hostname, pkix);
    Ok(ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth())
}
