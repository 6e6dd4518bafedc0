//! Host resolution and transport establishment.

pub mod dns;
mod starttls;
mod tcp;

pub use dns::{DnsConfig, DnssecMode, Endpoint, Resolver};

pub(crate) use starttls::{tls_connect, upgrade_starttls};
pub(crate) use tcp::connect_endpoints;

use tokio::io::{AsyncRead, AsyncWrite};

/// Object-safe transport bound, so TCP and TLS streams share one client
/// type.
pub trait AsyncReadAndWrite: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncReadAndWrite for T {}
