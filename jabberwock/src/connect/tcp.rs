//! TCP establishment across the resolved endpoint list.

use std::net::SocketAddr;
use std::time::Duration;

use futures::{future::select_ok, FutureExt};
use log::{debug, info};
use tokio::net::TcpStream;

use crate::connect::Endpoint;
use crate::error::{EndpointFailure, Error, ResolutionError};

/// Walks the endpoint list in order; within an endpoint, all addresses
/// are raced in parallel and the first to complete wins. Every failed
/// endpoint is recorded so the final error names each attempt.
pub async fn connect_endpoints(
    endpoints: &[Endpoint],
    timeout: Duration,
) -> Result<(TcpStream, Endpoint), Error> {
    let mut failures = Vec::new();
    for endpoint in endpoints {
        match connect_endpoint(endpoint, timeout).await {
            Ok(stream) => {
                info!("connected to {}", endpoint);
                return Ok((stream, endpoint.clone()));
            }
            Err(error) => {
                debug!("endpoint {} failed: {}", endpoint, error);
                failures.push(EndpointFailure {
                    host: endpoint.host.clone(),
                    port: endpoint.port,
                    error,
                });
            }
        }
    }
    Err(ResolutionError::AllEndpointsFailed(failures).into())
}

async fn connect_endpoint(endpoint: &Endpoint, timeout: Duration) -> Result<TcpStream, String> {
    if endpoint.addresses.is_empty() {
        return Err("no addresses".to_owned());
    }
    let race = select_ok(endpoint.addresses.iter().map(|&ip| {
        TcpStream::connect(SocketAddr::new(ip, endpoint.port)).boxed()
    }));
    match tokio::time::timeout(timeout, race).await {
        Ok(Ok((stream, _))) => Ok(stream),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("connect timed out after {:?}", timeout)),
    }
}
