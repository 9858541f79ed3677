use log::{debug, info};
use std::io;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("failed to bind data endpoint {address}: {source}")]
pub struct BindError {
    /// The requested `host:port`, as configured.
    pub address: String,
    #[source]
    pub source: io::Error,
}

/// The worker's listening data-transport socket.
///
/// Owned by exactly one running worker and closed exactly once, either by
/// [`NetworkEndpoint::close`] or on drop.
#[derive(Debug)]
pub struct NetworkEndpoint {
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
}

/// Binds `host:port` without retrying: the usual causes (port contention,
/// firewalling) do not clear up on their own. Port `0` picks an ephemeral
/// port. Only the first resolved address is tried.
pub fn bind(host: &str, port: u16) -> Result<NetworkEndpoint, BindError> {
    let address = format!("{host}:{port}");
    let fail = |source: io::Error| BindError {
        address: address.clone(),
        source,
    };
    let target = (host, port)
        .to_socket_addrs()
        .map_err(fail)?
        .next()
        .ok_or_else(|| {
            fail(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "host resolved to no addresses",
            ))
        })?;
    let listener = TcpListener::bind(target).map_err(fail)?;
    let local_addr = listener.local_addr().map_err(fail)?;
    info!("event=data_endpoint_bound requested={address} local={local_addr}");
    Ok(NetworkEndpoint {
        listener: Some(listener),
        local_addr,
    })
}

impl NetworkEndpoint {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_open(&self) -> bool {
        self.listener.is_some()
    }

    /// The bound listener, for the external transport engine to accept on.
    pub fn listener(&self) -> Option<&TcpListener> {
        self.listener.as_ref()
    }

    /// Closes the socket. Returns `false` if it was already closed.
    pub fn close(&mut self) -> bool {
        match self.listener.take() {
            Some(listener) => {
                drop(listener);
                debug!("event=data_endpoint_closed local={}", self.local_addr);
                true
            }
            None => false,
        }
    }
}

impl Drop for NetworkEndpoint {
    fn drop(&mut self) {
        self.close();
    }
}
