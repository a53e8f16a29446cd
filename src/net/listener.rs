//! TCP listener binding.
//!
//! # Responsibilities
//! - Bind to the configured address and network family
//! - Report the resolved address (ephemeral ports included)
//! - Discover the primary outbound interface address
//!
//! # Design Decisions
//! - Binding happens synchronously in `init`, before any runtime work
//! - The std listener is converted to a Tokio one when serving starts

use std::net::{IpAddr, SocketAddr, TcpListener, ToSocketAddrs, UdpSocket};

use crate::config::ServerConfig;

/// Error type for listener operations.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    /// Failed to resolve the configured address.
    #[error("Failed to resolve {0}: no address for the configured network")]
    Resolve(String),
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    Bind(#[from] std::io::Error),
}

/// A bound, not yet serving, TCP listener.
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    /// Bind to `config.address()` honoring `config.network`.
    pub fn bind(config: &ServerConfig) -> Result<Self, ListenerError> {
        let address = config.address();
        let candidates: Vec<SocketAddr> = address
            .to_socket_addrs()?
            .filter(|addr| match config.network.as_str() {
                "tcp4" => addr.is_ipv4(),
                "tcp6" => addr.is_ipv6(),
                _ => true,
            })
            .collect();

        if candidates.is_empty() {
            return Err(ListenerError::Resolve(address));
        }

        let inner = TcpListener::bind(&candidates[..])?;
        inner.set_nonblocking(true)?;
        let local_addr = inner.local_addr()?;

        tracing::info!(
            address = %local_addr,
            network = %config.network,
            "Listener bound"
        );

        Ok(Self { inner, local_addr })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Hand the socket to Tokio. Requires a runtime; the socket closes when
    /// the returned listener is dropped.
    pub fn into_tokio(self) -> std::io::Result<tokio::net::TcpListener> {
        tokio::net::TcpListener::from_std(self.inner)
    }
}

/// Address of the interface used for outbound traffic.
///
/// Connecting a UDP socket sends no packets; it only selects a route.
pub fn local_main_ip() -> std::io::Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect("8.8.8.8:80")?;
    Ok(socket.local_addr()?.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ephemeral_port_is_resolved() {
        let config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..ServerConfig::default()
        };
        let listener = Listener::bind(&config).unwrap();
        assert_ne!(listener.local_addr().port(), 0);
        assert!(listener.local_addr().ip().is_loopback());
    }

    #[test]
    fn family_filter_rejects_mismatch() {
        let config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            network: "tcp6".into(),
            ..ServerConfig::default()
        };
        assert!(matches!(Listener::bind(&config), Err(ListenerError::Resolve(_))));
    }

    #[test]
    fn occupied_port_fails_to_bind() {
        let first = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let config = ServerConfig {
            host: "127.0.0.1".into(),
            port: first.local_addr().unwrap().port(),
            ..ServerConfig::default()
        };
        assert!(matches!(Listener::bind(&config), Err(ListenerError::Bind(_))));
    }
}
