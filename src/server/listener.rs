use crate::error::Error;
use mio::net::{TcpListener, TcpStream};
use std::io;
use std::net::SocketAddr;
use tracing::info;

/// Passive, non-blocking socket that new connections are accepted from.
pub(crate) struct Listener {
    inner: TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    /// Binds and starts listening. `SO_REUSEADDR` is enabled on Unix so a
    /// restart does not trip over a port in `TIME_WAIT`.
    pub fn bind(addr: SocketAddr) -> Result<Self, Error> {
        let inner = TcpListener::bind(addr).map_err(|source| Error::Bind { addr, source })?;
        let local_addr = inner.local_addr()?;
        info!(%local_addr, "Listening for connections");
        Ok(Self { inner, local_addr })
    }

    /// Accepts one pending connection, or fails with `WouldBlock`.
    pub fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.inner.accept()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn source(&mut self) -> &mut TcpListener {
        &mut self.inner
    }
}
