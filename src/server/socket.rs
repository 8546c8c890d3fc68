//! Plain and TLS-wrapped client sockets behind one interface.
//!
//! Both flavours are non-blocking. `read` and `write` follow `std::io`
//! conventions: `Ok(0)` from `read` is end of stream and
//! [`ErrorKind::WouldBlock`] means try again on the next readiness event.

use mio::net::TcpStream;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr};

pub(crate) trait Socket: Send {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes as much of `buf` as the socket accepts right now.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Pushes out bytes buffered below the application layer.
    fn flush_pending(&mut self) -> io::Result<()>;

    /// Whether bytes are buffered below the application layer.
    fn wants_write(&self) -> bool;

    fn is_secure(&self) -> bool;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// The underlying stream, for readiness registration.
    fn source(&mut self) -> &mut TcpStream;

    fn close(&mut self);
}

// ============================================================================
// Plain TCP
// ============================================================================

pub(crate) struct PlainSocket {
    stream: TcpStream,
}

impl PlainSocket {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }
}

impl Socket for PlainSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush_pending(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn wants_write(&self) -> bool {
        false
    }

    fn is_secure(&self) -> bool {
        false
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    fn source(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    fn close(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

// ============================================================================
// TLS
// ============================================================================

#[cfg(feature = "tls")]
pub(crate) struct TlsSocket {
    stream: TcpStream,
    conn: rustls::ServerConnection,
}

#[cfg(feature = "tls")]
impl TlsSocket {
    /// Wraps an accepted stream. On failure the stream is dropped, which
    /// closes it.
    pub fn new(
        stream: TcpStream,
        config: std::sync::Arc<rustls::ServerConfig>,
    ) -> Result<Self, rustls::Error> {
        let conn = rustls::ServerConnection::new(config)?;
        Ok(Self { stream, conn })
    }
}

#[cfg(feature = "tls")]
impl Socket for TlsSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            // Serve decrypted data before touching the socket again
            match self.conn.reader().read(buf) {
                Ok(sz) => return Ok(sz),
                Err(err) if err.kind() == ErrorKind::WouldBlock => {}
                Err(err) => return Err(err),
            }

            match self.conn.read_tls(&mut self.stream) {
                Ok(0) => return Ok(0),
                Ok(_) => {
                    if let Err(err) = self.conn.process_new_packets() {
                        // Try to get the alert out before giving up
                        let _ = self.flush_pending();
                        return Err(io::Error::new(ErrorKind::InvalidData, err));
                    }
                    // Handshake messages may be waiting to go out
                    match self.flush_pending() {
                        Ok(()) => {}
                        Err(err) if err.kind() == ErrorKind::WouldBlock => {}
                        Err(err) => return Err(err),
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let sz = self.conn.writer().write(buf)?;
        match self.flush_pending() {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::WouldBlock => {}
            Err(err) => return Err(err),
        }
        if sz == 0 && !buf.is_empty() {
            return Err(ErrorKind::WouldBlock.into());
        }
        Ok(sz)
    }

    fn flush_pending(&mut self) -> io::Result<()> {
        while self.conn.wants_write() {
            if self.conn.write_tls(&mut self.stream)? == 0 {
                break;
            }
        }
        Ok(())
    }

    fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    fn is_secure(&self) -> bool {
        true
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    fn source(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    fn close(&mut self) {
        self.conn.send_close_notify();
        let _ = self.flush_pending();
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}
