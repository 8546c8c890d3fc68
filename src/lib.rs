//! wsserver - a single-threaded server for the legacy challenge-response
//! WebSocket protocol
//!
//! One worker thread multiplexes the listener and every client over
//! [`mio`]. Each client performs the `Sec-WebSocket-Key1`/`Key2` upgrade
//! handshake, then exchanges `0x00 payload 0xFF` frames. Complete frames are
//! handed to a [`MessageHandler`]; replies and broadcasts are queued per
//! connection and written as the socket accepts them. TLS (`wss`) is
//! available behind the default `tls` feature.
//!
//! ```no_run
//! use wsserver::prelude::*;
//!
//! let server = Server::new(ServerConfig::default(), |peer: &mut Peer, payload: &[u8]| {
//!     peer.send(payload);
//! })?;
//! let handle = server.start()?;
//! println!("listening on {}", handle.local_addr());
//! handle.stop();
//! # Ok::<(), wsserver::Error>(())
//! ```

// Internal-only modules
pub(crate) mod error;
pub(crate) mod server;

pub mod config;
pub mod protocol;

// These are the intended public API
pub use config::{HandshakeFailurePolicy, ServerConfig};
pub use error::{Error, HandshakeError, KeyError};
pub use server::{MessageHandler, Peer, Server, ServerHandle, ServerInterface, ServerState};

/// Convenient re-exports of commonly used types.
pub mod prelude {
    pub use crate::config::{HandshakeFailurePolicy, ServerConfig};
    pub use crate::error::Error;
    pub use crate::server::{
        MessageHandler, Peer, Server, ServerHandle, ServerInterface, ServerState,
    };
}
