use super::connection::Connection;
use std::net::SocketAddr;

/// Application callbacks, invoked on the server's worker thread.
///
/// Callbacks run inside the event loop, so they should return quickly. Use
/// the [`Peer`] to answer the connection that sent the message, or a
/// [`ServerInterface`](crate::ServerInterface) to reach other connections
/// from elsewhere.
///
/// Any `FnMut(&mut Peer, &[u8])` closure is a handler that only cares about
/// messages.
pub trait MessageHandler: Send + 'static {
    /// A complete frame arrived. `payload` has the frame markers stripped.
    fn message_received(&mut self, peer: &mut Peer<'_>, payload: &[u8]);

    /// The upgrade handshake completed and its response is queued.
    fn connection_opened(&mut self, _peer: &mut Peer<'_>) {}

    /// A connection that had completed the handshake was closed.
    fn connection_closed(&mut self, _id: usize) {}
}

impl<F> MessageHandler for F
where
    F: FnMut(&mut Peer<'_>, &[u8]) + Send + 'static,
{
    fn message_received(&mut self, peer: &mut Peer<'_>, payload: &[u8]) {
        self(peer, payload)
    }
}

/// The connection a callback is running for.
pub struct Peer<'a> {
    conn: &'a mut Connection,
}

impl<'a> Peer<'a> {
    pub(crate) fn new(conn: &'a mut Connection) -> Self {
        Self { conn }
    }

    pub fn id(&self) -> usize {
        self.conn.id()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.conn.peer_addr()
    }

    /// Whether the connection is TLS-wrapped (`wss`).
    pub fn is_secure(&self) -> bool {
        self.conn.is_secure()
    }

    /// Queues `payload` as one frame to this connection.
    pub fn send(&mut self, payload: impl AsRef<[u8]>) {
        self.conn.queue_send(payload.as_ref());
    }

    /// Sends the close marker once queued frames are out, then closes.
    /// Frames that arrive afterwards are not delivered.
    pub fn close(&mut self) {
        self.conn.close_gracefully();
    }
}
