use mio::Waker;
use std::sync::{
    mpsc::{channel, Sender},
    Arc,
};
use std::thread::{self, ThreadId};
use tracing::{debug, warn};

// Internal request type for cross-thread communication
#[derive(Debug)]
pub(crate) enum ControlRequest {
    Broadcast { data: Vec<u8> },
    SendTo { id: usize, data: Vec<u8> },
    Close { id: usize },
    OpenConnections { response: Sender<Vec<usize>> },
    Stop,
}

/// Thread-safe handle for reaching a running [`Server`](crate::Server).
///
/// Obtain one from [`ServerHandle::interface()`](crate::ServerHandle::interface).
/// Clones are cheap and can be moved to any thread. Requests are queued and
/// the server's poll is woken to carry them out on its worker thread; once the
/// server has stopped they are silently dropped.
#[derive(Debug, Clone)]
pub struct ServerInterface {
    pub(crate) sender: Sender<ControlRequest>,
    pub(crate) waker: Arc<Waker>,
    /// The server's worker thread, which must never wait on itself.
    pub(crate) worker: ThreadId,
}

impl ServerInterface {
    /// Queues `message` as a frame to every connection that has completed its
    /// handshake and is not closing.
    pub fn broadcast(&self, message: impl Into<Vec<u8>>) {
        self.request(ControlRequest::Broadcast {
            data: message.into(),
        });
    }

    /// Queues `message` as a frame to one connection. Unknown ids are ignored,
    /// because the connection might have been closed already.
    pub fn send_to(&self, id: usize, message: impl Into<Vec<u8>>) {
        self.request(ControlRequest::SendTo {
            id,
            data: message.into(),
        });
    }

    /// Sends the close marker to a connection after its queued frames, then
    /// closes it.
    pub fn close(&self, id: usize) {
        self.request(ControlRequest::Close { id });
    }

    /// Ids of the connections currently open for messages.
    ///
    /// Blocks until the worker thread answers. Returns an empty list if the
    /// server is not running, or when called from a [`MessageHandler`]
    /// callback, where the worker cannot answer its own request.
    ///
    /// [`MessageHandler`]: crate::MessageHandler
    pub fn open_connections(&self) -> Vec<usize> {
        if thread::current().id() == self.worker {
            warn!("open_connections() called on the server thread, returning no ids");
            return Vec::new();
        }
        let (tx, rx) = channel();
        if !self.request(ControlRequest::OpenConnections { response: tx }) {
            return Vec::new();
        }
        rx.recv().unwrap_or_default()
    }

    pub(crate) fn stop(&self) -> bool {
        self.request(ControlRequest::Stop)
    }

    fn request(&self, request: ControlRequest) -> bool {
        if self.sender.send(request).is_err() {
            debug!("Server is not running, dropping request");
            return false;
        }
        if let Err(err) = self.waker.wake() {
            debug!(?err, "Failed to wake server loop");
            return false;
        }
        true
    }
}
