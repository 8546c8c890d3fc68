//! Per-client state machine.
//!
//! A connection starts in the handshake phase, accumulating header bytes
//! until the upgrade request is complete, then switches to frame decoding.
//! Outbound data is queued here and drained by the server loop whenever the
//! socket is writable.

use super::handler::{MessageHandler, Peer};
use super::socket::Socket;
use crate::config::{HandshakeFailurePolicy, ServerConfig};
use crate::error::HandshakeError;
use crate::protocol::frame::{self, Frame, FrameDecoder, CLOSE_MARKER};
use crate::protocol::handshake::{
    parse_request_line, HandshakeRequest, Location, RequestLine, HEADER_TERMINATOR, KEY_BODY_LEN,
    POLICY_FILE_REQUEST, POLICY_FILE_RESPONSE,
};
use mio::net::TcpStream;
use mio::Interest;
use std::collections::VecDeque;
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// One entry of the outbound queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outbound {
    /// Bytes written verbatim.
    Data(Vec<u8>),
    /// Close the connection once everything queued before it is written.
    Close,
}

/// Outcome of [`Connection::flush`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlushStatus {
    /// The queue is empty.
    Drained,
    /// The socket stopped accepting bytes before the queue emptied.
    Pending,
    /// The close sentinel was reached.
    Close,
}

pub(crate) struct Connection {
    id: usize,
    socket: Box<dyn Socket>,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    config: Arc<ServerConfig>,
    pub(super) interest: Interest,

    /// Must be torn down now, without flushing.
    closing: bool,
    /// A close sentinel is queued; input is ignored.
    draining: bool,
    /// The upgrade request failed validation and the connection is parked.
    stalled: bool,
    handshaken: bool,
    path_checked: bool,

    /// Raw request bytes, only used before the handshake completes.
    header_buf: Vec<u8>,
    decoder: FrameDecoder,

    queue: VecDeque<Outbound>,
    /// Bytes of the front queue item already written.
    send_pos: usize,
}

// ============================================================================
// Constructors and Accessors
// ============================================================================

impl Connection {
    pub fn new(
        id: usize,
        socket: Box<dyn Socket>,
        peer_addr: SocketAddr,
        config: Arc<ServerConfig>,
    ) -> io::Result<Self> {
        let local_addr = socket.local_addr()?;
        Ok(Self {
            id,
            socket,
            peer_addr,
            local_addr,
            config,
            interest: Interest::READABLE,
            closing: false,
            draining: false,
            stalled: false,
            handshaken: false,
            path_checked: false,
            header_buf: Vec::new(),
            decoder: FrameDecoder::new(),
            queue: VecDeque::new(),
            send_pos: 0,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_secure(&self) -> bool {
        self.socket.is_secure()
    }

    pub fn is_handshaken(&self) -> bool {
        self.handshaken
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    /// Handshaken and not on its way out; the only state broadcasts reach.
    pub fn is_open(&self) -> bool {
        self.handshaken && !self.draining && !self.closing
    }

    pub fn source(&mut self) -> &mut TcpStream {
        self.socket.source()
    }

    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.read(buf)
    }

    /// Readiness the server loop should register for.
    pub fn desired_interest(&self) -> Interest {
        if !self.queue.is_empty() || self.socket.wants_write() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        }
    }

    pub fn close(&mut self) {
        self.socket.close();
        self.closing = true;
    }
}

// ============================================================================
// Inbound Data
// ============================================================================

impl Connection {
    /// Feeds bytes read from the socket through the handshake or the frame
    /// decoder, calling `handler` for every complete message.
    pub fn data_received(&mut self, data: &[u8], handler: &mut dyn MessageHandler) {
        if self.closing || self.draining {
            trace!(id = self.id, len = data.len(), "Ignoring data on closing connection");
            return;
        }
        if self.handshaken {
            self.frames_received(data, handler);
        } else {
            self.handshake_received(data, handler);
        }
    }

    fn handshake_received(&mut self, data: &[u8], handler: &mut dyn MessageHandler) {
        if self.stalled {
            trace!(id = self.id, len = data.len(), "Discarding data after failed handshake");
            return;
        }
        self.header_buf.extend_from_slice(data);

        if self.header_buf.starts_with(POLICY_FILE_REQUEST) {
            info!(id = self.id, peer_addr = %self.peer_addr, "Answering policy file request");
            self.header_buf.clear();
            self.enqueue(Outbound::Data(POLICY_FILE_RESPONSE.to_vec()));
            self.queue_close();
            return;
        }

        if !self.path_checked {
            match parse_request_line(&self.header_buf) {
                RequestLine::Incomplete => {}
                RequestLine::Get(path) if path == self.config.path => self.path_checked = true,
                RequestLine::Get(path) => {
                    warn!(id = self.id, peer_addr = %self.peer_addr, path, expected = %self.config.path, "Upgrade path mismatch");
                    self.closing = true;
                    return;
                }
                RequestLine::Invalid => {
                    warn!(id = self.id, peer_addr = %self.peer_addr, "Invalid GET request line");
                    self.closing = true;
                    return;
                }
                RequestLine::Other => {
                    debug!(id = self.id, "Request is not a GET, skipping path check");
                    self.path_checked = true;
                }
            }
        }

        let Some(head_end) = find(&self.header_buf, HEADER_TERMINATOR) else {
            if self.header_buf.len() > self.config.max_handshake_size {
                warn!(id = self.id, len = self.header_buf.len(), "Handshake header too large");
                self.closing = true;
            }
            return;
        };

        let head = String::from_utf8_lossy(&self.header_buf[..head_end]).into_owned();
        let request = match HandshakeRequest::parse(&head) {
            Ok(request) => request,
            Err(err) => {
                self.reject(err);
                return;
            }
        };

        let body_start = head_end + HEADER_TERMINATOR.len();
        let (key, rest_start) = if request.has_challenge() {
            if self.header_buf.len() < body_start + KEY_BODY_LEN {
                trace!(id = self.id, "Waiting for challenge key bytes");
                return;
            }
            let mut key = [0u8; KEY_BODY_LEN];
            key.copy_from_slice(&self.header_buf[body_start..body_start + KEY_BODY_LEN]);
            (Some(key), body_start + KEY_BODY_LEN)
        } else {
            (None, body_start)
        };

        let location = Location {
            scheme: self.config.scheme(),
            port: self.local_addr.port(),
            path: &self.config.path,
        };
        let response = request.response(&location, key.as_ref());
        self.enqueue(Outbound::Data(response));
        self.handshaken = true;
        info!(id = self.id, peer_addr = %self.peer_addr, host = %request.host, secure = self.is_secure(), "Handshake completed");

        let rest = std::mem::take(&mut self.header_buf).split_off(rest_start);
        handler.connection_opened(&mut Peer::new(self));
        if !rest.is_empty() {
            self.frames_received(&rest, handler);
        }
    }

    fn reject(&mut self, err: HandshakeError) {
        self.header_buf.clear();
        match self.config.handshake_failure_policy {
            HandshakeFailurePolicy::KeepPending => {
                warn!(id = self.id, peer_addr = %self.peer_addr, %err, "Handshake rejected, connection left pending");
                self.stalled = true;
            }
            HandshakeFailurePolicy::Close => {
                warn!(id = self.id, peer_addr = %self.peer_addr, %err, "Handshake rejected, closing");
                self.closing = true;
            }
        }
    }

    fn frames_received(&mut self, data: &[u8], handler: &mut dyn MessageHandler) {
        for frame in self.decoder.feed(data) {
            if self.draining || self.closing {
                break;
            }
            match frame {
                Frame::Message(payload) => {
                    debug!(id = self.id, len = payload.len(), "Received message");
                    handler.message_received(&mut Peer::new(self), &payload);
                }
                Frame::Close => {
                    info!(id = self.id, peer_addr = %self.peer_addr, "Peer requested close");
                    self.close_gracefully();
                }
            }
        }
    }
}

// ============================================================================
// Outbound Queue
// ============================================================================

impl Connection {
    /// Queues `payload` as one frame.
    pub fn queue_send(&mut self, payload: &[u8]) {
        if self.draining || self.closing {
            debug!(id = self.id, "Dropping message for closing connection");
            return;
        }
        self.enqueue(Outbound::Data(frame::encode(payload)));
    }

    /// Queues the close sentinel; nothing queued afterwards is sent.
    pub fn queue_close(&mut self) {
        if !self.draining {
            self.queue.push_back(Outbound::Close);
            self.draining = true;
        }
    }

    /// Queues the close marker pair (once handshaken) and the close sentinel.
    pub fn close_gracefully(&mut self) {
        if self.draining || self.closing {
            return;
        }
        if self.handshaken {
            self.enqueue(Outbound::Data(CLOSE_MARKER.to_vec()));
        }
        self.queue_close();
    }

    fn enqueue(&mut self, item: Outbound) {
        if let Some(limit) = self.config.max_queue_len {
            if self.queue.len() >= limit {
                warn!(id = self.id, limit, "Outbound queue full, dropping message");
                return;
            }
        }
        self.queue.push_back(item);
    }

    /// Writes queued items until the socket would block, the queue is empty
    /// or the close sentinel is reached. A partially written item resumes
    /// where it stopped on the next call.
    pub fn flush(&mut self) -> io::Result<FlushStatus> {
        match self.socket.flush_pending() {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(FlushStatus::Pending),
            Err(err) => return Err(err),
        }

        loop {
            match self.queue.front() {
                None => return Ok(FlushStatus::Drained),
                Some(Outbound::Close) => {
                    self.queue.pop_front();
                    return Ok(FlushStatus::Close);
                }
                Some(Outbound::Data(bytes)) => {
                    let len = bytes.len();
                    if self.send_pos >= len {
                        self.queue.pop_front();
                        self.send_pos = 0;
                        continue;
                    }
                    match self.socket.write(&bytes[self.send_pos..]) {
                        Ok(0) => return Ok(FlushStatus::Pending),
                        Ok(sz) => {
                            self.send_pos += sz;
                            trace!(id = self.id, len = sz, remaining = len - self.send_pos, "Wrote to socket");
                        }
                        Err(err) if err.kind() == ErrorKind::WouldBlock => {
                            return Ok(FlushStatus::Pending)
                        }
                        Err(err) if err.kind() == ErrorKind::Interrupted => {}
                        Err(err) => return Err(err),
                    }
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn queued(&self) -> Vec<Outbound> {
        self.queue.iter().cloned().collect()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::socket::PlainSocket;
    use std::io::Read;

    const KEY1: &str = "18x 6]8vM;54 *(5:  {   U1]8  z [  8";
    const KEY2: &str = "1_ tx7X d  <  nw  334J702) 7]o}` 0";

    #[derive(Default)]
    struct Recorder {
        messages: Vec<Vec<u8>>,
        opened: usize,
        echo: bool,
    }

    impl MessageHandler for Recorder {
        fn message_received(&mut self, peer: &mut Peer<'_>, payload: &[u8]) {
            self.messages.push(payload.to_vec());
            if self.echo {
                peer.send(payload);
            }
        }

        fn connection_opened(&mut self, _peer: &mut Peer<'_>) {
            self.opened += 1;
        }
    }

    // A connected loopback pair: the server side wrapped in a Connection and
    // the blocking client side.
    fn pair(config: ServerConfig) -> (Connection, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer_addr) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        let socket = PlainSocket::new(TcpStream::from_std(server));
        let conn = Connection::new(1000, Box::new(socket), peer_addr, Arc::new(config)).unwrap();
        (conn, client)
    }

    fn challenge_request(path: &str) -> Vec<u8> {
        let mut request = format!(
            "GET {path} HTTP/1.1\r\nHost: example.com\r\nOrigin: http://example.com\r\n\
             Sec-WebSocket-Key1: {KEY1}\r\nSec-WebSocket-Key2: {KEY2}\r\n\r\n"
        )
        .into_bytes();
        request.extend_from_slice(b"Tm[K T2u");
        request
    }

    fn response_bytes(conn: &Connection) -> Vec<u8> {
        match conn.queued().first() {
            Some(Outbound::Data(bytes)) => bytes.clone(),
            other => panic!("expected queued response, got {other:?}"),
        }
    }

    #[test]
    fn handshake_split_across_reads() {
        let (mut conn, _client) = pair(ServerConfig::default());
        let mut handler = Recorder::default();
        let request = challenge_request("/");

        for chunk in request.chunks(7) {
            assert!(!conn.is_handshaken());
            conn.data_received(chunk, &mut handler);
        }

        assert!(conn.is_handshaken());
        assert_eq!(handler.opened, 1);
        let response = response_bytes(&conn);
        assert!(response.starts_with(b"HTTP/1.1 101 Web Socket Protocol Handshake\r\n"));
        assert!(response.ends_with(b"fQJ,fN/4F4!~K~MH"));
        let port = conn.local_addr().port();
        let location = format!("WebSocket-Location: ws://example.com:{port}/\r\n");
        assert!(String::from_utf8_lossy(&response).contains(&location));
    }

    #[test]
    fn waits_for_full_key_body() {
        let (mut conn, _client) = pair(ServerConfig::default());
        let mut handler = Recorder::default();
        let request = challenge_request("/");
        let (head, key) = request.split_at(request.len() - 5);

        conn.data_received(head, &mut handler);
        assert!(!conn.is_handshaken());
        assert!(conn.queued().is_empty());

        conn.data_received(key, &mut handler);
        assert!(conn.is_handshaken());
    }

    #[test]
    fn frames_after_key_body_are_delivered() {
        let (mut conn, _client) = pair(ServerConfig::default());
        let mut handler = Recorder::default();
        let mut data = challenge_request("/");
        data.extend(frame::encode(b"early"));

        conn.data_received(&data, &mut handler);
        assert_eq!(handler.messages, vec![b"early".to_vec()]);
    }

    #[test]
    fn path_mismatch_closes() {
        let config = ServerConfig {
            path: "/chat".to_string(),
            ..ServerConfig::default()
        };
        let (mut conn, _client) = pair(config);
        let mut handler = Recorder::default();

        conn.data_received(b"GET /other HTTP/1.1\r\n", &mut handler);
        assert!(conn.is_closing());
        assert!(conn.queued().is_empty());
        assert_eq!(handler.opened, 0);
    }

    #[test]
    fn non_get_request_still_handshakes() {
        let (mut conn, _client) = pair(ServerConfig::default());
        let mut handler = Recorder::default();

        conn.data_received(b"HEAD / HTTP/1.1\r\nHost: localhost\r\n\r\n", &mut handler);
        assert!(!conn.is_closing());
        assert!(conn.is_handshaken());
        assert_eq!(handler.opened, 1);
    }

    #[test]
    fn malformed_get_line_closes() {
        let (mut conn, _client) = pair(ServerConfig::default());
        let mut handler = Recorder::default();

        conn.data_received(b"GET /\r\n", &mut handler);
        assert!(conn.is_closing());
    }

    #[test]
    fn policy_request_answered_then_closed() {
        let (mut conn, _client) = pair(ServerConfig::default());
        let mut handler = Recorder::default();

        conn.data_received(b"<policy-file-request/>\0", &mut handler);
        assert_eq!(
            conn.queued(),
            vec![
                Outbound::Data(POLICY_FILE_RESPONSE.to_vec()),
                Outbound::Close
            ]
        );
        assert!(!conn.is_handshaken());
    }

    #[test]
    fn bad_key_leaves_connection_pending_by_default() {
        let (mut conn, _client) = pair(ServerConfig::default());
        let mut handler = Recorder::default();
        let request = b"GET / HTTP/1.1\r\nHost: a\r\nSec-WebSocket-Key1: 12345\r\nSec-WebSocket-Key2: 1 2\r\n\r\n12345678";

        conn.data_received(request, &mut handler);
        assert!(!conn.is_handshaken());
        assert!(!conn.is_closing());
        assert!(conn.queued().is_empty());

        // Later bytes are discarded rather than reprocessed
        conn.data_received(&frame::encode(b"x"), &mut handler);
        assert!(handler.messages.is_empty());
        assert!(conn.queued().is_empty());
    }

    #[test]
    fn bad_key_closes_with_close_policy() {
        let config = ServerConfig {
            handshake_failure_policy: HandshakeFailurePolicy::Close,
            ..ServerConfig::default()
        };
        let (mut conn, _client) = pair(config);
        let mut handler = Recorder::default();

        conn.data_received(
            b"GET / HTTP/1.1\r\nHost: a\r\nSec-WebSocket-Key1: 12345\r\n\r\n",
            &mut handler,
        );
        assert!(conn.is_closing());
    }

    #[test]
    fn oversized_header_closes() {
        let config = ServerConfig {
            max_handshake_size: 64,
            ..ServerConfig::default()
        };
        let (mut conn, _client) = pair(config);
        let mut handler = Recorder::default();

        conn.data_received(b"GET / HTTP/1.1\r\n", &mut handler);
        assert!(!conn.is_closing());
        conn.data_received(&[b'x'; 100], &mut handler);
        assert!(conn.is_closing());
    }

    #[test]
    fn close_marker_queues_reply_and_stops_delivery() {
        let (mut conn, _client) = pair(ServerConfig::default());
        let mut handler = Recorder::default();
        conn.data_received(&challenge_request("/"), &mut handler);

        let mut data = frame::encode(b"one");
        data.extend_from_slice(&CLOSE_MARKER);
        data.extend(frame::encode(b"two"));
        conn.data_received(&data, &mut handler);

        assert_eq!(handler.messages, vec![b"one".to_vec()]);
        assert!(!conn.is_open());
        let queued = conn.queued();
        assert_eq!(queued[queued.len() - 2], Outbound::Data(CLOSE_MARKER.to_vec()));
        assert_eq!(queued[queued.len() - 1], Outbound::Close);

        conn.data_received(&frame::encode(b"three"), &mut handler);
        assert_eq!(handler.messages.len(), 1);
    }

    #[test]
    fn queue_bound_drops_newest() {
        let config = ServerConfig {
            max_queue_len: Some(2),
            ..ServerConfig::default()
        };
        let (mut conn, _client) = pair(config);
        conn.queue_send(b"a");
        conn.queue_send(b"b");
        conn.queue_send(b"c");
        assert_eq!(
            conn.queued(),
            vec![
                Outbound::Data(frame::encode(b"a")),
                Outbound::Data(frame::encode(b"b"))
            ]
        );
    }

    #[test]
    fn flush_writes_in_order_and_stops_at_close() {
        let (mut conn, mut client) = pair(ServerConfig::default());
        let mut handler = Recorder {
            echo: true,
            ..Recorder::default()
        };
        conn.data_received(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n", &mut handler);
        conn.data_received(&frame::encode(b"ping"), &mut handler);
        conn.close_gracefully();
        conn.queue_send(b"never sent");
        assert_eq!(
            conn.desired_interest(),
            Interest::READABLE | Interest::WRITABLE
        );

        assert_eq!(conn.flush().unwrap(), FlushStatus::Close);
        assert_eq!(conn.desired_interest(), Interest::READABLE);
        conn.close();

        let mut received = Vec::new();
        client.read_to_end(&mut received).unwrap();
        let head_end = find(&received, HEADER_TERMINATOR).unwrap() + HEADER_TERMINATOR.len();
        let mut expected = frame::encode(b"ping");
        expected.extend_from_slice(&CLOSE_MARKER);
        assert_eq!(&received[head_end..], &expected[..]);
    }
}
