//! Minimal blocking client for the legacy protocol, shared by the
//! integration tests.

#![allow(dead_code)]

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

pub const KEY1: &str = "18x 6]8vM;54 *(5:  {   U1]8  z [  8";
pub const KEY2: &str = "1_ tx7X d  <  nw  334J702) 7]o}` 0";
pub const KEY_BODY: &[u8; 8] = b"Tm[K T2u";
pub const EXPECTED_DIGEST: &[u8; 16] = b"fQJ,fN/4F4!~K~MH";
pub const CLOSE_MARKER: [u8; 2] = [0xFF, 0x00];

pub struct WsClient<S: Read + Write> {
    stream: S,
    buf: Vec<u8>,
}

/// Connects to a server bound on loopback.
pub fn connect(addr: SocketAddr) -> WsClient<TcpStream> {
    let stream = TcpStream::connect(("127.0.0.1", addr.port())).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream.set_nodelay(true).unwrap();
    WsClient::new(stream)
}

/// Upgrade request carrying both challenge keys and the key body.
pub fn challenge_request(host: &str, path: &str) -> Vec<u8> {
    let mut request = format!(
        "GET {path} HTTP/1.1\r\nUpgrade: WebSocket\r\nConnection: Upgrade\r\n\
         Host: {host}\r\nOrigin: http://{host}\r\n\
         Sec-WebSocket-Key1: {KEY1}\r\nSec-WebSocket-Key2: {KEY2}\r\n\r\n"
    )
    .into_bytes();
    request.extend_from_slice(KEY_BODY);
    request
}

pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut bytes = vec![0x00];
    bytes.extend_from_slice(payload);
    bytes.push(0xFF);
    bytes
}

impl<S: Read + Write> WsClient<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    pub fn stream(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).unwrap();
        self.stream.flush().unwrap();
    }

    pub fn send_frame(&mut self, payload: &[u8]) {
        self.send_raw(&frame(payload));
    }

    /// Performs the challenge handshake and checks the digest. Returns the
    /// response header block.
    pub fn handshake(&mut self, host: &str, path: &str) -> String {
        self.send_raw(&challenge_request(host, path));
        let (head, digest) = self.read_response();
        assert_eq!(&digest, EXPECTED_DIGEST);
        head
    }

    /// Reads the response header block and the 16-byte digest after it.
    pub fn read_response(&mut self) -> (String, [u8; 16]) {
        loop {
            if let Some(pos) = self.buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let end = pos + 4;
                if self.buf.len() >= end + 16 {
                    let head = String::from_utf8(self.buf[..end].to_vec()).unwrap();
                    let mut digest = [0u8; 16];
                    digest.copy_from_slice(&self.buf[end..end + 16]);
                    self.buf.drain(..end + 16);
                    return (head, digest);
                }
            }
            assert!(self.fill() > 0, "connection closed during handshake");
        }
    }

    /// Reads the next frame and returns its payload.
    pub fn read_frame(&mut self) -> Vec<u8> {
        loop {
            if let Some(end) = self.buf.iter().position(|&b| b == 0xFF) {
                assert_eq!(self.buf[0], 0x00, "frame does not start with 0x00");
                let payload = self.buf[1..end].to_vec();
                self.buf.drain(..=end);
                return payload;
            }
            assert!(self.fill() > 0, "connection closed while waiting for a frame");
        }
    }

    /// Everything left until the server closes the connection. A reset
    /// counts as closed.
    pub fn read_until_closed(&mut self) -> Vec<u8> {
        let mut chunk = [0u8; 1024];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::ConnectionReset => break,
                Err(err) => panic!("unexpected read error: {err}"),
            }
        }
        std::mem::take(&mut self.buf)
    }

    fn fill(&mut self) -> usize {
        let mut chunk = [0u8; 1024];
        let n = self.stream.read(&mut chunk).unwrap();
        self.buf.extend_from_slice(&chunk[..n]);
        n
    }
}

impl WsClient<TcpStream> {
    /// Asserts that nothing arrives for a short while.
    pub fn assert_silent(&mut self) {
        assert!(self.buf.is_empty(), "unexpected buffered bytes: {:?}", self.buf);
        self.stream
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        let mut chunk = [0u8; 64];
        match self.stream.read(&mut chunk) {
            Ok(n) => panic!("expected silence, got {:?}", &chunk[..n]),
            Err(err) => assert!(
                matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut),
                "unexpected read error: {err}"
            ),
        }
        self.stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
    }
}
