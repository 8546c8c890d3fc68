//! Legacy challenge-response upgrade handshake.
//!
//! The client sends an HTTP-like `GET` with two `Sec-WebSocket-Key` headers
//! followed by 8 raw key bytes. Each key value hides a number: its decimal
//! digits divided by its count of whitespace characters. The server proves it
//! read them by returning the MD5 digest of both numbers (big-endian `u32`)
//! followed by the 8 key bytes.
//!
//! Requests without the key headers get the textual response alone. That path
//! does not authenticate anything; it exists for older clients.

use crate::error::{HandshakeError, KeyError};
use md5::{Digest, Md5};
use std::fmt::Write as _;
use tracing::warn;

pub const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
pub const KEY_BODY_LEN: usize = 8;

/// Flash-era probe sent by clients looking for a socket policy.
pub const POLICY_FILE_REQUEST: &[u8] = b"<policy-file-request/>";

/// Fixed reply to [`POLICY_FILE_REQUEST`], sent without frame markers.
pub const POLICY_FILE_RESPONSE: &[u8] =
    b"<cross-domain-policy><allow-access-from domain=\"*\" to-ports=\"*\" /></cross-domain-policy>\n";

/// Result of looking at the request line of a pending upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestLine<'a> {
    /// The first line has not been fully received yet.
    Incomplete,
    /// `GET <path> <version>` was found.
    Get(&'a str),
    /// Starts with `GET` but has no `<path> <version>` after it.
    Invalid,
    /// Not a `GET` request; there is no path to check.
    Other,
}

/// Parses the request line at the start of `head`.
///
/// Only requests starting with `GET` are checked against the upgrade path.
/// Anything else is left to the header parser.
pub fn parse_request_line(head: &[u8]) -> RequestLine<'_> {
    let prefix = head.len().min(b"GET".len());
    if head[..prefix] != b"GET"[..prefix] {
        return RequestLine::Other;
    }
    let Some(end) = head.windows(2).position(|w| w == b"\r\n") else {
        return RequestLine::Incomplete;
    };
    let Ok(line) = std::str::from_utf8(&head[..end]) else {
        return RequestLine::Invalid;
    };
    match line
        .strip_prefix("GET ")
        .and_then(|rest| rest.rsplit_once(' '))
    {
        Some((path, _version)) if !path.is_empty() => RequestLine::Get(path),
        _ => RequestLine::Invalid,
    }
}

/// Where the upgraded channel lives, echoed back in the `Location` headers.
#[derive(Debug, Clone, Copy)]
pub struct Location<'a> {
    pub scheme: &'a str,
    pub port: u16,
    pub path: &'a str,
}

/// The fields of an upgrade request the response depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    /// `Host` header with any `:port` suffix removed.
    pub host: String,
    pub origin: Option<String>,
    pub key1: Option<u32>,
    pub key2: Option<u32>,
}

impl HandshakeRequest {
    /// Parses the header block (request line included, terminator excluded).
    pub fn parse(head: &str) -> Result<Self, HandshakeError> {
        let mut host = None;
        let mut origin = None;
        let mut key1 = None;
        let mut key2 = None;

        for line in head.split("\r\n").skip(1) {
            let Some((name, value)) = line.split_once(": ") else {
                continue;
            };
            if name.eq_ignore_ascii_case("sec-websocket-key1") {
                key1 = Some(key_part(value).map_err(|reason| HandshakeError::InvalidKey {
                    name: "Sec-WebSocket-Key1",
                    reason,
                })?);
            } else if name.eq_ignore_ascii_case("sec-websocket-key2") {
                key2 = Some(key_part(value).map_err(|reason| HandshakeError::InvalidKey {
                    name: "Sec-WebSocket-Key2",
                    reason,
                })?);
            } else if name.eq_ignore_ascii_case("host") {
                host = value.split(':').next().map(str::to_string);
            } else if name.eq_ignore_ascii_case("origin") {
                origin = Some(value.to_string());
            }
        }

        Ok(Self {
            host: host.ok_or(HandshakeError::MissingHost)?,
            origin,
            key1,
            key2,
        })
    }

    /// Whether the request carries both challenge keys, in which case the
    /// 8-byte key body is needed before responding.
    pub fn has_challenge(&self) -> bool {
        self.key1.is_some() && self.key2.is_some()
    }

    /// Builds the complete response, digest included when both keys were
    /// present and `key` was supplied.
    pub fn response(&self, location: &Location<'_>, key: Option<&[u8; KEY_BODY_LEN]>) -> Vec<u8> {
        let origin = self.origin.as_deref().unwrap_or("null");
        let url = format!(
            "{}://{}:{}{}",
            location.scheme, self.host, location.port, location.path
        );

        let mut head = String::with_capacity(256);
        head.push_str("HTTP/1.1 101 Web Socket Protocol Handshake\r\n");
        head.push_str("Upgrade: WebSocket\r\n");
        head.push_str("Connection: Upgrade\r\n");
        let _ = write!(head, "WebSocket-Origin: {origin}\r\n");
        let _ = write!(head, "WebSocket-Location: {url}\r\n");
        let _ = write!(head, "Sec-Websocket-Origin: {origin}\r\n");
        let _ = write!(head, "Sec-Websocket-Location: {url}\r\n");
        head.push_str("\r\n");

        let mut response = head.into_bytes();
        match (self.key1, self.key2, key) {
            (Some(part1), Some(part2), Some(key)) => {
                response.extend_from_slice(&challenge_response(part1, part2, key));
            }
            _ => {
                warn!(host = %self.host, "Responding without challenge digest");
            }
        }
        response
    }
}

/// Reduces one `Sec-WebSocket-Key` value to its 32-bit part.
pub fn key_part(value: &str) -> Result<u32, KeyError> {
    let digits: String = value.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return Err(KeyError::NoDigits);
    }
    let number: u64 = digits.parse().map_err(|_| KeyError::Overflow)?;
    let spaces = value.chars().filter(|&c| is_key_space(c)).count() as u64;
    if spaces == 0 {
        return Err(KeyError::NoSpaces);
    }
    if number % spaces != 0 {
        return Err(KeyError::NotDivisible);
    }
    u32::try_from(number / spaces).map_err(|_| KeyError::Overflow)
}

// ASCII whitespace including vertical tab, which `is_ascii_whitespace` omits
fn is_key_space(c: char) -> bool {
    c.is_ascii_whitespace() || c == '\x0B'
}

/// MD5 over `BE32(part1) ++ BE32(part2) ++ key`.
pub fn challenge_response(part1: u32, part2: u32, key: &[u8; KEY_BODY_LEN]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(part1.to_be_bytes());
    hasher.update(part2.to_be_bytes());
    hasher.update(key);
    hasher.finalize().into()
}
