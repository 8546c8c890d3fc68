//! Server configuration.
//!
//! Settings are read from a [`config::Config`] with optional namespacing: for
//! a server named `chat`, the key `chat.port` wins over a bare `port`, which
//! wins over the built-in default.

use crate::error::Error;
use ::config::{Config, ConfigError};

pub(crate) const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";
pub(crate) const DEFAULT_PATH: &str = "/";
pub(crate) const DEFAULT_READ_CHUNK_SIZE: usize = 1024;
pub(crate) const DEFAULT_POLL_CAPACITY: usize = 128;
pub(crate) const DEFAULT_MAX_HANDSHAKE_SIZE: usize = 8192;

/// What to do with a connection whose upgrade request fails validation
/// (missing `Host`, or a challenge key with no spaces or a non-zero
/// remainder).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakeFailurePolicy {
    /// Leave the connection registered but stalled. Further bytes are
    /// discarded until the peer hangs up or the server stops.
    #[default]
    KeepPending,
    /// Close the connection immediately.
    Close,
}

/// Settings consumed by [`Server`](crate::Server).
///
/// # Configuration Keys
///
/// - `bind_address` (default `0.0.0.0`)
/// - `port` (default `0`, an ephemeral port)
/// - `path` (default `/`)
/// - `use_tls` (default `false`), with `tls_server_cert` and `tls_server_key`
/// - `read_chunk_size` (default `1024`)
/// - `poll_capacity` (default `128`)
/// - `max_handshake_size` (default `8192`)
/// - `max_queue_len` (default unbounded)
/// - `close_on_handshake_failure` (default `false`)
///
/// # Example
///
/// ```toml
/// port = 9000
///
/// [chat]
/// path = "/chat"
/// use_tls = true
/// tls_server_cert = "/etc/chat/cert.pem"
/// tls_server_key = "/etc/chat/key.pem"
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub path: String,
    pub use_tls: bool,
    pub tls_server_cert: Option<String>,
    pub tls_server_key: Option<String>,
    pub read_chunk_size: usize,
    pub poll_capacity: usize,
    pub max_handshake_size: usize,
    pub max_queue_len: Option<usize>,
    pub handshake_failure_policy: HandshakeFailurePolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            port: 0,
            path: DEFAULT_PATH.to_string(),
            use_tls: false,
            tls_server_cert: None,
            tls_server_key: None,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            poll_capacity: DEFAULT_POLL_CAPACITY,
            max_handshake_size: DEFAULT_MAX_HANDSHAKE_SIZE,
            max_queue_len: None,
            handshake_failure_policy: HandshakeFailurePolicy::KeepPending,
        }
    }
}

impl ServerConfig {
    /// Reads settings from un-namespaced keys.
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        Self::from_config_named(config, "")
    }

    /// Reads settings, preferring keys under the `name.` namespace.
    ///
    /// Missing keys fall back to the bare key, then to defaults. A key that
    /// is present but has the wrong type is reported as [`Error::Config`],
    /// even when a bare key of the same name would have been usable.
    pub fn from_config_named(config: &Config, name: &str) -> Result<Self, Error> {
        let keys = Keys { config, name };
        let defaults = Self::default();

        let port = match keys.get_usize("port")? {
            Some(port) => u16::try_from(port).map_err(|_| {
                ConfigError::Message(format!("port {port} is out of range"))
            })?,
            None => defaults.port,
        };

        let handshake_failure_policy = match keys.get_bool("close_on_handshake_failure")? {
            Some(true) => HandshakeFailurePolicy::Close,
            Some(false) => HandshakeFailurePolicy::KeepPending,
            None => defaults.handshake_failure_policy,
        };

        Ok(Self {
            bind_address: keys.get_string("bind_address")?.unwrap_or(defaults.bind_address),
            port,
            path: keys.get_string("path")?.unwrap_or(defaults.path),
            use_tls: keys.get_bool("use_tls")?.unwrap_or(defaults.use_tls),
            tls_server_cert: keys.get_string("tls_server_cert")?,
            tls_server_key: keys.get_string("tls_server_key")?,
            read_chunk_size: keys.get_usize("read_chunk_size")?
                .unwrap_or(defaults.read_chunk_size)
                .max(1),
            poll_capacity: keys.get_usize("poll_capacity")?
                .unwrap_or(defaults.poll_capacity)
                .max(1),
            max_handshake_size: keys.get_usize("max_handshake_size")?
                .unwrap_or(defaults.max_handshake_size),
            max_queue_len: keys.get_usize("max_queue_len")?,
            handshake_failure_policy,
        })
    }

    /// URL scheme advertised in the handshake `Location` headers.
    pub(crate) fn scheme(&self) -> &'static str {
        if self.use_tls {
            "wss"
        } else {
            "ws"
        }
    }
}

/// Key lookup for one server instance: `name.key`, then `key`.
struct Keys<'a> {
    config: &'a Config,
    name: &'a str,
}

impl Keys<'_> {
    fn get_usize(&self, key: &str) -> Result<Option<usize>, ConfigError> {
        self.lookup(key, |cfg, key| cfg.get::<usize>(key))
    }

    fn get_string(&self, key: &str) -> Result<Option<String>, ConfigError> {
        self.lookup(key, Config::get_string)
    }

    fn get_bool(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        self.lookup(key, Config::get_bool)
    }

    // Only `NotFound` falls through to the next candidate.
    fn lookup<T>(
        &self,
        key: &str,
        getter: impl Fn(&Config, &str) -> Result<T, ConfigError>,
    ) -> Result<Option<T>, ConfigError> {
        if !self.name.is_empty() {
            match getter(self.config, &format!("{}.{key}", self.name)) {
                Err(ConfigError::NotFound(_)) => {}
                found => return found.map(Some),
            }
        }
        match getter(self.config, key) {
            Ok(value) => Ok(Some(value)),
            Err(ConfigError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }
}
