use thiserror::Error;

/// The error type for wsserver operations.
///
/// Only server-wide failures are reported through this type: configuration,
/// TLS material, binding the listener and the worker thread itself.
/// Per-connection failures (resets, bad requests, TLS alerts) are logged and
/// close that one connection instead.
#[derive(Error, Debug)]
pub enum Error {
    // ============================================================================
    // I/O and Networking Errors
    // ============================================================================

    /// Low-level I/O error from the operating system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The configured bind address could not be parsed or resolved.
    #[error("Invalid socket address '{0}'")]
    InvalidAddress(String),

    /// The listener could not be bound to the requested address.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },

    // ============================================================================
    // TLS Errors
    // ============================================================================

    /// Failed to load TLS certificate file from disk.
    #[error("Failed to load certificate from {path}: {source}")]
    TlsCertificateLoad {
        path: String,
        source: std::io::Error,
    },

    /// Failed to load TLS private key file from disk.
    #[error("Failed to load private key from {path}: {source}")]
    TlsKeyLoad {
        path: String,
        source: std::io::Error,
    },

    /// Certificate file format is invalid or unsupported.
    #[error("Invalid certificate format: {0}")]
    TlsInvalidCertificate(String),

    /// Private key file format is invalid or unsupported.
    #[error("Invalid private key format: {0}")]
    TlsInvalidKey(String),

    /// `use_tls` is set but `tls_server_cert` or `tls_server_key` is missing.
    #[error("TLS enabled but tls_server_cert/tls_server_key not configured")]
    TlsServerConfigMissing,

    /// Failed to build TLS server configuration from provided settings.
    #[error("Failed to build TLS server config: {0}")]
    TlsServerConfigBuild(String),

    /// TLS was requested but the crate was built without the `tls` feature.
    #[error("TLS requested but wsserver was built without the \"tls\" feature")]
    TlsUnsupported,

    // ============================================================================
    // Configuration Errors
    // ============================================================================

    /// Configuration file parsing or key lookup failed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

/// Reasons a legacy upgrade request is rejected.
///
/// These never escape the server loop; they decide whether a connection
/// completes its handshake.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// The request carries no `Host` header, so no `Location` can be built.
    #[error("Missing Host header")]
    MissingHost,

    /// One of the `Sec-WebSocket-Key1`/`Key2` values is unusable.
    #[error("Invalid {name}: {reason}")]
    InvalidKey {
        name: &'static str,
        reason: KeyError,
    },
}

/// Why a single challenge key could not be reduced to its 32-bit part.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyError {
    #[error("no digits")]
    NoDigits,
    #[error("no spaces")]
    NoSpaces,
    #[error("key number not divisible by space count")]
    NotDivisible,
    #[error("value out of range")]
    Overflow,
}
