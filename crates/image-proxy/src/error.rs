//! Error types for the proxy.
//!
//! Only [`ConfigError`] is fatal. Every other error is contained at the
//! connection or exchange that produced it.

use thiserror::Error;

/// Startup configuration error. The process must not serve when one occurs.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The root certificate could not be parsed.
    #[error("invalid CA certificate: {0}")]
    InvalidCertificate(String),

    /// The root private key could not be parsed.
    #[error("invalid CA private key: {0}")]
    InvalidKey(String),

    /// Certificate and key do not belong together.
    #[error("CA private key does not match the CA certificate")]
    KeyMismatch,

    /// Generating a fresh root authority failed.
    #[error("failed to generate CA: {0}")]
    Generation(String),

    /// The placeholder image is empty or not an image.
    #[error("invalid placeholder image: {0}")]
    InvalidPlaceholder(String),

    /// A required setting was not provided.
    #[error("missing required setting: {0}")]
    Missing(&'static str),

    /// A TLS configuration could not be built.
    #[error("invalid TLS configuration: {0}")]
    Tls(#[source] rustls::Error),

    /// The listener could not be bound.
    #[error("failed to bind proxy listener: {0}")]
    Bind(#[source] std::io::Error),
}

/// Leaf certificate minting error. Degrades the connection to a plain tunnel.
#[derive(Debug, Error)]
pub enum MintError {
    /// The hostname cannot be placed in a certificate.
    #[error("invalid hostname for leaf certificate: {0:?}")]
    InvalidHostname(String),

    /// Key generation or signing failed.
    #[error("failed to sign leaf certificate: {0}")]
    Signing(#[from] rcgen::Error),

    /// rustls rejected the generated key.
    #[error("unusable leaf signing key: {0}")]
    SigningKey(#[source] rustls::Error),

    /// Building the server TLS configuration failed.
    #[error("failed to build TLS config: {0}")]
    Config(#[source] rustls::Error),
}

/// MITM handshake error for one connection.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Reading the first client bytes failed.
    #[error("failed to read client hello: {0}")]
    Peek(#[source] std::io::Error),

    /// The TLS server handshake with the client failed.
    #[error("TLS handshake with client failed: {0}")]
    Tls(#[source] std::io::Error),

    /// The handshake did not complete in time.
    #[error("TLS handshake with client timed out")]
    Timeout,
}

/// Failure reaching the real server for one exchange. Answered with a 502.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The request target has no usable host.
    #[error("invalid upstream target: {0}")]
    InvalidTarget(String),

    /// DNS resolution failed.
    #[error("failed to resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: std::io::Error,
    },

    /// TCP connect failed.
    #[error("failed to connect to upstream: {0}")]
    Connect(#[source] std::io::Error),

    /// TLS handshake with the upstream failed.
    #[error("upstream TLS handshake failed: {0}")]
    Tls(#[source] std::io::Error),

    /// A phase of the upstream call timed out.
    #[error("upstream {0} timed out")]
    Timeout(&'static str),

    /// HTTP protocol failure on the upstream connection.
    #[error("upstream HTTP error: {0}")]
    Http(#[from] hyper::Error),
}

/// Malformed client input. Closes the offending connection only.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// CONNECT without a usable `host:port` target.
    #[error("malformed CONNECT target: {0}")]
    MalformedConnect(String),

    /// A proxied request without an absolute target.
    #[error("request target is not an absolute URI: {0}")]
    NotAbsolute(String),

    /// A tunnel tried to move between incompatible states.
    #[error("illegal tunnel transition from {from} to {to}")]
    IllegalTransition {
        from: &'static str,
        to: &'static str,
    },
}

/// Proxy error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Startup configuration error.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Certificate minting error.
    #[error(transparent)]
    Mint(#[from] MintError),

    /// MITM handshake error.
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// Upstream error.
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    /// Client protocol error.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP serving error.
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
