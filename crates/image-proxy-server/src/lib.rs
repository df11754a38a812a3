//! Image Proxy trust server.
//!
//! Small HTTP server that helps devices opt in to the proxy: it shows the
//! setup instructions and serves the root certificate for installation.
//!
//! ## Endpoints
//!
//! - `GET /` - Plain-text setup instructions with this machine's local IP
//! - `GET /ca.pem` - Root certificate, PEM encoded
//! - `GET /ca.crt` - Root certificate, DER encoded
//! - `GET /setup.json` - Setup details as JSON
//!
//! ## Example
//!
//! ```no_run
//! use image_proxy_server::{TrustServer, TrustServerConfig, TrustState};
//!
//! #[tokio::main]
//! async fn main() {
//!     let state = TrustState::new("-----BEGIN CERTIFICATE-----...", Vec::new(), 8080);
//!     let server = TrustServer::new(TrustServerConfig::default(), state).unwrap();
//!     server.run().await.unwrap();
//! }
//! ```

pub mod error;
mod handlers;
pub mod models;
pub mod state;

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use axum::routing::get;
use axum::Router;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::info;

pub use error::{Result, ServerError};
pub use state::TrustState;

/// Default trust server port.
pub const DEFAULT_PORT: u16 = 7777;

/// Default trust server host. Devices on the LAN must reach it.
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Trust server configuration.
#[derive(Debug, Clone)]
pub struct TrustServerConfig {
    /// Host to bind to (default: 0.0.0.0).
    pub host: String,
    /// Port to bind to (default: 7777).
    pub port: u16,
}

impl Default for TrustServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl TrustServerConfig {
    /// Sets the host.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Sets the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

/// The trust bootstrap server.
pub struct TrustServer {
    router: Router,
    addr: SocketAddr,
}

impl TrustServer {
    /// Creates a new server with the given configuration.
    pub fn new(config: TrustServerConfig, state: TrustState) -> Result<Self> {
        let router = Router::new()
            .route("/", get(handlers::index))
            .route("/ca.pem", get(handlers::ca_pem))
            .route("/ca.crt", get(handlers::ca_der))
            .route("/setup.json", get(handlers::setup_info))
            .with_state(state);

        // IPv6 hosts may arrive bracketed, as they appear in URLs.
        let host = config.host.trim_start_matches('[').trim_end_matches(']');
        let ip: IpAddr = host
            .parse()
            .map_err(|e| ServerError::InvalidAddress(format!("{}: {}", config.host, e)))?;
        let addr = SocketAddr::new(ip, config.port);

        Ok(Self { router, addr })
    }

    /// Returns the server address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Runs the server until the listener fails.
    pub async fn run(self) -> Result<()> {
        info!("Serving root certificate on http://{}", self.addr);

        // SO_REUSEADDR lets a restart bind while old sockets linger in TIME_WAIT.
        let domain = if self.addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| ServerError::BindError(self.addr, e))?;
        socket
            .set_reuse_address(true)
            .map_err(|e| ServerError::BindError(self.addr, e))?;
        socket
            .bind(&self.addr.into())
            .map_err(|e| ServerError::BindError(self.addr, e))?;
        socket
            .listen(128)
            .map_err(|e| ServerError::BindError(self.addr, e))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| ServerError::BindError(self.addr, e))?;

        let std_listener: std::net::TcpListener = socket.into();
        let listener = tokio::net::TcpListener::from_std(std_listener)
            .map_err(|e| ServerError::BindError(self.addr, e))?;

        axum::serve(listener, self.router)
            .await
            .map_err(|e| ServerError::Runtime(e.to_string()))?;

        Ok(())
    }

    /// Returns the router for testing.
    pub fn router(&self) -> Router {
        self.router.clone()
    }
}

/// Detects the local IPv4 address used for outbound traffic.
///
/// Connecting a UDP socket only selects a route; no packet is sent.
pub fn local_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80)).ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_unspecified() => Some(ip),
        _ => None,
    }
}
