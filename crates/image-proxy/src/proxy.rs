//! Proxy server.
//!
//! Binds the listener and hands every accepted connection to the
//! [`Dispatcher`] on its own task.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::dispatcher::{Dispatcher, DispatcherBuilder, DEFAULT_HANDSHAKE_TIMEOUT};
use crate::error::{ConfigError, Result};
use crate::transport::TransportConfig;
use crate::DEFAULT_PROXY_PORT;

/// Proxy server configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address to bind the proxy to.
    pub addr: SocketAddr,
    /// Upstream pool bounds and timeouts.
    pub transport: TransportConfig,
    /// Bound on the client-side TLS handshake of an intercepted tunnel.
    pub handshake_timeout: Duration,
}

impl ProxyConfig {
    /// Creates a configuration listening on all interfaces.
    pub fn new() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PROXY_PORT)),
            transport: TransportConfig::default(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// Sets the listen address.
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Sets the port (uses 127.0.0.1 as host).
    pub fn with_port(mut self, port: u16) -> Self {
        self.addr = SocketAddr::from(([127, 0, 0, 1], port));
        self
    }

    /// Sets the upstream transport settings.
    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    /// Sets the client handshake timeout.
    pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// MITM proxy server with a bound listener.
pub struct ProxyServer {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
}

impl std::fmt::Debug for ProxyServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyServer")
            .field("addr", &self.listener.local_addr().ok())
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

impl ProxyServer {
    /// Builds the dispatcher with the configured transport and binds the
    /// listener.
    pub async fn bind(config: ProxyConfig, dispatcher: DispatcherBuilder) -> Result<Self> {
        let dispatcher = dispatcher
            .transport_config(config.transport)
            .handshake_timeout(config.handshake_timeout)
            .build()?;

        let listener = TcpListener::bind(config.addr)
            .await
            .map_err(ConfigError::Bind)?;

        if !dispatcher.transport().config().verify_upstream {
            tracing::warn!("Upstream certificate verification is disabled");
        }

        Ok(Self {
            listener,
            dispatcher: Arc::new(dispatcher),
        })
    }

    /// Returns the address the proxy is listening on.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Runs the accept loop.
    ///
    /// This will block until the listener fails.
    pub async fn run(self) -> Result<()> {
        tracing::info!("Image proxy listening on {}", self.local_addr()?);

        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    // Usually descriptor exhaustion; back off instead of spinning.
                    tracing::warn!("Failed to accept connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            let _ = stream.set_nodelay(true);
            tracing::debug!("Accepted connection from {}", peer);

            let dispatcher = Arc::clone(&self.dispatcher);
            tokio::spawn(dispatcher.serve_connection(stream, peer));
        }
    }

    /// Starts the proxy server in the background.
    ///
    /// Returns a handle that can be used to stop the server.
    pub fn start(self) -> Result<ProxyHandle> {
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let mut shutdown_rx = shutdown_tx.subscribe();
        let addr = self.local_addr()?;

        let handle = tokio::spawn(async move {
            tokio::select! {
                result = self.run() => {
                    if let Err(e) = result {
                        tracing::error!("Proxy error: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Proxy shutdown signal received");
                }
            }
        });

        Ok(ProxyHandle {
            shutdown_tx,
            addr,
            handle,
        })
    }
}

/// Handle for controlling a running proxy server.
pub struct ProxyHandle {
    shutdown_tx: broadcast::Sender<()>,
    addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    /// Returns the address the proxy is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signals the proxy to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Waits for the proxy to finish.
    pub async fn wait(self) {
        let _ = self.handle.await;
    }

    /// Shuts down the proxy and waits for it to finish.
    pub async fn stop(self) {
        self.shutdown();
        self.wait().await;
    }
}
