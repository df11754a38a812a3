//! Upstream transport with connection pooling.
//!
//! Exchanges that are not short-circuited are forwarded to the real origin
//! over HTTP/1.1. Connections are pooled per `(scheme, host, port)` and a
//! connection goes back to the pool only once its response body has been
//! read to the end. Every failure is turned into a `502 Bad Gateway` so the
//! client never sees a reset.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper::client::conn::http1::{Builder as ClientBuilder, SendRequest};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, HOST};
use hyper::{Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use crate::body::{empty, ProxyBody};
use crate::error::{ConfigError, UpstreamError};
use crate::hooks::ExchangeContext;
use crate::target::{Scheme, Target};

/// Hop-by-hop headers that are never forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authorization",
    "te",
    "trailer",
    "upgrade",
];

/// Upstream transport settings.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Idle connections kept per origin.
    pub max_idle_per_host: usize,
    /// Idle connections kept across all origins.
    pub max_idle_total: usize,
    /// How long an unused pooled connection stays reusable.
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    pub tls_handshake_timeout: Duration,
    /// Bound on a whole request, up to the response head.
    pub request_timeout: Duration,
    /// Verify upstream certificates against the webpki roots.
    pub verify_upstream: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            max_idle_total: 100,
            idle_timeout: Duration::from_secs(90),
            connect_timeout: Duration::from_secs(10),
            tls_handshake_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            verify_upstream: false,
        }
    }
}

impl TransportConfig {
    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn with_max_idle_per_host(mut self, max_idle_per_host: usize) -> Self {
        self.max_idle_per_host = max_idle_per_host;
        self
    }

    pub fn with_max_idle_total(mut self, max_idle_total: usize) -> Self {
        self.max_idle_total = max_idle_total;
        self
    }

    pub fn with_verify_upstream(mut self, verify_upstream: bool) -> Self {
        self.verify_upstream = verify_upstream;
        self
    }
}

struct IdleConnection {
    sender: SendRequest<ProxyBody>,
    idle_since: Instant,
}

/// Free-list of idle upstream connections keyed by origin.
pub struct ConnectionPool {
    idle: Mutex<HashMap<Target, Vec<IdleConnection>>>,
    max_idle_per_host: usize,
    max_idle_total: usize,
    idle_timeout: Duration,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("idle", &self.idle_count())
            .field("max_idle_per_host", &self.max_idle_per_host)
            .field("max_idle_total", &self.max_idle_total)
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}

impl ConnectionPool {
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            idle: Mutex::new(HashMap::new()),
            max_idle_per_host: config.max_idle_per_host,
            max_idle_total: config.max_idle_total,
            idle_timeout: config.idle_timeout,
        }
    }

    /// Takes the most recently used live connection for `target`.
    pub fn checkout(&self, target: &Target) -> Option<SendRequest<ProxyBody>> {
        let mut idle = self.idle.lock();
        let conns = idle.get_mut(target)?;

        let mut found = None;
        while let Some(conn) = conns.pop() {
            if conn.idle_since.elapsed() < self.idle_timeout && !conn.sender.is_closed() {
                found = Some(conn.sender);
                break;
            }
        }

        if conns.is_empty() {
            idle.remove(target);
        }
        found
    }

    /// Returns a connection whose last exchange completed cleanly.
    ///
    /// The connection is dropped instead when it is closed or a bound is
    /// reached.
    pub fn checkin(&self, target: Target, sender: SendRequest<ProxyBody>) {
        if sender.is_closed() {
            return;
        }

        let mut idle = self.idle.lock();
        let idle_timeout = self.idle_timeout;
        idle.retain(|_, conns| {
            conns.retain(|c| c.idle_since.elapsed() < idle_timeout && !c.sender.is_closed());
            !conns.is_empty()
        });

        let total: usize = idle.values().map(Vec::len).sum();
        if total >= self.max_idle_total {
            return;
        }

        let conns = idle.entry(target).or_default();
        if conns.len() >= self.max_idle_per_host {
            return;
        }
        conns.push(IdleConnection {
            sender,
            idle_since: Instant::now(),
        });
    }

    /// Number of idle connections across all origins.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().values().map(Vec::len).sum()
    }

    /// Number of idle connections for one origin.
    pub fn idle_count_for(&self, target: &Target) -> usize {
        self.idle.lock().get(target).map_or(0, Vec::len)
    }
}

/// Outbound HTTP/1.1 client shared by every exchange.
#[derive(Clone)]
pub struct UpstreamTransport {
    config: TransportConfig,
    pool: Arc<ConnectionPool>,
    tls: TlsConnector,
}

impl std::fmt::Debug for UpstreamTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamTransport")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl UpstreamTransport {
    pub fn new(config: TransportConfig) -> Result<Self, ConfigError> {
        let tls = TlsConnector::from(client_config(config.verify_upstream)?);
        Ok(Self {
            pool: Arc::new(ConnectionPool::new(&config)),
            config,
            tls,
        })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Forwards the request upstream and returns the response.
    ///
    /// Never fails: any upstream error is logged and answered with a 502.
    pub async fn forward(&self, ctx: &ExchangeContext, req: Request<ProxyBody>) -> Response<ProxyBody> {
        let result = timeout(self.config.request_timeout, self.send(&ctx.target, req))
            .await
            .unwrap_or_else(|_| Err(UpstreamError::Timeout("request")));

        match result {
            Ok(res) => res,
            Err(e) => {
                tracing::warn!("Upstream request #{} to {} failed: {}", ctx.id, ctx.target, e);
                bad_gateway()
            }
        }
    }

    /// Sends one request, reusing a pooled connection when possible.
    ///
    /// A reused connection that fails before the request was written is
    /// retried once on a fresh connection.
    pub async fn send(
        &self,
        target: &Target,
        req: Request<ProxyBody>,
    ) -> Result<Response<ProxyBody>, UpstreamError> {
        let mut req = prepare_request(req, target)?;

        if let Some(mut sender) = self.pool.checkout(target) {
            if sender.ready().await.is_ok() {
                match sender.try_send_request(req).await {
                    Ok(res) => return Ok(self.track(target, sender, res)),
                    Err(mut err) => match err.take_message() {
                        Some(unsent) => {
                            tracing::debug!(
                                "Pooled connection to {} failed before sending, retrying: {}",
                                target,
                                err.error()
                            );
                            req = unsent;
                        }
                        None => return Err(err.into_error().into()),
                    },
                }
            }
        }

        let mut sender = self.connect(target).await?;
        let res = sender.send_request(req).await?;
        Ok(self.track(target, sender, res))
    }

    /// Opens a new HTTP/1.1 connection to `target`.
    async fn connect(&self, target: &Target) -> Result<SendRequest<ProxyBody>, UpstreamError> {
        let addrs: Vec<_> = timeout(
            self.config.connect_timeout,
            tokio::net::lookup_host((target.bare_host(), target.port)),
        )
        .await
        .map_err(|_| UpstreamError::Timeout("DNS lookup"))?
        .map_err(|source| UpstreamError::Resolve {
            host: target.host.clone(),
            source,
        })?
        .collect();

        let stream = timeout(self.config.connect_timeout, TcpStream::connect(&addrs[..]))
            .await
            .map_err(|_| UpstreamError::Timeout("connect"))?
            .map_err(UpstreamError::Connect)?;
        let _ = stream.set_nodelay(true);

        tracing::debug!("Connected to upstream {}", target);

        match target.scheme {
            Scheme::Http => handshake(TokioIo::new(stream)).await,
            Scheme::Https => {
                let server_name = ServerName::try_from(target.bare_host().to_string())
                    .map_err(|_| UpstreamError::InvalidTarget(target.host.clone()))?;
                let tls = timeout(
                    self.config.tls_handshake_timeout,
                    self.tls.connect(server_name, stream),
                )
                .await
                .map_err(|_| UpstreamError::Timeout("TLS handshake"))?
                .map_err(UpstreamError::Tls)?;
                handshake(TokioIo::new(tls)).await
            }
        }
    }

    /// Ties the connection's return to the pool to the end of the body.
    fn track(
        &self,
        target: &Target,
        sender: SendRequest<ProxyBody>,
        res: Response<Incoming>,
    ) -> Response<ProxyBody> {
        if res.body().is_end_stream() {
            self.pool.checkin(target.clone(), sender);
            return res.map(|body| body.boxed());
        }

        let pool = Arc::clone(&self.pool);
        let target = target.clone();
        res.map(|inner| {
            PooledBody {
                inner,
                release: Some((pool, target, sender)),
            }
            .boxed()
        })
    }
}

async fn handshake<T>(io: T) -> Result<SendRequest<ProxyBody>, UpstreamError>
where
    T: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let (sender, conn) = ClientBuilder::new()
        .preserve_header_case(true)
        .title_case_headers(false)
        .handshake(io)
        .await?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!("Upstream connection closed: {}", e);
        }
    });

    Ok(sender)
}

/// Response body that hands its connection back to the pool at end of
/// stream. Dropping it early discards the connection.
struct PooledBody {
    inner: Incoming,
    release: Option<(Arc<ConnectionPool>, Target, SendRequest<ProxyBody>)>,
}

impl PooledBody {
    fn release(&mut self) {
        if let Some((pool, target, sender)) = self.release.take() {
            pool.checkin(target, sender);
        }
    }
}

impl Body for PooledBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_frame(cx);

        match &poll {
            Poll::Ready(None) => this.release(),
            Poll::Ready(Some(Ok(_))) if this.inner.is_end_stream() => this.release(),
            Poll::Ready(Some(Err(_))) => this.release = None,
            _ => {}
        }
        poll
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Rewrites a proxied request for the origin.
///
/// The target becomes origin-form, hop-by-hop headers (including any named
/// by `Connection`) are removed and `Host` is filled in when missing.
/// Header order and the original header casing are left untouched.
pub fn prepare_request(
    req: Request<ProxyBody>,
    target: &Target,
) -> Result<Request<ProxyBody>, UpstreamError> {
    let (mut parts, body) = req.into_parts();

    let path = parts
        .uri
        .path_and_query()
        .map_or("/", |pq| pq.as_str())
        .to_string();
    parts.uri = path
        .parse::<Uri>()
        .map_err(|_| UpstreamError::InvalidTarget(path))?;
    parts.version = Version::HTTP_11;

    strip_hop_by_hop(&mut parts.headers);

    if !parts.headers.contains_key(HOST) {
        let host = HeaderValue::from_str(&target.host_header())
            .map_err(|_| UpstreamError::InvalidTarget(target.host.clone()))?;
        parts.headers.insert(HOST, host);
    }

    Ok(Request::from_parts(parts, body))
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// `502 Bad Gateway` with an empty body.
pub fn bad_gateway() -> Response<ProxyBody> {
    let mut res = Response::new(empty());
    *res.status_mut() = StatusCode::BAD_GATEWAY;
    res.headers_mut()
        .insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
    res
}

fn client_config(verify_upstream: bool) -> Result<Arc<ClientConfig>, ConfigError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(ConfigError::Tls)?;

    let mut config = if verify_upstream {
        let roots = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        builder.with_root_certificates(roots).with_no_client_auth()
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification { provider }))
            .with_no_client_auth()
    };
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

/// Accepts any upstream certificate. Signatures are still checked so the
/// handshake itself stays sound.
#[derive(Debug)]
struct SkipServerVerification {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
