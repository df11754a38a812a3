//! Connection dispatcher.
//!
//! Serves client connections as HTTP/1.1, answers absolute-form requests as
//! exchanges and turns `CONNECT` into either an intercepted TLS session or
//! an opaque byte tunnel.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONNECTION, CONTENT_LENGTH};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;

use crate::body::{empty, ProxyBody};
use crate::context::InterceptContext;
use crate::error::{ConfigError, HandshakeError, MintError, ProtocolError, ProxyError};
use crate::hooks::{
    AlwaysMitm, ExchangeContext, ImageRequestMatcher, MatchPredicate, MitmDecision,
    PlaceholderRequestHook, PlaceholderResponseHook, RequestHook, RequestOrResponse, ResponseHook,
};
use crate::target::{parse_connect_target, Scheme, Target};
use crate::transport::{TransportConfig, UpstreamTransport};
use crate::tunnel::{is_tls_client_hello, read_prefix, relay, Rewind, TunnelSession, TunnelState};
use crate::{MARKER_HEADER, MARKER_VALUE};

/// Default bound on reading the client hello and completing the handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How a CONNECT tunnel will be handled.
pub enum TunnelPlan {
    /// Terminate TLS with this server configuration.
    Intercept(Arc<ServerConfig>),
    /// Relay bytes without looking at them.
    Passthrough(PassthroughReason),
}

impl std::fmt::Debug for TunnelPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelPlan::Intercept(_) => f.write_str("Intercept"),
            TunnelPlan::Passthrough(reason) => f.debug_tuple("Passthrough").field(reason).finish(),
        }
    }
}

/// Why a tunnel is not intercepted.
#[derive(Debug)]
pub enum PassthroughReason {
    /// The MITM decision declined the host.
    Declined,
    /// No leaf certificate could be minted for the host.
    Mint(MintError),
}

impl std::fmt::Display for PassthroughReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PassthroughReason::Declined => f.write_str("interception declined"),
            PassthroughReason::Mint(e) => write!(f, "{e}"),
        }
    }
}

/// Builder for [`Dispatcher`].
pub struct DispatcherBuilder {
    context: Arc<InterceptContext>,
    predicate: Arc<dyn MatchPredicate>,
    request_hook: Arc<dyn RequestHook>,
    response_hook: Arc<dyn ResponseHook>,
    mitm: Arc<dyn MitmDecision>,
    transport: TransportConfig,
    handshake_timeout: Duration,
}

impl DispatcherBuilder {
    /// Image matcher, placeholder hooks and always-MITM by default.
    pub fn new(context: Arc<InterceptContext>) -> Self {
        let placeholder = context.placeholder().clone();
        Self {
            predicate: Arc::new(ImageRequestMatcher),
            request_hook: Arc::new(PlaceholderRequestHook::new(placeholder.clone())),
            response_hook: Arc::new(PlaceholderResponseHook::new(placeholder)),
            mitm: Arc::new(AlwaysMitm),
            transport: TransportConfig::default(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            context,
        }
    }

    pub fn match_predicate(mut self, predicate: impl MatchPredicate + 'static) -> Self {
        self.predicate = Arc::new(predicate);
        self
    }

    pub fn request_hook(mut self, hook: impl RequestHook + 'static) -> Self {
        self.request_hook = Arc::new(hook);
        self
    }

    pub fn response_hook(mut self, hook: impl ResponseHook + 'static) -> Self {
        self.response_hook = Arc::new(hook);
        self
    }

    /// Wraps the current response hook, e.g. to add telemetry.
    pub fn wrap_response_hook<H, F>(mut self, wrap: F) -> Self
    where
        H: ResponseHook + 'static,
        F: FnOnce(Arc<dyn ResponseHook>) -> H,
    {
        self.response_hook = Arc::new(wrap(self.response_hook));
        self
    }

    pub fn mitm_decision(mut self, decision: impl MitmDecision + 'static) -> Self {
        self.mitm = Arc::new(decision);
        self
    }

    pub fn transport_config(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    pub fn build(self) -> Result<Dispatcher, ConfigError> {
        Ok(Dispatcher {
            transport: UpstreamTransport::new(self.transport)?,
            context: self.context,
            predicate: self.predicate,
            request_hook: self.request_hook,
            response_hook: self.response_hook,
            mitm: self.mitm,
            handshake_timeout: self.handshake_timeout,
        })
    }
}

/// Routes client connections through the hook pipeline.
pub struct Dispatcher {
    context: Arc<InterceptContext>,
    transport: UpstreamTransport,
    predicate: Arc<dyn MatchPredicate>,
    request_hook: Arc<dyn RequestHook>,
    response_hook: Arc<dyn ResponseHook>,
    mitm: Arc<dyn MitmDecision>,
    handshake_timeout: Duration,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("context", &self.context)
            .field("transport", &self.transport)
            .field("handshake_timeout", &self.handshake_timeout)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn builder(context: Arc<InterceptContext>) -> DispatcherBuilder {
        DispatcherBuilder::new(context)
    }

    pub fn context(&self) -> &InterceptContext {
        &self.context
    }

    pub fn transport(&self) -> &UpstreamTransport {
        &self.transport
    }

    /// Serves one client connection until it closes.
    pub async fn serve_connection<I>(self: Arc<Self>, io: I, peer: SocketAddr)
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let dispatcher = Arc::clone(&self);
        let service = service_fn(move |req: Request<Incoming>| {
            let dispatcher = Arc::clone(&dispatcher);
            async move { Ok::<_, Infallible>(dispatcher.route(req).await) }
        });

        if let Err(e) = server_builder()
            .serve_connection(TokioIo::new(io), service)
            .with_upgrades()
            .await
        {
            tracing::debug!("Client connection {} ended: {}", peer, e);
        }
    }

    /// Routes a request received on the proxy listener.
    pub async fn route(self: Arc<Self>, req: Request<Incoming>) -> Response<ProxyBody> {
        if req.method() == Method::CONNECT {
            return self.handle_connect(req);
        }

        match Target::from_uri(req.uri()) {
            Ok(target) => self.handle_exchange(target, req.map(|b| b.boxed())).await,
            Err(_) => {
                let err = ProtocolError::NotAbsolute(req.uri().to_string());
                tracing::warn!("Rejected request: {}", err);
                bad_request()
            }
        }
    }

    /// Answers a CONNECT and hands the upgraded stream to a tunnel task.
    fn handle_connect(self: Arc<Self>, req: Request<Incoming>) -> Response<ProxyBody> {
        let authority = req.uri().authority().map(|a| a.as_str()).unwrap_or_default();
        let Some((host, port)) = parse_connect_target(authority) else {
            let err = ProtocolError::MalformedConnect(req.uri().to_string());
            tracing::warn!("Rejected CONNECT: {}", err);
            return bad_request();
        };

        let on_upgrade = hyper::upgrade::on(req);
        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => self.run_tunnel(TokioIo::new(upgraded), host, port).await,
                Err(e) => tracing::warn!("CONNECT upgrade for {}:{} failed: {}", host, port, e),
            }
        });

        let mut res = Response::new(empty());
        res.headers_mut()
            .insert(MARKER_HEADER, HeaderValue::from_static(MARKER_VALUE));
        res
    }

    /// Decides between interception and passthrough for a CONNECT target.
    pub fn plan_tunnel(&self, host: &str, port: u16) -> TunnelPlan {
        if !self.mitm.should_intercept(host, port) {
            return TunnelPlan::Passthrough(PassthroughReason::Declined);
        }
        match self.context.authority().server_config(host) {
            Ok(config) => TunnelPlan::Intercept(config),
            Err(e) => TunnelPlan::Passthrough(PassthroughReason::Mint(e)),
        }
    }

    /// Drives one CONNECT tunnel from `Accepted` to a terminal state.
    pub async fn run_tunnel<I>(self: Arc<Self>, client: I, host: String, port: u16)
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut session = TunnelSession::new(host, port);
        let outcome = self.drive_tunnel(&mut session, client).await;

        if let Err(e) = &outcome {
            tracing::warn!("Tunnel {}:{} failed: {}", session.host(), session.port(), e);
        }
        session.finish(outcome.is_err());
    }

    async fn drive_tunnel<I>(
        self: Arc<Self>,
        session: &mut TunnelSession,
        mut client: I,
    ) -> Result<(), ProxyError>
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let plan = self.plan_tunnel(session.host(), session.port());
        session.transition(TunnelState::Handshaking)?;

        let prefix = match read_prefix(&mut client, self.handshake_timeout).await {
            Ok(prefix) if prefix.is_empty() => {
                return Err(HandshakeError::Peek(std::io::ErrorKind::UnexpectedEof.into()).into())
            }
            Ok(prefix) => prefix,
            Err(HandshakeError::Timeout) => {
                tracing::debug!(
                    "No client bytes for {}:{}, relaying",
                    session.host(),
                    session.port()
                );
                return self.passthrough(session, client, Bytes::new()).await;
            }
            Err(e) => return Err(e.into()),
        };

        let config = match plan {
            TunnelPlan::Intercept(config) if is_tls_client_hello(&prefix) => config,
            TunnelPlan::Intercept(_) => {
                tracing::debug!(
                    "Client of {}:{} is not speaking TLS, relaying",
                    session.host(),
                    session.port()
                );
                return self.passthrough(session, client, prefix).await;
            }
            TunnelPlan::Passthrough(reason) => {
                tracing::info!(
                    "Relaying {}:{} without interception: {}",
                    session.host(),
                    session.port(),
                    reason
                );
                return self.passthrough(session, client, prefix).await;
            }
        };

        let acceptor = TlsAcceptor::from(config);
        let tls = timeout(
            self.handshake_timeout,
            acceptor.accept(Rewind::new(prefix, client)),
        )
        .await
        .map_err(|_| HandshakeError::Timeout)?
        .map_err(HandshakeError::Tls)?;
        session.transition(TunnelState::Intercepting)?;

        let origin = Target::new(Scheme::Https, session.host(), session.port());
        let dispatcher = Arc::clone(&self);
        let service = service_fn(move |req: Request<Incoming>| {
            let dispatcher = Arc::clone(&dispatcher);
            let origin = origin.clone();
            async move { Ok::<_, Infallible>(dispatcher.handle_intercepted(origin, req).await) }
        });

        server_builder()
            .serve_connection(TokioIo::new(tls), service)
            .await?;
        Ok(())
    }

    async fn passthrough<I>(
        &self,
        session: &mut TunnelSession,
        mut client: I,
        prefix: Bytes,
    ) -> Result<(), ProxyError>
    where
        I: AsyncRead + AsyncWrite + Unpin,
    {
        session.transition(TunnelState::PlainTunnel)?;
        relay(
            &mut client,
            &prefix,
            session.host(),
            session.port(),
            self.transport.config().connect_timeout,
        )
        .await?;
        Ok(())
    }

    /// Serves a request decrypted from an intercepted tunnel.
    async fn handle_intercepted(&self, origin: Target, req: Request<Incoming>) -> Response<ProxyBody> {
        let (mut parts, body) = req.into_parts();

        let path = parts.uri.path_and_query().map_or("/", |pq| pq.as_str());
        match format!("https://{}{}", origin.host_header(), path).parse::<Uri>() {
            Ok(uri) => parts.uri = uri,
            Err(_) => {
                tracing::warn!("Rejected request: {}", ProtocolError::NotAbsolute(path.to_string()));
                return bad_request();
            }
        }

        self.handle_exchange(origin, Request::from_parts(parts, body.boxed()))
            .await
    }

    /// Runs one exchange through the predicate, hooks and transport.
    ///
    /// The response hook sees every response exactly once, including
    /// synthetic and 502 responses.
    pub async fn handle_exchange(&self, target: Target, req: Request<ProxyBody>) -> Response<ProxyBody> {
        let ctx = ExchangeContext::new(req.method().clone(), req.uri().clone(), target);
        tracing::debug!("Exchange #{} {} {}", ctx.id, ctx.method, ctx.uri);

        let res = if self.predicate.matches(&req) {
            match self.request_hook.on_request(&ctx, req).await {
                RequestOrResponse::Response(res) => res,
                RequestOrResponse::Request(req) => self.transport.forward(&ctx, req).await,
            }
        } else {
            self.transport.forward(&ctx, req).await
        };

        self.response_hook.on_response(&ctx, res).await
    }
}

fn server_builder() -> http1::Builder {
    let mut builder = http1::Builder::new();
    builder.preserve_header_case(true).title_case_headers(false);
    builder
}

/// `400 Bad Request` that also closes the client connection.
fn bad_request() -> Response<ProxyBody> {
    let mut res = Response::new(empty());
    *res.status_mut() = StatusCode::BAD_REQUEST;
    let headers = res.headers_mut();
    headers.insert(CONNECTION, HeaderValue::from_static("close"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
    headers.insert(MARKER_HEADER, HeaderValue::from_static(MARKER_VALUE));
    res
}
