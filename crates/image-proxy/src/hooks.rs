//! Request/response hook pipeline.
//!
//! The dispatcher runs every intercepted exchange through the same steps:
//!
//! ```text
//! request ─▶ MatchPredicate ──match──▶ RequestHook ──▶ synthetic response ─┐
//!                 │                                                         │
//!                 └──no match──▶ UpstreamTransport ──▶ upstream response ───┤
//!                                                                           ▼
//!                                                   ResponseHook ─▶ client
//! ```
//!
//! Each seam is a trait object so the pieces can be swapped or wrapped
//! (e.g. by a telemetry layer) independently.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use hyper::header::{HeaderValue, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};
use hyper::{Method, Request, Response, StatusCode, Uri};

use crate::body::{full, ProxyBody};
use crate::classifier::{is_image_request, is_image_response};
use crate::placeholder::{PlaceholderAsset, PLACEHOLDER_CONTENT_TYPE};
use crate::target::Target;
use crate::{MARKER_HEADER, MARKER_VALUE};

static NEXT_EXCHANGE_ID: AtomicU64 = AtomicU64::new(1);

/// Per-exchange metadata handed to every hook.
#[derive(Debug, Clone)]
pub struct ExchangeContext {
    /// Process-unique exchange id.
    pub id: u64,
    pub method: Method,
    /// Absolute URI of the request.
    pub uri: Uri,
    pub target: Target,
    /// When the exchange was accepted.
    pub started: Instant,
}

impl ExchangeContext {
    pub fn new(method: Method, uri: Uri, target: Target) -> Self {
        Self {
            id: NEXT_EXCHANGE_ID.fetch_add(1, Ordering::Relaxed),
            method,
            uri,
            target,
            started: Instant::now(),
        }
    }
}

/// Outcome of a request hook.
#[derive(Debug)]
pub enum RequestOrResponse {
    /// Forward this request upstream.
    Request(Request<ProxyBody>),
    /// Answer the client directly.
    Response(Response<ProxyBody>),
}

/// Decides whether a request is handed to the request hook.
pub trait MatchPredicate: Send + Sync {
    fn matches(&self, req: &Request<ProxyBody>) -> bool;
}

impl<F> MatchPredicate for F
where
    F: Fn(&Request<ProxyBody>) -> bool + Send + Sync,
{
    fn matches(&self, req: &Request<ProxyBody>) -> bool {
        self(req)
    }
}

/// Runs on matched requests before any upstream call.
#[async_trait]
pub trait RequestHook: Send + Sync {
    async fn on_request(&self, ctx: &ExchangeContext, req: Request<ProxyBody>) -> RequestOrResponse;
}

/// Runs exactly once on every response before it reaches the client.
#[async_trait]
pub trait ResponseHook: Send + Sync {
    async fn on_response(&self, ctx: &ExchangeContext, res: Response<ProxyBody>) -> Response<ProxyBody>;
}

#[async_trait]
impl<H: ResponseHook + ?Sized> ResponseHook for Arc<H> {
    async fn on_response(&self, ctx: &ExchangeContext, res: Response<ProxyBody>) -> Response<ProxyBody> {
        (**self).on_response(ctx, res).await
    }
}

/// Decides whether a CONNECT tunnel is intercepted or passed through.
pub trait MitmDecision: Send + Sync {
    fn should_intercept(&self, host: &str, port: u16) -> bool;
}

impl<F> MitmDecision for F
where
    F: Fn(&str, u16) -> bool + Send + Sync,
{
    fn should_intercept(&self, host: &str, port: u16) -> bool {
        self(host, port)
    }
}

/// Intercepts every tunnel.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysMitm;

impl MitmDecision for AlwaysMitm {
    fn should_intercept(&self, _host: &str, _port: u16) -> bool {
        true
    }
}

/// Matches image requests using the traffic classifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageRequestMatcher;

impl MatchPredicate for ImageRequestMatcher {
    fn matches(&self, req: &Request<ProxyBody>) -> bool {
        is_image_request(req.uri(), req.headers())
    }
}

/// Answers matched requests with the placeholder image.
#[derive(Debug, Clone)]
pub struct PlaceholderRequestHook {
    placeholder: PlaceholderAsset,
}

impl PlaceholderRequestHook {
    pub fn new(placeholder: PlaceholderAsset) -> Self {
        Self { placeholder }
    }
}

#[async_trait]
impl RequestHook for PlaceholderRequestHook {
    async fn on_request(&self, ctx: &ExchangeContext, _req: Request<ProxyBody>) -> RequestOrResponse {
        tracing::debug!("Short-circuiting image request #{} {}", ctx.id, ctx.uri);
        RequestOrResponse::Response(placeholder_response(&self.placeholder))
    }
}

/// Replaces image response bodies with the placeholder and stamps the
/// marker header on every response.
#[derive(Debug, Clone)]
pub struct PlaceholderResponseHook {
    placeholder: PlaceholderAsset,
}

impl PlaceholderResponseHook {
    pub fn new(placeholder: PlaceholderAsset) -> Self {
        Self { placeholder }
    }
}

#[async_trait]
impl ResponseHook for PlaceholderResponseHook {
    async fn on_response(&self, ctx: &ExchangeContext, res: Response<ProxyBody>) -> Response<ProxyBody> {
        let mut res = if is_image_response(res.headers()) && status_allows_body(res.status()) {
            tracing::debug!("Replacing image response #{} {}", ctx.id, ctx.uri);
            replace_body(res, &self.placeholder)
        } else {
            res
        };

        res.headers_mut()
            .insert(MARKER_HEADER, HeaderValue::from_static(MARKER_VALUE));
        res
    }
}

/// Builds the synthetic `200 image/png` placeholder response.
pub fn placeholder_response(placeholder: &PlaceholderAsset) -> Response<ProxyBody> {
    let mut res = Response::new(full(placeholder.bytes()));
    let headers = res.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(PLACEHOLDER_CONTENT_TYPE));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(placeholder.len()));
    res
}

/// Swaps the body for the placeholder. The upstream body is dropped here,
/// which discards its connection rather than returning it half-read.
fn replace_body(res: Response<ProxyBody>, placeholder: &PlaceholderAsset) -> Response<ProxyBody> {
    let (mut parts, _upstream) = res.into_parts();
    parts.headers.remove(TRANSFER_ENCODING);
    parts.headers.remove(CONTENT_ENCODING);
    parts
        .headers
        .insert(CONTENT_TYPE, HeaderValue::from_static(PLACEHOLDER_CONTENT_TYPE));
    parts
        .headers
        .insert(CONTENT_LENGTH, HeaderValue::from(placeholder.len()));
    Response::from_parts(parts, full(placeholder.bytes()))
}

/// Returns false for statuses that must not carry a body.
pub fn status_allows_body(status: StatusCode) -> bool {
    !(status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED)
}
