//! Image Proxy - MITM forward proxy that replaces image traffic with a
//! placeholder.
//!
//! HTTPS is decrypted with a locally trusted root CA; plain HTTP is proxied
//! in absolute form. Every exchange is classified and image traffic never
//! reaches the client as-is.
//!
//! ## Features
//!
//! - Mints per-host leaf certificates on the fly from a loaded root CA
//! - Falls back to an opaque tunnel when a host cannot be intercepted
//! - Answers image requests locally, without any upstream call
//! - Rewrites image responses that slip through to the placeholder
//! - Stamps `X-Image-Proxy: 1` on every response
//! - Pools upstream connections and preserves header casing end to end
//!
//! ## Architecture
//!
//! ```text
//! Client ─▶ Dispatcher ─▶ CONNECT? ──yes──▶ MITM decision + leaf mint
//!                │                              │
//!                │                    ┌─────────┴──────────┐
//!                │                    │ TLS hello          │ otherwise
//!                │                    ▼                    ▼
//!                │              TLS termination       Plain tunnel
//!                │                    │
//!                ▼                    ▼
//!          HTTP exchange ◀────────────┘
//!                │
//!         Image request? ──yes──▶ Placeholder (no upstream call)
//!                │ no                   │
//!                ▼                      │
//!         Upstream transport            │
//!                │                      │
//!                ▼                      ▼
//!            Response hook (rewrite images, stamp marker) ─▶ Client
//! ```

pub mod body;
pub mod ca;
pub mod classifier;
mod context;
pub mod dispatcher;
mod error;
pub mod hooks;
pub mod placeholder;
mod proxy;
pub mod target;
pub mod transport;
pub mod tunnel;

pub use body::ProxyBody;
pub use ca::{CertificateAuthority, GeneratedRoot};
pub use context::InterceptContext;
pub use dispatcher::{Dispatcher, DispatcherBuilder, PassthroughReason, TunnelPlan};
pub use error::{
    ConfigError, HandshakeError, MintError, ProtocolError, ProxyError, Result, UpstreamError,
};
pub use hooks::{
    AlwaysMitm, ExchangeContext, ImageRequestMatcher, MatchPredicate, MitmDecision,
    PlaceholderRequestHook, PlaceholderResponseHook, RequestHook, RequestOrResponse, ResponseHook,
};
pub use placeholder::PlaceholderAsset;
pub use proxy::{ProxyConfig, ProxyHandle, ProxyServer};
pub use target::{Scheme, Target};
pub use transport::{TransportConfig, UpstreamTransport};
pub use tunnel::{TunnelSession, TunnelState};

/// Default proxy port.
pub const DEFAULT_PROXY_PORT: u16 = 8080;

/// Header stamped on every response that passes through the proxy.
pub const MARKER_HEADER: &str = "x-image-proxy";

/// Value of [`MARKER_HEADER`].
pub const MARKER_VALUE: &str = "1";
