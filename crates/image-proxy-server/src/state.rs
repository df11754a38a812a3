//! Shared state for the trust server.

use std::sync::Arc;

use axum::body::Bytes;
use image_proxy::CertificateAuthority;

/// Read-only state shared by every handler.
#[derive(Debug, Clone)]
pub struct TrustState {
    /// Root certificate, PEM encoded.
    pub root_pem: Arc<str>,
    /// Root certificate, DER encoded.
    pub root_der: Bytes,
    /// Port the proxy listens on, shown in the setup instructions.
    pub proxy_port: u16,
}

impl TrustState {
    pub fn new(root_pem: impl Into<Arc<str>>, root_der: impl Into<Bytes>, proxy_port: u16) -> Self {
        Self {
            root_pem: root_pem.into(),
            root_der: root_der.into(),
            proxy_port,
        }
    }

    /// Captures the public half of a loaded authority.
    pub fn from_authority(authority: &CertificateAuthority, proxy_port: u16) -> Self {
        Self::new(
            authority.root_pem(),
            authority.root_der().to_vec(),
            proxy_port,
        )
    }
}
