//! Upstream origin addressing.

use std::fmt;

use hyper::http::uri::Authority;
use hyper::Uri;

use crate::error::UpstreamError;

/// Transport scheme of an upstream origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    /// Well-known port for the scheme.
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// An upstream origin: scheme, host and port.
///
/// IPv6 hosts keep their brackets, matching how they appear in URIs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
        }
    }

    /// Extracts the origin from an absolute-form URI.
    pub fn from_uri(uri: &Uri) -> Result<Self, UpstreamError> {
        let scheme = match uri.scheme_str() {
            Some(s) if s.eq_ignore_ascii_case("http") => Scheme::Http,
            Some(s) if s.eq_ignore_ascii_case("https") => Scheme::Https,
            _ => return Err(UpstreamError::InvalidTarget(uri.to_string())),
        };
        let host = uri
            .host()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| UpstreamError::InvalidTarget(uri.to_string()))?;
        let port = uri.port_u16().unwrap_or_else(|| scheme.default_port());

        Ok(Self::new(scheme, host, port))
    }

    /// Host without IPv6 brackets, as used for DNS and SNI.
    pub fn bare_host(&self) -> &str {
        self.host.trim_start_matches('[').trim_end_matches(']')
    }

    /// `host:port` suitable for a socket connect.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Value for a `Host` header; the port is omitted when it is the default.
    pub fn host_header(&self) -> String {
        if self.port == self.scheme.default_port() {
            self.host.clone()
        } else {
            self.authority()
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme.as_str(), self.host, self.port)
    }
}

/// Parses a CONNECT request target (`host:port`).
///
/// The port defaults to 443 when absent. Returns `None` for anything that
/// is not a bare authority.
pub fn parse_connect_target(target: &str) -> Option<(String, u16)> {
    let authority: Authority = target.parse().ok()?;
    if authority.as_str().contains('@') {
        return None;
    }
    let host = authority.host();
    if host.is_empty() {
        return None;
    }
    let port = match &authority.as_str()[host.len()..] {
        "" => Scheme::Https.default_port(),
        rest => rest.strip_prefix(':')?.parse().ok()?,
    };
    Some((host.to_string(), port))
}
