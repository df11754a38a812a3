//! Response models.

use serde::Serialize;

/// Response for GET /setup.json.
#[derive(Debug, Serialize)]
pub struct SetupInfo {
    /// Local IPv4 address of this machine, if one could be detected.
    pub proxy_host: Option<String>,
    pub proxy_port: u16,
    /// Paths the root certificate can be downloaded from.
    pub certificate_paths: Vec<&'static str>,
}
