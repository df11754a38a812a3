//! Command-line configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use image_proxy::{
    CertificateAuthority, ConfigError, InterceptContext, ProxyConfig, TransportConfig,
};

/// File name of a generated root certificate.
pub const ROOT_CERT_FILE: &str = "rootCA.pem";

/// File name of a generated root private key.
pub const ROOT_KEY_FILE: &str = "private_key.pem";

/// Image Proxy - replaces image traffic with a placeholder
#[derive(Parser, Debug)]
#[command(name = "image-proxy", version, about, subcommand_negates_reqs = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Proxy listen port
    #[arg(long, env = "PORT", required = true)]
    pub port: Option<u16>,

    /// Proxy listen address
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind: IpAddr,

    /// Root CA certificate (PEM)
    #[arg(long, env = "PUB_CERT_PATH", required = true)]
    pub cert: Option<PathBuf>,

    /// Root CA private key (PEM)
    #[arg(long, env = "PRIVATE_CERT_KEY", required = true)]
    pub key: Option<PathBuf>,

    /// Image served in place of every image response
    #[arg(long, env = "PLACEHOLDER_IMAGE_PATH", required = true)]
    pub placeholder: Option<PathBuf>,

    /// Port of the certificate download page (0 disables it)
    #[arg(long, env = "TRUST_PORT", default_value_t = image_proxy_server::DEFAULT_PORT)]
    pub trust_port: u16,

    /// Upstream request timeout in seconds
    #[arg(long, default_value_t = 30)]
    pub request_timeout: u64,

    /// Idle upstream connection lifetime in seconds
    #[arg(long, default_value_t = 90)]
    pub idle_timeout: u64,

    /// Idle upstream connections kept per host
    #[arg(long, default_value_t = 10)]
    pub max_idle_per_host: usize,

    /// Verify upstream server certificates against the webpki roots
    #[arg(long)]
    pub verify_upstream: bool,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Also write daily rotated logs to this directory
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Generate a new root CA and write it to disk
    GenerateCa {
        /// Output directory
        #[arg(long, default_value = ".")]
        out: PathBuf,

        /// Common name of the root certificate
        #[arg(long, default_value = "Image Proxy CA")]
        common_name: String,
    },
}

impl Args {
    /// Proxy listener and upstream transport settings.
    pub fn proxy_config(&self) -> Result<ProxyConfig, ConfigError> {
        let port = self.port.ok_or(ConfigError::Missing("port"))?;
        let transport = TransportConfig::default()
            .with_request_timeout(Duration::from_secs(self.request_timeout))
            .with_idle_timeout(Duration::from_secs(self.idle_timeout))
            .with_max_idle_per_host(self.max_idle_per_host)
            .with_verify_upstream(self.verify_upstream);

        Ok(ProxyConfig::new()
            .with_addr(SocketAddr::new(self.bind, port))
            .with_transport(transport))
    }

    /// Reads the root CA and placeholder image and validates them.
    pub fn load_context(&self) -> Result<Arc<InterceptContext>> {
        let cert = self.cert.as_deref().ok_or(ConfigError::Missing("cert"))?;
        let key = self.key.as_deref().ok_or(ConfigError::Missing("key"))?;
        let placeholder = self
            .placeholder
            .as_deref()
            .ok_or(ConfigError::Missing("placeholder"))?;

        let context = InterceptContext::load(&read(cert)?, &read(key)?, read(placeholder)?)?;
        tracing::info!(
            "Loaded root CA from {} and {} byte placeholder from {}",
            cert.display(),
            context.placeholder().len(),
            placeholder.display()
        );
        Ok(Arc::new(context))
    }
}

fn read(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

/// Writes a freshly generated root CA into `out`.
///
/// Returns the certificate and key paths. Existing files are never
/// overwritten.
pub fn generate_ca(out: &Path, common_name: &str) -> Result<(PathBuf, PathBuf)> {
    let cert_path = out.join(ROOT_CERT_FILE);
    let key_path = out.join(ROOT_KEY_FILE);
    for path in [&cert_path, &key_path] {
        anyhow::ensure!(!path.exists(), "{} already exists", path.display());
    }

    let root = CertificateAuthority::generate(common_name)?;
    std::fs::create_dir_all(out)
        .with_context(|| format!("failed to create {}", out.display()))?;
    std::fs::write(&cert_path, root.cert_pem)
        .with_context(|| format!("failed to write {}", cert_path.display()))?;
    write_private(&key_path, root.key_pem.as_bytes())
        .with_context(|| format!("failed to write {}", key_path.display()))?;

    Ok((cert_path, key_path))
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, contents)
}
