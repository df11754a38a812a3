//! Route handlers.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::response::IntoResponse;
use axum::Json;
use tracing::debug;

use crate::local_ipv4;
use crate::models::SetupInfo;
use crate::state::TrustState;

const PEM_PATH: &str = "/ca.pem";
const DER_PATH: &str = "/ca.crt";

/// GET / - Plain-text setup instructions.
pub async fn index(State(state): State<TrustState>) -> String {
    let host = match local_ipv4() {
        Some(ip) => ip.to_string(),
        None => "<could not detect local IP, use this machine's address>".to_string(),
    };

    format!(
        "Image Proxy setup\n\
         =================\n\
         \n\
         1. Install the root certificate and mark it trusted:\n\
         \x20  PEM: http://{host}{PEM_PATH}\n\
         \x20  DER: http://{host}{DER_PATH} (Android, Windows)\n\
         \n\
         2. Point your HTTP and HTTPS proxy at:\n\
         \x20  host: {host}\n\
         \x20  port: {port}\n",
        port = state.proxy_port,
    )
}

/// GET /ca.pem - Root certificate in PEM form.
pub async fn ca_pem(State(state): State<TrustState>) -> impl IntoResponse {
    debug!("Serving root certificate (PEM)");
    (
        [
            (CONTENT_TYPE, "application/x-pem-file"),
            (CONTENT_DISPOSITION, "attachment; filename=\"image-proxy-ca.pem\""),
        ],
        state.root_pem.to_string(),
    )
}

/// GET /ca.crt - Root certificate in DER form.
pub async fn ca_der(State(state): State<TrustState>) -> impl IntoResponse {
    debug!("Serving root certificate (DER)");
    (
        [
            (CONTENT_TYPE, "application/x-x509-ca-cert"),
            (CONTENT_DISPOSITION, "attachment; filename=\"image-proxy-ca.crt\""),
        ],
        Bytes::clone(&state.root_der),
    )
}

/// GET /setup.json - Machine-readable setup details.
pub async fn setup_info(State(state): State<TrustState>) -> Json<SetupInfo> {
    Json(SetupInfo {
        proxy_host: local_ipv4().map(|ip| ip.to_string()),
        proxy_port: state.proxy_port,
        certificate_paths: vec![PEM_PATH, DER_PATH],
    })
}
