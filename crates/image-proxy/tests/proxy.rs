//! End-to-end tests driving the proxy over real sockets.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use image_proxy::{
    CertificateAuthority, Dispatcher, DispatcherBuilder, GeneratedRoot, InterceptContext,
    ProxyConfig, ProxyHandle, ProxyServer, TransportConfig,
};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

const PLACEHOLDER: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44, 0x52,
];

const CHROME_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
    (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";

const JSON_RESPONSE: &[u8] =
    b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 11\r\n\r\n{\"ok\":true}";

const JPEG_RESPONSE: &[u8] =
    b"HTTP/1.1 200 OK\r\nContent-Type: image/jpeg\r\nContent-Length: 10\r\n\r\n\xFF\xD8\xFF\xE0jpeg!!";

struct RawResponse {
    status: u16,
    head: String,
    body: Vec<u8>,
}

impl RawResponse {
    fn header(&self, name: &str) -> Option<&str> {
        self.head.lines().skip(1).find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.eq_ignore_ascii_case(name).then(|| value.trim())
        })
    }
}

/// Reads up to and including the blank line ending a message head.
async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> (String, Vec<u8>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let rest = buf.split_off(end + 4);
            return (String::from_utf8_lossy(&buf).into_owned(), rest);
        }
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "stream closed before end of head");
        buf.extend_from_slice(&chunk[..n]);
    }
}

async fn read_response<S: AsyncRead + Unpin>(stream: &mut S) -> RawResponse {
    let (head, mut body) = read_head(stream).await;
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap();
    let mut response = RawResponse {
        status,
        head,
        body: Vec::new(),
    };

    let length: usize = response
        .header("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let mut chunk = [0u8; 1024];
    while body.len() < length {
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "stream closed before end of body");
        body.extend_from_slice(&chunk[..n]);
    }
    response.body = body;
    response
}

async fn exchange<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S, request: &str) -> RawResponse {
    stream.write_all(request.as_bytes()).await.unwrap();
    read_response(stream).await
}

async fn start_proxy(
    configure: impl FnOnce(DispatcherBuilder) -> DispatcherBuilder,
) -> (ProxyHandle, GeneratedRoot) {
    let root = CertificateAuthority::generate("Image Proxy Integration CA").unwrap();
    let context =
        InterceptContext::load(root.cert_pem.as_bytes(), root.key_pem.as_bytes(), PLACEHOLDER)
            .unwrap();

    let config = ProxyConfig::new().with_port(0).with_transport(
        TransportConfig::default()
            .with_connect_timeout(Duration::from_secs(2))
            .with_request_timeout(Duration::from_secs(5)),
    );
    let server = ProxyServer::bind(config, configure(Dispatcher::builder(Arc::new(context))))
        .await
        .unwrap();
    (server.start().unwrap(), root)
}

/// Plain HTTP origin that records each request head and answers with a
/// canned response.
struct Origin {
    port: u16,
    hits: Arc<AtomicUsize>,
    heads: mpsc::UnboundedReceiver<String>,
}

async fn spawn_origin(response: &'static [u8]) -> Origin {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let hits = Arc::new(AtomicUsize::new(0));
    let (tx, heads) = mpsc::unbounded_channel();

    let counter = Arc::clone(&hits);
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let counter = Arc::clone(&counter);
            let tx = tx.clone();
            tokio::spawn(async move {
                loop {
                    let mut buf = [0u8; 1];
                    if stream.peek(&mut buf).await.map_or(true, |n| n == 0) {
                        return;
                    }
                    let (head, _) = read_head(&mut stream).await;
                    counter.fetch_add(1, Ordering::SeqCst);
                    let _ = tx.send(head);
                    if stream.write_all(response).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    Origin { port, hits, heads }
}

/// HTTPS origin for `localhost` signed by its own throwaway root.
async fn spawn_tls_origin(response: &'static [u8]) -> (u16, GeneratedRoot) {
    let root = CertificateAuthority::generate("Origin CA").unwrap();
    let ca = CertificateAuthority::load(root.cert_pem.as_bytes(), root.key_pem.as_bytes()).unwrap();
    let acceptor = TlsAcceptor::from(ca.server_config("localhost").unwrap());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(mut tls) = acceptor.accept(stream).await else {
                    return;
                };
                read_head(&mut tls).await;
                let _ = tls.write_all(response).await;
                let _ = tls.flush().await;
                // Hold the stream open until the peer is done reading.
                let mut sink = [0u8; 64];
                let _ = tls.read(&mut sink).await;
            });
        }
    });

    (port, root)
}

fn tls_client_trusting(root: &GeneratedRoot) -> TlsConnector {
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut root.cert_pem.as_bytes()) {
        roots.add(cert.unwrap()).unwrap();
    }
    let config = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

async fn open_tunnel(proxy: SocketAddr, target: &str) -> TcpStream {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let (head, rest) = read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");
    assert!(rest.is_empty());
    stream
}

fn get(url: &str, host: &str, extra_headers: &str) -> String {
    format!("GET {url} HTTP/1.1\r\nHost: {host}\r\n{extra_headers}\r\n")
}

#[tokio::test]
async fn image_accept_is_answered_without_upstream_call() {
    let origin = spawn_origin(JSON_RESPONSE).await;
    let (proxy, _) = start_proxy(|b| b).await;
    let host = format!("127.0.0.1:{}", origin.port);

    let mut client = TcpStream::connect(proxy.addr()).await.unwrap();
    let res = exchange(
        &mut client,
        &get(
            &format!("http://{host}/avatar"),
            &host,
            "User-Agent: Mozilla/5.0 Firefox/127.0\r\nAccept: image/avif,image/webp,*/*\r\n",
        ),
    )
    .await;

    assert_eq!(res.status, 200);
    assert_eq!(res.header("content-type"), Some("image/png"));
    assert_eq!(res.header("x-image-proxy"), Some("1"));
    assert_eq!(res.body, PLACEHOLDER);
    assert_eq!(origin.hits.load(Ordering::SeqCst), 0);

    proxy.stop().await;
}

#[tokio::test]
async fn chromium_image_path_is_answered_without_upstream_call() {
    let origin = spawn_origin(JSON_RESPONSE).await;
    let (proxy, _) = start_proxy(|b| b).await;
    let host = format!("127.0.0.1:{}", origin.port);

    let mut client = TcpStream::connect(proxy.addr()).await.unwrap();
    let res = exchange(
        &mut client,
        &get(
            &format!("http://{host}/photo.jpg"),
            &host,
            &format!("User-Agent: {CHROME_UA}\r\nAccept: */*\r\n"),
        ),
    )
    .await;

    assert_eq!(res.status, 200);
    assert_eq!(res.body, PLACEHOLDER);
    assert_eq!(origin.hits.load(Ordering::SeqCst), 0);

    proxy.stop().await;
}

#[tokio::test]
async fn chromium_ignores_image_accept_on_non_image_path() {
    let mut origin = spawn_origin(JSON_RESPONSE).await;
    let (proxy, _) = start_proxy(|b| b).await;
    let host = format!("127.0.0.1:{}", origin.port);

    let mut client = TcpStream::connect(proxy.addr()).await.unwrap();
    let res = exchange(
        &mut client,
        &get(
            &format!("http://{host}/api/data.json"),
            &host,
            &format!("User-Agent: {CHROME_UA}\r\nAccept: image/webp,*/*\r\n"),
        ),
    )
    .await;

    assert_eq!(res.status, 200);
    assert_eq!(res.body, b"{\"ok\":true}");
    assert_eq!(res.header("x-image-proxy"), Some("1"));
    assert!(origin.heads.recv().await.unwrap().starts_with("GET /api/data.json HTTP/1.1"));

    proxy.stop().await;
}

#[tokio::test]
async fn image_response_is_replaced_with_placeholder() {
    let origin = spawn_origin(JPEG_RESPONSE).await;
    let (proxy, _) = start_proxy(|b| b).await;
    let host = format!("127.0.0.1:{}", origin.port);

    let mut client = TcpStream::connect(proxy.addr()).await.unwrap();
    let res = exchange(
        &mut client,
        &get(&format!("http://{host}/download?id=7"), &host, "Accept: */*\r\n"),
    )
    .await;

    assert_eq!(res.status, 200);
    assert_eq!(res.body, PLACEHOLDER);
    assert_eq!(
        res.header("content-length"),
        Some(PLACEHOLDER.len().to_string().as_str())
    );
    assert_eq!(res.header("x-image-proxy"), Some("1"));
    assert_eq!(origin.hits.load(Ordering::SeqCst), 1);

    proxy.stop().await;
}

#[tokio::test]
async fn json_passes_through_with_marker() {
    let mut origin = spawn_origin(JSON_RESPONSE).await;
    let (proxy, _) = start_proxy(|b| b).await;
    let host = format!("127.0.0.1:{}", origin.port);

    let mut client = TcpStream::connect(proxy.addr()).await.unwrap();
    let request = get(
        &format!("http://{host}/data.json"),
        &host,
        "Accept: application/json\r\n",
    );

    for _ in 0..2 {
        let res = exchange(&mut client, &request).await;
        assert_eq!(res.status, 200);
        assert_eq!(res.header("content-type"), Some("application/json"));
        assert_eq!(res.header("x-image-proxy"), Some("1"));
        assert_eq!(res.body, b"{\"ok\":true}");
    }

    let head = origin.heads.recv().await.unwrap();
    assert!(head.starts_with("GET /data.json HTTP/1.1\r\n"), "{head}");
    assert_eq!(origin.hits.load(Ordering::SeqCst), 2);

    proxy.stop().await;
}

#[tokio::test]
async fn header_casing_reaches_upstream_unchanged() {
    let mut origin = spawn_origin(JSON_RESPONSE).await;
    let (proxy, _) = start_proxy(|b| b).await;
    let host = format!("127.0.0.1:{}", origin.port);

    let mut client = TcpStream::connect(proxy.addr()).await.unwrap();
    let res = exchange(
        &mut client,
        &get(
            &format!("http://{host}/data.json"),
            &host,
            "non-canonical-header-name: kept\r\nX-MiXeD-Case: also\r\nProxy-Connection: keep-alive\r\n",
        ),
    )
    .await;
    assert_eq!(res.status, 200);

    let head = origin.heads.recv().await.unwrap();
    assert!(head.contains("\r\nnon-canonical-header-name: kept\r\n"), "{head}");
    assert!(head.contains("\r\nX-MiXeD-Case: also\r\n"), "{head}");
    assert!(!head.to_ascii_lowercase().contains("proxy-connection"), "{head}");

    proxy.stop().await;
}

#[tokio::test]
async fn unreachable_upstream_is_bad_gateway() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let (proxy, _) = start_proxy(|b| b).await;
    let host = format!("127.0.0.1:{port}");

    let mut client = TcpStream::connect(proxy.addr()).await.unwrap();
    let res = exchange(
        &mut client,
        &get(&format!("http://{host}/data.json"), &host, "Accept: application/json\r\n"),
    )
    .await;

    assert_eq!(res.status, 502);
    assert!(res.body.is_empty());
    assert_eq!(res.header("x-image-proxy"), Some("1"));

    proxy.stop().await;
}

#[tokio::test]
async fn origin_form_request_is_rejected() {
    let (proxy, _) = start_proxy(|b| b).await;

    let mut client = TcpStream::connect(proxy.addr()).await.unwrap();
    let res = exchange(&mut client, &get("/", "proxy.local", "")).await;
    assert_eq!(res.status, 400);

    proxy.stop().await;
}

#[tokio::test]
async fn connect_is_intercepted_with_a_minted_leaf() {
    let (origin_port, _) = spawn_tls_origin(JSON_RESPONSE).await;
    let (proxy, root) = start_proxy(|b| b).await;
    let target = format!("localhost:{origin_port}");

    let tunnel = open_tunnel(proxy.addr(), &target).await;
    let server_name = ServerName::try_from("localhost").unwrap();
    let mut tls = tls_client_trusting(&root)
        .connect(server_name, tunnel)
        .await
        .unwrap();

    let res = exchange(
        &mut tls,
        &get("/avatar.png", &target, "Accept: image/png,image/*\r\n"),
    )
    .await;
    assert_eq!(res.status, 200);
    assert_eq!(res.body, PLACEHOLDER);
    assert_eq!(res.header("x-image-proxy"), Some("1"));

    let res = exchange(
        &mut tls,
        &get("/data.json", &target, "Accept: application/json\r\n"),
    )
    .await;
    assert_eq!(res.status, 200);
    assert_eq!(res.body, b"{\"ok\":true}");
    assert_eq!(res.header("x-image-proxy"), Some("1"));

    proxy.stop().await;
}

#[tokio::test]
async fn intercepted_image_response_is_replaced() {
    let (origin_port, _) = spawn_tls_origin(JPEG_RESPONSE).await;
    let (proxy, root) = start_proxy(|b| b).await;
    let target = format!("localhost:{origin_port}");

    let tunnel = open_tunnel(proxy.addr(), &target).await;
    let mut tls = tls_client_trusting(&root)
        .connect(ServerName::try_from("localhost").unwrap(), tunnel)
        .await
        .unwrap();

    let res = exchange(&mut tls, &get("/cdn/asset", &target, "Accept: */*\r\n")).await;
    assert_eq!(res.status, 200);
    assert_eq!(res.body, PLACEHOLDER);

    proxy.stop().await;
}

#[tokio::test]
async fn declined_host_is_tunneled_untouched() {
    let (origin_port, origin_root) = spawn_tls_origin(JPEG_RESPONSE).await;
    let (proxy, _) = start_proxy(|b| b.mitm_decision(|host: &str, _port: u16| host != "localhost")).await;
    let target = format!("localhost:{origin_port}");

    // Only the origin's own root is trusted, so the handshake succeeds only
    // if the proxy stays out of the way.
    let tunnel = open_tunnel(proxy.addr(), &target).await;
    let mut tls = tls_client_trusting(&origin_root)
        .connect(ServerName::try_from("localhost").unwrap(), tunnel)
        .await
        .unwrap();

    let res = exchange(&mut tls, &get("/photo.jpg", &target, "Accept: image/*\r\n")).await;
    assert_eq!(res.status, 200);
    assert_eq!(res.body, b"\xFF\xD8\xFF\xE0jpeg!!");
    assert_eq!(res.header("x-image-proxy"), None);

    proxy.stop().await;
}

#[tokio::test]
async fn unmintable_host_is_tunneled_untouched() {
    let (origin_port, origin_root) = spawn_tls_origin(JPEG_RESPONSE).await;
    let (proxy, _) = start_proxy(|b| b).await;

    // `127.1` resolves to loopback but is neither an IP literal nor a DNS
    // name, so no leaf can be minted for it.
    let target = format!("127.1:{origin_port}");
    let tunnel = open_tunnel(proxy.addr(), &target).await;
    let mut tls = tls_client_trusting(&origin_root)
        .connect(ServerName::try_from("localhost").unwrap(), tunnel)
        .await
        .unwrap();

    let res = exchange(&mut tls, &get("/photo.jpg", &target, "Accept: image/*\r\n")).await;
    assert_eq!(res.status, 200);
    assert_eq!(res.body, b"\xFF\xD8\xFF\xE0jpeg!!");
    assert_eq!(res.header("x-image-proxy"), None);

    proxy.stop().await;
}

#[tokio::test]
async fn non_tls_connect_is_relayed_with_replayed_prefix() {
    let mut origin = spawn_origin(JPEG_RESPONSE).await;
    let (proxy, _) = start_proxy(|b| b).await;
    let target = format!("127.0.0.1:{}", origin.port);

    let mut tunnel = open_tunnel(proxy.addr(), &target).await;
    let res = exchange(&mut tunnel, &get("/photo.jpg", &target, "Accept: image/*\r\n")).await;

    assert_eq!(res.status, 200);
    assert_eq!(res.body, b"\xFF\xD8\xFF\xE0jpeg!!");
    assert_eq!(res.header("x-image-proxy"), None);
    assert!(origin.heads.recv().await.unwrap().starts_with("GET /photo.jpg HTTP/1.1\r\n"));

    proxy.stop().await;
}

#[tokio::test]
async fn malformed_connect_is_rejected() {
    let (proxy, _) = start_proxy(|b| b).await;

    let mut client = TcpStream::connect(proxy.addr()).await.unwrap();
    let res = exchange(
        &mut client,
        "CONNECT example.com:notaport HTTP/1.1\r\nHost: example.com\r\n\r\n",
    )
    .await;
    assert_eq!(res.status, 400);

    proxy.stop().await;
}
