//! Shared utilities for integration tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use rustls::pki_types::ServerName;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use tls_relay::config::ProxyConfig;
use tls_relay::http::{HttpServer, Pipeline, ResponseModifier};
use tls_relay::lifecycle::LifecycleController;
use tls_relay::net::tls::{backend_client_config, load_server_config};
use tls_relay::net::{Listener, ListenerError};
use tls_relay::observability::MemorySink;

/// A self-signed certificate for `localhost` / `127.0.0.1` on disk.
pub struct TestCerts {
    _dir: TempDir,
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl TestCerts {
    pub fn generate() -> Self {
        let dir = TempDir::new().unwrap();
        let generated = rcgen::generate_simple_self_signed(vec![
            "localhost".to_string(),
            "127.0.0.1".to_string(),
        ])
        .unwrap();

        let cert = dir.path().join("server.crt");
        let key = dir.path().join("server.key");
        std::fs::write(&cert, generated.cert.pem()).unwrap();
        std::fs::write(&key, generated.key_pair.serialize_pem()).unwrap();

        Self {
            _dir: dir,
            cert,
            key,
        }
    }
}

/// What the mock backend does with each request.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Answer with a fixed response and keep the connection open.
    Respond { status: u16, body: &'static str },
    /// Read the request and never answer.
    Stall,
    /// Send a chunked response, one chunk per `delay`.
    Stream {
        chunks: Vec<&'static str>,
        delay: Duration,
    },
    /// Answer with bytes that are not HTTP.
    Garbage,
    /// Send a chunked body followed by one announced trailer field.
    Trailer {
        body: &'static str,
        name: &'static str,
        value: &'static str,
    },
}

/// A request as the backend saw it.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
}

impl CapturedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn header_count(&self, name: &str) -> usize {
        self.headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .count()
    }
}

/// Raw-TCP HTTP/1.1 backend that records what it receives.
pub struct MockBackend {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
    accepted: Arc<AtomicUsize>,
}

impl MockBackend {
    pub async fn start(behavior: Behavior) -> Self {
        Self::start_inner(behavior, None).await
    }

    /// Same, behind TLS with the given certificate.
    pub async fn start_tls(behavior: Behavior, certs: &TestCerts) -> Self {
        let acceptor = TlsAcceptor::from(load_server_config(&certs.cert, &certs.key).unwrap());
        Self::start_inner(behavior, Some(acceptor)).await
    }

    async fn start_inner(behavior: Behavior, acceptor: Option<TlsAcceptor>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let accepted = Arc::new(AtomicUsize::new(0));

        let (reqs, count) = (requests.clone(), accepted.clone());
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                count.fetch_add(1, Ordering::SeqCst);
                let behavior = behavior.clone();
                let reqs = reqs.clone();
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    match acceptor {
                        Some(acceptor) => {
                            if let Ok(tls) = acceptor.accept(socket).await {
                                serve(tls, behavior, reqs).await;
                            }
                        }
                        None => serve(socket, behavior, reqs).await,
                    }
                });
            }
        });

        Self {
            addr,
            requests,
            accepted,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn https_url(&self) -> String {
        format!("https://localhost:{}", self.addr.port())
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Number of TCP connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

async fn serve<S>(mut socket: S, behavior: Behavior, requests: Arc<Mutex<Vec<CapturedRequest>>>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = Vec::new();
    while let Some(request) = read_request(&mut socket, &mut buf).await {
        requests.lock().unwrap().push(request);

        match &behavior {
            Behavior::Respond { status, body } => {
                let response = format!(
                    "HTTP/1.1 {status} {}\r\nContent-Length: {}\r\nContent-Type: text/plain\r\n\r\n{body}",
                    reason(*status),
                    body.len()
                );
                if socket.write_all(response.as_bytes()).await.is_err() {
                    return;
                }
                let _ = socket.flush().await;
            }
            Behavior::Stall => {
                let mut sink = [0u8; 1024];
                while matches!(socket.read(&mut sink).await, Ok(n) if n > 0) {}
                return;
            }
            Behavior::Stream { chunks, delay } => {
                let head = "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nContent-Type: text/plain\r\n\r\n";
                if socket.write_all(head.as_bytes()).await.is_err() {
                    return;
                }
                let _ = socket.flush().await;
                for chunk in chunks {
                    tokio::time::sleep(*delay).await;
                    let frame = format!("{:x}\r\n{chunk}\r\n", chunk.len());
                    if socket.write_all(frame.as_bytes()).await.is_err() {
                        return;
                    }
                    let _ = socket.flush().await;
                }
                let _ = socket.write_all(b"0\r\n\r\n").await;
                let _ = socket.flush().await;
            }
            Behavior::Trailer { body, name, value } => {
                let response = format!(
                    "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nTrailer: {name}\r\n\r\n\
                     {:x}\r\n{body}\r\n0\r\n{name}: {value}\r\n\r\n",
                    body.len()
                );
                if socket.write_all(response.as_bytes()).await.is_err() {
                    return;
                }
                let _ = socket.flush().await;
            }
            Behavior::Garbage => {
                let _ = socket.write_all(b"SSH-2.0-OpenSSH_9.6\r\n\r\n").await;
                let _ = socket.flush().await;
                return;
            }
        }
    }
}

async fn read_request<S>(socket: &mut S, buf: &mut Vec<u8>) -> Option<CapturedRequest>
where
    S: AsyncRead + Unpin,
{
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        fill(socket, buf).await?;
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    buf.drain(..head_end);

    let mut lines = head.split("\r\n");
    let mut request_line = lines.next()?.split(' ');
    let method = request_line.next()?.to_string();
    let target = request_line.next()?.to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();

    let length = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);
    while buf.len() < length {
        fill(socket, buf).await?;
    }
    buf.drain(..length);

    Some(CapturedRequest {
        method,
        target,
        headers,
    })
}

async fn fill<S: AsyncRead + Unpin>(socket: &mut S, buf: &mut Vec<u8>) -> Option<()> {
    let mut chunk = [0u8; 4096];
    match socket.read(&mut chunk).await {
        Ok(0) | Err(_) => None,
        Ok(n) => {
            buf.extend_from_slice(&chunk[..n]);
            Some(())
        }
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        404 => "Not Found",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// An address nothing listens on.
pub async fn unreachable_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// A proxy running on an ephemeral port.
pub struct TestProxy {
    pub addr: SocketAddr,
    pub lifecycle: Arc<LifecycleController>,
    pub sink: Arc<MemorySink>,
    pub pipeline: Arc<Pipeline>,
    pub handle: JoinHandle<Result<(), ListenerError>>,
    _certs: TestCerts,
}

impl TestProxy {
    pub fn url(&self, path: &str) -> String {
        format!("https://127.0.0.1:{}{path}", self.addr.port())
    }

    /// The proxy's self-signed certificate.
    pub fn cert(&self) -> &Path {
        &self._certs.cert
    }
}

/// Write `request` verbatim over HTTP/1.1 + TLS and return everything the
/// proxy sends back until it closes the connection.
pub async fn raw_exchange(proxy: &TestProxy, request: &str) -> String {
    let connector = TlsConnector::from(backend_client_config(Some(proxy.cert())).unwrap());
    let tcp = TcpStream::connect(proxy.addr).await.unwrap();
    let name = ServerName::try_from("localhost").unwrap();
    let mut tls = connector.connect(name, tcp).await.unwrap();
    tls.write_all(request.as_bytes()).await.unwrap();

    let mut out = Vec::new();
    let read_all = async {
        let mut chunk = [0u8; 4096];
        loop {
            match tls.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => out.extend_from_slice(&chunk[..n]),
            }
        }
    };
    let _ = tokio::time::timeout(Duration::from_secs(5), read_all).await;
    String::from_utf8_lossy(&out).into_owned()
}

pub async fn spawn_proxy(backend_url: &str, configure: impl FnOnce(&mut ProxyConfig)) -> TestProxy {
    spawn_proxy_with(backend_url, configure, None).await
}

pub async fn spawn_proxy_with(
    backend_url: &str,
    configure: impl FnOnce(&mut ProxyConfig),
    modifier: Option<Arc<dyn ResponseModifier>>,
) -> TestProxy {
    let certs = TestCerts::generate();

    let mut config = ProxyConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();
    config.listener.tls.cert_path = certs.cert.display().to_string();
    config.listener.tls.key_path = certs.key.display().to_string();
    config.backend.url = backend_url.to_string();
    config.timeouts.dial_ms = 1_000;
    config.timeouts.drain_ms = 5_000;
    configure(&mut config);

    let sink = Arc::new(MemorySink::new());
    let mut pipeline = Pipeline::from_config(&config, sink.clone()).unwrap();
    if let Some(modifier) = modifier {
        pipeline = pipeline.with_modifier(modifier);
    }

    let lifecycle = Arc::new(LifecycleController::new());
    let server = HttpServer::with_pipeline(config.clone(), lifecycle.clone(), pipeline).unwrap();
    let pipeline = server.pipeline().clone();

    let listener = Listener::bind(&config.listener).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(server.run(listener));

    TestProxy {
        addr,
        lifecycle,
        sink,
        pipeline,
        handle,
        _certs: certs,
    }
}

/// HTTPS client that trusts the proxy's self-signed certificate.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .no_proxy()
        .build()
        .unwrap()
}

/// Same, but never reuses a connection.
pub fn fresh_client() -> reqwest::Client {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap()
}

/// Poll `check` until it holds or a second passes.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..50 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
