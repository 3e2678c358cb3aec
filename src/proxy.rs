use crate::acme::{Http01Challenges, ACME_TLS_ALPN_NAME};
use crate::error::{json_error_response, ProxyErrorCode};
use crate::loadbalancer::LoadBalancer;
use crate::pool::ConnectionPool;
use crate::registry::{strip_port, Registry};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
const X_REAL_IP: &str = "x-real-ip";
const X_REMOTE_IP: &str = "x-remote-ip";
const X_REMOTE_PORT: &str = "x-remote-port";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Connection-scoped headers that are never forwarded
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Maximum hostname length (RFC 1035)
const MAX_HOSTNAME_LEN: usize = 253;

/// Routing state shared by every listener.
///
/// Everything here is read per request; the only mutation a request makes
/// is advancing the round-robin counter of its hostname.
pub struct Router {
    registry: Arc<Registry>,
    balancer: LoadBalancer,
    pool: ConnectionPool,
    request_timeout: Duration,
}

impl Router {
    pub fn new(registry: Arc<Registry>, pool: ConnectionPool, request_timeout: Duration) -> Self {
        Self {
            registry,
            balancer: LoadBalancer::new(),
            pool,
            request_timeout,
        }
    }
}

/// One listening socket of the gateway, plain or TLS
pub struct ProxyServer {
    listener: TcpListener,
    router: Arc<Router>,
    shutdown_rx: watch::Receiver<bool>,
    tls_acceptor: Option<TlsAcceptor>,
    /// ACME HTTP-01 challenges
    acme_challenges: Option<Http01Challenges>,
}

impl ProxyServer {
    /// Bind the listening socket. Failing to bind is fatal for the caller.
    pub async fn bind(
        bind_addr: SocketAddr,
        router: Arc<Router>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Cannot bind {}: {}", bind_addr, e))?;

        Ok(Self {
            listener,
            router,
            shutdown_rx,
            tls_acceptor: None,
            acme_challenges: None,
        })
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    /// Set ACME HTTP-01 challenge handler
    pub fn with_acme_challenges(mut self, challenges: Http01Challenges) -> Self {
        self.acme_challenges = Some(challenges);
        self
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let protocol = if self.tls_acceptor.is_some() { "HTTPS" } else { "HTTP" };
        let addr = self.listener.local_addr()?;
        info!(addr = %addr, protocol, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let router = Arc::clone(&self.router);
                            let tls_acceptor = self.tls_acceptor.clone();
                            let acme_challenges = self.acme_challenges.clone();

                            tokio::spawn(async move {
                                if let Some(acceptor) = tls_acceptor {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            // TLS-ALPN-01 validation only needs the handshake
                                            if tls_stream.get_ref().1.alpn_protocol() == Some(ACME_TLS_ALPN_NAME) {
                                                debug!(addr = %addr, "Completed ACME TLS-ALPN-01 handshake");
                                                return;
                                            }
                                            if let Err(e) = handle_connection(tls_stream, addr, router, true, None).await {
                                                debug!(addr = %addr, error = %e, "TLS connection error");
                                            }
                                        }
                                        Err(e) => {
                                            debug!(addr = %addr, error = %e, "TLS handshake failed");
                                        }
                                    }
                                } else if let Err(e) = handle_connection(stream, addr, router, false, acme_challenges).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                res = shutdown_rx.changed() => {
                    if res.is_err() || *shutdown_rx.borrow() {
                        info!(protocol, "Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    router: Arc<Router>,
    is_tls: bool,
    acme_challenges: Option<Http01Challenges>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let router = Arc::clone(&router);
        let acme = acme_challenges.clone();
        async move { handle_request(req, router, addr, is_tls, acme).await }
    });

    // auto::Builder serves HTTP/1.1 and HTTP/2 (h2c, or h2 over TLS)
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    router: Arc<Router>,
    client_addr: SocketAddr,
    is_tls: bool,
    acme_challenges: Option<Http01Challenges>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    // ACME HTTP-01 challenges are answered before any routing
    if let Some(ref challenges) = acme_challenges {
        if let Some(key_auth) = challenges.response_for_path(req.uri().path()) {
            debug!(path = req.uri().path(), "Responding to ACME HTTP-01 challenge");
            return Ok(challenge_response(key_auth));
        }
    }

    let Some(host) = request_host(&req) else {
        return Ok(json_error_response(
            ProxyErrorCode::MissingHostHeader,
            "Missing or invalid Host header",
        ));
    };
    let hostname = strip_port(&host).to_string();

    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let backends = router.registry.resolve(&hostname);
    if backends.is_empty() {
        info!(hostname, request_id, "No service registered for hostname");
        return Ok(json_error_response(
            ProxyErrorCode::UnknownHost,
            "Unknown or unconfigured host",
        ));
    }

    let candidates = backends.len();
    let Some(backend) = router.balancer.pick(&hostname, backends) else {
        return Ok(json_error_response(
            ProxyErrorCode::InternalError,
            "No backend selected",
        ));
    };

    apply_forwarded_headers(req.headers_mut(), &host, client_addr, is_tls, &request_id);

    debug!(
        hostname,
        method = %req.method(),
        uri = %req.uri(),
        backend = %backend,
        candidates,
        request_id,
        "Forwarding request"
    );

    let request_timeout = router.request_timeout;
    let result = tokio::time::timeout(request_timeout, router.pool.send_request(req, &backend)).await;

    match result {
        Ok(Ok(mut response)) => {
            strip_hop_by_hop(response.headers_mut());
            response.headers_mut().insert(
                hyper::header::SERVER,
                HeaderValue::from_static(crate::SERVER_NAME),
            );
            Ok(response)
        }
        Ok(Err(e)) => {
            // Log detailed error internally, return generic message externally
            warn!(hostname, backend = %backend, request_id, error = %e, "Failed to forward request");
            Ok(json_error_response(
                ProxyErrorCode::BackendUnavailable,
                "Backend unavailable",
            ))
        }
        Err(_) => {
            warn!(
                hostname,
                backend = %backend,
                request_id,
                timeout_secs = request_timeout.as_secs(),
                "Request timed out"
            );
            Ok(json_error_response(
                ProxyErrorCode::BackendTimeout,
                format!(
                    "Backend did not respond within {} seconds",
                    request_timeout.as_secs()
                ),
            ))
        }
    }
}

fn challenge_response(key_auth: String) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .header(hyper::header::SERVER, crate::SERVER_NAME)
        .body(Full::new(Bytes::from(key_auth)).map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}

/// The requested host, port included, from the Host header or, for HTTP/2,
/// the URI authority. Returns `None` when absent or malformed.
fn request_host<B>(req: &Request<B>) -> Option<String> {
    let host = match req.headers().get(hyper::header::HOST) {
        Some(value) => value.to_str().ok()?.trim().to_string(),
        None => req.uri().authority()?.as_str().to_string(),
    };

    let hostname = strip_port(&host);
    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }

    // Keeps log fields and forwarded headers free of injected content
    let valid = host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | ':' | '[' | ']'));
    valid.then_some(host)
}

/// Set the headers a backend sees about the original client.
///
/// `X-Forwarded-For` extends any chain sent by the client; the other
/// forwarding headers are overwritten.
fn apply_forwarded_headers(
    headers: &mut HeaderMap,
    host: &str,
    client_addr: SocketAddr,
    is_tls: bool,
    request_id: &str,
) {
    strip_hop_by_hop(headers);

    let client_ip = client_addr.ip().to_string();
    let forwarded_for = match headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .collect::<Vec<_>>()
    {
        chain if chain.is_empty() => client_ip.clone(),
        chain => format!("{}, {}", chain.join(", "), client_ip),
    };

    set_header(headers, X_REAL_IP, &client_ip);
    set_header(headers, X_REMOTE_IP, &client_ip);
    set_header(headers, X_REMOTE_PORT, &client_addr.port().to_string());
    set_header(headers, X_FORWARDED_FOR, &forwarded_for);
    set_header(headers, X_FORWARDED_HOST, host);
    headers.insert(
        X_FORWARDED_PROTO,
        HeaderValue::from_static(if is_tls { "https" } else { "http" }),
    );
    set_header(headers, X_REQUEST_ID, request_id);

    // HTTP/2 requests carry the host in the authority only
    if !headers.contains_key(hyper::header::HOST) {
        set_header(headers, "host", host);
    }
}

fn set_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

/// Remove hop-by-hop headers, including any listed in `Connection`
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}
