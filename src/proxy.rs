//! Proxy server implementation
//! Routes each request by its Host header to `localhost:<port>`

use crate::error::ForwardError;
use crate::routes::Routes;
use crate::tls::TlsTerminator;
use anyhow::{anyhow, Result};
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_TYPE, HOST, UPGRADE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::OnUpgrade;
use hyper::{Method, Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

/// Headers that describe a single connection and are not forwarded
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Proxy server configuration
#[derive(Debug, Clone, Copy)]
pub struct ProxyConfig {
    /// Limit for establishing the TCP connection to a backend
    pub connect_timeout: Duration,
    /// Limit for a backend to send its response head
    pub response_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// Proxy server
pub struct ProxyServer {
    config: ProxyConfig,
    routes: Routes,
}

impl ProxyServer {
    /// Create a new proxy server
    pub fn new(config: ProxyConfig, routes: Routes) -> Self {
        Self { config, routes }
    }

    /// Serve plain HTTP connections
    pub async fn serve_http(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!("Proxy listening on http://{}", listener.local_addr()?);

        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server
                    .serve_connection(stream, remote_addr, Scheme::Http)
                    .await
                {
                    debug!("HTTP connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    /// Serve HTTPS connections, terminating TLS with `tls`
    pub async fn serve_https(
        self: Arc<Self>,
        listener: TcpListener,
        tls: Arc<TlsTerminator>,
    ) -> Result<()> {
        info!("Proxy listening on https://{}", listener.local_addr()?);

        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };

            let server = self.clone();
            let tls = tls.clone();
            tokio::spawn(async move {
                let stream = match tls.accept(stream).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!("TLS handshake with {} failed: {:#}", remote_addr, e);
                        return;
                    }
                };

                if let Err(e) = server
                    .serve_connection(stream, remote_addr, Scheme::Https)
                    .await
                {
                    debug!("HTTPS connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    /// Handle a single HTTP/1 connection
    async fn serve_connection<S>(
        self: Arc<Self>,
        stream: S,
        remote_addr: SocketAddr,
        scheme: Scheme,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(false)
            .serve_connection(
                TokioIo::new(stream),
                service_fn(move |req| {
                    let server = self.clone();
                    async move { Ok::<_, Infallible>(server.handle(req, remote_addr, scheme).await) }
                }),
            )
            .with_upgrades()
            .await
            .map_err(|e| anyhow!("HTTP service error: {}", e))
    }

    /// Route one request and log it once the response body has been written
    pub async fn handle<B>(
        &self,
        req: Request<B>,
        remote_addr: SocketAddr,
        scheme: Scheme,
    ) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let entry = AccessLog::new(remote_addr, &req);
        let response = self.dispatch(req, remote_addr, scheme).await;
        entry.attach(response)
    }

    async fn dispatch<B>(
        &self,
        req: Request<B>,
        remote_addr: SocketAddr,
        scheme: Scheme,
    ) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        // A request without a Host matches no route
        let Some(port) = request_host(&req).and_then(|host| self.routes.lookup(host)) else {
            debug!("No route for host {:?}", request_host(&req));
            return text_response(StatusCode::NOT_FOUND, "Domain Not Recognized");
        };

        match self.forward(req, port, remote_addr, scheme).await {
            Ok(response) => response,
            Err(e) => {
                let status = match e {
                    ForwardError::ConnectTimeout(_) | ForwardError::ResponseTimeout => {
                        StatusCode::GATEWAY_TIMEOUT
                    }
                    ForwardError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
                    _ => StatusCode::BAD_GATEWAY,
                };
                error!("Proxying to localhost:{} failed: {}", port, e);
                text_response(status, status.canonical_reason().unwrap_or("Bad Gateway"))
            }
        }
    }

    /// Proxy the request to the backend on `localhost:port`
    async fn forward<B>(
        &self,
        mut req: Request<B>,
        port: u16,
        remote_addr: SocketAddr,
        scheme: Scheme,
    ) -> Result<Response<ProxyBody>, ForwardError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let backend = format!("localhost:{}", port);

        let stream = timeout(self.config.connect_timeout, TcpStream::connect(&backend))
            .await
            .map_err(|_| ForwardError::ConnectTimeout(backend.clone()))?
            .map_err(|source| ForwardError::Connect {
                backend: backend.clone(),
                source,
            })?;

        let client_upgrade = upgrade_protocol(req.headers()).map(|_| hyper::upgrade::on(&mut req));
        let proxy_req = backend_request(req, remote_addr, scheme)?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(ForwardError::Handshake)?;

        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!("Backend connection error: {}", e);
            }
        });

        let mut response = timeout(self.config.response_timeout, sender.send_request(proxy_req))
            .await
            .map_err(|_| ForwardError::ResponseTimeout)?
            .map_err(ForwardError::Backend)?;

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            if let Some(client_upgrade) = client_upgrade {
                let backend_upgrade = hyper::upgrade::on(&mut response);
                tokio::spawn(tunnel(client_upgrade, backend_upgrade));
            }
        }

        Ok(client_response(response))
    }
}

/// Host the client asked for, without a port suffix
pub fn request_host<B>(req: &Request<B>) -> Option<&str> {
    let host = req
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))?;

    let host = strip_port(host);
    (!host.is_empty()).then_some(host)
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }

    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Protocol named in `Upgrade` if the request asks for a connection upgrade
fn upgrade_protocol(headers: &HeaderMap) -> Option<HeaderValue> {
    let wants_upgrade = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    if wants_upgrade {
        headers.get(UPGRADE).cloned()
    } else {
        None
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
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

/// Rewrite a client request into the request sent to the backend
fn backend_request<B>(
    req: Request<B>,
    remote_addr: SocketAddr,
    scheme: Scheme,
) -> Result<Request<B>, ForwardError> {
    let (mut parts, body) = req.into_parts();

    let upgrade = upgrade_protocol(&parts.headers);

    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    parts.uri = path
        .parse::<Uri>()
        .map_err(|e| ForwardError::InvalidRequest(e.to_string()))?;
    parts.version = Version::HTTP_11;

    let headers = &mut parts.headers;
    strip_hop_by_hop(headers);

    if let Some(protocol) = upgrade {
        headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
        headers.insert(UPGRADE, protocol);
    }

    let client_ip = remote_addr.ip().to_canonical().to_string();
    let forwarded_for = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) => format!("{}, {}", prior, client_ip),
        None => client_ip,
    };
    let forwarded_for = HeaderValue::from_str(&forwarded_for)
        .map_err(|e| ForwardError::InvalidRequest(e.to_string()))?;
    headers.insert(X_FORWARDED_FOR, forwarded_for);

    if let Some(host) = headers.get(HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(scheme.as_str()));

    Ok(Request::from_parts(parts, body))
}

/// Relay the backend response, streaming its body
fn client_response(response: Response<Incoming>) -> Response<ProxyBody> {
    let (mut parts, body) = response.into_parts();
    if parts.status != StatusCode::SWITCHING_PROTOCOLS {
        strip_hop_by_hop(&mut parts.headers);
    }
    Response::from_parts(parts, body.boxed())
}

/// Copy bytes both ways between an upgraded client and backend connection
async fn tunnel(client: OnUpgrade, backend: OnUpgrade) {
    let (client, backend) = match tokio::try_join!(client, backend) {
        Ok(upgraded) => upgraded,
        Err(e) => {
            warn!("Connection upgrade failed: {}", e);
            return;
        }
    };

    let mut client = TokioIo::new(client);
    let mut backend = TokioIo::new(backend);
    match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
        Ok((sent, received)) => debug!("Upgraded connection closed ({} bytes up, {} down)", sent, received),
        Err(e) => debug!("Upgraded connection error: {}", e),
    }
}

/// One access log line, written when the response body is dropped
struct AccessLog {
    remote_addr: SocketAddr,
    host: String,
    method: Method,
    path: String,
    status: StatusCode,
}

impl AccessLog {
    fn new<B>(remote_addr: SocketAddr, req: &Request<B>) -> Self {
        Self {
            remote_addr,
            host: request_host(req).unwrap_or("-").to_string(),
            method: req.method().clone(),
            path: req
                .uri()
                .path_and_query()
                .map(|pq| pq.to_string())
                .unwrap_or_else(|| "/".to_string()),
            status: StatusCode::OK,
        }
    }

    fn attach(mut self, response: Response<ProxyBody>) -> Response<ProxyBody> {
        self.status = response.status();
        response.map(|inner| LoggedBody { inner, entry: self }.boxed())
    }
}

struct LoggedBody {
    inner: ProxyBody,
    entry: AccessLog,
}

impl Body for LoggedBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for LoggedBody {
    fn drop(&mut self) {
        let e = &self.entry;
        info!(
            "{} {} {} {} {}",
            e.remote_addr,
            e.host,
            e.method,
            e.path,
            e.status.as_u16()
        );
    }
}

/// Create text response
pub fn text_response(status: StatusCode, body: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Create full body
pub fn full_body(bytes: Bytes) -> ProxyBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Empty;

    fn remote() -> SocketAddr {
        "127.0.0.1:54321".parse().unwrap()
    }

    fn request(host: &str, path: &str) -> Request<Empty<Bytes>> {
        Request::builder()
            .uri(path)
            .header(HOST, host)
            .body(Empty::new())
            .unwrap()
    }

    async fn body_text(response: Response<ProxyBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("foo.test"), "foo.test");
        assert_eq!(strip_port("foo.test:8443"), "foo.test");
        assert_eq!(strip_port("[::1]:8080"), "[::1]");
        assert_eq!(strip_port("[::1]"), "[::1]");
        assert_eq!(strip_port("foo.test:"), "foo.test:");
    }

    #[test]
    fn test_request_host() {
        assert_eq!(request_host(&request("foo.test:443", "/")), Some("foo.test"));

        let no_host = Request::builder().uri("/").body(()).unwrap();
        assert_eq!(request_host(&no_host), None);

        let absolute = Request::builder()
            .uri("http://bar.test/x")
            .body(())
            .unwrap();
        assert_eq!(request_host(&absolute), Some("bar.test"));
    }

    #[test]
    fn test_backend_request_rewrites_headers() {
        let req = Request::builder()
            .method(Method::POST)
            .uri("http://foo.test/api/items?page=2")
            .header(HOST, "foo.test")
            .header(CONNECTION, "keep-alive, x-private")
            .header("x-private", "secret")
            .header("keep-alive", "timeout=5")
            .header("x-forwarded-for", "203.0.113.7")
            .header("accept", "application/json")
            .body(())
            .unwrap();

        let out = backend_request(req, remote(), Scheme::Https).unwrap();

        assert_eq!(out.method(), &Method::POST);
        assert_eq!(out.uri(), "/api/items?page=2");
        let headers = out.headers();
        assert_eq!(headers[HOST], "foo.test");
        assert_eq!(headers["accept"], "application/json");
        assert_eq!(headers["x-forwarded-for"], "203.0.113.7, 127.0.0.1");
        assert_eq!(headers["x-forwarded-host"], "foo.test");
        assert_eq!(headers["x-forwarded-proto"], "https");
        assert!(headers.get(CONNECTION).is_none());
        assert!(headers.get("keep-alive").is_none());
        assert!(headers.get("x-private").is_none());
    }

    #[test]
    fn test_backend_request_keeps_upgrade() {
        let req = Request::builder()
            .uri("/socket")
            .header(HOST, "foo.test")
            .header(CONNECTION, "Upgrade")
            .header(UPGRADE, "websocket")
            .body(())
            .unwrap();

        let out = backend_request(req, remote(), Scheme::Http).unwrap();

        assert_eq!(out.headers()[CONNECTION], "upgrade");
        assert_eq!(out.headers()[UPGRADE], "websocket");
    }

    #[tokio::test]
    async fn test_unknown_domain_is_404() {
        let routes = Routes::in_memory();
        routes.upsert("foo.test", 9).unwrap();
        let server = ProxyServer::new(ProxyConfig::default(), routes);

        let response = server
            .handle(request("bar.test", "/"), remote(), Scheme::Http)
            .await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_text(response).await, "Domain Not Recognized");
    }

    #[tokio::test]
    async fn test_missing_host_is_404() {
        let routes = Routes::in_memory();
        routes.upsert("foo.test", 9).unwrap();
        let server = ProxyServer::new(ProxyConfig::default(), routes);
        let req = Request::builder().uri("/").body(Empty::<Bytes>::new()).unwrap();

        let response = server.handle(req, remote(), Scheme::Http).await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_text(response).await, "Domain Not Recognized");
    }

    #[tokio::test]
    async fn test_refused_backend_is_502() {
        // Grab a free port and release it so nothing is listening there
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let routes = Routes::in_memory();
        routes.upsert("foo.test", port).unwrap();
        let server = ProxyServer::new(ProxyConfig::default(), routes);

        let response = server
            .handle(request("foo.test", "/"), remote(), Scheme::Http)
            .await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_silent_backend_is_504() {
        // Accepts connections but never answers
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let routes = Routes::in_memory();
        routes.upsert("foo.test", port).unwrap();
        let config = ProxyConfig {
            response_timeout: Duration::from_millis(100),
            ..ProxyConfig::default()
        };
        let server = ProxyServer::new(config, routes);

        let response = server
            .handle(request("foo.test", "/"), remote(), Scheme::Http)
            .await;

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    }
}
