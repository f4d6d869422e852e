//! Integration tests for coreproxy
//!
//! Runs whole servers on unique local ports and covers:
//! - HTTP proxying by Host header
//! - Route updates over the UDP control channel
//! - Routes file persistence
//! - Shutdown and takeover of a running instance
//! - HTTPS with self-signed certificates and the HTTP redirector

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use coreproxy::control::{announce, send_command};
use coreproxy::{CertTool, Command, Config, CoreServer, Mode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use tempfile::tempdir;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::sleep;

// Counter for unique port allocation
static PORT_COUNTER: AtomicU16 = AtomicU16::new(19000);

fn get_unique_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

fn local(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// Simple backend server for testing
///
/// Echoes what it received so tests can check what the proxy forwarded.
async fn run_backend_server(port: u16, response_body: &'static str) -> JoinHandle<()> {
    let listener = TcpListener::bind(local(port)).await.unwrap();

    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let io = TokioIo::new(stream);

            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| async move {
                    let text = {
                        let header = |name: &str| {
                            req.headers()
                                .get(name)
                                .and_then(|h| h.to_str().ok())
                                .unwrap_or("none")
                                .to_string()
                        };
                        format!(
                            "{}|method={}|path={}|query={}|host={}|xff={}|xfp={}",
                            response_body,
                            req.method(),
                            req.uri().path(),
                            req.uri().query().unwrap_or(""),
                            header("host"),
                            header("x-forwarded-for"),
                            header("x-forwarded-proto"),
                        )
                    };
                    let body = req.into_body().collect().await.unwrap().to_bytes();
                    let text = format!("{}|body={}", text, String::from_utf8_lossy(&body));

                    Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(text))))
                });

                let _ = http1::Builder::new().serve_connection(io, service).await;
            });
        }
    })
}

/// Development config on unique local ports, plain HTTP only
fn test_config(dir: &Path) -> Config {
    let mut config = Config::for_mode(Mode::Development);
    config.http_addr = local(get_unique_port());
    config.https_addr = local(get_unique_port());
    config.control_addr = local(get_unique_port());
    config.routes_file = Some(dir.join("forward_targets.txt"));
    config.certs_dir = dir.join("certs");
    config.cert_tool = CertTool::None;
    config
}

async fn start_server(config: Config) -> JoinHandle<anyhow::Result<()>> {
    let handle = tokio::spawn(CoreServer::new(config).run());
    sleep(Duration::from_millis(200)).await;
    handle
}

async fn get(config: &Config, host: &str, path: &str) -> reqwest::Response {
    reqwest::Client::new()
        .get(format!("http://{}{}", config.http_addr, path))
        .header("Host", host)
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_proxy_announced_domain() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path());
    let backend_port = get_unique_port();
    let _backend = run_backend_server(backend_port, "backend1").await;
    let _server = start_server(config.clone()).await;

    announce(config.control_addr, "app.test", backend_port)
        .await
        .unwrap();
    sleep(Duration::from_millis(100)).await;

    let response = get(&config, "app.test", "/hello").await;

    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    assert!(body.starts_with("backend1|method=GET|path=/hello"));
    assert!(body.contains("|host=app.test|"));
    assert!(body.contains("|xff=127.0.0.1|"));
    assert!(body.contains("|xfp=http|"));
}

#[tokio::test]
async fn test_proxy_unknown_domain_404() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path());
    let _server = start_server(config.clone()).await;

    let response = get(&config, "unknown.test", "/").await;

    assert_eq!(response.status(), 404);
    assert_eq!(response.text().await.unwrap(), "Domain Not Recognized");
}

#[tokio::test]
async fn test_routes_loaded_at_startup() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path());
    let backend_port = get_unique_port();
    let _backend = run_backend_server(backend_port, "preloaded").await;

    std::fs::write(
        dir.path().join("forward_targets.txt"),
        format!("\nbroken line here\napp.test {}\n", backend_port),
    )
    .unwrap();
    let _server = start_server(config.clone()).await;

    let response = get(&config, "app.test", "/").await;

    assert_eq!(response.status(), 200);
    assert!(response.text().await.unwrap().starts_with("preloaded|"));
}

#[tokio::test]
async fn test_proxy_query_and_post_body() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path());
    let backend_port = get_unique_port();
    let _backend = run_backend_server(backend_port, "echo").await;
    let _server = start_server(config.clone()).await;

    announce(config.control_addr, "api.test", backend_port)
        .await
        .unwrap();
    sleep(Duration::from_millis(100)).await;

    let response = reqwest::Client::new()
        .post(format!("http://{}/items?page=2&sort=name", config.http_addr))
        .header("Host", "api.test")
        .body("{\"name\":\"widget\"}")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    assert!(body.contains("|method=POST|path=/items|query=page=2&sort=name|"));
    assert!(body.ends_with("|body={\"name\":\"widget\"}"));
}

#[tokio::test]
async fn test_backend_unreachable_502() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path());
    let _server = start_server(config.clone()).await;

    // Nothing listens on this port
    announce(config.control_addr, "dead.test", get_unique_port())
        .await
        .unwrap();
    sleep(Duration::from_millis(100)).await;

    let response = get(&config, "dead.test", "/").await;
    assert_eq!(response.status(), 502);
}

#[tokio::test]
async fn test_control_updates_are_persisted() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path());
    let _server = start_server(config.clone()).await;

    announce(config.control_addr, "a.test", 3001).await.unwrap();
    announce(config.control_addr, "b.test", 3002).await.unwrap();
    announce(config.control_addr, "a.test", 3003).await.unwrap();
    send_command(config.control_addr, &Command::Remove("b.test".to_string()))
        .await
        .unwrap();
    sleep(Duration::from_millis(200)).await;

    let snapshot = std::fs::read_to_string(dir.path().join("forward_targets.txt")).unwrap();
    assert_eq!(snapshot.trim(), "a.test 3003");
}

#[tokio::test]
async fn test_removed_domain_is_not_proxied() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path());
    let backend_port = get_unique_port();
    let _backend = run_backend_server(backend_port, "backend").await;
    let _server = start_server(config.clone()).await;

    announce(config.control_addr, "gone.test", backend_port)
        .await
        .unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(get(&config, "gone.test", "/").await.status(), 200);

    send_command(config.control_addr, &Command::Remove("gone.test".to_string()))
        .await
        .unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(get(&config, "gone.test", "/").await.status(), 404);
}

#[tokio::test]
async fn test_shutdown_command_stops_server() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path());
    let server = start_server(config.clone()).await;

    send_command(config.control_addr, &Command::Shutdown)
        .await
        .unwrap();

    let result = tokio::time::timeout(Duration::from_secs(2), server)
        .await
        .expect("server did not stop")
        .unwrap();
    assert!(result.is_ok());

    // The HTTP port is free again
    TcpListener::bind(config.http_addr).await.unwrap();
}

#[tokio::test]
async fn test_new_instance_takes_over() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path());
    let backend_port = get_unique_port();
    let _backend = run_backend_server(backend_port, "backend").await;

    let first = start_server(config.clone()).await;
    announce(config.control_addr, "app.test", backend_port)
        .await
        .unwrap();
    sleep(Duration::from_millis(100)).await;

    let second = start_server(config.clone()).await;

    let first_result = tokio::time::timeout(Duration::from_secs(2), first)
        .await
        .expect("first instance did not stop")
        .unwrap();
    assert!(first_result.is_ok());
    assert!(!second.is_finished());

    // The new instance serves the persisted routes
    let response = get(&config, "app.test", "/").await;
    assert_eq!(response.status(), 200);

    // and now owns the control port
    announce(config.control_addr, "other.test", backend_port)
        .await
        .unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(get(&config, "other.test", "/").await.status(), 200);
}

#[tokio::test]
async fn test_https_with_self_signed_certificates() {
    let dir = tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.cert_tool = CertTool::SelfSigned;
    let backend_port = get_unique_port();
    let _backend = run_backend_server(backend_port, "secure").await;
    let _server = start_server(config.clone()).await;

    announce(config.control_addr, "foo.test", backend_port)
        .await
        .unwrap();
    sleep(Duration::from_millis(100)).await;

    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .resolve("foo.test", config.https_addr)
        .build()
        .unwrap();

    let response = client
        .get(format!("https://foo.test:{}/secure", config.https_addr.port()))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    assert!(body.starts_with("secure|method=GET|path=/secure"));
    assert!(body.contains("|xfp=https|"));
    assert!(dir.path().join("certs/foo.test-cert.pem").exists());
}

#[tokio::test]
async fn test_plain_http_redirects_when_tls_is_active() {
    let dir = tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.cert_tool = CertTool::SelfSigned;
    let _server = start_server(config.clone()).await;

    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();

    let response = client
        .get(format!("http://{}/some/path", config.http_addr))
        .header("Host", "foo.test")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 307);
    assert_eq!(
        response.headers()["location"],
        "https://foo.test/some/path"
    );
}
