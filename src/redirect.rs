//! Plain-HTTP listener that sends clients to HTTPS
//!
//! When ACME is active it also answers HTTP-01 challenges, which must be served
//! over plain HTTP on port 80.

use crate::acme::Http01Challenges;
use crate::proxy::{request_host, text_response, ProxyBody};
use anyhow::{anyhow, Result};
use hyper::header::{HeaderValue, CONTENT_TYPE, LOCATION};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

pub struct Redirector {
    challenges: Option<Http01Challenges>,
}

impl Redirector {
    pub fn new(challenges: Option<Http01Challenges>) -> Self {
        Self { challenges }
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!("Redirecting http://{} to HTTPS", listener.local_addr()?);

        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };

            let redirector = self.clone();
            tokio::spawn(async move {
                let result = http1::Builder::new()
                    .serve_connection(
                        TokioIo::new(stream),
                        service_fn(move |req| {
                            let response = redirector.handle(&req);
                            async move { Ok::<_, Infallible>(response) }
                        }),
                    )
                    .await
                    .map_err(|e| anyhow!("HTTP service error: {}", e));

                if let Err(e) = result {
                    debug!("Redirect connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    pub fn handle<B>(&self, req: &Request<B>) -> Response<ProxyBody> {
        if let Some(response) = self.acme_challenge(req.uri()) {
            return response;
        }

        let Some(host) = request_host(req) else {
            return text_response(StatusCode::BAD_REQUEST, "Missing Host header");
        };

        let location = redirect_location(host, req.uri());
        debug!("Redirecting {} {} to {}", host, req.uri(), location);

        let mut response = text_response(StatusCode::TEMPORARY_REDIRECT, "");
        match HeaderValue::from_str(&location) {
            Ok(value) => {
                response.headers_mut().insert(LOCATION, value);
                response
            }
            Err(_) => text_response(StatusCode::BAD_REQUEST, "Invalid Host header"),
        }
    }

    fn acme_challenge(&self, uri: &Uri) -> Option<Response<ProxyBody>> {
        let challenges = self.challenges.as_ref()?;
        let token = uri.path().strip_prefix(ACME_CHALLENGE_PREFIX)?;

        let Some(key_authorization) = challenges.get(token) else {
            return Some(text_response(StatusCode::NOT_FOUND, "Not Found"));
        };

        debug!("Answering ACME challenge {}", token);
        let mut response = text_response(StatusCode::OK, &key_authorization);
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        );
        Some(response)
    }
}

/// `https://<host><path-and-query>` for a request received on plain HTTP
pub fn redirect_location(host: &str, uri: &Uri) -> String {
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    format!("https://{}{}", host, path)
}
