// Copyright 2024-2025 Tree xie.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::config::ConfLoader;
use crate::metrics::Stats;
use crate::responder::{Responder, WELL_KNOWN_PATH_PREFIX};
use crate::util;
use bytes::Bytes;
use http::header;
use http::StatusCode;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use snafu::Snafu;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use substring::Substring;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info};

pub static LOG_CATEGORY: &str = "server";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Io error {source}, category: {category}"))]
    Io {
        category: String,
        source: std::io::Error,
    },
    #[snafu(display("Tls error {source}"))]
    Tls { source: rustls::Error },
    #[snafu(display("Invalid error {message}"))]
    Invalid { message: String },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything a request handler needs, shared across both listeners.
pub struct AppState {
    pub responder: Arc<Responder>,
    pub loader: Arc<ConfLoader>,
    pub stats: Arc<Stats>,
}

/// Debug paths are loopback-only unless the config opens them up.
fn is_blocked_request(path: &str, remote: &SocketAddr) -> bool {
    if path == "/debug" || path.starts_with("/debug/") {
        return !remote.ip().is_loopback();
    }
    false
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut builder = Response::builder().status(status);
    if let Some(headers) = builder.headers_mut() {
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("text/plain; charset=utf-8"),
        );
    }
    builder
        .body(Full::new(body.into()))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

fn not_found() -> Response<Full<Bytes>> {
    text_response(StatusCode::NOT_FOUND, "Not Found")
}

async fn handle<B>(
    state: Arc<AppState>,
    remote: SocketAddr,
    req: Request<B>,
) -> Response<Full<Bytes>> {
    let path = req.uri().path().to_string();

    // Google load balancers have no configurable health check and expect /
    // to return 200, so their user agent is special cased.
    if path == "/" {
        let agent = req
            .headers()
            .get(header::USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if agent == "GoogleHC/1.0" {
            return text_response(StatusCode::OK, "OK");
        }
    }

    if path == "/debug" || path.starts_with("/debug/") {
        let conf = state.loader.get();
        if !conf.allow_remote_debug && is_blocked_request(&path, &remote) {
            return not_found();
        }
        return match path.as_str() {
            "/debug/build" => text_response(
                StatusCode::OK,
                format!("SHA: {}", util::BUILD_SHA),
            ),
            "/debug/vars" => match state.stats.encode() {
                Ok(metrics) => text_response(StatusCode::OK, metrics),
                Err(e) => {
                    error!(
                        category = LOG_CATEGORY,
                        error = e.to_string(),
                        "encode metrics fail"
                    );
                    text_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "encode fail",
                    )
                },
            },
            _ => not_found(),
        };
    }

    if !path.starts_with(WELL_KNOWN_PATH_PREFIX) {
        info!(
            category = LOG_CATEGORY,
            path, "received incorrectly prefixed path"
        );
        return not_found();
    }
    let token = path.substring(WELL_KNOWN_PATH_PREFIX.len(), path.len());
    match state.responder.reply_for(token) {
        Some(body) => text_response(StatusCode::OK, body),
        None => not_found(),
    }
}

async fn serve_connection<S>(stream: S, remote: SocketAddr, state: Arc<AppState>)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req| {
        let state = state.clone();
        async move {
            Ok::<_, std::convert::Infallible>(
                handle(state, remote, req).await,
            )
        }
    });
    if let Err(e) = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .await
    {
        error!(
            category = LOG_CATEGORY,
            error = e.to_string(),
            "serve connection fail"
        );
    }
}

/// Accept loop of the plain HTTP listener. Never returns except on a bind or
/// accept failure, which is fatal to the process.
pub async fn serve_http(addr: SocketAddr, state: Arc<AppState>) -> Result<()> {
    let listener = TcpListener::bind(addr).await.map_err(|e| Error::Io {
        category: "bind_http".to_string(),
        source: e,
    })?;
    info!(category = LOG_CATEGORY, addr = addr.to_string(), "http server is listening");
    loop {
        let (stream, remote) =
            listener.accept().await.map_err(|e| Error::Io {
                category: "accept_http".to_string(),
                source: e,
            })?;
        let state = state.clone();
        tokio::spawn(serve_connection(stream, remote, state));
    }
}

fn load_tls_config(tls_dir: &str) -> Result<rustls::ServerConfig> {
    let cert_path = Path::new(tls_dir).join("tls.crt");
    let key_path = Path::new(tls_dir).join("tls.key");

    let cert_file =
        std::fs::File::open(&cert_path).map_err(|e| Error::Io {
            category: cert_path.to_string_lossy().to_string(),
            source: e,
        })?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Io {
            category: "parse_tls_cert".to_string(),
            source: e,
        })?;

    let key_file = std::fs::File::open(&key_path).map_err(|e| Error::Io {
        category: key_path.to_string_lossy().to_string(),
        source: e,
    })?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| Error::Io {
            category: "parse_tls_key".to_string(),
            source: e,
        })?
        .ok_or_else(|| Error::Invalid {
            message: format!("no private key found in {key_path:?}"),
        })?;

    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Tls { source: e })
}

/// Accept loop of the HTTPS listener, enabled when the config points at a
/// directory with TLS material.
pub async fn serve_https(
    addr: SocketAddr,
    tls_dir: &str,
    state: Arc<AppState>,
) -> Result<()> {
    let tls_config = Arc::new(load_tls_config(tls_dir)?);
    let acceptor = TlsAcceptor::from(tls_config);
    let listener = TcpListener::bind(addr).await.map_err(|e| Error::Io {
        category: "bind_https".to_string(),
        source: e,
    })?;
    info!(category = LOG_CATEGORY, addr = addr.to_string(), "https server is listening");
    loop {
        let (stream, remote) =
            listener.accept().await.map_err(|e| Error::Io {
                category: "accept_https".to_string(),
                source: e,
            })?;
        let acceptor = acceptor.clone();
        let state = state.clone();
        tokio::spawn(async move {
            match acceptor.accept(stream).await {
                Ok(stream) => serve_connection(stream, remote, state).await,
                Err(e) => {
                    error!(
                        category = LOG_CATEGORY,
                        error = e.to_string(),
                        "tls handshake fail"
                    );
                },
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Stats;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn remote(value: &str) -> SocketAddr {
        value.parse().unwrap()
    }

    #[test]
    fn test_is_blocked_request() {
        let cases = vec![
            ("/debug", "93.184.216.34:1111", true),
            ("/debug/", "93.184.216.34:1111", true),
            ("/debug/foobar", "93.184.216.34:1111", true),
            ("/", "93.184.216.34:1111", false),
            ("/foobar", "93.184.216.34:1111", false),
            ("/debug", "127.0.0.1:1111", false),
            ("/debug/", "127.0.0.1:1111", false),
            ("/debug/foobar", "127.0.0.1:1111", false),
            ("/", "127.0.0.1:1111", false),
            ("/foobar", "127.0.0.1:1111", false),
        ];
        for (path, addr, blocked) in cases {
            assert_eq!(
                blocked,
                is_blocked_request(path, &remote(addr)),
                "path {path}, remote addr {addr}"
            );
        }
    }

    async fn new_state(allow_remote_debug: bool) -> Arc<AppState> {
        let data = format!(
            r#"{{
  "email": "fake@example.com",
  "use_prod": false,
  "allow_remote_debug": {allow_remote_debug},
  "secrets": [
    {{"namespace": "default", "name": "test", "domains": ["example.com"]}}
  ]
}}"#
        );
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        file.write_all(data.as_bytes()).unwrap();
        let stats = Arc::new(Stats::new().unwrap());
        let (loader, _) = ConfLoader::new(file.path(), stats.clone())
            .await
            .unwrap();
        // the loader owns the temp file contents now
        drop(file);
        Arc::new(AppState {
            responder: Arc::new(Responder::new()),
            loader,
            stats,
        })
    }

    fn new_request(path: &str) -> Request<()> {
        Request::builder().uri(path).body(()).unwrap()
    }

    #[tokio::test]
    async fn test_google_health_check() {
        let state = new_state(false).await;
        let req = Request::builder()
            .uri("/")
            .header(header::USER_AGENT, "GoogleHC/1.0")
            .body(())
            .unwrap();
        let resp = handle(state.clone(), remote("127.0.0.1:1111"), req).await;
        assert_eq!(StatusCode::OK, resp.status());

        // a plain / without the health check agent is not special
        let resp = handle(
            state,
            remote("127.0.0.1:1111"),
            new_request("/"),
        )
        .await;
        assert_eq!(StatusCode::NOT_FOUND, resp.status());
    }

    #[tokio::test]
    async fn test_challenge_flow() {
        let state = new_state(false).await;
        state
            .responder
            .add("example.com", "ABC", "ABC.fake-thumbprint");

        let resp = handle(
            state.clone(),
            remote("93.184.216.34:1111"),
            new_request("/.well-known/acme-challenge/ABC"),
        )
        .await;
        assert_eq!(StatusCode::OK, resp.status());

        let resp = handle(
            state.clone(),
            remote("93.184.216.34:1111"),
            new_request("/.well-known/acme-challenge/unknown"),
        )
        .await;
        assert_eq!(StatusCode::NOT_FOUND, resp.status());

        state.responder.reset();
        let resp = handle(
            state,
            remote("93.184.216.34:1111"),
            new_request("/.well-known/acme-challenge/ABC"),
        )
        .await;
        assert_eq!(StatusCode::NOT_FOUND, resp.status());
    }

    #[tokio::test]
    async fn test_debug_gating() {
        let state = new_state(false).await;
        let resp = handle(
            state.clone(),
            remote("93.184.216.34:1111"),
            new_request("/debug/build"),
        )
        .await;
        assert_eq!(StatusCode::NOT_FOUND, resp.status());

        let resp = handle(
            state,
            remote("127.0.0.1:1111"),
            new_request("/debug/build"),
        )
        .await;
        assert_eq!(StatusCode::OK, resp.status());
    }

    #[tokio::test]
    async fn test_debug_allowed_remotely_when_configured() {
        let state = new_state(true).await;
        let resp = handle(
            state.clone(),
            remote("93.184.216.34:1111"),
            new_request("/debug/build"),
        )
        .await;
        assert_eq!(StatusCode::OK, resp.status());

        let resp = handle(
            state,
            remote("93.184.216.34:1111"),
            new_request("/debug/vars"),
        )
        .await;
        assert_eq!(StatusCode::OK, resp.status());
    }

    #[tokio::test]
    async fn test_unknown_debug_path() {
        let state = new_state(false).await;
        let resp = handle(
            state,
            remote("127.0.0.1:1111"),
            new_request("/debug/pprof"),
        )
        .await;
        assert_eq!(StatusCode::NOT_FOUND, resp.status());
    }
}
