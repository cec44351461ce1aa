//! Reverse proxy in front of the app.
//!
//! Every request first asks the coordinator whether a rebuild is due. A failed
//! rebuild is answered with the error page; otherwise the request is forwarded
//! to the app and its response relayed back. WebSocket upgrades are tunnelled
//! over a dedicated upstream connection.

use super::error_page::ErrorPage;
use crate::coordinator::RebuildCoordinator;
use crate::error::{HarnessError, Result};
use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use hyper_util::rt::TokioIo;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Headers that describe one connection and are never forwarded.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

struct ProxyState {
    coordinator: Arc<RebuildCoordinator>,
    app_addr: SocketAddr,
    /// e.g. `http://127.0.0.1:9123`
    upstream: String,
    client: reqwest::Client,
    error_page: ErrorPage,
    last_request_failed: AtomicBool,
}

/// Development proxy server.
#[derive(Clone)]
pub struct DevProxy {
    state: Arc<ProxyState>,
}

impl DevProxy {
    /// Proxy to an app listening on `127.0.0.1:<app_port>`.
    pub fn new(coordinator: Arc<RebuildCoordinator>, app_port: u16) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| HarnessError::Server(format!("Failed to create proxy client: {}", e)))?;
        let error_page = ErrorPage::new()
            .map_err(|e| HarnessError::Server(format!("Failed to load error page: {}", e)))?;

        let app_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, app_port));

        Ok(Self {
            state: Arc::new(ProxyState {
                coordinator,
                app_addr,
                upstream: format!("http://{}", app_addr),
                client,
                error_page,
                last_request_failed: AtomicBool::new(false),
            }),
        })
    }

    pub fn upstream(&self) -> &str {
        &self.state.upstream
    }

    pub fn router(&self) -> Router {
        Router::new()
            .fallback(handle_request)
            .with_state(Arc::clone(&self.state))
    }

    /// Bind `addr` and serve until the server fails.
    pub async fn serve(self, addr: SocketAddr) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| HarnessError::Server(format!("Failed to bind to {}: {}", addr, e)))?;
        self.serve_on(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve_on(self, listener: tokio::net::TcpListener) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, upstream = %self.state.upstream, "Proxy listening");
        }

        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .await
            .map_err(|e| HarnessError::Server(format!("Server error: {}", e)))
    }
}

async fn handle_request(State(state): State<Arc<ProxyState>>, req: Request) -> Response {
    // Browsers ask for the icon right after an error page; don't rebuild twice
    if state.last_request_failed.load(Ordering::SeqCst) && req.uri().path() == "/favicon.ico" {
        return StatusCode::NO_CONTENT.into_response();
    }

    if let Err(err) = state.coordinator.notify().await {
        state.last_request_failed.store(true, Ordering::SeqCst);
        return state.error_page.response(&err);
    }
    state.last_request_failed.store(false, Ordering::SeqCst);

    let result = if is_websocket_upgrade(req.headers()) {
        tunnel(&state, req).await
    } else {
        forward(&state, req).await
    };

    match result {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(error = %e, upstream = %state.upstream, "Proxy request failed");
            (StatusCode::BAD_GATEWAY, format!("Proxy error: {}", e)).into_response()
        }
    }
}

async fn forward(state: &ProxyState, req: Request) -> std::result::Result<Response, String> {
    let (parts, body) = req.into_parts();
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("{}{}", state.upstream, path);

    let body: Bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| format!("failed to read request body: {}", e))?;

    let mut headers = strip_hop_by_hop(&parts.headers);
    add_forwarded_headers(&mut headers, &parts.extensions);

    let upstream = state
        .client
        .request(parts.method, url)
        .headers(headers)
        .body(body)
        .send()
        .await
        .map_err(|e| e.to_string())?;

    let status = upstream.status();
    let headers = strip_hop_by_hop(upstream.headers());
    let bytes = upstream.bytes().await.map_err(|e| e.to_string())?;

    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

/// Relay a WebSocket handshake to the app and, once both sides switch
/// protocols, copy bytes between the two upgraded connections.
async fn tunnel(state: &ProxyState, mut req: Request) -> std::result::Result<Response, String> {
    let client_upgrade = hyper::upgrade::on(&mut req);
    let (parts, _) = req.into_parts();

    let stream = tokio::net::TcpStream::connect(state.app_addr)
        .await
        .map_err(|e| e.to_string())?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| e.to_string())?;
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            tracing::debug!(error = %e, "Proxy: upstream websocket connection closed");
        }
    });

    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut upstream_req = axum::http::Request::builder()
        .method(parts.method)
        .uri(path)
        .body(Body::empty())
        .map_err(|e| e.to_string())?;
    // Connection and Upgrade are kept: they are the handshake
    let mut headers = parts.headers;
    if !headers.contains_key(header::HOST) {
        let host = HeaderValue::from_str(&state.app_addr.to_string()).map_err(|e| e.to_string())?;
        headers.insert(header::HOST, host);
    }
    add_forwarded_headers(&mut headers, &parts.extensions);
    *upstream_req.headers_mut() = headers;

    let mut upstream_res = sender
        .send_request(upstream_req)
        .await
        .map_err(|e| e.to_string())?;

    if upstream_res.status() != StatusCode::SWITCHING_PROTOCOLS {
        let (mut res_parts, body) = upstream_res.into_parts();
        res_parts.headers = strip_hop_by_hop(&res_parts.headers);
        return Ok(Response::from_parts(res_parts, Body::new(body)));
    }

    let upstream_upgrade = hyper::upgrade::on(&mut upstream_res);
    tokio::spawn(async move {
        let (client, upstream) = match tokio::try_join!(client_upgrade, upstream_upgrade) {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "Proxy: websocket upgrade failed");
                return;
            }
        };
        let mut client = TokioIo::new(client);
        let mut upstream = TokioIo::new(upstream);
        match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
            Ok((sent, received)) => {
                tracing::debug!(sent, received, "Proxy: websocket closed");
            }
            Err(e) => tracing::debug!(error = %e, "Proxy: websocket ended"),
        }
    });

    let (res_parts, _) = upstream_res.into_parts();
    Ok(Response::from_parts(res_parts, Body::empty()))
}

/// `Host` is forwarded as sent; these record where the request came from.
fn add_forwarded_headers(headers: &mut HeaderMap, extensions: &axum::http::Extensions) {
    if let Some(host) = headers.get(header::HOST).cloned() {
        headers.insert(HeaderName::from_static("x-forwarded-host"), host);
    }
    headers.insert(
        HeaderName::from_static("x-forwarded-proto"),
        HeaderValue::from_static("http"),
    );
    if let Some(ConnectInfo(peer)) = extensions.get::<ConnectInfo<SocketAddr>>() {
        if let Ok(value) = HeaderValue::from_str(&peer.ip().to_string()) {
            headers.append(HeaderName::from_static("x-forwarded-for"), value);
        }
    }
}

fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut out = headers.clone();
    // Headers named in Connection are connection-scoped as well
    let named: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    for name in HOP_BY_HOP.iter().copied().chain(named.iter().map(String::as_str)) {
        out.remove(name);
    }
    out
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-trace"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert("x-trace", HeaderValue::from_static("1"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("text/html"));

        let out = strip_hop_by_hop(&headers);

        assert_eq!(out.len(), 1);
        assert_eq!(out[header::ACCEPT], "text/html");
    }

    #[test]
    fn test_forwarded_headers_keep_host() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("shop.localhost:3000"));
        let mut extensions = axum::http::Extensions::new();
        extensions.insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 51000))));

        add_forwarded_headers(&mut headers, &extensions);

        assert_eq!(headers[header::HOST], "shop.localhost:3000");
        assert_eq!(headers["x-forwarded-host"], "shop.localhost:3000");
        assert_eq!(headers["x-forwarded-for"], "127.0.0.1");
        assert_eq!(headers["x-forwarded-proto"], "http");
    }

    #[test]
    fn test_websocket_detection() {
        let mut headers = HeaderMap::new();
        assert!(!is_websocket_upgrade(&headers));
        headers.insert(header::UPGRADE, HeaderValue::from_static("WebSocket"));
        assert!(is_websocket_upgrade(&headers));
    }
}
