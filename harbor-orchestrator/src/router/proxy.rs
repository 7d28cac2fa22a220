//! Single-target reverse proxy and the host-dispatching front handler.
//!
//! Each proxied request opens a fresh HTTP/1.1 connection to the container; request and
//! response bodies are streamed, never buffered.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use log::{debug, warn};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tower::ServiceExt;
use tower_http::trace::TraceLayer;

use super::Router;
use crate::error::RouteError;

/// Connection-scoped headers that must not be forwarded.
const HOP_BY_HOP: [&str; 6] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "upgrade",
];

/// Forwards `req` to `target`, keeping method, path, query, headers and the original `Host`.
pub async fn forward(req: Request, target: SocketAddr) -> Result<Response, RouteError> {
    let stream = TcpStream::connect(target)
        .await
        .map_err(|e| RouteError::Upstream(format!("connect to {} failed: {}", target, e)))?;

    let (mut sender, conn) = http1::Builder::new()
        .handshake(TokioIo::new(stream))
        .await
        .map_err(|e| RouteError::Upstream(format!("handshake with {} failed: {}", target, e)))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Proxy: connection to {} ended: {}", target, e);
        }
    });

    let (mut parts, body) = req.into_parts();
    if !parts.headers.contains_key(header::HOST) {
        if let Some(authority) = parts.uri.authority() {
            if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
                parts.headers.insert(header::HOST, value);
            }
        }
    }

    let path_and_query = parts
        .uri
        .path_and_query()
        .map_or("/", |pq| pq.as_str())
        .to_string();
    parts.uri = path_and_query
        .parse()
        .map_err(|e| RouteError::Upstream(format!("invalid request path: {}", e)))?;

    for name in HOP_BY_HOP {
        parts.headers.remove(name);
    }
    parts.headers.insert(
        HeaderName::from_static("x-forwarded-proto"),
        HeaderValue::from_static("http"),
    );
    parts.version = axum::http::Version::HTTP_11;

    let response = sender
        .send_request(Request::from_parts(parts, body))
        .await
        .map_err(|e| RouteError::Upstream(format!("request to {} failed: {}", target, e)))?;

    let (parts, incoming) = response.into_parts();
    Ok(Response::from_parts(parts, Body::new(incoming)))
}

/// The host named by a request: the `Host` header, or the URI authority for HTTP/2.
pub fn request_host(req: &Request) -> Option<String> {
    req.headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.as_str().to_string()))
}

#[derive(Clone)]
struct FrontState {
    router: Arc<Router>,
    api: axum::Router,
}

/// The public HTTP(S) entry point: the control-plane host goes to `api`, every other host
/// is proxied to its container. Unroutable hosts get `502 Bad Gateway`.
pub fn front(router: Arc<Router>, api: axum::Router) -> axum::Router {
    axum::Router::new()
        .fallback(dispatch)
        .with_state(FrontState { router, api })
        .layer(TraceLayer::new_for_http())
}

async fn dispatch(State(state): State<FrontState>, req: Request) -> Response {
    let Some(host) = request_host(&req) else {
        return (StatusCode::BAD_REQUEST, "missing Host header").into_response();
    };

    if state.router.is_control_plane(&host) {
        let response: Result<Response, Infallible> = state.api.oneshot(req).await;
        return match response {
            Ok(response) => response,
            Err(never) => match never {},
        };
    }

    let ip = match state.router.resolve(&host).await {
        Ok(ip) => ip,
        Err(e) => {
            debug!("Proxy: cannot route {}: {}", host, e);
            return (StatusCode::BAD_GATEWAY, e.to_string()).into_response();
        }
    };

    let target = SocketAddr::from((ip, state.router.container_port()));
    match forward(req, target).await {
        Ok(response) => response,
        Err(e) => {
            warn!("Proxy: {} -> {}: {}", host, target, e);
            (StatusCode::BAD_GATEWAY, e.to_string()).into_response()
        }
    }
}
