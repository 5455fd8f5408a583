use super::GatewayState;
use super::routes::Route;
use axum::{
    body::Body,
    extract::{ConnectInfo, Request},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use url::Url;

/// RFC 9110 §7.6.1 connection-specific headers. These describe a single hop and never
/// get passed along in either direction.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // anything the sender listed in Connection is hop-by-hop too
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
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

fn append_forwarded(headers: &mut HeaderMap, peer: Option<SocketAddr>, host: Option<HeaderValue>) {
    if let Some(peer) = peer {
        let ip = peer.ip().to_string();
        let chain = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            Some(existing) => format!("{}, {}", existing, ip),
            None => ip,
        };
        if let Ok(value) = HeaderValue::from_str(&chain) {
            headers.insert("x-forwarded-for", value);
        }
    }
    // an edge proxy in front of us knows better than we do
    if !headers.contains_key("x-forwarded-proto") {
        headers.insert("x-forwarded-proto", HeaderValue::from_static("http"));
    }
    if let Some(host) = host {
        if !headers.contains_key("x-forwarded-host") {
            headers.insert("x-forwarded-host", host);
        }
    }
}

fn upstream_failure(url: &Url, error: reqwest::Error) -> Response {
    if error.is_timeout() {
        tracing::warn!("upstream {} timed out: {}", url, error);
        (StatusCode::GATEWAY_TIMEOUT, "Upstream service timed out").into_response()
    } else if error.is_connect() {
        tracing::warn!("upstream {} unreachable: {}", url, error);
        (StatusCode::BAD_GATEWAY, "Upstream service unavailable").into_response()
    } else {
        tracing::error!("upstream {} failed: {}", url, error);
        (StatusCode::BAD_GATEWAY, "Upstream request failed").into_response()
    }
}

fn too_large(limit: usize) -> Response {
    (
        StatusCode::PAYLOAD_TOO_LARGE,
        format!("Request body exceeds {} bytes", limit),
    )
        .into_response()
}

/// Forward the request to the route's backend and relay whatever comes back: status,
/// headers and body, minus hop-by-hop headers.
///
/// The body is buffered (bounded by `max_body_bytes`) so a slow client can't hold an
/// upstream connection open. If the client goes away axum drops this future, which
/// drops the in-flight upstream call with it.
pub async fn forward(state: &GatewayState, route: &Route, request: Request) -> Response {
    let limit = state.settings.max_body_bytes;
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let (parts, body) = request.into_parts();

    let declared = parts
        .headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if declared.is_some_and(|len| len > limit) {
        tracing::debug!("refusing {} byte body for {}", declared.unwrap_or_default(), parts.uri.path());
        return too_large(limit);
    }

    let body = match axum::body::to_bytes(body, limit).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::debug!("could not buffer request body for {}: {}", parts.uri.path(), e);
            return too_large(limit);
        }
    };

    let url = route.upstream_url(parts.uri.path(), parts.uri.query());

    let mut headers = parts.headers;
    strip_hop_by_hop(&mut headers);
    let host = headers.remove(header::HOST);
    // reqwest works these out from the buffered body
    headers.remove(header::CONTENT_LENGTH);
    append_forwarded(&mut headers, peer, host);

    tracing::debug!("{} {} -> {}", parts.method, parts.uri.path(), url);

    let upstream = match state
        .http
        .request(parts.method, url.clone())
        .headers(headers)
        .body(body)
        .timeout(state.settings.upstream_timeout)
        .send()
        .await
    {
        Ok(response) => response,
        Err(e) => return upstream_failure(&url, e),
    };

    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    strip_hop_by_hop(&mut headers);
    headers.remove(header::CONTENT_LENGTH);

    let bytes = match upstream.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => return upstream_failure(&url, e),
    };

    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}
