//! Request rewriting before forwarding.
//!
//! # Responsibilities
//! - Address the request to the backend target (scheme, authority, base path)
//! - Assign a correlation ID when the caller did not send one
//! - Strip hop-by-hop headers
//! - Append the client address to X-Forwarded-For
//!
//! # Design Decisions
//! - The director never fails: input it cannot rewrite is forwarded as-is
//! - Rewriting is idempotent; X-Forwarded-For is a separate stage because
//!   appending is not
//! - The inbound Host header is preserved

use std::net::SocketAddr;

use axum::http::header::{
    CONNECTION, HOST, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TE, TRAILER, TRANSFER_ENCODING,
    UPGRADE,
};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, Uri};

use crate::upstream::BackendTarget;

/// Correlation ID header.
pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

const PROXY_CONNECTION: HeaderName = HeaderName::from_static("proxy-connection");
const KEEP_ALIVE: HeaderName = HeaderName::from_static("keep-alive");

/// Headers that describe a single connection and must not cross the proxy.
const HOP_BY_HOP: [HeaderName; 8] = [
    CONNECTION,
    PROXY_CONNECTION,
    KEEP_ALIVE,
    PROXY_AUTHENTICATE,
    PROXY_AUTHORIZATION,
    TRAILER,
    TRANSFER_ENCODING,
    UPGRADE,
];

/// Timestamp-derived correlation ID with microsecond resolution,
/// e.g. `20261019T101500.123456`.
pub fn correlation_id() -> String {
    chrono::Utc::now().format("%Y%m%dT%H%M%S%.6f").to_string()
}

/// The request's correlation ID, if it carries a usable one.
pub fn request_id<B>(request: &Request<B>) -> Option<&str> {
    request
        .headers()
        .get(&X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

/// Rewrite an inbound request so it can be sent to `target`.
pub fn rewrite<B>(mut request: Request<B>, target: &BackendTarget) -> Request<B> {
    rewrite_uri(&mut request, target);

    let has_id = request
        .headers()
        .get(&X_REQUEST_ID)
        .is_some_and(|v| !v.is_empty());
    if !has_id {
        if let Ok(value) = HeaderValue::from_str(&correlation_id()) {
            request.headers_mut().insert(X_REQUEST_ID, value);
        }
    }

    strip_hop_by_hop(request.headers_mut());
    request
}

fn rewrite_uri<B>(request: &mut Request<B>, target: &BackendTarget) {
    let uri = request.uri();
    if uri.scheme() == Some(target.scheme()) && uri.authority() == Some(target.authority()) {
        return;
    }

    // HTTP/2 clients send :authority instead of Host
    if !request.headers().contains_key(HOST) {
        let host = uri
            .authority()
            .unwrap_or(target.authority())
            .as_str()
            .to_owned();
        if let Ok(value) = HeaderValue::from_str(&host) {
            request.headers_mut().insert(HOST, value);
        }
    }

    let uri = request.uri();
    let path = join_paths(target.base_path(), uri.path());
    let query = match (target.base_query(), uri.query()) {
        (Some(base), Some(query)) => Some(format!("{base}&{query}")),
        (Some(base), None) => Some(base.to_owned()),
        (None, Some(query)) => Some(query.to_owned()),
        (None, None) => None,
    };
    let path_and_query = match query {
        Some(query) => format!("{path}?{query}"),
        None => path,
    };

    let rewritten = Uri::builder()
        .scheme(target.scheme().clone())
        .authority(target.authority().clone())
        .path_and_query(path_and_query)
        .build();
    match rewritten {
        Ok(uri) => *request.uri_mut() = uri,
        Err(err) => tracing::debug!(error = %err, "Request URI left unchanged"),
    }
}

/// Join the target base path and the request path with exactly one slash.
fn join_paths(base: &str, path: &str) -> String {
    if base.is_empty() {
        return path.to_owned();
    }
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{base}{}", &path[1..]),
        (false, false) => format!("{base}/{path}"),
        _ => format!("{base}{path}"),
    }
}

/// Remove hop-by-hop headers, including any named in `Connection`.
///
/// `TE: trailers` is the one hop-by-hop value worth keeping. `Trailer` is
/// re-announced with its end-to-end names; hyper only writes trailer fields
/// the header announced.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named = header_tokens(headers, CONNECTION);
    let announced = header_tokens(headers, TRAILER);

    for name in &named {
        if *name != X_REQUEST_ID {
            headers.remove(name);
        }
    }

    for name in HOP_BY_HOP {
        headers.remove(name);
    }

    let keep_trailers = headers.get_all(TE).iter().any(|v| {
        v.to_str()
            .is_ok_and(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("trailers")))
    });
    headers.remove(TE);
    if keep_trailers {
        headers.insert(TE, HeaderValue::from_static("trailers"));
    }

    let mut trailers: Vec<&str> = Vec::new();
    for name in &announced {
        if HOP_BY_HOP.contains(name) || *name == TE || named.contains(name) {
            continue;
        }
        if !trailers.contains(&name.as_str()) {
            trailers.push(name.as_str());
        }
    }
    if trailers.is_empty() {
        return;
    }
    if let Ok(value) = HeaderValue::from_str(&trailers.join(", ")) {
        headers.insert(TRAILER, value);
    }
}

/// Comma-separated header names carried by every `name` header.
fn header_tokens(headers: &HeaderMap, name: HeaderName) -> Vec<HeaderName> {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect()
}

/// Append the client's IP to X-Forwarded-For.
pub fn append_forwarded_for<B>(request: &mut Request<B>, peer: Option<SocketAddr>) {
    let Some(peer) = peer else {
        return;
    };
    let ip = peer.ip().to_string();

    let prior: Vec<&str> = request
        .headers()
        .get_all(&X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    let value = if prior.is_empty() {
        ip
    } else {
        format!("{}, {ip}", prior.join(", "))
    };

    if let Ok(value) = HeaderValue::from_str(&value) {
        request.headers_mut().insert(X_FORWARDED_FOR, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(url: &str) -> BackendTarget {
        BackendTarget::parse(url).unwrap()
    }

    fn inbound(uri: &str) -> axum::http::request::Builder {
        Request::builder().uri(uri).header(HOST, "proxy.example.com")
    }

    fn is_timestamp_id(id: &str) -> bool {
        chrono::NaiveDateTime::parse_from_str(id, "%Y%m%dT%H%M%S%.6f").is_ok()
            && id.len() == "20060102T150405.000000".len()
    }

    #[test]
    fn addresses_backend_and_keeps_path_and_query() {
        let req = rewrite(
            inbound("/foo?x=1").body(()).unwrap(),
            &target("http://localhost:8081"),
        );
        assert_eq!(req.uri(), "http://localhost:8081/foo?x=1");
        assert_eq!(req.headers()[HOST], "proxy.example.com");
    }

    #[test]
    fn joins_base_path_with_one_slash() {
        assert_eq!(join_paths("", "/foo"), "/foo");
        assert_eq!(join_paths("/api", "/foo"), "/api/foo");
        assert_eq!(join_paths("/api/", "/foo"), "/api/foo");
        assert_eq!(join_paths("/api", "foo"), "/api/foo");

        let req = rewrite(
            inbound("/users?page=2").body(()).unwrap(),
            &target("http://backend:9000/v1?tenant=a"),
        );
        assert_eq!(req.uri(), "http://backend:9000/v1/users?tenant=a&page=2");
    }

    #[test]
    fn missing_host_comes_from_inbound_authority() {
        let req = Request::builder()
            .uri("https://proxy.example.com/foo")
            .body(())
            .unwrap();
        let req = rewrite(req, &target("http://backend:9000"));
        assert_eq!(req.headers()[HOST], "proxy.example.com");
    }

    #[test]
    fn assigns_timestamp_correlation_id() {
        let req = rewrite(inbound("/").body(()).unwrap(), &target("http://b:1"));
        let ids: Vec<_> = req.headers().get_all(&X_REQUEST_ID).iter().collect();
        assert_eq!(ids.len(), 1);
        assert!(is_timestamp_id(ids[0].to_str().unwrap()));
    }

    #[test]
    fn preserves_caller_correlation_id() {
        let req = rewrite(
            inbound("/").header(&X_REQUEST_ID, "abc-123").body(()).unwrap(),
            &target("http://b:1"),
        );
        assert_eq!(request_id(&req), Some("abc-123"));
        assert_eq!(req.headers().get_all(&X_REQUEST_ID).iter().count(), 1);
    }

    #[test]
    fn empty_correlation_id_is_replaced() {
        let req = rewrite(
            inbound("/").header(&X_REQUEST_ID, "").body(()).unwrap(),
            &target("http://b:1"),
        );
        assert!(is_timestamp_id(request_id(&req).unwrap()));
    }

    #[test]
    fn strips_hop_by_hop_headers() {
        let req = rewrite(
            inbound("/")
                .header("proxy-connection", "keep-alive")
                .header(CONNECTION, "keep-alive, x-internal-hop")
                .header("keep-alive", "timeout=5")
                .header("x-internal-hop", "1")
                .header(UPGRADE, "websocket")
                .header(TE, "gzip, trailers")
                .header("x-kept", "yes")
                .body(())
                .unwrap(),
            &target("http://b:1"),
        );

        let headers = req.headers();
        for gone in ["proxy-connection", "connection", "keep-alive", "x-internal-hop", "upgrade"] {
            assert!(!headers.contains_key(gone), "{gone} should be stripped");
        }
        assert_eq!(headers[TE], "trailers");
        assert_eq!(headers["x-kept"], "yes");
    }

    #[test]
    fn trailer_announcement_survives_with_end_to_end_names() {
        let req = rewrite(
            inbound("/")
                .header(CONNECTION, "x-hop-trailer")
                .header(TRAILER, "x-checksum, keep-alive, x-hop-trailer")
                .header(TRAILER, "server-timing")
                .body(())
                .unwrap(),
            &target("http://b:1"),
        );

        let trailers: Vec<_> = req.headers().get_all(TRAILER).iter().collect();
        assert_eq!(trailers, ["x-checksum, server-timing"]);

        let again = rewrite(req, &target("http://b:1"));
        assert_eq!(again.headers()[TRAILER], "x-checksum, server-timing");
    }

    #[test]
    fn trailer_of_only_hop_names_is_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert(TRAILER, HeaderValue::from_static("connection, te"));
        strip_hop_by_hop(&mut headers);
        assert!(!headers.contains_key(TRAILER));
    }

    #[test]
    fn connection_cannot_strip_correlation_id() {
        let req = rewrite(
            inbound("/")
                .header(CONNECTION, "x-request-id")
                .header(&X_REQUEST_ID, "keep-me")
                .body(())
                .unwrap(),
            &target("http://b:1"),
        );
        assert_eq!(request_id(&req), Some("keep-me"));
    }

    #[test]
    fn rewrite_is_idempotent() {
        let backend = target("http://backend:9000/v1?tenant=a");
        let once = rewrite(
            inbound("/foo?x=1")
                .header("proxy-connection", "keep-alive")
                .body(())
                .unwrap(),
            &backend,
        );
        let (uri, headers) = (once.uri().clone(), once.headers().clone());

        let twice = rewrite(once, &backend);
        assert_eq!(twice.uri(), &uri);
        assert_eq!(twice.headers(), &headers);
        assert_eq!(twice.headers().get_all(&X_REQUEST_ID).iter().count(), 1);
    }

    #[test]
    fn forwarded_for_appends_peer_ip() {
        let peer: SocketAddr = "203.0.113.9:51000".parse().unwrap();

        let mut fresh = inbound("/").body(()).unwrap();
        append_forwarded_for(&mut fresh, Some(peer));
        assert_eq!(fresh.headers()[&X_FORWARDED_FOR], "203.0.113.9");

        let mut chained = inbound("/")
            .header(&X_FORWARDED_FOR, "198.51.100.1")
            .body(())
            .unwrap();
        append_forwarded_for(&mut chained, Some(peer));
        assert_eq!(
            chained.headers()[&X_FORWARDED_FOR],
            "198.51.100.1, 203.0.113.9"
        );
    }
}
