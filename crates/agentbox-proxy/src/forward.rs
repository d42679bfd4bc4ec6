//! Plain HTTP forwarding with credential injection.
//!
//! Absolute-URI requests (`GET http://host/path HTTP/1.1`) are forwarded
//! through a shared hyper client. Hop-by-hop headers are stripped in both
//! directions, and the injection rule for the target host, if any, sets its
//! header on the outbound request. Bodies are streamed, not buffered.
//!
//! A request whose target is the proxy itself is refused: forwarding it
//! would make the proxy connect to itself again for every hop. Outbound
//! requests carry a `Via` marker so loops through a name that resolves
//! back to the proxy are caught on the second hop.
//!
//! `PASS` is recorded once the response body has been fully relayed; a body
//! that fails or is abandoned part way is recorded as `ERROR`.

use crate::audit::AuditLogger;
use crate::credential::normalize_host;
use crate::error::ProxyError;
use crate::server::{text_response, ProxyBody, ProxyState};
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST, VIA};
use hyper::{Request, Response, StatusCode, Uri};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{debug, warn};

/// Headers that apply to a single connection leg and are never forwarded.
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Host label used in the audit log when the request names no host at all.
const UNKNOWN_HOST: &str = "unknown";

/// `Via` entry this proxy adds to every forwarded request.
const VIA_VALUE: &str = "1.1 agentbox";

/// Pseudonym part of [`VIA_VALUE`].
const VIA_TOKEN: &str = "agentbox";

/// Port assumed for plain HTTP targets without one.
const DEFAULT_HTTP_PORT: u16 = 80;

/// Handle a non-CONNECT request.
///
/// `local_addr` is the proxy address the client connected to.
pub(crate) async fn handle_forward(
    req: Request<Incoming>,
    client_addr: SocketAddr,
    local_addr: SocketAddr,
    state: &ProxyState,
) -> Response<ProxyBody> {
    let client = client_addr.to_string();

    let Some(authority) = request_authority(&req) else {
        let err = ProxyError::HttpParse(format!("no target host in request for {}", req.uri()));
        state.audit.log_error(UNKNOWN_HOST, &err);
        return text_response(StatusCode::BAD_REQUEST, &err.to_string());
    };
    let hostname = normalize_host(&authority);

    let (mut parts, body) = req.into_parts();
    parts.uri = match outbound_uri(&parts.uri, &authority) {
        Ok(uri) => uri,
        Err(e) => {
            state.audit.log_error(&authority, &e);
            return text_response(StatusCode::BAD_REQUEST, &e.to_string());
        }
    };
    if targets_proxy(&parts.uri, local_addr) || already_forwarded(&parts.headers) {
        let err = ProxyError::ForwardLoop(authority.clone());
        warn!("{}", err);
        state.audit.log_error(&authority, &err);
        return text_response(StatusCode::LOOP_DETECTED, &err.to_string());
    }
    debug!("Forwarding {} {}", parts.method, parts.uri);

    strip_hop_by_hop(&mut parts.headers);
    parts
        .headers
        .append(VIA, HeaderValue::from_static(VIA_VALUE));
    if state.injector.inject(&hostname, &mut parts.headers) {
        state.audit.log_auth_injected(&authority, &client);
    }

    let outbound = Request::from_parts(parts, body.boxed());
    match state.client.request(outbound).await {
        Ok(response) => {
            let (mut parts, body) = response.into_parts();
            strip_hop_by_hop(&mut parts.headers);
            let body = AuditedBody::new(body, Arc::clone(&state.audit), authority, client);
            Response::from_parts(parts, body.boxed())
        }
        Err(e) => {
            let reason = error_chain(&e);
            debug!("Upstream request to {} failed: {}", authority, reason);
            state.audit.log_error(&authority, &reason);
            text_response(StatusCode::SERVICE_UNAVAILABLE, &reason)
        }
    }
}

/// Target authority: from the absolute URI, else from the `Host` header.
fn request_authority<B>(req: &Request<B>) -> Option<String> {
    if let Some(authority) = req.uri().authority() {
        return Some(authority.as_str().to_string());
    }
    req.headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(str::to_string)
}

/// Make the request URI absolute so the client knows where to connect.
fn outbound_uri(uri: &Uri, authority: &str) -> Result<Uri, ProxyError> {
    if uri.scheme().is_some() && uri.authority().is_some() {
        return Ok(uri.clone());
    }
    let path = uri.path_and_query().map_or("/", |pq| pq.as_str());
    format!("http://{}{}", authority, path)
        .parse::<Uri>()
        .map_err(|e| ProxyError::HttpParse(format!("invalid target {}{}: {}", authority, path, e)))
}

/// Whether `uri` points at the proxy's own listening socket.
fn targets_proxy(uri: &Uri, local_addr: SocketAddr) -> bool {
    let Some(host) = uri.host() else {
        return false;
    };
    if uri.port_u16().unwrap_or(DEFAULT_HTTP_PORT) != local_addr.port() {
        return false;
    }
    let host = normalize_host(host);
    if host == "localhost" {
        return true;
    }
    match host.parse::<IpAddr>() {
        Ok(ip) => ip == local_addr.ip() || ip.is_loopback() || ip.is_unspecified(),
        Err(_) => false,
    }
}

/// Whether this proxy already forwarded the request once.
fn already_forwarded(headers: &HeaderMap) -> bool {
    headers
        .get_all(VIA)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|hop| hop.split_whitespace().nth(1) == Some(VIA_TOKEN))
}

/// Response body that records the outcome of relaying it.
///
/// `PASS` when the stream ends cleanly, `ERROR` when it fails or is
/// dropped before the end. Exactly one entry per body.
struct AuditedBody<B: Body> {
    inner: B,
    audit: Arc<AuditLogger>,
    host: String,
    client: String,
    finished: bool,
    failure: Option<String>,
}

impl<B> AuditedBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: fmt::Display,
{
    fn new(inner: B, audit: Arc<AuditLogger>, host: String, client: String) -> Self {
        Self {
            inner,
            audit,
            host,
            client,
            finished: false,
            failure: None,
        }
    }
}

impl<B> Body for AuditedBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: fmt::Display,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Bytes>, B::Error>>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_frame(cx);
        match &polled {
            Poll::Ready(None) => this.finished = true,
            Poll::Ready(Some(Err(e))) if this.failure.is_none() => {
                this.failure = Some(format!("response body failed: {}", e));
            }
            _ => {}
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl<B: Body> Drop for AuditedBody<B> {
    fn drop(&mut self) {
        if let Some(reason) = self.failure.take() {
            self.audit.log_error(&self.host, &reason);
        } else if self.finished || self.inner.is_end_stream() {
            self.audit.log_pass(&self.host, &self.client);
        } else {
            self.audit
                .log_error(&self.host, &"response body not fully relayed");
        }
    }
}

/// Remove hop-by-hop headers, including any named by `Connection`.
pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap) {
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
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

/// `outer: inner: innermost` for an error and its sources.
fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        out.push_str(": ");
        out.push_str(&inner.to_string());
        source = inner.source();
    }
    out
}
