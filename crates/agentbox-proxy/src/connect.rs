//! HTTP CONNECT tunnel handler.
//!
//! Handles `CONNECT host:port HTTP/1.1` requests by:
//! 1. Recording a `SKIP` entry when the host has an injection rule
//! 2. Dialing the target with a bounded timeout
//! 3. Returning `200` and taking over the client socket via hyper's upgrade
//! 4. Relaying bytes in both directions until either side stops
//!
//! The proxy never terminates TLS, so credentials cannot be injected into a
//! tunnel. Tunnels outlive server shutdown and end only when a peer closes.

use crate::credential::normalize_host;
use crate::error::{ProxyError, Result};
use crate::server::{empty_body, text_response, ProxyBody, ProxyState};
use hyper::body::Incoming;
use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, error};

/// Timeout for upstream TCP connect.
pub(crate) const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Port assumed when a CONNECT target carries none.
const DEFAULT_CONNECT_PORT: u16 = 443;

/// Recorded when a tunnel goes to a host that has an injection rule.
const SKIP_REASON: &str = "HTTPS requires terminating TLS to inject credentials; passing through";

/// Handle a CONNECT request.
pub(crate) async fn handle_connect(
    mut req: Request<Incoming>,
    client_addr: SocketAddr,
    state: &ProxyState,
) -> Response<ProxyBody> {
    let authority = match req.uri().authority() {
        Some(a) => a.as_str().to_string(),
        None => {
            let err = ProxyError::HttpParse(format!("CONNECT without authority: {}", req.uri()));
            state.audit.log_error(&req.uri().to_string(), &err);
            return text_response(StatusCode::BAD_REQUEST, &err.to_string());
        }
    };

    let (host, port) = match parse_connect_target(&authority) {
        Ok(target) => target,
        Err(e) => {
            state.audit.log_error(&authority, &e);
            return text_response(StatusCode::BAD_REQUEST, &e.to_string());
        }
    };
    debug!("CONNECT request to {}:{}", host, port);

    let hostname = normalize_host(&host);
    if state.injector.needs_injection(&hostname) {
        state.audit.log_skipped(&hostname, SKIP_REASON);
    }

    // Without the upgrade handle the client socket can never be detached.
    // This is a server wiring bug, not a client problem.
    let Some(on_upgrade) = req.extensions_mut().remove::<OnUpgrade>() else {
        let err = ProxyError::UpgradeUnsupported(format!(
            "no upgrade handle for CONNECT {}",
            authority
        ));
        error!("{}", err);
        state.audit.log_error(&authority, &err);
        return text_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string());
    };

    let upstream = match dial(&host, port).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!("CONNECT dial failed: {}", e);
            state.audit.log_error(&authority, &e);
            return text_response(StatusCode::SERVICE_UNAVAILABLE, &e.to_string());
        }
    };

    let audit = std::sync::Arc::clone(&state.audit);
    let client = client_addr.to_string();
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                audit.log_pass(&authority, &client);
                relay(TokioIo::new(upgraded), upstream).await;
                debug!("CONNECT tunnel closed for {}", authority);
            }
            Err(e) => {
                error!("Upgrade failed for CONNECT {}: {}", authority, e);
                audit.log_error(&authority, &e);
            }
        }
    });

    // 200 with no body; hyper hands the socket to `on_upgrade` once sent.
    let mut response = Response::new(empty_body());
    *response.status_mut() = StatusCode::OK;
    response
}

/// Dial `host:port` with [`UPSTREAM_CONNECT_TIMEOUT`].
async fn dial(host: &str, port: u16) -> Result<TcpStream> {
    let target = format!("{}:{}", host, port);
    match tokio::time::timeout(UPSTREAM_CONNECT_TIMEOUT, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(ProxyError::UpstreamConnect {
            host: target,
            reason: e.to_string(),
        }),
        Err(_) => Err(ProxyError::UpstreamConnect {
            host: target,
            reason: "connection timed out".to_string(),
        }),
    }
}

/// Copy bytes both ways until one direction hits EOF or an error, then
/// drop both streams.
async fn relay<C, U>(client: C, upstream: U)
where
    C: AsyncRead + AsyncWrite,
    U: AsyncRead + AsyncWrite,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut upstream_rd, mut upstream_wr) = tokio::io::split(upstream);

    tokio::select! {
        r = tokio::io::copy(&mut client_rd, &mut upstream_wr) => {
            debug!("client -> upstream finished: {:?}", r);
        }
        r = tokio::io::copy(&mut upstream_rd, &mut client_wr) => {
            debug!("upstream -> client finished: {:?}", r);
        }
    }
}

/// Split a CONNECT authority into host and port.
///
/// Bracketed IPv6 hosts lose their brackets. A missing port means 443.
fn parse_connect_target(authority: &str) -> Result<(String, u16)> {
    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest.split_once(']').ok_or_else(|| {
            ProxyError::HttpParse(format!("unterminated IPv6 literal in CONNECT: {}", authority))
        })?;
        (host, after.strip_prefix(':'))
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    if host.is_empty() {
        return Err(ProxyError::HttpParse(format!(
            "missing host in CONNECT: {}",
            authority
        )));
    }

    let port = match port {
        Some(p) => p.parse::<u16>().map_err(|_| {
            ProxyError::HttpParse(format!("invalid port in CONNECT: {}", authority))
        })?,
        None => DEFAULT_CONNECT_PORT,
    };

    Ok((host.to_string(), port))
}
