//! Proxy server: TCP listener, connection dispatch, and lifecycle.
//!
//! The server binds to `127.0.0.1:<port>` (3128 by default), accepts TCP
//! connections and serves each one with hyper's HTTP/1.1 server on its own
//! task, with upgrades enabled so CONNECT can take over the raw socket.
//!
//! CONNECT method -> [`connect`](crate::connect) handler (opaque tunnel)
//! Other methods  -> [`forward`](crate::forward) handler (credential injection)
//!
//! Shutdown stops the accept loop only. Connections already being served,
//! tunnels included, run until their peers close them.

use crate::audit::AuditLogger;
use crate::config::ProxyConfig;
use crate::connect::{self, UPSTREAM_CONNECT_TIMEOUT};
use crate::credential::AuthInjector;
use crate::error::{ProxyError, Result};
use crate::forward;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Time a client gets to send a complete request head.
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Body type for every response the proxy produces.
pub(crate) type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Shared state for the proxy server.
pub(crate) struct ProxyState {
    pub(crate) injector: AuthInjector,
    pub(crate) audit: Arc<AuditLogger>,
    /// Outbound client for plain HTTP. Built once so idle upstream
    /// connections are pooled across requests.
    pub(crate) client: Client<HttpConnector, ProxyBody>,
}

/// The forward proxy.
pub struct ProxyServer {
    listen_addr: SocketAddr,
    state: Arc<ProxyState>,
}

impl ProxyServer {
    /// Create a server. Nothing is bound until [`run`](Self::run).
    #[must_use]
    pub fn new(config: &ProxyConfig, injector: AuthInjector, audit: Arc<AuditLogger>) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(UPSTREAM_CONNECT_TIMEOUT));
        let client = Client::builder(TokioExecutor::new()).build(connector);

        Self {
            listen_addr: config.listen_addr(),
            state: Arc::new(ProxyState {
                injector,
                audit,
                client,
            }),
        }
    }

    /// Address the server binds to.
    #[must_use]
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// Bind the configured address and serve until `shutdown` becomes `true`
    /// or its sender is dropped.
    ///
    /// Only a bind failure is returned as an error; per-connection failures
    /// are logged and never stop the server.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = bind(self.listen_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already-bound listener until `shutdown` fires.
    pub async fn serve(self, listener: TcpListener, shutdown: watch::Receiver<bool>) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!("Proxy server listening on {}", addr);
        }
        accept_loop(listener, self.state, shutdown).await;
        Ok(())
    }
}

/// Handle returned when the proxy server is started in the background.
pub struct ProxyHandle {
    /// The address the proxy is listening on
    pub addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<Result<()>>,
}

impl ProxyHandle {
    /// The actual port the proxy is listening on.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Stop accepting new connections.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for the accept loop to finish.
    pub async fn wait(self) -> Result<()> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(ProxyError::Io(std::io::Error::other(e))),
        }
    }

    /// Environment variables that route a child's HTTP clients through
    /// the proxy.
    #[must_use]
    pub fn env_vars(&self) -> Vec<(String, String)> {
        let proxy_url = format!("http://{}", self.addr);

        let mut vars = vec![
            ("HTTP_PROXY".to_string(), proxy_url.clone()),
            ("HTTPS_PROXY".to_string(), proxy_url.clone()),
            ("NO_PROXY".to_string(), "localhost,127.0.0.1".to_string()),
        ];

        // Lowercase variants for compatibility
        vars.push(("http_proxy".to_string(), proxy_url.clone()));
        vars.push(("https_proxy".to_string(), proxy_url));
        vars.push(("no_proxy".to_string(), "localhost,127.0.0.1".to_string()));

        vars
    }
}

/// Bind the configured address and serve on a background task.
///
/// Use port 0 in `config` for an OS-assigned port; the handle carries the
/// actual address.
pub async fn start(
    config: &ProxyConfig,
    injector: AuthInjector,
    audit: Arc<AuditLogger>,
) -> Result<ProxyHandle> {
    let server = ProxyServer::new(config, injector, audit);
    let listener = bind(server.listen_addr).await?;
    let addr = listener.local_addr().map_err(|e| ProxyError::Bind {
        addr: server.listen_addr.to_string(),
        source: e,
    })?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(server.serve(listener, shutdown_rx));

    Ok(ProxyHandle {
        addr,
        shutdown_tx,
        task,
    })
}

async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr).await.map_err(|e| ProxyError::Bind {
        addr: addr.to_string(),
        source: e,
    })
}

/// Accept loop: listen for connections until shutdown.
///
/// Returning drops the listener, which closes the listening socket.
async fn accept_loop(
    listener: TcpListener,
    state: Arc<ProxyState>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    if *shutdown_rx.borrow() {
        return;
    }

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        debug!("Accepted connection from {}", addr);
                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, state).await {
                                debug!("Connection handler error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("Accept error: {}", e);
                    }
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("Proxy server shutting down");
                    return;
                }
            }
        }
    }
}

/// Serve one client connection. Keep-alive requests on the same
/// connection are handled in order.
async fn handle_connection(
    stream: TcpStream,
    client_addr: SocketAddr,
    state: Arc<ProxyState>,
) -> Result<()> {
    let local_addr = stream.local_addr()?;
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { Ok::<_, Infallible>(dispatch(req, client_addr, local_addr, &state).await) }
    });

    http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(HEADER_READ_TIMEOUT)
        .serve_connection(io, service)
        .with_upgrades()
        .await?;
    Ok(())
}

/// Route a request by method.
async fn dispatch(
    req: Request<Incoming>,
    client_addr: SocketAddr,
    local_addr: SocketAddr,
    state: &ProxyState,
) -> Response<ProxyBody> {
    if req.method() == Method::CONNECT {
        connect::handle_connect(req, client_addr, state).await
    } else {
        forward::handle_forward(req, client_addr, local_addr, state).await
    }
}

pub(crate) fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

/// Plain-text response carrying `message`.
pub(crate) fn text_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let body = Full::new(Bytes::from(format!("{}\n", message)))
        .map_err(|never| match never {})
        .boxed();
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::redact::Redactor;
    use tempfile::tempdir;

    fn test_config() -> ProxyConfig {
        ProxyConfig {
            port: 0,
            ..Default::default()
        }
    }

    fn test_audit(dir: &tempfile::TempDir) -> Arc<AuditLogger> {
        Arc::new(AuditLogger::open(dir.path().join("network.log"), Redactor::default()).unwrap())
    }

    #[tokio::test]
    async fn test_proxy_starts_and_binds() {
        let dir = tempdir().unwrap();
        let handle = start(&test_config(), AuthInjector::default(), test_audit(&dir))
            .await
            .unwrap();

        assert!(handle.port() > 0);
        assert!(handle.addr.ip().is_loopback());

        handle.shutdown();
        handle.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_listener() {
        let dir = tempdir().unwrap();
        let handle = start(&test_config(), AuthInjector::default(), test_audit(&dir))
            .await
            .unwrap();
        let addr = handle.addr;

        handle.shutdown();
        handle.wait().await.unwrap();

        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_run_returns_when_sender_dropped() {
        let dir = tempdir().unwrap();
        let server = ProxyServer::new(&test_config(), AuthInjector::default(), test_audit(&dir));
        let (tx, rx) = watch::channel(false);
        drop(tx);
        server.run(rx).await.unwrap();
    }

    #[tokio::test]
    async fn test_run_reports_bind_failure() {
        let dir = tempdir().unwrap();
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let config = ProxyConfig {
            port: taken.local_addr().unwrap().port(),
            ..Default::default()
        };
        let server = ProxyServer::new(&config, AuthInjector::default(), test_audit(&dir));
        let (_tx, rx) = watch::channel(false);

        let err = server.run(rx).await.unwrap_err();
        assert!(matches!(err, ProxyError::Bind { .. }));
    }

    #[tokio::test]
    async fn test_proxy_env_vars() {
        let dir = tempdir().unwrap();
        let handle = start(&test_config(), AuthInjector::default(), test_audit(&dir))
            .await
            .unwrap();

        let vars = handle.env_vars();
        let http_proxy = vars.iter().find(|(k, _)| k == "HTTP_PROXY").unwrap();
        assert_eq!(http_proxy.1, format!("http://127.0.0.1:{}", handle.port()));
        assert!(vars.iter().any(|(k, _)| k == "https_proxy"));

        handle.shutdown();
    }

    #[test]
    fn test_text_response() {
        let response = text_response(StatusCode::SERVICE_UNAVAILABLE, "down");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "text/plain; charset=utf-8"
        );
    }
}
