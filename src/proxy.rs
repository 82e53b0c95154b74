//! TLS-terminating proxy server: accept loop, per-request lifecycle
//!
//! Composes the admission gate, connection tracker, backend registry and
//! forwarder behind a single listener. Shared state travels through a
//! [`ProxyContext`] handed to each connection task; there is no global
//! mutable state.

use crate::backend::BackendRegistry;
use crate::config::ProxyConfig;
use crate::forward::ProxyForwarder;
use crate::gate::{self, AdmissionDecision};
use crate::tracker::ConnectionTracker;
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};
use uuid::Uuid;

const X_REQUEST_ID: &str = "x-request-id";

/// Shared per-process proxy state, cheap to clone into tasks.
#[derive(Clone)]
pub struct ProxyContext {
    pub config: Arc<ProxyConfig>,
    pub tracker: Arc<ConnectionTracker>,
    pub registry: Arc<BackendRegistry>,
    pub forwarder: Arc<ProxyForwarder>,
}

impl ProxyContext {
    pub fn new(config: ProxyConfig) -> anyhow::Result<Self> {
        let tracker = Arc::new(ConnectionTracker::new(config.tracker_limits()));
        let registry = Arc::new(BackendRegistry::new(config.servers.clone())?);
        let forwarder = Arc::new(ProxyForwarder::new(
            Arc::clone(&registry),
            config.req_transfer_timeout,
        ));
        Ok(Self {
            config: Arc::new(config),
            tracker,
            registry,
            forwarder,
        })
    }
}

/// The proxy server: owns the listener address and the shutdown signal.
pub struct ProxyServer {
    bind_addr: SocketAddr,
    ctx: ProxyContext,
    shutdown_rx: watch::Receiver<bool>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        ctx: ProxyContext,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            ctx,
            shutdown_rx,
            tls_acceptor: None,
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already-bound listener. Split out from [`run`] so
    /// tests can bind to an ephemeral port first.
    ///
    /// [`run`]: ProxyServer::run
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let protocol = if self.tls_acceptor.is_some() { "HTTPS" } else { "HTTP" };
        info!(addr = %listener.local_addr()?, protocol, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let tls_acceptor = self.tls_acceptor.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let ctx = self.ctx.clone();
                            let tls_acceptor = tls_acceptor.clone();

                            tokio::spawn(async move {
                                if let Some(acceptor) = tls_acceptor {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            if let Err(e) = handle_connection(tls_stream, addr, ctx).await {
                                                debug!(addr = %addr, error = %e, "TLS connection error");
                                            }
                                        }
                                        Err(e) => {
                                            debug!(addr = %addr, error = %e, "TLS handshake failed");
                                        }
                                    }
                                } else if let Err(e) = handle_connection(stream, addr, ctx).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(stream: S, addr: SocketAddr, ctx: ProxyContext) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let idle_timeout = ctx.config.connection_timeout;

    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = ctx.clone();
        async move { handle_request(req, ctx, addr).await }
    });

    // auto::Builder serves both HTTP/1.1 and HTTP/2 (h2 over TLS).
    // The idle timeout maps to the header read timeout on HTTP/1 and to
    // keep-alive pings on HTTP/2, so idle connections are bounded on
    // both protocols.
    let mut builder = AutoBuilder::new(TokioExecutor::new());
    {
        let mut http1 = builder.http1();
        http1.timer(TokioTimer::new()).preserve_header_case(true);
        if let Some(timeout) = idle_timeout {
            http1.header_read_timeout(timeout);
        }
        let mut http2 = http1.http2();
        http2.timer(TokioTimer::new()).max_concurrent_streams(250);
        if let Some(timeout) = idle_timeout {
            http2.keep_alive_interval(timeout).keep_alive_timeout(timeout);
        }
    }
    builder
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

/// Top of the request lifecycle. Any failure below surfaces here as a
/// plain 500; the service itself never errors, so hyper keeps the
/// connection in a defined state.
async fn handle_request(
    req: Request<Incoming>,
    ctx: ProxyContext,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, Infallible> {
    // Generate or propagate the request id
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    debug!(
        request_id,
        client = %client_addr,
        method = %req.method(),
        uri = %req.uri(),
        "Incoming request"
    );

    let response = match gate::admit(&ctx.config, &ctx.tracker, &req, client_addr) {
        AdmissionDecision::Rejected(rejection) => {
            debug!(request_id, code = ?rejection.code, "request rejected");
            rejection.into_response()
        }
        AdmissionDecision::Admitted(admission) => {
            ctx.forwarder.relay(req, admission, &request_id).await
        }
    };

    Ok(response)
}
