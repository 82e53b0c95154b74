//! Streaming request forwarding to the selected backend
//!
//! The forwarder owns a pooled HTTP client, picks the least-loaded
//! backend per request, rewrites the URI onto that backend, and streams
//! both bodies without buffering. The tracker charge and the backend
//! load slot ride the response body as drop guards so both counters are
//! released exactly once, whether the response completes, the client
//! aborts mid-stream, or the upstream errors out.

use crate::backend::{BackendGuard, BackendRegistry};
use crate::error::{error_response, ProxyErrorCode};
use crate::gate::Admission;
use crate::tracker::TrackerGuard;
use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes, Frame, Incoming, SizeHint};
use hyper::header::HeaderValue;
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tracing::{debug, warn};

const X_REQUEST_ID: &str = "x-request-id";

pub struct ProxyForwarder {
    client: Client<HttpConnector, Incoming>,
    registry: Arc<BackendRegistry>,
    transfer_timeout: Option<Duration>,
}

impl ProxyForwarder {
    pub fn new(registry: Arc<BackendRegistry>, transfer_timeout: Option<Duration>) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build(connector);

        Self {
            client,
            registry,
            transfer_timeout,
        }
    }

    /// Forward an admitted request to the least-loaded backend and relay
    /// the response stream back.
    pub async fn relay(
        &self,
        req: Request<Incoming>,
        admission: Admission,
        request_id: &str,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        let origin = admission.origin.clone();

        let backend = match self.registry.select() {
            Some(guard) => guard,
            None => {
                warn!(request_id, "all backends at connection limit");
                return error_response(
                    ProxyErrorCode::BackendSaturated,
                    "Connection refused: limit overflowed.",
                    origin.as_ref(),
                );
            }
        };

        debug!(
            request_id,
            backend = %backend.host(),
            source = %admission.source_key,
            method = %req.method(),
            uri = %req.uri(),
            "forwarding request"
        );

        let backend_req = match rewrite_request(req, backend.host(), request_id) {
            Ok(r) => r,
            Err(e) => {
                warn!(request_id, error = %e, "failed to build upstream request");
                return error_response(
                    ProxyErrorCode::InternalError,
                    "Internal server error.",
                    origin.as_ref(),
                );
            }
        };

        let result = match self.transfer_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, self.client.request(backend_req))
                .await
            {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        request_id,
                        backend = %backend.host(),
                        timeout_ms = timeout.as_millis() as u64,
                        "upstream request timed out"
                    );
                    return error_response(
                        ProxyErrorCode::RequestTimeout,
                        "Request to upstream server timed out.",
                        origin.as_ref(),
                    );
                }
            },
            None => self.client.request(backend_req).await,
        };

        match result {
            Ok(response) => {
                debug!(request_id, status = %response.status(), "upstream responded");
                let (parts, body) = response.into_parts();
                let guarded =
                    GuardedBody::new(body.boxed(), admission.charge, backend).boxed();
                Response::from_parts(parts, guarded)
            }
            Err(e) => {
                warn!(request_id, backend = %backend.host(), error = %e, "upstream request failed");
                error_response(
                    ProxyErrorCode::ConnectionFailed,
                    "Failed to connect to upstream server.",
                    origin.as_ref(),
                )
            }
        }
    }
}

/// Rebuild the request onto the backend host, keeping method, path,
/// query and headers, and stamping the request id.
fn rewrite_request<B>(
    req: Request<B>,
    backend_host: &str,
    request_id: &str,
) -> Result<Request<B>, hyper::http::Error> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri = format!("http://{backend_host}{path}");

    let (parts, body) = req.into_parts();
    let mut builder = Request::builder().method(parts.method).uri(&uri);

    for (key, value) in parts.headers.iter() {
        builder = builder.header(key, value);
    }
    if let Ok(value) = HeaderValue::from_str(request_id) {
        builder = builder.header(X_REQUEST_ID, value);
    }

    builder.body(body)
}

/// Response body that carries the connection-accounting guards.
///
/// Dropped when the body finishes, the client disconnects, or the
/// stream errors, so each guard releases its counter exactly once.
struct GuardedBody {
    inner: BoxBody<Bytes, hyper::Error>,
    _charge: TrackerGuard,
    _backend: BackendGuard,
}

impl GuardedBody {
    fn new(
        inner: BoxBody<Bytes, hyper::Error>,
        charge: TrackerGuard,
        backend: BackendGuard,
    ) -> Self {
        Self {
            inner,
            _charge: charge,
            _backend: backend,
        }
    }
}

impl Body for GuardedBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
