//! Integration tests for Loadgate

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use loadgate::config::ProxyConfig;
use loadgate::proxy::{ProxyContext, ProxyServer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Notify};

/// Spawn an in-process backend. Responds with the given status, a body
/// and `x-backend` header carrying `name`, and echoes `x-request-id`.
/// When `gate` is set, each response is held until the gate is notified.
async fn spawn_backend(
    name: &'static str,
    status: StatusCode,
    gate: Option<Arc<Notify>>,
) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let gate = gate.clone();

            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req: Request<Incoming>| {
                    let gate = gate.clone();
                    async move {
                        if let Some(gate) = &gate {
                            gate.notified().await;
                        }
                        let mut builder = Response::builder()
                            .status(status)
                            .header("x-backend", name);
                        if let Some(id) = req.headers().get("x-request-id") {
                            builder = builder.header("x-request-id", id);
                        }
                        Ok::<_, Infallible>(
                            builder.body(Full::new(Bytes::from_static(name.as_bytes()))).unwrap(),
                        )
                    }
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(io, service)
                    .await;
            });
        }
    });

    addr
}

/// Start the proxy (plain HTTP, ephemeral port) over injected settings.
async fn start_proxy(extra: &[(&str, String)], servers: &str) -> (SocketAddr, watch::Sender<bool>) {
    let mut env: HashMap<String, String> = HashMap::from([
        ("PORT".to_string(), "0".to_string()),
        ("SERVERS".to_string(), servers.to_string()),
    ]);
    for (key, value) in extra {
        env.insert(key.to_string(), value.clone());
    }

    let config = ProxyConfig::from_lookup(|var| env.get(var).cloned()).unwrap();
    let ctx = ProxyContext::new(config).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = ProxyServer::new(addr, ctx, shutdown_rx);
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    (addr, shutdown_tx)
}

fn one_server(addr: SocketAddr) -> String {
    format!(r#"[{{"host":"{addr}"}}]"#)
}

/// Send a raw HTTP/1.1 request and read the whole response.
async fn send_raw(addr: SocketAddr, request: String) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

async fn http_get(addr: SocketAddr, path: &str, extra_headers: &str) -> String {
    send_raw(
        addr,
        format!(
            "GET {path} HTTP/1.1\r\nHost: 127.0.0.1\r\n{extra_headers}Connection: close\r\n\r\n"
        ),
    )
    .await
}

fn status_line_of(response: &str) -> &str {
    response.lines().next().unwrap_or("")
}

#[tokio::test]
async fn test_relays_status_headers_and_body() {
    let backend = spawn_backend("teapot", StatusCode::IM_A_TEAPOT, None).await;
    let (proxy, _shutdown) = start_proxy(&[], &one_server(backend)).await;

    let response = http_get(proxy, "/brew?kind=oolong", "").await;

    assert!(status_line_of(&response).starts_with("HTTP/1.1 418"));
    assert!(response.to_lowercase().contains("x-backend: teapot"));
    // The proxy stamps a request id on the way through
    assert!(response.to_lowercase().contains("x-request-id:"));
    assert!(response.ends_with("teapot"));
}

#[tokio::test]
async fn test_propagates_existing_request_id() {
    let backend = spawn_backend("ok", StatusCode::OK, None).await;
    let (proxy, _shutdown) = start_proxy(&[], &one_server(backend)).await;

    let response = http_get(proxy, "/", "x-request-id: trace-me-42\r\n").await;

    assert!(status_line_of(&response).starts_with("HTTP/1.1 200"));
    assert!(response.contains("trace-me-42"));
}

#[tokio::test]
async fn test_least_connections_prefers_idle_backend() {
    let gate = Arc::new(Notify::new());
    let slow = spawn_backend("alpha", StatusCode::OK, Some(Arc::clone(&gate))).await;
    let fast = spawn_backend("beta", StatusCode::OK, None).await;

    let servers = format!(r#"[{{"host":"{slow}"}},{{"host":"{fast}"}}]"#);
    let (proxy, _shutdown) = start_proxy(&[], &servers).await;

    // First request lands on the first backend and is held there
    let held = tokio::spawn(http_get(proxy, "/", ""));
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Second request sees the first backend busy and goes to the other
    let response = http_get(proxy, "/", "").await;
    assert!(response.ends_with("beta"));

    gate.notify_one();
    let held_response = held.await.unwrap();
    assert!(held_response.ends_with("alpha"));

    // Both idle again: the earliest backend wins the tie
    tokio::time::sleep(Duration::from_millis(100)).await;
    gate.notify_one();
    let response = http_get(proxy, "/", "").await;
    assert!(response.ends_with("alpha"));
}

#[tokio::test]
async fn test_per_source_connection_limit() {
    let gate = Arc::new(Notify::new());
    let backend = spawn_backend("slow", StatusCode::OK, Some(Arc::clone(&gate))).await;
    let (proxy, _shutdown) = start_proxy(
        &[("IP_CONNECTIONS_LIMIT", "1".to_string())],
        &one_server(backend),
    )
    .await;

    // First connection is admitted and held open inside the backend
    let held = tokio::spawn(http_get(proxy, "/", ""));
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Second connection from the same source is refused
    let refused = http_get(proxy, "/", "").await;
    assert!(status_line_of(&refused).starts_with("HTTP/1.1 503"));
    assert!(refused.contains("Connection refused: limit overflowed."));

    // Release the first connection; the slot frees up
    gate.notify_one();
    let held_response = held.await.unwrap();
    assert!(status_line_of(&held_response).starts_with("HTTP/1.1 200"));

    tokio::time::sleep(Duration::from_millis(100)).await;
    gate.notify_one();
    let admitted = http_get(proxy, "/", "").await;
    assert!(status_line_of(&admitted).starts_with("HTTP/1.1 200"));
}

#[tokio::test]
async fn test_payload_size_boundary() {
    let backend = spawn_backend("ok", StatusCode::OK, None).await;
    let (proxy, _shutdown) = start_proxy(
        &[("MAX_REQ_BYTES", "4".to_string())],
        &one_server(backend),
    )
    .await;

    // Declared length exactly at the limit passes
    let at_limit = send_raw(
        proxy,
        "POST /upload HTTP/1.1\r\nHost: 127.0.0.1\r\nContent-Length: 4\r\nConnection: close\r\n\r\nbody".to_string(),
    )
    .await;
    assert!(status_line_of(&at_limit).starts_with("HTTP/1.1 200"));

    // One byte over is refused
    let over = send_raw(
        proxy,
        "POST /upload HTTP/1.1\r\nHost: 127.0.0.1\r\nContent-Length: 5\r\nConnection: close\r\n\r\nbody!".to_string(),
    )
    .await;
    assert!(status_line_of(&over).starts_with("HTTP/1.1 413"));
    assert!(over.contains("Req. size limit overflowed."));
}

#[tokio::test]
async fn test_origin_allowlist() {
    let backend = spawn_backend("ok", StatusCode::OK, None).await;
    let (proxy, _shutdown) = start_proxy(
        &[("ALLOWED_ORIGINS", "https://ok.example".to_string())],
        &one_server(backend),
    )
    .await;

    // No origin supplied: refused, and no echo header in the response
    let missing = http_get(proxy, "/", "").await;
    assert!(status_line_of(&missing).starts_with("HTTP/1.1 403"));
    assert!(!missing.to_lowercase().contains("access-control-allow-origin"));

    // Unlisted origin: refused, with the origin echoed back
    let unlisted = http_get(proxy, "/", "Origin: https://evil.example\r\n").await;
    assert!(status_line_of(&unlisted).starts_with("HTTP/1.1 403"));
    assert!(unlisted
        .to_lowercase()
        .contains("access-control-allow-origin: https://evil.example"));

    // Listed origin passes through to the backend
    let listed = http_get(proxy, "/", "Origin: https://ok.example\r\n").await;
    assert!(status_line_of(&listed).starts_with("HTTP/1.1 200"));
}

#[tokio::test]
async fn test_ip_allowlist_rejects_unlisted_peer() {
    let backend = spawn_backend("ok", StatusCode::OK, None).await;
    let (proxy, _shutdown) = start_proxy(
        &[("ALLOWED_IPS", "10.9.9.9".to_string())],
        &one_server(backend),
    )
    .await;

    let response = http_get(proxy, "/", "").await;
    assert!(status_line_of(&response).starts_with("HTTP/1.1 403"));
    assert!(response.contains("Access from IP address 127.0.0.1 denied."));
}

#[tokio::test]
async fn test_saturated_backend_refused() {
    let backend = spawn_backend("ok", StatusCode::OK, None).await;
    let servers = format!(r#"[{{"host":"{backend}","connectionsLimit":0}}]"#);
    let (proxy, _shutdown) = start_proxy(&[], &servers).await;

    let response = http_get(proxy, "/", "").await;
    assert!(status_line_of(&response).starts_with("HTTP/1.1 503"));
}

#[tokio::test]
async fn test_unreachable_backend_yields_502() {
    // Bind then drop a listener so the port refuses connections
    let dead = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let (proxy, _shutdown) = start_proxy(&[], &one_server(dead)).await;

    let response = http_get(proxy, "/", "").await;
    assert!(status_line_of(&response).starts_with("HTTP/1.1 502"));
}

#[tokio::test]
async fn test_idle_connection_is_closed_after_timeout() {
    let backend = spawn_backend("ok", StatusCode::OK, None).await;
    let (proxy, _shutdown) = start_proxy(
        &[("CONNECTION_TIMEOUT", "300".to_string())],
        &one_server(backend),
    )
    .await;

    // Connect but never send a request; the server must hang up
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let mut buffer = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(3), stream.read_to_end(&mut buffer)).await;
    assert_eq!(read.unwrap().unwrap(), 0);
}

#[tokio::test]
async fn test_shutdown_stops_accepting() {
    let backend = spawn_backend("ok", StatusCode::OK, None).await;
    let (proxy, shutdown) = start_proxy(&[], &one_server(backend)).await;

    let response = http_get(proxy, "/", "").await;
    assert!(status_line_of(&response).starts_with("HTTP/1.1 200"));

    shutdown.send(true).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(TcpStream::connect(proxy).await.is_err());
}
