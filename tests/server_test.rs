//! Integration tests for the SSE daemon over real TCP connections.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use sse_session::config::{ServerConfig, SessionOptions};
use sse_session::error::DaemonError;
use sse_session::server::{ConnectionHandler, SseListener};
use sse_session::shutdown::ShutdownCoordinator;

fn test_config() -> ServerConfig {
    ServerConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        heartbeat_interval_ms: 50,
        request_timeout_secs: 2,
        write_timeout_secs: 2,
        ..ServerConfig::default()
    }
}

/// Bind a listener and run the accept loop in the background.
async fn start_server(config: ServerConfig, session: SessionOptions) -> (SocketAddr, ShutdownCoordinator) {
    let shutdown = ShutdownCoordinator::new();
    let listener = SseListener::bind(&config, shutdown.clone()).await.unwrap();
    let addr = listener.local_addr();
    let handler = Arc::new(ConnectionHandler::new(config, session.resolve()));

    tokio::spawn(async move {
        while let Some(conn) = listener.accept().await {
            let handler = handler.clone();
            tokio::spawn(async move {
                handler.handle(conn.stream, conn.guard).await;
            });
        }
    });

    (addr, shutdown)
}

async fn request(addr: SocketAddr, request_line: &str) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let raw = format!("{}\r\nHost: localhost\r\nAccept: text/event-stream\r\n\r\n", request_line);
    stream.write_all(raw.as_bytes()).await.unwrap();
    stream
}

/// Read until `needle` has been seen, the peer closes, or two seconds pass.
async fn read_until(stream: &mut TcpStream, needle: &str) -> String {
    let mut received = Vec::new();
    let mut buf = [0u8; 1024];
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);

    while !String::from_utf8_lossy(&received).contains(needle) {
        match tokio::time::timeout_at(deadline, stream.read(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
            Ok(Ok(n)) => received.extend_from_slice(&buf[..n]),
        }
    }
    String::from_utf8_lossy(&received).into_owned()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stream_handshake_and_heartbeat() {
    let (addr, _shutdown) = start_server(test_config(), SessionOptions::default()).await;
    let mut client = request(addr, "GET /events HTTP/1.1").await;

    let response = read_until(&mut client, "data: {\"connection_id\":1,\"seq\":0}\n\n").await;

    let expected_head = "HTTP/1.1 200 OK\r\n\
        Content-Type: text/event-stream\r\n\
        Cache-Control: no-cache, no-transform\r\n\
        Connection: keep-alive\r\n\
        \r\n\
        :ok\n\n";
    assert!(response.starts_with(expected_head), "got: {:?}", response);
    assert!(
        response.contains(
            "event: heartbeat\nretry: 1000\nid: 1\ndata: {\"connection_id\":1,\"seq\":0}\n\n"
        ),
        "got: {:?}",
        response
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_session_options_reach_the_wire() {
    let options = SessionOptions::default()
        .retry(3000)
        .max_event_source_buffer_size(1024);
    let (addr, _shutdown) = start_server(test_config(), options).await;
    let mut client = request(addr, "GET /events?since=0 HTTP/1.1").await;

    let response = read_until(&mut client, "retry: 3000\n").await;
    assert!(response.contains("retry: 3000\nid: 1\n"), "got: {:?}", response);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stream_runs_past_buffer_size() {
    let config = ServerConfig {
        heartbeat_interval_ms: 5,
        ..test_config()
    };
    let options = SessionOptions::default().max_event_source_buffer_size(64);
    let (addr, _shutdown) = start_server(config, options).await;
    let mut client = request(addr, "GET /events HTTP/1.1").await;

    let response = read_until(&mut client, "\"seq\":5}").await;
    let (head, body) = response.split_once("\r\n\r\n").unwrap();

    assert!(!head.contains("Content-Length"), "got: {:?}", head);
    assert!(body.len() > 64, "got: {:?}", body);
    assert!(body.contains("data: {\"connection_id\":1,\"seq\":5}"), "got: {:?}", body);
}

#[tokio::test]
async fn test_bind_rejects_zero_heartbeat_interval() {
    let config = ServerConfig {
        heartbeat_interval_ms: 0,
        ..test_config()
    };
    let result = SseListener::bind(&config, ShutdownCoordinator::new()).await;
    assert!(matches!(result, Err(DaemonError::Config(_))));
}

#[tokio::test]
async fn test_bind_rejects_zero_capacity() {
    let config = ServerConfig {
        max_connections: 0,
        ..test_config()
    };
    let result = SseListener::bind(&config, ShutdownCoordinator::new()).await;
    assert!(matches!(result, Err(DaemonError::Config(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_path_returns_404() {
    let (addr, _shutdown) = start_server(test_config(), SessionOptions::default()).await;
    let mut client = request(addr, "GET /nope HTTP/1.1").await;

    let response = read_until(&mut client, "\n\n\n").await;
    assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"), "got: {:?}", response);
    assert!(response.contains("No event stream at /nope"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_non_get_returns_405() {
    let (addr, _shutdown) = start_server(test_config(), SessionOptions::default()).await;
    let mut client = request(addr, "POST /events HTTP/1.1").await;

    let response = read_until(&mut client, "not supported").await;
    assert!(response.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"), "got: {:?}", response);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_malformed_request_returns_400() {
    let (addr, _shutdown) = start_server(test_config(), SessionOptions::default()).await;
    let mut client = request(addr, "HELLO").await;

    let response = read_until(&mut client, "Malformed").await;
    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "got: {:?}", response);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_sends_final_event_and_closes() {
    let (addr, shutdown) = start_server(test_config(), SessionOptions::default()).await;
    let mut client = request(addr, "GET /events HTTP/1.1").await;

    read_until(&mut client, "event: heartbeat\n").await;
    shutdown.shutdown();

    let mut rest = Vec::new();
    tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut rest))
        .await
        .expect("stream should close after shutdown")
        .unwrap();
    let rest = String::from_utf8_lossy(&rest);
    assert!(rest.contains("event: shutdown\n"), "got: {:?}", rest);
    assert!(
        rest.contains("data: {\"reason\":\"server shutting down\"}\n\n"),
        "got: {:?}",
        rest
    );

    tokio::time::timeout(Duration::from_secs(2), shutdown.wait_for_drain())
        .await
        .expect("connections should drain");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_client_disconnect_releases_connection() {
    let (addr, shutdown) = start_server(test_config(), SessionOptions::default()).await;
    let mut client = request(addr, "GET /events HTTP/1.1").await;
    read_until(&mut client, "event: heartbeat\n").await;
    assert_eq!(shutdown.active_connections(), 1);

    drop(client);

    tokio::time::timeout(Duration::from_secs(2), shutdown.wait_for_drain())
        .await
        .expect("connection should be released after the client leaves");
}
