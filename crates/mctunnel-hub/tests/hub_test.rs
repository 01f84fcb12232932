//! Integration tests for the hub: gRPC tunnel registration and the HTTP
//! gateway, exercised with a scripted in-process agent.

use std::net::SocketAddr;
use std::time::Duration;

use mctunnel_hub::{HubConfig, Server};
use mctunnel_proto::{ControlCode, Packet, TunnelServiceClient};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::metadata::MetadataValue;
use tonic::transport::Endpoint;
use tonic::{Request, Streaming};

const WAIT: Duration = Duration::from_secs(5);

struct TestHub {
    grpc_addr: SocketAddr,
    http_addr: SocketAddr,
    cancel: CancellationToken,
}

impl Drop for TestHub {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn start_hub() -> TestHub {
    let config = HubConfig {
        grpc_listen_addr: "127.0.0.1:0".to_string(),
        http_listen_addr: "127.0.0.1:0".to_string(),
        ..HubConfig::default()
    };

    let server = Server::bind(config).await.expect("failed to bind hub");
    let grpc_addr = server.grpc_addr();
    let http_addr = server.http_addr();

    let cancel = CancellationToken::new();
    let run_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = server.run(run_cancel).await;
    });

    TestHub {
        grpc_addr,
        http_addr,
        cancel,
    }
}

/// A scripted agent speaking the raw packet protocol.
struct FakeAgent {
    tx: mpsc::Sender<Packet>,
    inbound: Streaming<Packet>,
}

impl FakeAgent {
    async fn connect(grpc_addr: SocketAddr, cluster_name: &str) -> Self {
        let channel = Endpoint::from_shared(format!("http://{grpc_addr}"))
            .unwrap()
            .connect()
            .await
            .expect("failed to dial hub");

        let mut client = TunnelServiceClient::new(channel);
        let (tx, rx) = mpsc::channel(64);
        let mut request = Request::new(ReceiverStream::new(rx));
        request.metadata_mut().insert(
            "cluster-name",
            MetadataValue::try_from(cluster_name).unwrap(),
        );

        let inbound = client
            .tunnel(request)
            .await
            .expect("tunnel rpc failed")
            .into_inner();

        Self { tx, inbound }
    }

    async fn recv(&mut self) -> Packet {
        timeout(WAIT, self.inbound.message())
            .await
            .expect("timed out waiting for packet")
            .expect("stream failed")
            .expect("stream ended")
    }

    async fn send(&self, packet: Packet) {
        self.tx.send(packet).await.expect("send failed");
    }
}

async fn http_request(addr: SocketAddr, raw: &[u8]) -> String {
    let mut stream = TcpStream::connect(addr).await.expect("connect failed");
    stream.write_all(raw).await.unwrap();
    read_response(&mut stream).await
}

/// Read one HTTP response, honoring Content-Length. The hub keeps the
/// socket open until the client hangs up, so waiting for EOF would wedge.
async fn read_response(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        let n = timeout(WAIT, stream.read(&mut chunk))
            .await
            .expect("timed out reading response")
            .unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(head_end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..head_end]);
            let content_length = head
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    if name.eq_ignore_ascii_case("content-length") {
                        value.trim().parse::<usize>().ok()
                    } else {
                        None
                    }
                })
                .unwrap_or(0);
            if buf.len() >= head_end + 4 + content_length {
                break;
            }
        }
    }

    String::from_utf8_lossy(&buf).to_string()
}

#[tokio::test]
async fn test_health_endpoint() {
    let hub = start_hub().await;

    let response = http_request(hub.http_addr, b"GET /health HTTP/1.1\r\nHost: hub\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.ends_with("OK"));
}

#[tokio::test]
async fn test_unknown_cluster_returns_503() {
    let hub = start_hub().await;

    let response = http_request(hub.http_addr, b"GET /ghost/x HTTP/1.1\r\nHost: hub\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 503"));
    assert!(response.contains("Cluster ghost not available"));
}

#[tokio::test]
async fn test_unparsable_cluster_returns_400() {
    let hub = start_hub().await;

    let response = http_request(hub.http_addr, b"GET / HTTP/1.1\r\nHost: hub\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 400"));
}

#[tokio::test]
async fn test_missing_cluster_metadata_is_rejected() {
    let hub = start_hub().await;

    let channel = Endpoint::from_shared(format!("http://{}", hub.grpc_addr))
        .unwrap()
        .connect()
        .await
        .unwrap();
    let mut client = TunnelServiceClient::new(channel);

    let (_tx, rx) = mpsc::channel::<Packet>(4);
    let result = client.tunnel(Request::new(ReceiverStream::new(rx))).await;

    let status = result.expect_err("rpc without metadata should fail");
    assert_eq!(status.code(), tonic::Code::InvalidArgument);
}

#[tokio::test]
async fn test_request_roundtrip_through_fake_agent() {
    let hub = start_hub().await;
    let mut agent = FakeAgent::connect(hub.grpc_addr, "cluster-a").await;

    let client = tokio::spawn(http_request(
        hub.http_addr,
        b"GET /cluster-a/hello HTTP/1.1\r\nHost: hub\r\n\r\n",
    ));

    // Open sentinel first: empty payload on a fresh conn_id.
    let sentinel = agent.recv().await;
    assert_eq!(sentinel.conn_id, 1);
    assert_eq!(ControlCode::try_from(sentinel.code), Ok(ControlCode::Data));
    assert!(sentinel.data.is_empty());

    // Then the serialized request, original request line preserved.
    let request = agent.recv().await;
    assert_eq!(request.conn_id, 1);
    let text = String::from_utf8_lossy(&request.data);
    assert!(text.starts_with("GET /cluster-a/hello HTTP/1.1\r\n"));
    assert!(text.contains("Host: hub\r\n"));

    let body = "hi";
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    agent
        .send(Packet::data(request.conn_id, response.into_bytes()))
        .await;

    let response = client.await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.ends_with("hi"));
}

#[tokio::test]
async fn test_agent_error_renders_502() {
    let hub = start_hub().await;
    let mut agent = FakeAgent::connect(hub.grpc_addr, "cluster-a").await;

    let client = tokio::spawn(http_request(
        hub.http_addr,
        b"GET /cluster-a/x HTTP/1.1\r\nHost: hub\r\n\r\n",
    ));

    let sentinel = agent.recv().await;
    let _request = agent.recv().await;
    agent
        .send(Packet::error(sentinel.conn_id, "connection refused"))
        .await;

    let response = client.await.unwrap();
    assert!(response.starts_with("HTTP/1.1 502 Bad Gateway"));
    assert!(response.contains("connection refused"));
}

#[tokio::test]
async fn test_data_for_unknown_conn_is_answered_with_error() {
    let hub = start_hub().await;
    let mut agent = FakeAgent::connect(hub.grpc_addr, "cluster-a").await;

    agent.send(Packet::data(99, b"stray".to_vec())).await;

    let packet = agent.recv().await;
    assert_eq!(packet.conn_id, 99);
    assert_eq!(ControlCode::try_from(packet.code), Ok(ControlCode::Error));
}

#[tokio::test]
async fn test_drain_tears_down_tunnel() {
    let hub = start_hub().await;
    let mut agent = FakeAgent::connect(hub.grpc_addr, "cluster-a").await;

    agent.send(Packet::drain()).await;

    // The hub closes the stream in response to the drain.
    let end = timeout(WAIT, async {
        loop {
            match agent.inbound.message().await {
                Ok(Some(_)) => continue,
                other => break other,
            }
        }
    })
    .await
    .expect("stream did not end after drain");
    assert!(matches!(end, Ok(None) | Err(_)));

    // Subsequent requests find no tunnel.
    let mut last = String::new();
    for _ in 0..50 {
        last = http_request(hub.http_addr, b"GET /cluster-a/x HTTP/1.1\r\nHost: hub\r\n\r\n").await;
        if last.starts_with("HTTP/1.1 503") {
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }
    assert!(last.starts_with("HTTP/1.1 503"));
    assert!(last.contains("Cluster cluster-a not available"));
}

#[tokio::test]
async fn test_second_agent_replaces_first() {
    let hub = start_hub().await;
    let mut first = FakeAgent::connect(hub.grpc_addr, "cluster-a").await;
    let mut second = FakeAgent::connect(hub.grpc_addr, "cluster-a").await;

    // The first agent's stream is terminated by the replacement.
    let end = timeout(WAIT, first.inbound.message())
        .await
        .expect("first agent stream did not terminate");
    assert!(matches!(end, Ok(None) | Err(_)));

    // New requests are served by the second agent.
    let client = tokio::spawn(http_request(
        hub.http_addr,
        b"GET /cluster-a/y HTTP/1.1\r\nHost: hub\r\n\r\n",
    ));

    let sentinel = second.recv().await;
    let _request = second.recv().await;
    second
        .send(Packet::data(
            sentinel.conn_id,
            b"HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n".to_vec(),
        ))
        .await;

    let response = client.await.unwrap();
    assert!(response.starts_with("HTTP/1.1 204"));
}

#[tokio::test]
async fn test_concurrent_conns_get_distinct_ids() {
    let hub = start_hub().await;
    let mut agent = FakeAgent::connect(hub.grpc_addr, "cluster-a").await;

    let first = tokio::spawn(http_request(
        hub.http_addr,
        b"GET /cluster-a/a HTTP/1.1\r\nHost: hub\r\n\r\n",
    ));
    let sentinel_a = agent.recv().await;
    let _req_a = agent.recv().await;

    let second = tokio::spawn(http_request(
        hub.http_addr,
        b"GET /cluster-a/b HTTP/1.1\r\nHost: hub\r\n\r\n",
    ));
    let sentinel_b = agent.recv().await;
    let _req_b = agent.recv().await;

    assert!(sentinel_b.conn_id > sentinel_a.conn_id);

    for (conn_id, task) in [(sentinel_a.conn_id, first), (sentinel_b.conn_id, second)] {
        agent
            .send(Packet::data(
                conn_id,
                b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_vec(),
            ))
            .await;
        let response = task.await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"));
    }
}
