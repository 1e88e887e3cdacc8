use bytes::Bytes;
use rsm_core::{Payload, TransportConfig, TransportType};
use rsm_integration_tests::common::{ephemeral_address, random_bytes, wait_for, TestClient, TestServer};
use rsm_transport::{ConnectionState, FnHandler, MultiTransportServer, RSocketClient, SessionContext};
use std::sync::Arc;
use std::time::Duration;

async fn echo_roundtrip(kind: TransportType) -> anyhow::Result<()> {
    rsm_core::logging::init_test_logging();

    let server = TestServer::start(kind).await?;
    let client = TestClient::connect(&server).await?;

    let test_messages = vec![
        Payload::from_text("Hello, World!", Some("metadata")),
        Payload::from_text("Test message 2", None),
        Payload::new(Some(Bytes::from(vec![0u8; 1024])), None), // 1KB binary
        Payload::new(Some(random_bytes(10 * 1024)), Some(Bytes::from_static(b"\x00\xff"))),
        Payload::new(None, Some(Bytes::from_static(b"metadata only"))),
    ];

    for payload in test_messages {
        let reply = client.request(payload.clone()).await?;
        assert_eq!(reply, payload, "{} echo mismatch", kind);
    }

    let metrics = client.metrics();
    assert_eq!(metrics.request_count(), 5);
    assert_eq!(metrics.response_count(), 5);
    assert_eq!(metrics.error_count(), 0);
    assert!(metrics.bytes_sent() > 11 * 1024);
    assert_eq!(metrics.bytes_sent(), metrics.bytes_received());

    client.close().await?;
    server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_tcp_end_to_end() -> anyhow::Result<()> {
    echo_roundtrip(TransportType::Tcp).await
}

#[tokio::test]
async fn test_websocket_end_to_end() -> anyhow::Result<()> {
    echo_roundtrip(TransportType::WebSocket).await
}

#[tokio::test]
async fn test_quic_end_to_end() -> anyhow::Result<()> {
    echo_roundtrip(TransportType::Quic).await
}

#[tokio::test]
async fn test_overlay_end_to_end() -> anyhow::Result<()> {
    echo_roundtrip(TransportType::Overlay).await
}

#[tokio::test]
async fn test_custom_handler_sees_session() -> anyhow::Result<()> {
    let handler = FnHandler::new(|session: &SessionContext, request: Payload| {
        let text = request.data_utf8()?.unwrap_or_default().to_uppercase();
        let meta = format!("session-{}", session.id());
        Ok(Some(Payload::from_text(&text, Some(&meta))))
    });
    let server = TestServer::with_handler(TransportType::Tcp, Arc::new(handler)).await?;
    let client = TestClient::connect(&server).await?;

    let reply = client.request(Payload::from_text("shout", None)).await?;
    assert_eq!(reply.data_utf8()?, Some("SHOUT"));
    assert_eq!(reply.metadata_utf8()?, Some("session-1"));

    let sessions = server.inner().sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].state, ConnectionState::Connected);

    server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_fire_and_forget_is_handled() -> anyhow::Result<()> {
    let server = TestServer::start(TransportType::Overlay).await?;
    let client = TestClient::connect(&server).await?;
    let raw = client.inner();

    raw.fire_and_forget(Payload::from_text("one-way", None)).await?;

    let server_metrics = server.metrics();
    assert!(
        wait_for(|| server_metrics.response_count() == 1, Duration::from_secs(5)).await,
        "server never handled the one-way request"
    );

    // the echo is still delivered and pairs with the pending send
    let echoed = raw.receive().await?;
    assert_eq!(echoed.data_utf8()?, Some("one-way"));
    assert_eq!(raw.metrics().response_count(), 1);

    server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_many_sequential_requests() -> anyhow::Result<()> {
    let server = TestServer::start(TransportType::Tcp).await?;
    let client = TestClient::connect(&server).await?;

    for i in 0..200 {
        let text = format!("request {}", i);
        assert_eq!(client.request_text(&text).await?, text);
    }

    let summary = client.metrics().summary();
    assert_eq!(summary.request_count, 200);
    assert_eq!(summary.response_count, 200);
    assert!(summary.max_latency_ms >= summary.min_latency_ms);

    server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_multi_transport_echo_server() -> anyhow::Result<()> {
    let server = MultiTransportServer::new()
        .add_transport("tcp", TransportConfig::tcp(ephemeral_address(TransportType::Tcp))?)?
        .add_transport("overlay", TransportConfig::overlay(ephemeral_address(TransportType::Overlay))?)?;
    server.start().await?;

    for name in server.transports() {
        let address = server
            .local_address(name)
            .ok_or_else(|| anyhow::anyhow!("{} has no address", name))?;
        let kind = server
            .server(name)
            .map(|inner| inner.transport_type())
            .ok_or_else(|| anyhow::anyhow!("{} missing", name))?;

        let client = RSocketClient::new(TransportConfig::new(kind, address, None)?)?;
        client.connect().await?;
        let reply = client
            .request_response(Payload::from_text(name, Some("multi")))
            .await?;
        assert_eq!(reply.data_utf8()?, Some(name));
        client.close().await?;
    }

    let metrics = server.metrics();
    assert_eq!(metrics.request_count(), 2);
    assert!(wait_for(|| metrics.response_count() == 2, Duration::from_secs(5)).await);

    server.stop().await?;
    assert!(!server.is_running());
    Ok(())
}
