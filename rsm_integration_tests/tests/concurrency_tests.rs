use rsm_core::config::{websocket_authority, TuningOptions};
use rsm_core::{Payload, PerformanceMetrics, RsmError, TransportConfig, TransportType};
use rsm_integration_tests::common::{ephemeral_address, wait_for, TestClient, TestServer};
use rsm_transport::overlay::{self, OverlayListener};
use rsm_transport::{ConnectionState, RSocketClient, RSocketServer};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

#[tokio::test]
async fn test_concurrent_connect_reports_already_connecting() -> anyhow::Result<()> {
    rsm_core::logging::init_test_logging();

    // A listener that never accepts; once its backlog is full dialers block
    let peer = ephemeral_address(TransportType::Overlay);
    let tuning = TuningOptions::default();
    let _listener = OverlayListener::bind(&peer, &tuning)?;
    let mut backlog = Vec::new();
    for _ in 0..128 {
        backlog.push(overlay::connect(&peer, &tuning).await?);
    }

    let client = Arc::new(RSocketClient::new(TransportConfig::overlay(peer.as_str())?)?);
    let first = {
        let client = client.clone();
        tokio::spawn(async move { client.connect().await })
    };

    assert!(
        wait_for(|| client.state() == ConnectionState::Connecting, Duration::from_secs(5)).await,
        "first connect never started"
    );
    assert!(matches!(client.connect().await, Err(RsmError::AlreadyConnecting)));

    // close cancels the blocked attempt
    client.close().await?;
    let first = timeout(Duration::from_secs(5), first).await??;
    assert!(matches!(first, Err(RsmError::NotConnected)));
    assert_eq!(client.state(), ConnectionState::Closed);

    Ok(())
}

#[tokio::test]
async fn test_racing_connects_open_one_transport() -> anyhow::Result<()> {
    let server = TestServer::start(TransportType::Tcp).await?;
    let client = Arc::new(RSocketClient::new(server.client_config()?)?);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let client = client.clone();
        handles.push(tokio::spawn(async move { client.connect().await }));
    }

    let mut ok = 0;
    for handle in handles {
        match handle.await? {
            Ok(()) => ok += 1,
            Err(RsmError::AlreadyConnecting) => {}
            Err(e) => anyhow::bail!("unexpected connect error: {}", e),
        }
    }
    assert!(ok >= 1);
    assert!(client.is_connected());

    assert!(wait_for(|| server.session_count() == 1, Duration::from_secs(5)).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.session_count(), 1);

    server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_shared_client_serializes_requests() -> anyhow::Result<()> {
    let server = TestServer::start(TransportType::Tcp).await?;
    let client = TestClient::connect(&server).await?;
    let raw = client.inner();

    let mut handles = Vec::new();
    for task in 0..20 {
        let raw = raw.clone();
        handles.push(tokio::spawn(async move {
            for i in 0..10 {
                let text = format!("task {} request {}", task, i);
                let reply = raw.request_response(Payload::from_text(&text, None)).await?;
                assert_eq!(reply.data_utf8()?, Some(text.as_str()));
            }
            Ok::<_, RsmError>(())
        }));
    }
    for handle in handles {
        handle.await??;
    }

    let metrics = raw.metrics();
    assert_eq!(metrics.request_count(), 200);
    assert_eq!(metrics.response_count(), 200);
    assert_eq!(metrics.latencies().len(), 200);

    server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_many_clients_share_metrics() -> anyhow::Result<()> {
    let server = TestServer::start(TransportType::Overlay).await?;
    let shared = PerformanceMetrics::shared();

    let mut handles = Vec::new();
    for id in 0..10 {
        let client = RSocketClient::with_metrics(server.client_config()?, shared.clone())?;
        handles.push(tokio::spawn(async move {
            client.connect().await?;
            for i in 0..10 {
                let text = format!("client {} message {}", id, i);
                let reply = client.request_response(Payload::from_text(&text, None)).await?;
                assert_eq!(reply.data_utf8()?, Some(text.as_str()));
            }
            client.close().await
        }));
    }
    for handle in handles {
        handle.await??;
    }

    assert_eq!(shared.request_count(), 100);
    assert_eq!(shared.response_count(), 100);
    assert_eq!(shared.error_count(), 0);

    let server_metrics = server.metrics();
    assert!(wait_for(|| server_metrics.response_count() == 100, Duration::from_secs(5)).await);

    server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_session_limit_queues_extra_peers() -> anyhow::Result<()> {
    let config = TransportConfig::tcp("127.0.0.1:0")?;
    let server = TestServer::from_server(RSocketServer::new(config)?.with_max_sessions(1)).await?;

    let first = TestClient::connect(&server).await?;
    assert_eq!(first.request_text("first").await?, "first");

    // The second peer connects but is not serviced while the first is live
    let second = TestClient::connect(&server).await?;
    let raw = second.inner();
    let stalled = timeout(
        Duration::from_millis(300),
        raw.request_response(Payload::from_text("second", None)),
    )
    .await;
    assert!(stalled.is_err(), "second session was serviced over the limit");
    assert_eq!(server.session_count(), 1);

    first.close().await?;

    // the queued request is served once the slot frees up
    let reply = timeout(Duration::from_secs(5), raw.receive()).await??;
    assert_eq!(reply.data_utf8()?, Some("second"));

    server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_per_session_metrics_are_isolated() -> anyhow::Result<()> {
    let config = TransportConfig::tcp("127.0.0.1:0")?;
    let server =
        TestServer::from_server(RSocketServer::new(config)?.with_per_session_metrics(true)).await?;

    let a = TestClient::connect(&server).await?;
    let b = TestClient::connect(&server).await?;
    for _ in 0..3 {
        a.request_text("from a").await?;
    }
    b.request_text("from b").await?;

    let mut counts: Vec<u64> = server
        .inner()
        .sessions()
        .iter()
        .filter_map(|info| server.inner().session(info.id))
        .map(|session| session.metrics().request_count())
        .collect();
    counts.sort();
    assert_eq!(counts, vec![1, 3]);
    assert_eq!(server.metrics().request_count(), 0);

    server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_idle_websocket_peer_does_not_block_clients() -> anyhow::Result<()> {
    let server = TestServer::start(TransportType::WebSocket).await?;
    let authority = websocket_authority(server.address())
        .ok_or_else(|| anyhow::anyhow!("no authority in {}", server.address()))?
        .to_string();

    // Opens the socket but never sends the upgrade request
    let _idle = tokio::net::TcpStream::connect(&authority).await?;
    let _idle_too = tokio::net::TcpStream::connect(&authority).await?;

    let roundtrip = async {
        let client = TestClient::connect(&server).await?;
        let reply = client.request_text("hi").await?;
        client.close().await?;
        anyhow::Ok(reply)
    };
    let reply = timeout(Duration::from_secs(3), roundtrip).await??;
    assert_eq!(reply, "hi");

    server.stop().await?;
    Ok(())
}
