//! Raw frame exchange through every connector variant.

use bytes::Bytes;
use rsm_core::config::TuningOptions;
use rsm_core::{RsmError, TransportType};
use rsm_transport::TransportConnector;
use std::time::Duration;
use tokio::time::timeout;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn listen_address(kind: TransportType) -> &'static str {
    match kind {
        TransportType::Tcp | TransportType::Quic => "127.0.0.1:0",
        TransportType::WebSocket => "ws://127.0.0.1:0/frames",
        TransportType::Overlay => "iroh://connector-matrix",
    }
}

async fn exchange(kind: TransportType) -> anyhow::Result<()> {
    let tuning = TuningOptions::default();
    let connector = TransportConnector::for_kind(kind);

    let listener = connector.open_server(listen_address(kind), &tuning).await?;
    let address = listener.local_addr();

    // WebSocket and QUIC handshakes need the accepting side running
    let (client, server) = timeout(Duration::from_secs(5), async {
        tokio::join!(
            connector.open_client(&address, &tuning),
            connector.accept(listener.as_ref())
        )
    })
    .await?;
    let (client, server) = (client?, server?);

    // QUIC only announces the stream with its first frame
    client.send(Bytes::from_static(b"first")).await?;
    assert_eq!(server.receive().await?.as_ref(), b"first");

    server.send(Bytes::from_static(b"reply")).await?;
    assert_eq!(client.receive().await?.as_ref(), b"reply");

    client.close().await?;
    let after_close = timeout(Duration::from_secs(5), server.receive()).await?;
    assert!(after_close.is_err(), "{} delivered a frame after close", kind);

    listener.close().await;
    assert!(matches!(
        timeout(Duration::from_secs(5), listener.accept()).await?.err(),
        Some(RsmError::ListenerClosed)
    ));
    Ok(())
}

#[tokio::test]
async fn test_all_connectors_exchange_frames() -> anyhow::Result<()> {
    init_tracing();
    for kind in TransportType::ALL {
        tracing::info!(%kind, "Exchanging frames");
        exchange(kind).await?;
    }
    Ok(())
}

#[tokio::test]
async fn test_wrong_address_form_is_rejected_before_io() {
    let tuning = TuningOptions::default();
    for (kind, address) in [
        (TransportType::Tcp, "ws://127.0.0.1:1/x"),
        (TransportType::WebSocket, "127.0.0.1:1"),
        (TransportType::Quic, "localhost"),
        (TransportType::Overlay, "127.0.0.1:1"),
    ] {
        let connector = TransportConnector::for_kind(kind);
        assert!(matches!(
            connector.open_client(address, &tuning).await.err(),
            Some(RsmError::InvalidAddress { .. })
        ));
        assert!(matches!(
            connector.open_server(address, &tuning).await.err(),
            Some(RsmError::InvalidAddress { .. })
        ));
    }
}
