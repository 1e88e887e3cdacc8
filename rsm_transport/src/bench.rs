//! In-process request/response timing over a real transport.

use rsm_core::{Payload, Result, RsmError, TransportConfig, TransportType};
use serde::Serialize;
use std::fmt;
use std::time::Instant;

use crate::client::RSocketClient;
use crate::server::RSocketServer;

/// Payload body used for every benchmark request
pub const BENCHMARK_DATA: &str = "benchmark";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BenchmarkReport {
    pub transport: TransportType,
    pub iterations: usize,
    pub total_ms: f64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    pub ops_per_sec: f64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl fmt::Display for BenchmarkReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- {} benchmark ---", self.transport)?;
        writeln!(f, "  Iterations: {}", self.iterations)?;
        writeln!(f, "  Total: {:.3} ms ({:.0} ops/s)", self.total_ms, self.ops_per_sec)?;
        writeln!(
            f,
            "  Latency: avg {:.3} ms (min {:.3}, max {:.3})",
            self.avg_latency_ms, self.min_latency_ms, self.max_latency_ms
        )?;
        writeln!(f, "  Bytes: {} sent / {} received", self.bytes_sent, self.bytes_received)
    }
}

/// Start an echo server on `address`, run `iterations` request/response
/// round trips against it and report the timings.
///
/// Binding port `0` is supported; the client dials whatever was bound.
pub async fn benchmark_transport_performance(
    kind: TransportType,
    address: &str,
    iterations: usize,
) -> Result<BenchmarkReport> {
    let server = RSocketServer::new(TransportConfig::new(kind, address, None)?)?;
    server.start().await?;

    let result = run_round_trips(&server, kind, iterations).await;
    server.stop().await?;

    let report = result?;
    tracing::info!(
        transport = %kind,
        iterations,
        avg_latency_ms = report.avg_latency_ms,
        ops_per_sec = report.ops_per_sec,
        "Benchmark finished"
    );
    Ok(report)
}

async fn run_round_trips(
    server: &RSocketServer,
    kind: TransportType,
    iterations: usize,
) -> Result<BenchmarkReport> {
    let target = server.local_address().ok_or(RsmError::ListenerClosed)?;
    let client = RSocketClient::new(TransportConfig::new(kind, target, None)?)?;
    client.connect().await?;

    let started = Instant::now();
    let mut outcome = Ok(());
    for _ in 0..iterations {
        if let Err(e) = client
            .request_response(Payload::from_text(BENCHMARK_DATA, None))
            .await
        {
            outcome = Err(e);
            break;
        }
    }
    let total = started.elapsed();
    client.close().await?;
    outcome?;

    let summary = client.metrics().summary();
    let total_ms = total.as_secs_f64() * 1000.0;
    let ops_per_sec = if total_ms > 0.0 {
        iterations as f64 / total.as_secs_f64()
    } else {
        0.0
    };

    Ok(BenchmarkReport {
        transport: kind,
        iterations,
        total_ms,
        avg_latency_ms: summary.average_latency_ms,
        min_latency_ms: summary.min_latency_ms,
        max_latency_ms: summary.max_latency_ms,
        ops_per_sec,
        bytes_sent: summary.bytes_sent,
        bytes_received: summary.bytes_received,
    })
}
