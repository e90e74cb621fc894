//! Prometheus metrics for the micropayment engine.
//!
//! Exposes metrics on /metrics endpoint for Prometheus scraping.

#![allow(dead_code)]

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec, CounterVec,
    Encoder, Gauge, GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;

lazy_static! {
    // Batcher metrics
    pub static ref EVENTS_INGESTED: CounterVec = register_counter_vec!(
        "engine_events_ingested_total",
        "Total number of payment events ingested by the batcher",
        &["direction"]
    ).unwrap();

    pub static ref EVENTS_REJECTED: CounterVec = register_counter_vec!(
        "engine_events_rejected_total",
        "Total number of payment events rejected by the batcher",
        &["reason"]
    ).unwrap();

    pub static ref BATCHES_FLUSHED: CounterVec = register_counter_vec!(
        "engine_batches_flushed_total",
        "Total number of batches flushed",
        &["reason"]
    ).unwrap();

    pub static ref CURRENT_BATCH_SIZE: Gauge = register_gauge!(
        "engine_current_adaptive_batch_size",
        "Current adaptive batch size target"
    ).unwrap();

    pub static ref CURRENT_BATCH_TIMEOUT_MS: Gauge = register_gauge!(
        "engine_current_adaptive_batch_timeout_ms",
        "Current adaptive batch timeout in milliseconds"
    ).unwrap();

    pub static ref BATCH_LATENCY: HistogramVec = register_histogram_vec!(
        "engine_batch_latency_ms",
        "Time from event arrival to batch flush, in milliseconds",
        &["reason"],
        vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0]
    ).unwrap();

    // Channel manager metrics
    pub static ref CHANNELS_OPENED: Gauge = register_gauge!(
        "engine_channels_opened_total",
        "Total number of channels opened"
    ).unwrap();

    pub static ref PAYMENTS_ADMITTED: CounterVec = register_counter_vec!(
        "engine_payments_admitted_total",
        "Total number of payments admitted into a channel",
        &["channel_status"]
    ).unwrap();

    pub static ref PAYMENTS_REJECTED: CounterVec = register_counter_vec!(
        "engine_payments_rejected_total",
        "Total number of payments rejected by the channel manager",
        &["reason"]
    ).unwrap();

    pub static ref SETTLEMENTS: CounterVec = register_counter_vec!(
        "engine_settlements_total",
        "Total number of channel settlement attempts",
        &["status"]
    ).unwrap();

    pub static ref OPEN_CHANNELS: GaugeVec = register_gauge_vec!(
        "engine_open_channels",
        "Number of channels currently in each status",
        &["status"]
    ).unwrap();

    // Dispatcher metrics
    pub static ref BROADCASTS: CounterVec = register_counter_vec!(
        "engine_broadcasts_total",
        "Total number of broadcast attempts",
        &["endpoint", "status"]
    ).unwrap();

    pub static ref BROADCAST_LATENCY: HistogramVec = register_histogram_vec!(
        "engine_broadcast_latency_seconds",
        "Time to complete a broadcast attempt",
        &["endpoint"],
        vec![0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]
    ).unwrap();

    pub static ref CIRCUIT_BREAKER_STATE: GaugeVec = register_gauge_vec!(
        "engine_circuit_breaker_open",
        "Whether the circuit breaker for an endpoint is open (1) or closed (0)",
        &["endpoint"]
    ).unwrap();

    pub static ref DISPATCH_QUEUE_DEPTH: Gauge = register_gauge!(
        "engine_dispatch_queue_depth",
        "Current number of queued broadcasts awaiting dispatch"
    ).unwrap();

    // Health
    pub static ref UP: Gauge = register_gauge!(
        "engine_up",
        "Whether the engine is up and running"
    ).unwrap();
}

/// Maximum concurrent connections to the metrics server.
const METRICS_MAX_CONNECTIONS: usize = 128;

/// Read timeout for incoming connections.
const METRICS_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Start the metrics HTTP server
pub async fn start_metrics_server(addr: SocketAddr) -> eyre::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "Metrics server started");

    UP.set(1.0);

    let semaphore = Arc::new(Semaphore::new(METRICS_MAX_CONNECTIONS));

    loop {
        let (mut socket, _) = listener.accept().await?;
        let sem = semaphore.clone();

        tokio::spawn(async move {
            let _permit = match sem.acquire_owned().await {
                Ok(p) => p,
                Err(_) => return,
            };

            let mut buf = [0u8; 4096];
            let n = match tokio::time::timeout(METRICS_READ_TIMEOUT, socket.read(&mut buf)).await {
                Ok(Ok(n)) if n > 0 => n,
                _ => return,
            };

            let (method, path) = match parse_metrics_request(&buf[..n]) {
                Some(mp) => mp,
                None => {
                    let _ = socket
                        .write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n")
                        .await;
                    return;
                }
            };

            match (method.as_str(), path.as_str()) {
                ("GET", "/metrics") | ("GET", "/") => {
                    let encoder = TextEncoder::new();
                    let metric_families = prometheus::gather();
                    let mut buffer = Vec::new();
                    let _ = encoder.encode(&metric_families, &mut buffer);

                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\n\r\n",
                        buffer.len()
                    );

                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.write_all(&buffer).await;
                }
                ("GET", "/health") => {
                    let response =
                        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\n\r\nOK";
                    let _ = socket.write_all(response.as_bytes()).await;
                }
                _ => {
                    let response = "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n";
                    let _ = socket.write_all(response.as_bytes()).await;
                }
            }
        });
    }
}

/// Parse HTTP method and path from raw request bytes (metrics server).
fn parse_metrics_request(buf: &[u8]) -> Option<(String, String)> {
    let request = std::str::from_utf8(buf).ok()?;
    let first_line = request.lines().next()?;
    let mut parts = first_line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();
    Some((method, path))
}

pub fn record_event_ingested(direction: &str) {
    EVENTS_INGESTED.with_label_values(&[direction]).inc();
}

pub fn record_event_rejected(reason: &str) {
    EVENTS_REJECTED.with_label_values(&[reason]).inc();
}

pub fn record_batch_flushed(reason: &str, latency_ms: f64) {
    BATCHES_FLUSHED.with_label_values(&[reason]).inc();
    BATCH_LATENCY.with_label_values(&[reason]).observe(latency_ms);
}

pub fn set_adaptive_params(batch_size: usize, timeout_ms: u64) {
    CURRENT_BATCH_SIZE.set(batch_size as f64);
    CURRENT_BATCH_TIMEOUT_MS.set(timeout_ms as f64);
}

pub fn record_channel_opened() {
    CHANNELS_OPENED.inc();
}

pub fn record_payment_admitted(channel_status: &str) {
    PAYMENTS_ADMITTED.with_label_values(&[channel_status]).inc();
}

pub fn record_payment_rejected(reason: &str) {
    PAYMENTS_REJECTED.with_label_values(&[reason]).inc();
}

pub fn record_settlement(success: bool) {
    let status = if success { "success" } else { "failure" };
    SETTLEMENTS.with_label_values(&[status]).inc();
}

pub fn set_open_channels(status: &str, count: i64) {
    OPEN_CHANNELS.with_label_values(&[status]).set(count as f64);
}

pub fn record_broadcast(endpoint: &str, success: bool, latency_secs: f64) {
    let status = if success { "success" } else { "failure" };
    BROADCASTS.with_label_values(&[endpoint, status]).inc();
    BROADCAST_LATENCY.with_label_values(&[endpoint]).observe(latency_secs);
}

pub fn set_circuit_breaker_open(endpoint: &str, open: bool) {
    CIRCUIT_BREAKER_STATE
        .with_label_values(&[endpoint])
        .set(if open { 1.0 } else { 0.0 });
}

pub fn set_dispatch_queue_depth(depth: usize) {
    DISPATCH_QUEUE_DEPTH.set(depth as f64);
}
