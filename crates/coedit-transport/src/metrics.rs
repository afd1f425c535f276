//! Prometheus metrics for coedit
//!
//! Counters and gauges for connections, rooms, replica traffic and
//! persistence. Exposed in Prometheus text format via HTTP.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{error, info};

/// coedit metrics collector
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    // Connection metrics
    pub connections_total: IntCounter,
    pub connections_active: IntGauge,
    pub slow_consumer_kicks: IntCounter,

    // Room and replica metrics
    pub rooms_active: IntGauge,
    pub replicas_loaded: IntGauge,

    // Sync metrics
    pub updates_applied: IntCounter,
    pub updates_redundant: IntCounter,
    pub messages_dropped: IntCounterVec,
    pub broadcasts: IntCounter,
    pub awareness_updates: IntCounter,

    // Data metrics
    pub bytes_received: IntCounter,
    pub bytes_sent: IntCounter,

    // Persistence metrics
    pub saves_total: IntCounterVec,
    pub save_failures: IntCounterVec,
    pub save_duration_seconds: Histogram,
}

impl Metrics {
    /// Create a new metrics collector with its own registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let connections_total =
            IntCounter::new("coedit_connections_total", "Total number of connections")?;
        let connections_active =
            IntGauge::new("coedit_connections_active", "Number of active connections")?;
        let slow_consumer_kicks = IntCounter::new(
            "coedit_slow_consumer_kicks_total",
            "Connections dropped because their outbound queue was full",
        )?;

        let rooms_active = IntGauge::new("coedit_rooms_active", "Number of open rooms")?;
        let replicas_loaded =
            IntGauge::new("coedit_replicas_loaded", "Number of replicas held in memory")?;

        let updates_applied = IntCounter::new(
            "coedit_updates_applied_total",
            "Updates that changed a replica",
        )?;
        let updates_redundant = IntCounter::new(
            "coedit_updates_redundant_total",
            "Updates that were already integrated",
        )?;
        let messages_dropped = IntCounterVec::new(
            Opts::new("coedit_messages_dropped_total", "Inbound messages dropped"),
            &["channel", "reason"],
        )?;
        let broadcasts = IntCounter::new(
            "coedit_broadcasts_total",
            "Messages fanned out to room members",
        )?;
        let awareness_updates = IntCounter::new(
            "coedit_awareness_updates_total",
            "Accepted awareness updates",
        )?;

        let bytes_received =
            IntCounter::new("coedit_bytes_received_total", "Total bytes received from clients")?;
        let bytes_sent = IntCounter::new("coedit_bytes_sent_total", "Total bytes sent to clients")?;

        let saves_total = IntCounterVec::new(
            Opts::new("coedit_saves_total", "Successful document saves"),
            &["kind"],
        )?;
        let save_failures = IntCounterVec::new(
            Opts::new("coedit_save_failures_total", "Failed document saves"),
            &["kind"],
        )?;
        let save_duration_seconds = Histogram::with_opts(
            HistogramOpts::new("coedit_save_duration_seconds", "Document save duration")
                .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;

        registry.register(Box::new(connections_total.clone()))?;
        registry.register(Box::new(connections_active.clone()))?;
        registry.register(Box::new(slow_consumer_kicks.clone()))?;
        registry.register(Box::new(rooms_active.clone()))?;
        registry.register(Box::new(replicas_loaded.clone()))?;
        registry.register(Box::new(updates_applied.clone()))?;
        registry.register(Box::new(updates_redundant.clone()))?;
        registry.register(Box::new(messages_dropped.clone()))?;
        registry.register(Box::new(broadcasts.clone()))?;
        registry.register(Box::new(awareness_updates.clone()))?;
        registry.register(Box::new(bytes_received.clone()))?;
        registry.register(Box::new(bytes_sent.clone()))?;
        registry.register(Box::new(saves_total.clone()))?;
        registry.register(Box::new(save_failures.clone()))?;
        registry.register(Box::new(save_duration_seconds.clone()))?;

        Ok(Self {
            registry,
            connections_total,
            connections_active,
            slow_consumer_kicks,
            rooms_active,
            replicas_loaded,
            updates_applied,
            updates_redundant,
            messages_dropped,
            broadcasts,
            awareness_updates,
            bytes_received,
            bytes_sent,
            saves_total,
            save_failures,
            save_duration_seconds,
        })
    }

    /// Record a new connection
    pub fn record_connection(&self) {
        self.connections_total.inc();
        self.connections_active.inc();
    }

    /// Record a connection closed
    pub fn record_disconnection(&self) {
        self.connections_active.dec();
    }

    /// Record an inbound message that was dropped
    pub fn record_drop(&self, channel: &str, reason: &str) {
        self.messages_dropped.with_label_values(&[channel, reason]).inc();
    }

    /// Record the outcome of a save
    pub fn record_save(&self, kind: &str, ok: bool, duration_secs: f64) {
        if ok {
            self.saves_total.with_label_values(&[kind]).inc();
        } else {
            self.save_failures.with_label_values(&[kind]).inc();
        }
        self.save_duration_seconds.observe(duration_secs);
    }

    /// Export metrics in Prometheus text format
    pub fn export(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            error!(error = %e, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

/// HTTP server for metrics endpoint
pub struct MetricsServer {
    metrics: Arc<Metrics>,
    addr: SocketAddr,
}

impl MetricsServer {
    pub fn new(metrics: Arc<Metrics>, addr: SocketAddr) -> Self {
        Self { metrics, addr }
    }

    /// Run the metrics HTTP server
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "Metrics server listening on http://{}/metrics", self.addr);

        loop {
            match listener.accept().await {
                Ok((mut stream, _)) => {
                    let metrics = self.metrics.clone();

                    tokio::spawn(async move {
                        let mut buf = [0u8; 1024];
                        if let Ok(n) = stream.read(&mut buf).await {
                            if n > 0 {
                                let request = String::from_utf8_lossy(&buf[..n]);
                                let response = respond(&request, &metrics);
                                let _ = stream.write_all(response.as_bytes()).await;
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept metrics connection");
                }
            }
        }
    }
}

fn respond(request: &str, metrics: &Metrics) -> String {
    if request.starts_with("GET /metrics") || request.starts_with("GET / ") {
        let body = metrics.export();
        format!(
            "HTTP/1.1 200 OK\r\n\
             Content-Type: text/plain; version=0.0.4; charset=utf-8\r\n\
             Content-Length: {}\r\n\
             \r\n\
             {}",
            body.len(),
            body
        )
    } else if request.starts_with("GET /health") {
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: 2\r\n\
         \r\n\
         OK"
            .to_string()
    } else {
        "HTTP/1.1 404 Not Found\r\n\
         Content-Length: 0\r\n\
         \r\n"
            .to_string()
    }
}
