//! coedit Daemon (coeditd)
//!
//! Real-time collaborative document sync server.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (WebSocket on 4444, metrics on 9464)
//! coeditd
//!
//! # Custom ports
//! coeditd --ws-port 7001 --metrics-port 7002
//!
//! # With persistence
//! coeditd --db /var/lib/coedit/coedit.db
//!
//! # With configuration file
//! coeditd --config /etc/coedit/coedit.toml
//! ```

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use coedit_storage::{MemoryStorage, SqliteStorage, Storage};
use coedit_transport::{CollabService, Metrics, MetricsServer, WebSocketServer};

use config::{FileConfig, Overrides, Settings};

/// coedit Daemon - real-time collaborative document sync
#[derive(Parser, Debug)]
#[command(name = "coeditd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// WebSocket port to listen on [default: 4444]
    #[arg(long, env = "COEDIT_WS_PORT")]
    ws_port: Option<u16>,

    /// Metrics HTTP port, 0 disables [default: 9464]
    #[arg(long, env = "COEDIT_METRICS_PORT")]
    metrics_port: Option<u16>,

    /// Bind address [default: 0.0.0.0]
    #[arg(long, env = "COEDIT_BIND")]
    bind: Option<String>,

    /// Configuration file path
    #[arg(short, long, env = "COEDIT_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error) [default: info]
    #[arg(long, env = "COEDIT_LOG_LEVEL")]
    log_level: Option<String>,

    /// SQLite database path for persistence (default: in-memory only)
    #[arg(long, env = "COEDIT_DB")]
    db: Option<PathBuf>,

    /// Quiet period before a changed document is saved, in milliseconds [default: 3000]
    #[arg(long, env = "COEDIT_DEBOUNCE_MS")]
    debounce_ms: Option<u64>,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            bind: self.bind.clone(),
            ws_port: self.ws_port,
            metrics_port: self.metrics_port,
            db: self.db.clone(),
            debounce_ms: self.debounce_ms,
            log_level: self.log_level.clone(),
        }
    }
}

fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let file = match &args.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    let settings = Settings::resolve(file, args.overrides())?;

    // Initialize logging
    FmtSubscriber::builder()
        .with_max_level(parse_level(&settings.log_level))
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    print_banner();

    // Initialize SQLite storage if path provided
    let storage: Arc<dyn Storage> = match &settings.db {
        Some(db_path) => {
            info!(path = %db_path.display(), "Initializing SQLite persistence");
            match SqliteStorage::open(db_path) {
                Ok(storage) => {
                    info!("SQLite persistence enabled");
                    Arc::new(storage)
                }
                Err(e) => {
                    warn!(error = %e, "Failed to initialize SQLite, running in-memory only");
                    Arc::new(MemoryStorage::new())
                }
            }
        }
        None => {
            info!("Running in-memory only (no --db specified)");
            Arc::new(MemoryStorage::new())
        }
    };

    let metrics = Arc::new(Metrics::new()?);
    let service = Arc::new(CollabService::new(
        storage,
        settings.service.clone(),
        Arc::clone(&metrics),
    ));

    info!(
        ws_addr = %settings.ws_addr,
        metrics = settings.metrics_addr.is_some(),
        save_debounce_ms = settings.service.save_debounce.as_millis() as u64,
        "Starting coedit daemon"
    );

    let ws_server = WebSocketServer::new(Arc::clone(&service), settings.ws_addr);
    let mut handles = vec![tokio::spawn(async move {
        if let Err(e) = ws_server.run().await {
            tracing::error!(error = %e, "WebSocket server error");
        }
    })];

    if let Some(addr) = settings.metrics_addr {
        let metrics_server = MetricsServer::new(metrics, addr);
        handles.push(tokio::spawn(async move {
            if let Err(e) = metrics_server.run().await {
                tracing::error!(error = %e, "Metrics server error");
            }
        }));
    }

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    for handle in &handles {
        handle.abort();
    }
    service.shutdown().await;
    info!(stats = ?service.stats(), "Shutdown complete");

    Ok(())
}

fn print_banner() {
    println!(
        r#"
  coedit
  Real-time collaborative document sync
  Version {}
"#,
        env!("CARGO_PKG_VERSION")
    );
}
