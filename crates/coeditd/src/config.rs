//! Daemon settings: TOML file defaults overridden by CLI flags / env

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use coedit_transport::ServiceConfig;

/// Optional configuration file
///
/// ```toml
/// [server]
/// bind = "0.0.0.0"
/// ws_port = 4444
/// metrics_port = 9464
///
/// [storage]
/// db = "/var/lib/coedit/coedit.db"
///
/// [sync]
/// save_debounce_ms = 3000
/// outbound_buffer = 256
/// final_flush_attempts = 3
/// final_flush_backoff_ms = 200
///
/// [log]
/// level = "info"
/// ```
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub server: ServerSection,
    pub storage: StorageSection,
    pub sync: SyncSection,
    pub log: LogSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    pub bind: Option<String>,
    pub ws_port: Option<u16>,
    pub metrics_port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageSection {
    pub db: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncSection {
    pub save_debounce_ms: Option<u64>,
    pub outbound_buffer: Option<usize>,
    pub final_flush_attempts: Option<u32>,
    pub final_flush_backoff_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogSection {
    pub level: Option<String>,
}

impl FileConfig {
    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).context("invalid configuration file")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("in {}", path.display()))
    }
}

/// Values given on the command line (or via environment)
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub bind: Option<String>,
    pub ws_port: Option<u16>,
    pub metrics_port: Option<u16>,
    pub db: Option<PathBuf>,
    pub debounce_ms: Option<u64>,
    pub log_level: Option<String>,
}

/// Fully resolved daemon settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub ws_addr: SocketAddr,
    /// `None` disables the metrics endpoint
    pub metrics_addr: Option<SocketAddr>,
    pub db: Option<PathBuf>,
    pub log_level: String,
    pub service: ServiceConfig,
}

pub const DEFAULT_BIND: &str = "0.0.0.0";
pub const DEFAULT_WS_PORT: u16 = 4444;
pub const DEFAULT_METRICS_PORT: u16 = 9464;

impl Settings {
    /// Merge CLI overrides over file values over built-in defaults. A metrics
    /// port of 0 disables the endpoint.
    pub fn resolve(file: FileConfig, cli: Overrides) -> Result<Self> {
        let bind = cli
            .bind
            .or(file.server.bind)
            .unwrap_or_else(|| DEFAULT_BIND.to_string());
        let ws_port = cli.ws_port.or(file.server.ws_port).unwrap_or(DEFAULT_WS_PORT);
        let metrics_port = cli
            .metrics_port
            .or(file.server.metrics_port)
            .unwrap_or(DEFAULT_METRICS_PORT);

        let ip: IpAddr = bind
            .parse()
            .with_context(|| format!("invalid bind address {:?}", bind))?;
        let ws_addr = SocketAddr::new(ip, ws_port);
        let metrics_addr = if metrics_port == 0 {
            None
        } else {
            Some(SocketAddr::new(ip, metrics_port))
        };

        let defaults = ServiceConfig::default();
        let service = ServiceConfig {
            save_debounce: cli
                .debounce_ms
                .or(file.sync.save_debounce_ms)
                .map_or(defaults.save_debounce, Duration::from_millis),
            outbound_buffer: file
                .sync
                .outbound_buffer
                .unwrap_or(defaults.outbound_buffer)
                .max(1),
            final_flush_attempts: file
                .sync
                .final_flush_attempts
                .unwrap_or(defaults.final_flush_attempts)
                .max(1),
            final_flush_backoff: file
                .sync
                .final_flush_backoff_ms
                .map_or(defaults.final_flush_backoff, Duration::from_millis),
        };

        Ok(Self {
            ws_addr,
            metrics_addr,
            db: cli.db.or(file.storage.db),
            log_level: cli
                .log_level
                .or(file.log.level)
                .unwrap_or_else(|| "info".to_string()),
            service,
        })
    }
}
