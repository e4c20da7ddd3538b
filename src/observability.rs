use std::net::SocketAddr;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingConfig};

// ── Request-driven metrics ──────────────────────────────────────

/// Counter: reservation requests by outcome. Labels: outcome (confirmed, pending, rejected, failed).
pub const RESERVATIONS_TOTAL: &str = "arbiter_reservations_total";

/// Counter: pairwise arbitration decisions. Labels: winner (new, existing).
pub const ARBITRATIONS_TOTAL: &str = "arbiter_arbitrations_total";

/// Counter: confirmation workflow runs. Labels: decision (accepted, contested).
pub const CONFIRMATIONS_TOTAL: &str = "arbiter_confirmations_total";

// ── Oracle metrics ──────────────────────────────────────────────

/// Counter: oracle calls attempted. Labels: call.
pub const ORACLE_CALLS_TOTAL: &str = "arbiter_oracle_calls_total";

/// Counter: oracle calls answered by the deterministic fallback. Labels: call.
pub const ORACLE_FALLBACKS_TOTAL: &str = "arbiter_oracle_fallbacks_total";

/// Histogram: oracle call latency in seconds, timeouts included. Labels: call.
pub const ORACLE_DURATION_SECONDS: &str = "arbiter_oracle_duration_seconds";

// ── Storage metrics ─────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "arbiter_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (transactions per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "arbiter_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init_metrics(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Install the global tracing subscriber. `RUST_LOG` wins over the configured level.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format {
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .try_init()?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                .try_init()?;
        }
    }
    Ok(())
}
