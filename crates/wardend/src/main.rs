//! wardend: per-app network policy daemon
//!
//! Wires the pipeline together - policy engine, threat scanner, DNS and
//! flow interceptors, traffic lobby, connection logger - then runs the
//! expiry sweep until shutdown. Packet capture is platform plumbing
//! that lives outside this binary; collaborators drive the interceptor
//! through its API.

mod config;

use anyhow::{Context, Result};
use config::WardenConfig;
use std::fs::File;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use warden_intercept::{DnsInterceptor, FlowInterceptor};
use warden_lobby::{Classifier, TrafficLobby, no_beacon_check};
use warden_log::ConnectionLogger;
use warden_policy::PolicyEngine;
use warden_threat::{ThreatScanner, load_feed};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .compact()
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => {
            info!("Loading configuration from {}", path);
            WardenConfig::load(&path).with_context(|| format!("loading config {}", path))?
        }
        None => {
            info!("No config file given, using defaults");
            WardenConfig::default()
        }
    };

    info!("wardend starting...");

    // Connection logger, with replay of whatever survived last run
    let logger = Arc::new(
        ConnectionLogger::open(&config.log_path, config.log_ring_capacity)
            .with_context(|| format!("opening log {}", config.log_path.display()))?,
    );
    match File::open(&config.log_path) {
        Ok(file) => {
            logger.replay(file).context("replaying connection log")?;
        }
        Err(e) => warn!("No previous connection log to replay: {}", e),
    }

    // Threat scanner; an empty database is available, an unloaded one
    // fails classification toward LOBBY
    let scanner = Arc::new(ThreatScanner::new());
    match &config.threat_feed_path {
        Some(path) => {
            let file =
                File::open(path).with_context(|| format!("opening feed {}", path.display()))?;
            let records = load_feed(file).context("parsing threat feed")?;
            scanner.replace(records);
        }
        None => {
            warn!("No threat feed configured, scanner starts empty");
            scanner.replace(Vec::new());
        }
    }

    // Policy engine with any statically configured policies
    let engine = Arc::new(PolicyEngine::new());
    for policy in &config.policies {
        engine.set_policy(policy.clone());
    }
    info!("{} app policies installed", engine.len());

    // Interception pipeline
    let dns = Arc::new(
        DnsInterceptor::new(config.dns_config()?, Arc::clone(&engine), Arc::clone(&logger))
            .context("initializing DNS interceptor")?,
    );
    let classifier = Classifier::new(
        Arc::clone(&scanner),
        Arc::clone(&logger),
        no_beacon_check(),
        config.lobby_config().upload_threshold_bytes,
    );
    let lobby = Arc::new(TrafficLobby::new(
        classifier,
        Arc::clone(&logger),
        config.lobby_config(),
    ));
    let interceptor = Arc::new(FlowInterceptor::new(
        Arc::clone(&engine),
        Arc::clone(&dns),
        Arc::clone(&lobby),
        Arc::clone(&logger),
    ));

    let sweep = lobby.spawn_sweep();
    spawn_stats_reporter(Arc::clone(&interceptor), Arc::clone(&lobby));

    info!("wardend ready");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown signal received");

    sweep.stop().await;
    logger.shutdown();

    info!("wardend stopped");
    Ok(())
}

/// Periodic one-line health log.
fn spawn_stats_reporter(interceptor: Arc<FlowInterceptor>, lobby: Arc<TrafficLobby>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        ticker.tick().await; // skip the immediate first tick
        loop {
            ticker.tick().await;
            let (total, allowed, blocked, lobbied) = interceptor.stats();
            info!(
                "Flows: {} total ({} allowed, {} blocked, {} lobbied), {} pending",
                total,
                allowed,
                blocked,
                lobbied,
                lobby.pending_len()
            );
        }
    });
}
