//! healthd - distributed health-monitoring daemon
//!
//! Resolves target hostnames, probes every address they resolve to on a
//! fixed schedule, and records the results in SQLite.

mod clock;
mod config;
mod db;
mod dns;
mod probe;
mod scheduler;
mod work;

use config::ServerConfig;
use db::Store;
use probe::ProbeSet;
use scheduler::Scheduler;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("healthd=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Using database at {}", cfg.db_path);
    match cfg.nameserver {
        Some(ns) => tracing::info!("Resolving through nameserver {}", ns),
        None => tracing::info!("Resolving through the system resolver"),
    }

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    // Add sample target if none exist
    let targets = store.get_targets()?;
    if targets.is_empty() {
        tracing::info!("Adding sample target: example.com");
        let mut target = db::Target {
            name: "Example".to_string(),
            hostname: "example.com".to_string(),
            probe_type: "tcp".to_string(),
            probe_config: r#"{"port": 443}"#.to_string(),
            probe_interval: 30.0,
            ..Default::default()
        };
        store.add_target(&mut target)?;
    }

    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        cfg.engine.clone(),
        ProbeSet::standard(cfg.nameserver),
    ));
    scheduler.start().await?;

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut hangup = signal(SignalKind::hangup())?;
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            while hangup.recv().await.is_some() {
                tracing::info!("Received SIGHUP, reloading targets");
                if let Err(e) = scheduler.reload() {
                    tracing::error!("Reload failed: {}", e);
                }
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Interrupted, shutting down");
    scheduler.shutdown().await;

    Ok(())
}
