//! # microproto
//!
//! MicroProto device binary: loads settings, registers the property table
//! and serves it over WebSocket.

#![deny(unsafe_code)]

mod demo;
mod settings;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use microproto_core::Value;
use microproto_engine::{EngineHandle, PropertyRegistry, UpdateEngine};
use microproto_store::{Database, PropertyValueRepo};
use microproto_telemetry::TelemetryConfig;
use tracing::Level;

/// MicroProto property-sync server.
#[derive(Parser, Debug)]
#[command(name = "microproto", about = "MicroProto property-sync server")]
struct Cli {
    /// Port to bind (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Host to bind.
    #[arg(long)]
    host: Option<String>,

    /// JSON settings file, deep-merged over defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to the `SQLite` database for persistent properties.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Do not load or save persistent property values.
    #[arg(long)]
    no_persist: bool,

    /// Erase every stored property value before registering properties.
    #[arg(long, conflicts_with = "no_persist")]
    reset_store: bool,

    /// Log JSON lines instead of human-readable output.
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    fn apply(&self, settings: &mut settings::Settings) {
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(host) = &self.host {
            settings.server.host = host.clone();
        }
        if let Some(db) = &self.db {
            settings.storage.db_path = db.clone();
        }
        if self.no_persist {
            settings.storage.persist = false;
        }
        if self.log_json {
            settings.logging.json = true;
        }
    }
}

fn telemetry_config(logging: &settings::LoggingSettings) -> TelemetryConfig {
    let parse = |s: &str| s.parse::<Level>().ok();
    TelemetryConfig {
        log_level: parse(&logging.level).unwrap_or(Level::INFO),
        module_levels: logging
            .modules
            .iter()
            .filter_map(|(module, level)| Some((module.clone(), parse(level)?)))
            .collect(),
        json: logging.json,
        ..TelemetryConfig::default()
    }
}

fn ensure_parent_dir(path: &std::path::Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

fn open_registry(storage: &settings::StorageSettings, reset: bool) -> Result<PropertyRegistry> {
    if !storage.persist {
        tracing::info!("persistence disabled");
        return Ok(PropertyRegistry::new());
    }
    ensure_parent_dir(&storage.db_path)?;
    let db = Database::open(&storage.db_path)
        .with_context(|| format!("Failed to open database {}", storage.db_path.display()))?;
    tracing::info!(path = %storage.db_path.display(), "database opened");
    let repo = PropertyValueRepo::new(db);
    if reset {
        let erased = repo.erase_all().context("Failed to reset stored values")?;
        tracing::info!(erased, "stored property values erased");
    }
    Ok(PropertyRegistry::with_store(repo))
}

/// Publish seconds since start on the read-only uptime property.
fn spawn_uptime(engine: EngineHandle) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let started = Instant::now();
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            let secs = i32::try_from(started.elapsed().as_secs()).unwrap_or(i32::MAX);
            if let Err(e) = engine.set(demo::UPTIME, Value::Int32(secs)).await {
                tracing::debug!(error = %e, "uptime update stopped");
                break;
            }
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = settings::load_settings(cli.config.as_deref())?;
    cli.apply(&mut settings);

    let telemetry = microproto_telemetry::init_telemetry(telemetry_config(&settings.logging));
    tracing::info!("starting MicroProto server");

    let mut registry = open_registry(&settings.storage, cli.reset_store)?;
    demo::register_properties(&mut registry).context("Failed to register properties")?;

    let mut engine = UpdateEngine::new(registry, settings.engine.to_config());
    if let Some(metrics) = telemetry.metrics() {
        engine = engine.with_metrics(metrics);
    }
    let (engine, engine_task) = microproto_engine::spawn(engine);

    let server = microproto_server::start(settings.server.clone(), engine.clone(), telemetry.metrics())
        .await
        .context("Failed to start server")?;
    tracing::info!(port = server.port, path = %settings.server.path, "MicroProto server ready");

    let uptime = spawn_uptime(engine.clone());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    uptime.abort();
    server.shutdown();
    drop(engine);
    let _ = tokio::time::timeout(Duration::from_secs(2), engine_task).await;
    Ok(())
}
