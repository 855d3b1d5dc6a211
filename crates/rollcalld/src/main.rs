use anyhow::{Context, Result};
use rollcall_store::{FaceStore, SqliteStore};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod attendance;
mod config;
mod dbus_interface;
mod engine;
mod enrollment;
mod error;
mod ingest;
mod pdf;
mod registrar;
mod service;
#[cfg(test)]
mod testing;

use config::{BusKind, Config};
use dbus_interface::{RollcallService, BUS_NAME, OBJECT_PATH};
use service::ServiceContext;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "rollcalld starting");

    let config = Config::load().context("loading configuration")?;

    let store = SqliteStore::open(&config.db_path)
        .with_context(|| format!("opening {}", config.db_path.display()))?;
    let created = store.migrate_groups()?;
    tracing::info!(
        db = %config.db_path.display(),
        identities = store.identity_count()?,
        groups_created = created,
        "store ready"
    );

    let engine = engine::spawn_engine(&config).context("loading models")?;

    let shutdown = CancellationToken::new();
    let bus = config.bus;
    let ctx = ServiceContext::new(config, engine, Arc::new(store), shutdown.clone())
        .context("building registrar client")?;

    let builder = match bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, RollcallService::new(Arc::new(ctx)))?
        .build()
        .await?;

    tracing::info!(bus = ?bus, name = BUS_NAME, path = OBJECT_PATH, "rollcalld ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");
    shutdown.cancel();

    Ok(())
}
