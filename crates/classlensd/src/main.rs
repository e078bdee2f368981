use anyhow::Result;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod events;

use dbus_interface::{AttendanceService, BUS_NAME, OBJECT_PATH};
use events::{AttendanceEvent, EventBus};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "classlensd starting");

    let config = config::Config::from_env();
    std::fs::create_dir_all(&config.data_dir)?;
    std::fs::create_dir_all(config.passports_dir())?;
    tracing::info!(
        db = %config.db_path.display(),
        models = %config.model_dir.display(),
        metric = %config.policy.metric,
        threshold = config.policy.threshold,
        "configuration loaded"
    );

    let events = EventBus::new();
    let (engine, store) = engine::spawn_engine(&config, events.clone())?;

    let service = AttendanceService::new(engine, store, config.policy);
    let connection = zbus::connection::Builder::system()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await?;
    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "classlensd ready");

    let forwarder = tokio::spawn(forward_events(connection.clone(), events.subscribe()));

    tokio::signal::ctrl_c().await?;
    tracing::info!("classlensd shutting down");
    forwarder.abort();

    Ok(())
}

/// Relay attendance events from the feed onto the bus as signals.
async fn forward_events(
    connection: zbus::Connection,
    mut feed: broadcast::Receiver<AttendanceEvent>,
) {
    loop {
        match feed.recv().await {
            Ok(event) => {
                let payload = match serde_json::to_string(&event) {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::warn!(error = %e, "attendance event not serializable");
                        continue;
                    }
                };
                let iface = match connection
                    .object_server()
                    .interface::<_, AttendanceService>(OBJECT_PATH)
                    .await
                {
                    Ok(iface) => iface,
                    Err(e) => {
                        tracing::warn!(error = %e, "attendance interface not served");
                        continue;
                    }
                };
                if let Err(e) =
                    AttendanceService::attendance_marked(iface.signal_emitter(), &payload).await
                {
                    tracing::warn!(error = %e, "attendance signal emit failed");
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "attendance feed lagged, events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
