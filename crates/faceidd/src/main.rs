use anyhow::Result;
use tracing_subscriber::EnvFilter;

mod api;
mod config;
mod dbus_interface;
mod engine;

const BUS_NAME: &str = "org.faceid.FaceId1";
const OBJECT_PATH: &str = "/org/faceid/FaceId1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "faceidd starting");

    let config = config::Config::from_env();
    let engine = engine::spawn_engine(&config)?;
    let service = dbus_interface::FaceIdService::new(engine);

    let builder = if config.session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await?;

    tracing::info!(
        bus = if config.session_bus { "session" } else { "system" },
        name = BUS_NAME,
        "faceidd ready"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("faceidd shutting down");

    Ok(())
}
