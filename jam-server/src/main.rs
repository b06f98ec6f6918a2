use jam_collab::{ServerConfig, SyncServer};
use log::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // RUST_LOG wins, then JAM_LOG_LEVEL
    let level = std::env::var("JAM_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let config = ServerConfig::from_env()?;
    match &config.storage_path {
        Some(path) => info!("Starting jam server with storage at {}", path.display()),
        None => info!("Starting jam server with in-memory storage"),
    }

    let server = SyncServer::new(config)?;

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    Ok(())
}
