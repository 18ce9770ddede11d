use itemsync_realtime::{ServerConfig, SyncServer};
use log::{error, info};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            std::process::exit(2);
        }
    };

    info!(
        "Starting itemsync server on {} (auth timeout: {:?}, per-user limit: {:?})",
        config.bind_addr, config.auth_timeout, config.max_connections_per_user
    );

    let server = SyncServer::new(config);
    if let Err(e) = server.run().await {
        error!("Server stopped: {e}");
        std::process::exit(1);
    }
}
