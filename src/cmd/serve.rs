//! Server commands: `kds serve` and `kds init-db`.

use std::path::PathBuf;

use anyhow::Result;
use tracing::info;

use kds::config::KdsConfig;
use kds::kitchen::server::{ServerConfig, open_database, start_server};

fn server_config(
    config: &KdsConfig,
    port: Option<u16>,
    db_path: Option<PathBuf>,
    dev: bool,
) -> Result<ServerConfig> {
    let mut server = ServerConfig::from_config(config)?;
    if let Some(port) = port {
        server.port = port;
    }
    if let Some(db_path) = db_path {
        server.db_path = db_path;
    }
    server.dev_mode |= dev;
    Ok(server)
}

pub async fn cmd_serve(
    config: &KdsConfig,
    port: Option<u16>,
    db_path: Option<PathBuf>,
    dev: bool,
) -> Result<()> {
    for warning in config.validate() {
        tracing::warn!(%warning, "configuration warning");
    }
    start_server(server_config(config, port, db_path, dev)?).await
}

pub fn cmd_init_db(config: &KdsConfig, db_path: Option<PathBuf>) -> Result<()> {
    let server = server_config(config, None, db_path, false)?;
    open_database(&server)?;
    info!(db = %server.db_path.display(), "database initialized");
    println!("Kitchen database initialized at {}", server.db_path.display());
    Ok(())
}
