use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use kds::config::{CONFIG_DIR, KdsConfig};
use kds_common::{Role, Station};

mod cmd;

#[derive(Parser)]
#[command(name = "kds")]
#[command(version, about = "Kitchen display ticket engine")]
pub struct Cli {
    /// Directory holding kds.toml (defaults to ./.kds)
    #[arg(long, global = true)]
    pub config_dir: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the ticket API server
    Serve {
        /// Port to listen on
        #[arg(long)]
        port: Option<u16>,
        /// Path to the SQLite database
        #[arg(long)]
        db_path: Option<PathBuf>,
        /// Bind on all interfaces and allow any CORS origin
        #[arg(long)]
        dev: bool,
    },
    /// Create the database and run migrations, then exit
    InitDb {
        /// Path to the SQLite database
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Follow a station's ticket board from a running server
    Watch {
        /// Station to display (kitchen or bar)
        #[arg(long, value_parser = parse_station)]
        station: Option<Station>,
        /// Base URL of the server
        #[arg(long)]
        url: Option<String>,
        /// Role sent with each poll (defaults to the station's own role)
        #[arg(long, value_parser = parse_role)]
        role: Option<Role>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default kds.toml file
    Init,
}

fn parse_station(s: &str) -> Result<Station, String> {
    s.to_ascii_lowercase().parse()
}

fn parse_role(s: &str) -> Result<Role, String> {
    s.parse()
}

fn init_tracing(json: bool) {
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config_dir = match cli.config_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir()
            .context("Failed to get current directory")?
            .join(CONFIG_DIR),
    };

    match &cli.command {
        Commands::Config { command } => cmd::cmd_config(&config_dir, command.clone())?,
        command => {
            let mut config = KdsConfig::load_or_default(&config_dir)?;
            config.apply_env()?;
            match command {
                Commands::Serve { port, db_path, dev } => {
                    cmd::cmd_serve(&config, *port, db_path.clone(), *dev).await?
                }
                Commands::InitDb { db_path } => cmd::cmd_init_db(&config, db_path.clone())?,
                Commands::Watch { station, url, role } => {
                    cmd::cmd_watch(&config, *station, url.clone(), *role).await?
                }
                Commands::Config { .. } => {}
            }
        }
    }

    Ok(())
}
