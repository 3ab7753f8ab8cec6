//! Arena server binary

use arena::api::ApiServer;
use arena::{ArenaService, Collaborators, ConfigLoader, Stores};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "arena-server")]
#[command(about = "Real-time game session server", long_about = None)]
struct Args {
    /// TOML configuration file; a demo game set is used when omitted
    #[arg(long)]
    config: Option<String>,

    /// Override server.host
    #[arg(long)]
    host: Option<String>,

    /// Override server.port
    #[arg(long)]
    port: Option<u16>,

    /// Override storage.data_directory
    #[arg(long)]
    data_dir: Option<String>,

    /// Keep sessions and risk profiles in memory
    #[arg(long)]
    in_memory: bool,

    /// Starting balance for players in the in-process wallet
    #[arg(long, default_value = "1000")]
    opening_balance: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "arena=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();

    let mut loader = ConfigLoader::new();
    if let Some(path) = &args.config {
        loader = loader.with_path(path);
    }
    let mut config = loader.load()?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(dir) = args.data_dir {
        config.storage.data_directory = dir;
    }
    if args.in_memory {
        config.storage.in_memory = true;
    }

    tracing::info!(games = ?config.games.keys().collect::<Vec<_>>(), "Configuration loaded");

    let stores = Stores::from_config(&config.storage)?;
    let service = ArenaService::new(config, stores, Collaborators::in_process(args.opening_balance));
    let loops = service.start();

    let server = ApiServer::new(service.config().server.clone(), service.app_state());
    let result = server.run().await;

    for handle in loops {
        handle.abort();
    }
    result
}
