use std::path::PathBuf;

use clap::Parser;

use meshpath_core::stats::LogMonitor;
use meshpath_node::NodeConfig;
use meshpath_prefix::kv::MemoryKvStore;
use meshpath_prefix::manager::PrefixManager;
use meshpath_prefix::store::FileConfigStore;
use meshpath_routing::fib::MemoryFib;
use meshpath_routing::service::RoutingService;

#[derive(Parser)]
#[command(name = "meshpathd", about = "Mesh path routing and prefix advertisement daemon")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/meshpath/config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match NodeConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to load config from {}: {e}", cli.config.display());
            std::process::exit(1);
        }
    };

    // Initialize logging
    if std::env::var("RUST_LOG_FORMAT").as_deref() == Ok("json") {
        meshpath_node::logging::init_json(&config.logging.level);
    } else {
        meshpath_node::logging::init(&config.logging.level);
    }

    let store = match &config.node.data_dir {
        Some(dir) => FileConfigStore::new(PathBuf::from(dir)),
        None => FileConfigStore::default_path(),
    };
    let store = match store {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("failed to open config store: {e}");
            std::process::exit(1);
        }
    };

    let routing_cfg = match config.routing_service_config() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("{e}");
            std::process::exit(1);
        }
    };
    let prefix_cfg = match config.prefix_manager_config() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("{e}");
            std::process::exit(1);
        }
    };

    let routing = match RoutingService::bind(routing_cfg, MemoryFib::new()).await {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("failed to start mesh path service: {e}");
            std::process::exit(1);
        }
    };
    let prefix_manager =
        PrefixManager::new(prefix_cfg, store, MemoryKvStore::new(), LogMonitor);

    let routing_handle = routing.handle();
    let prefix_handle = prefix_manager.handle();

    // Spawn SIGINT handler
    {
        let routing_handle = routing_handle.clone();
        let prefix_handle = prefix_handle.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("received SIGINT, shutting down");
            routing_handle.shutdown();
            prefix_handle.shutdown();
        });
    }

    // Spawn SIGTERM handler (Docker sends SIGTERM on `docker stop`)
    #[cfg(unix)]
    {
        let routing_handle = routing_handle.clone();
        let prefix_handle = prefix_handle.clone();
        tokio::spawn(async move {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");
            sigterm.recv().await;
            tracing::info!("received SIGTERM, shutting down");
            routing_handle.shutdown();
            prefix_handle.shutdown();
        });
    }

    let routing_task = tokio::spawn(routing.run());
    let prefix_task = tokio::spawn(prefix_manager.run());

    let _ = routing_task.await;
    let _ = prefix_task.await;
}
