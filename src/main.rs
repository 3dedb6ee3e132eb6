use std::process;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use pgbroker::api::{create_router, ApiState};
use pgbroker::backend::Backends;
use pgbroker::backup::{CommandBackupStore, MemoryBackupStore, SharedBackupStore};
use pgbroker::broker::Broker;
use pgbroker::cli::{format_check, Args};
use pgbroker::config::{default_config_path, load_config_file, BrokerConfig};
use pgbroker::kv::{EtcdStore, MemoryStore, SharedKvStore};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    let filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    if let Err(e) = run(args).await {
        error!("{:#}", e);
        process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    // Load .env file if specified
    if let Some(ref env_file) = args.env_file {
        dotenvy::from_path(env_file)
            .with_context(|| format!("Failed to load env file {}", env_file.display()))?;
    }

    let path = args.config.clone().unwrap_or_else(default_config_path);
    let mut config = load_config_file(&path)
        .with_context(|| format!("Failed to load config file {}", path.display()))?;
    args.apply_overrides(&mut config);

    if args.check {
        println!("{}", format_check(&config, &path.display().to_string()));
        return Ok(());
    }

    let kv = open_store(&config)?;
    let backends = Backends::from_config(&config.backends).context("Invalid backend")?;
    let backups = open_backups(&config);
    let addr = format!("{}:{}", config.broker.bind_addr, config.broker.port);

    info!(
        "Starting pgbroker with {} backend(s) in {} zone(s)",
        backends.len(),
        backends.azs().len()
    );
    let broker = Broker::new(config, kv, backends, backups);
    let app = create_router(ApiState::new(broker));

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("Server listening on {}", addr);
    info!("Endpoints:");
    info!("  PUT/PATCH/DELETE /v2/service_instances/{{id}}");
    info!("  GET              /v2/service_instances/{{id}}/last_operation");
    info!("  PUT/DELETE       /v2/service_instances/{{id}}/service_bindings/{{binding}}");
    info!("  GET              /health");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server stopped");
    Ok(())
}

fn open_store(config: &BrokerConfig) -> anyhow::Result<SharedKvStore> {
    match &config.kv_store {
        Some(kv) => {
            info!("Using etcd at {} (prefix '{}')", kv.endpoint, kv.prefix);
            let store = EtcdStore::new(&kv.endpoint, &kv.prefix, kv.timeout())
                .context("Failed to create etcd client")?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("No kv_store configured, state is kept in memory and lost on exit");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

fn open_backups(config: &BrokerConfig) -> SharedBackupStore {
    match &config.callbacks {
        Some(callbacks) => Arc::new(CommandBackupStore::new(callbacks.clone())),
        None => {
            warn!("No backup callbacks configured, recreation data is kept in memory");
            Arc::new(MemoryBackupStore::new())
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
