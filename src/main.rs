use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use replica_sync::collections::CollectionName;
use replica_sync::config::Config;
use replica_sync::peer::PeerLink;
use replica_sync::readiness::ReadinessSignal;
use replica_sync::registry::SubscriptionRegistry;
use replica_sync::remote::HttpApiClient;
use replica_sync::server::{self, AppState};
use replica_sync::store::{LocalStore, ReplicaStore};
use replica_sync::sync::{SyncOrchestrator, SyncSettings};

#[derive(Parser)]
#[command(name = "replica-sync")]
#[command(version)]
#[command(about = "Bulk catch-up sync for a peer-replicated local store", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the replica, the bulk sync and the HTTP server (default)
    Serve,

    /// Run a single bulk sync and print its summary
    Sync,

    /// Print the remote document count for a collection
    Count {
        /// Collection name (e.g. Asset, ERPMasterData)
        collection: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "replica_sync=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = Config::load(cli.config)?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Sync => sync_once(config).await,
        Commands::Count { collection } => count(config, &collection).await,
    }
}

/// Components shared by `serve` and `sync`.
struct Replica {
    store: ReplicaStore,
    client: Arc<HttpApiClient>,
    orchestrator: Arc<SyncOrchestrator>,
    peer_shutdown: watch::Sender<bool>,
    peer_task: Option<JoinHandle<()>>,
}

impl Replica {
    async fn start(config: &Config) -> Result<Self, Box<dyn std::error::Error>> {
        tracing::info!("Replica database: {}", config.database_path.display());

        let store = ReplicaStore::open(&config.database_path).await?;
        store.start_sync();
        tracing::info!("Local replica sync started");

        let local: Arc<dyn LocalStore> = Arc::new(store.clone());
        let client = Arc::new(
            HttpApiClient::new(config.api_base_url(), config.api_key.clone(), config.call_timeout())?
                .with_replica(local.clone()),
        );

        let registry = Arc::new(SubscriptionRegistry::new(Arc::new(store.clone())));
        let orchestrator = Arc::new(SyncOrchestrator::new(
            client.clone(),
            local,
            registry,
            ReadinessSignal::new(),
            SyncSettings::from_config(config),
        ));

        let (peer_shutdown, peer_shutdown_rx) = watch::channel(false);
        let peer_task = match PeerLink::from_config(config, store.clone()) {
            Some(link) => Some(tokio::spawn(link.run(peer_shutdown_rx))),
            None => {
                tracing::warn!("No websocket URL configured, replica will not receive peer data");
                None
            }
        };

        Ok(Self {
            store,
            client,
            orchestrator,
            peer_shutdown,
            peer_task,
        })
    }

    /// Registers the collection-wide subscriptions and raises readiness.
    async fn register_subscriptions(&self) -> Result<(), Box<dyn std::error::Error>> {
        self.orchestrator
            .registry()
            .register_all(&CollectionName::ALL)
            .await?;
        tracing::info!("All subscriptions registered successfully");
        self.orchestrator.readiness().set();
        Ok(())
    }

    async fn stop(self) {
        self.orchestrator.shutdown().await;
        let _ = self.peer_shutdown.send(true);
        if let Some(task) = self.peer_task {
            if let Err(e) = task.await {
                tracing::warn!("Peer link task failed: {}", e);
            }
        }
        self.store.stop_sync();
        tracing::info!("Local replica sync stopped");
    }
}

async fn serve(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let replica = Replica::start(&config).await?;

    let orchestrator = replica.orchestrator.clone();
    let sync_task = tokio::spawn(async move {
        if let Err(e) = orchestrator.run_when_ready().await {
            tracing::error!("Bulk sync did not run: {}", e);
        }
    });

    if let Err(e) = replica.register_subscriptions().await {
        return Err(abandon_startup(replica, Some(sync_task), e).await);
    }

    let app = server::router(AppState {
        orchestrator: replica.orchestrator.clone(),
        client: replica.client.clone(),
        store: Arc::new(replica.store.clone()),
        count_filter: config.count_filter.clone(),
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down");
    replica.stop().await;
    if let Err(e) = sync_task.await {
        tracing::warn!("Sync task failed: {}", e);
    }

    Ok(())
}

/// Tears down a partially started replica and hands back the startup error.
async fn abandon_startup(
    replica: Replica,
    sync_task: Option<JoinHandle<()>>,
    err: Box<dyn std::error::Error>,
) -> Box<dyn std::error::Error> {
    tracing::error!("Failed to register subscriptions: {}", err);
    replica.stop().await;
    if let Some(task) = sync_task {
        if let Err(e) = task.await {
            tracing::warn!("Sync task failed: {}", e);
        }
    }
    err
}

async fn sync_once(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let replica = Replica::start(&config).await?;
    if let Err(e) = replica.register_subscriptions().await {
        return Err(abandon_startup(replica, None, e).await);
    }

    let orchestrator = replica.orchestrator.clone();
    let interrupt = tokio::spawn(async move {
        shutdown_signal().await;
        orchestrator.shutdown().await;
    });

    let result = replica.orchestrator.run_now().await;
    interrupt.abort();
    replica.stop().await;

    let summary = result?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn count(config: Config, collection: &str) -> Result<(), Box<dyn std::error::Error>> {
    let collection = CollectionName::parse(collection)
        .ok_or_else(|| format!("Unknown collection: {}", collection))?;

    let client = HttpApiClient::new(
        config.api_base_url(),
        config.api_key.clone(),
        config.call_timeout(),
    )?;
    let body = client
        .get_document_counts(&config.count_filter, collection.as_str())
        .await?;

    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
