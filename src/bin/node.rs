//! Node binary: hosts one service role (lock, queue or cache)

use clap::{Parser, Subcommand};
use minicoord::cache::grpc::{CacheGrpcService, GrpcCachePeers};
use minicoord::cache::http::CacheHttpState;
use minicoord::cache::CacheServer;
use minicoord::common::{Config, ConsistentHashRing, Metrics, NodeRole, PeerSet};
use minicoord::lock::grpc::LockGrpcService;
use minicoord::lock::http::LockHttpState;
use minicoord::lock::LockServer;
use minicoord::queue::grpc::QueueGrpcService;
use minicoord::queue::http::QueueHttpState;
use minicoord::queue::{QueueEngine, QueueServer};
use minicoord::raft::{GrpcRaftTransport, RaftNode, RaftTimings};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const EXIT_CONFIG: i32 = 1;
const EXIT_STORAGE: i32 = 2;
const EXIT_BOOTSTRAP: i32 = 3;

#[derive(Parser)]
#[command(name = "minicoord-node")]
#[command(about = "minicoord cluster node (lock / queue / cache role)")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a node
    Serve {
        /// JSON config file; CLI flags override its values
        #[arg(long)]
        config: Option<PathBuf>,

        /// Node ID
        #[arg(long)]
        id: Option<String>,

        /// Role: lock, queue or cache
        #[arg(long)]
        role: Option<String>,

        /// Bind address for the HTTP client surface
        #[arg(long)]
        bind: Option<String>,

        /// Bind address for internal gRPC
        #[arg(long)]
        grpc: Option<String>,

        /// Data directory
        #[arg(long)]
        data: Option<PathBuf>,

        /// Same-role peers (comma-separated id:host:port)
        #[arg(long, value_delimiter = ',')]
        peers: Vec<String>,

        /// WAL path override (queue role)
        #[arg(long)]
        wal: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let Commands::Serve {
        config,
        id,
        role,
        bind,
        grpc,
        data,
        peers,
        wal,
    } = cli.command;

    let config = match build_config(config, id, role, bind, grpc, data, peers, wal) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("configuration error: {}", e);
            std::process::exit(EXIT_CONFIG);
        }
    };

    if let Err((code, e)) = serve(config).await {
        tracing::error!("fatal: {}", e);
        std::process::exit(code);
    }
}

#[allow(clippy::too_many_arguments)]
fn build_config(
    file: Option<PathBuf>,
    id: Option<String>,
    role: Option<String>,
    bind: Option<String>,
    grpc: Option<String>,
    data: Option<PathBuf>,
    peers: Vec<String>,
    wal: Option<PathBuf>,
) -> minicoord::Result<Config> {
    let mut config = match file {
        Some(path) => Config::from_file(path)?,
        None => Config {
            node_id: id
                .clone()
                .ok_or_else(|| minicoord::Error::InvalidConfig("--id is required".into()))?,
            role: role
                .as_deref()
                .ok_or_else(|| minicoord::Error::InvalidConfig("--role is required".into()))?
                .parse()?,
            bind_addr: "0.0.0.0:7000".parse().unwrap(),
            grpc_addr: "0.0.0.0:7001".parse().unwrap(),
            peers: Vec::new(),
            data_dir: PathBuf::from("./data"),
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_ms: 50,
            cache_capacity: 100,
            queue_visibility_timeout_ms: 30_000,
            wal_path: None,
            consistent_hash_virtual_nodes: 150,
            rpc_timeout_ms: 1_000,
            log_level: "info".into(),
        },
    };

    // CLI flags override the file
    if let Some(id) = id {
        config.node_id = id;
    }
    if let Some(role) = role {
        config.role = role.parse()?;
    }
    if let Some(bind) = bind {
        config.bind_addr = bind
            .parse()
            .map_err(|e| minicoord::Error::InvalidConfig(format!("bad bind addr: {}", e)))?;
    }
    if let Some(grpc) = grpc {
        config.grpc_addr = grpc
            .parse()
            .map_err(|e| minicoord::Error::InvalidConfig(format!("bad grpc addr: {}", e)))?;
    }
    if let Some(data) = data {
        config.data_dir = data;
    }
    if !peers.is_empty() {
        config.peers = peers;
    }
    if wal.is_some() {
        config.wal_path = wal;
    }

    config.validate()?;
    Ok(config)
}

async fn serve(config: Config) -> Result<(), (i32, minicoord::Error)> {
    tracing::info!("starting {} node: {}", config.role, config.node_id);
    tracing::info!("  HTTP API: {}", config.bind_addr);
    tracing::info!("  gRPC API: {}", config.grpc_addr);
    tracing::info!("  data dir: {}", config.data_dir.display());
    tracing::info!("  peers: {:?}", config.peers);

    let addrs = config.peer_addrs().map_err(|e| (EXIT_CONFIG, e))?;
    let peers = Arc::new(PeerSet::new(&addrs, config.rpc_timeout()));
    let metrics = Arc::new(Metrics::new());

    match config.role {
        NodeRole::Lock => serve_lock(config, peers, metrics).await,
        NodeRole::Queue => serve_queue(config, peers, metrics).await,
        NodeRole::Cache => serve_cache(config, peers, metrics).await,
    }
}

async fn serve_lock(
    config: Config,
    peers: Arc<PeerSet>,
    metrics: Arc<Metrics>,
) -> Result<(), (i32, minicoord::Error)> {
    let transport = Arc::new(GrpcRaftTransport::new(peers.clone()));
    let (raft, commit_rx) = RaftNode::new(
        config.node_id.clone(),
        peers.ids(),
        RaftTimings::from_config(&config),
        &config.data_dir,
        transport,
    )
    .map_err(|e| (EXIT_STORAGE, e))?;
    raft.start();

    let server = LockServer::start(
        config.node_id.clone(),
        raft,
        commit_rx,
        Duration::from_secs(5),
        metrics.clone(),
    );

    let grpc_server = tonic::transport::Server::builder()
        .add_service(LockGrpcService::new(server.clone()).into_server())
        .serve(config.grpc_addr);

    let router = minicoord::lock::http::create_router(LockHttpState {
        server,
        peers,
        metrics,
    });
    let http_listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .map_err(|e| (EXIT_BOOTSTRAP, minicoord::Error::Io(e)))?;
    let http_server = axum::serve(http_listener, router);

    tracing::info!("✓ lock node ready");

    tokio::select! {
        res = http_server => {
            if let Err(e) = res {
                tracing::error!("HTTP server error: {}", e);
                return Err((EXIT_BOOTSTRAP, minicoord::Error::Io(e)));
            }
        }
        res = grpc_server => {
            if let Err(e) = res {
                tracing::error!("gRPC server error: {}", e);
                return Err((EXIT_BOOTSTRAP, minicoord::Error::ConnectionFailed(e.to_string())));
            }
        }
    }

    Ok(())
}

async fn serve_queue(
    config: Config,
    peers: Arc<PeerSet>,
    metrics: Arc<Metrics>,
) -> Result<(), (i32, minicoord::Error)> {
    let mut node_ids = peers.ids();
    node_ids.push(config.node_id.clone());
    let ring = ConsistentHashRing::with_nodes(config.consistent_hash_virtual_nodes, &node_ids);

    let engine = QueueEngine::open(
        config.wal_file(),
        config.node_id.clone(),
        config.queue_visibility_timeout_ms,
    )
    .map_err(|e| (EXIT_STORAGE, e))?;

    let server = QueueServer::start(
        config.node_id.clone(),
        ring,
        engine,
        peers.clone(),
        metrics.clone(),
    );

    let grpc_server = tonic::transport::Server::builder()
        .add_service(QueueGrpcService::new(server.clone()).into_server())
        .serve(config.grpc_addr);

    let router = minicoord::queue::http::create_router(QueueHttpState {
        server,
        peers,
        metrics,
    });
    let http_listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .map_err(|e| (EXIT_BOOTSTRAP, minicoord::Error::Io(e)))?;
    let http_server = axum::serve(http_listener, router);

    tracing::info!("✓ queue node ready");

    tokio::select! {
        res = http_server => {
            if let Err(e) = res {
                tracing::error!("HTTP server error: {}", e);
                return Err((EXIT_BOOTSTRAP, minicoord::Error::Io(e)));
            }
        }
        res = grpc_server => {
            if let Err(e) = res {
                tracing::error!("gRPC server error: {}", e);
                return Err((EXIT_BOOTSTRAP, minicoord::Error::ConnectionFailed(e.to_string())));
            }
        }
    }

    Ok(())
}

async fn serve_cache(
    config: Config,
    peers: Arc<PeerSet>,
    metrics: Arc<Metrics>,
) -> Result<(), (i32, minicoord::Error)> {
    let cache_peers = Arc::new(GrpcCachePeers::new(peers.clone()));
    let server = CacheServer::new(
        config.node_id.clone(),
        config.cache_capacity,
        cache_peers,
        None,
        metrics.clone(),
    );

    let grpc_server = tonic::transport::Server::builder()
        .add_service(CacheGrpcService::new(server.clone()).into_server())
        .serve(config.grpc_addr);

    let router = minicoord::cache::http::create_router(CacheHttpState {
        server,
        peers,
        metrics,
    });
    let http_listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .map_err(|e| (EXIT_BOOTSTRAP, minicoord::Error::Io(e)))?;
    let http_server = axum::serve(http_listener, router);

    tracing::info!("✓ cache node ready");

    tokio::select! {
        res = http_server => {
            if let Err(e) = res {
                tracing::error!("HTTP server error: {}", e);
                return Err((EXIT_BOOTSTRAP, minicoord::Error::Io(e)));
            }
        }
        res = grpc_server => {
            if let Err(e) = res {
                tracing::error!("gRPC server error: {}", e);
                return Err((EXIT_BOOTSTRAP, minicoord::Error::ConnectionFailed(e.to_string())));
            }
        }
    }

    Ok(())
}
