//! Redis-compatible in-memory key/value store.
//!
//! Single-writer execution core over a pluggable eviction cache, an
//! append-only command log with background rewrite, a point-in-time
//! snapshot file, and a static consistent-hash cluster router. The binary
//! lives in `main.rs`; this library surface exists so integration tests
//! (and embedders) can run full nodes in-process.

pub mod aof;
pub mod cache;
pub mod cluster;
pub mod db;
pub mod rdb;
pub mod resp;
pub mod server;
pub mod value;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub use cluster::Router;
pub use db::{Db, DbConfig, EvictionPolicy, DEFAULT_MAX_BYTES};
pub use resp::Frame;
pub use server::{Server, SHUTDOWN_GRACE};
pub use value::Value;

/// The database surface the TCP front-end talks to: either a standalone
/// core or a cluster router wrapping one.
#[derive(Clone)]
pub enum Database {
    Standalone(Db),
    Cluster(Router),
}

impl Database {
    pub async fn exec(&self, argv: Vec<Vec<u8>>) -> Frame {
        match self {
            Database::Standalone(db) => db.exec(argv).await,
            Database::Cluster(router) => router.exec(argv).await,
        }
    }

    /// Restore persisted state (snapshot first, then append-log replay).
    pub async fn load(&self) -> anyhow::Result<()> {
        match self {
            Database::Standalone(db) => db.load().await,
            Database::Cluster(router) => router.load().await,
        }
    }

    /// Append-log durability barrier on the local core.
    pub fn flush_aof(&self) -> anyhow::Result<()> {
        match self {
            Database::Standalone(db) => db.flush_aof(),
            Database::Cluster(router) => router.local().flush_aof(),
        }
    }

    /// Idempotent close.
    pub fn close(&self) {
        match self {
            Database::Standalone(db) => db.close(),
            Database::Cluster(router) => router.close(),
        }
    }
}

/// Everything needed to run one node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Listen address; in cluster mode it must appear in `nodes`.
    pub addr: String,
    /// Static cluster membership; empty disables cluster mode.
    pub nodes: Vec<String>,
    pub aof_path: Option<PathBuf>,
    pub rdb_path: Option<PathBuf>,
    pub eviction: EvictionPolicy,
    pub max_bytes: usize,
    pub vnodes: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            addr: ":6399".to_string(),
            nodes: Vec::new(),
            aof_path: None,
            rdb_path: None,
            eviction: EvictionPolicy::Lru,
            max_bytes: DEFAULT_MAX_BYTES,
            vnodes: cluster::DEFAULT_VNODES,
        }
    }
}

/// Build the database stack for `cfg` (standalone core, optionally wrapped
/// by the cluster router).
pub fn build_database(cfg: &NodeConfig) -> anyhow::Result<Database> {
    let db = Db::new(DbConfig {
        aof_path: cfg.aof_path.clone(),
        rdb_path: cfg.rdb_path.clone(),
        max_bytes: cfg.max_bytes,
        eviction: cfg.eviction,
    })?;

    if cfg.nodes.is_empty() {
        return Ok(Database::Standalone(db));
    }
    anyhow::ensure!(
        cfg.nodes.iter().any(|n| n == &cfg.addr),
        "--addr must be included in --nodes when cluster mode is enabled"
    );
    Ok(Database::Cluster(Router::new(
        &cfg.addr, db, &cfg.nodes, cfg.vnodes,
    )))
}

/// A node started in-process. Used by integration tests and embedders.
pub struct NodeHandle {
    server: Server,
    task: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl NodeHandle {
    pub fn addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    pub fn database(&self) -> &Database {
        self.server.database()
    }

    /// Gracefully stop the node and wait for the accept loop to exit.
    pub async fn shutdown(self) {
        self.server.shutdown(SHUTDOWN_GRACE).await;
        let _ = self.task.await;
    }
}

/// Load persisted state, bind, and start serving in a background task.
pub async fn start_node(cfg: NodeConfig) -> anyhow::Result<NodeHandle> {
    let database = build_database(&cfg)?;
    database.load().await?;
    let server = Server::bind(&cfg.addr, database).await?;
    tracing::info!(addr = %server.local_addr(), "myredis listening");
    let serve = server.clone();
    let task = tokio::spawn(async move { serve.serve().await });
    Ok(NodeHandle { server, task })
}

/// Run one node until `shutdown` resolves or the server stops on its own
/// (e.g. a client issued SHUTDOWN), then drain gracefully.
pub async fn run_node_until(
    cfg: NodeConfig,
    shutdown: impl std::future::Future<Output = ()>,
    grace: Duration,
) -> anyhow::Result<()> {
    let database = build_database(&cfg)?;
    database.load().await?;
    let server = Server::bind(&cfg.addr, database).await?;
    tracing::info!(addr = %server.local_addr(), "myredis listening");

    let res = tokio::select! {
        res = server.serve() => res,
        _ = shutdown => Ok(()),
    };
    server.shutdown(grace).await;
    res
}
