//! myredis-server entry point: CLI parsing, logging setup, and
//! signal-driven graceful shutdown around the node runtime.

use std::io::IsTerminal;
use std::path::PathBuf;

use clap::Parser;

use myredis::{run_node_until, EvictionPolicy, NodeConfig, DEFAULT_MAX_BYTES, SHUTDOWN_GRACE};

#[derive(Parser, Debug)]
#[command(name = "myredis-server")]
#[command(about = "Redis-compatible in-memory key/value store with AOF, snapshots, and static cluster routing")]
struct Args {
    /// Listen address, e.g. 127.0.0.1:6399 (a bare :port listens on all
    /// interfaces)
    #[arg(long, default_value = ":6399")]
    addr: String,

    /// Cluster nodes, comma-separated, e.g.
    /// 127.0.0.1:6399,127.0.0.1:6400,127.0.0.1:6401; empty disables cluster
    /// mode
    #[arg(long, default_value = "")]
    nodes: String,

    /// Append-log filename (empty disables)
    #[arg(long, default_value = "")]
    aof: String,

    /// Snapshot filename (empty disables)
    #[arg(long, default_value = "")]
    rdb: String,

    /// AOF fsync policy (only everysec is supported)
    #[arg(long, default_value = "everysec")]
    appendfsync: String,

    /// Eviction policy: lru|lfu
    #[arg(long, default_value = "lru")]
    eviction: String,

    /// Max memory in bytes for eviction
    #[arg(long = "max-bytes", default_value_t = DEFAULT_MAX_BYTES)]
    max_bytes: usize,

    /// Virtual nodes per physical node for consistent hashing
    #[arg(long, default_value_t = 160)]
    vnodes: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    anyhow::ensure!(
        args.appendfsync.trim().eq_ignore_ascii_case("everysec"),
        "only --appendfsync=everysec is supported"
    );

    let cfg = NodeConfig {
        addr: args.addr,
        nodes: parse_nodes(&args.nodes),
        aof_path: non_empty_path(&args.aof),
        rdb_path: non_empty_path(&args.rdb),
        eviction: EvictionPolicy::parse(&args.eviction),
        max_bytes: args.max_bytes,
        vnodes: args.vnodes,
    };

    run_node_until(cfg, shutdown_signal(), SHUTDOWN_GRACE).await
}

fn parse_nodes(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .collect()
}

fn non_empty_path(raw: &str) -> Option<PathBuf> {
    let raw = raw.trim();
    if raw.is_empty() {
        None
    } else {
        Some(PathBuf::from(raw))
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
