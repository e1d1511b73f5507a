//! Cluster router: a database front that owns a slice of the keyspace and
//! transparently forwards the rest.
//!
//! Routing policy: `PING` always runs locally; single-key commands (key at
//! argv index 1) go to the ring owner, forwarded once with the peer's reply
//! returned verbatim; multi-key `DEL` fans out one sub-command per owner
//! and sums the integer replies. There is no redirection protocol;
//! membership is static and every node routes for every key.

mod peer;
mod ring;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::join_all;

pub use ring::{Ring, DEFAULT_VNODES};

use crate::db::Db;
use crate::resp::Frame;
use peer::PeerClient;

/// Shared-nothing router over a static node list. Clones share one state.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    local_addr: String,
    local: Db,
    ring: Ring,
    peers: Mutex<HashMap<String, Arc<PeerClient>>>,
    closed: AtomicBool,
}

impl Router {
    pub fn new(local_addr: &str, local: Db, nodes: &[String], vnodes: usize) -> Router {
        let mut peers = HashMap::new();
        for node in nodes {
            if node.is_empty() || node == local_addr {
                continue;
            }
            peers.insert(node.clone(), Arc::new(PeerClient::new(node.clone())));
        }
        Router {
            inner: Arc::new(RouterInner {
                local_addr: local_addr.to_string(),
                local,
                ring: Ring::new(nodes, vnodes),
                peers: Mutex::new(peers),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Each node replays only its own persisted state.
    pub async fn load(&self) -> anyhow::Result<()> {
        self.inner.local.load().await
    }

    pub fn local(&self) -> &Db {
        &self.inner.local
    }

    pub async fn exec(&self, argv: Vec<Vec<u8>>) -> Frame {
        let Some(name) = argv.first() else {
            return Frame::error("ERR empty command");
        };
        let name = String::from_utf8_lossy(name).to_ascii_lowercase();

        // Keyless commands (and everything admin) run locally.
        if name == "ping" {
            return self.inner.local.exec(argv).await;
        }
        if name == "del" {
            return self.exec_del(argv).await;
        }
        if argv.len() < 2 {
            return self.inner.local.exec(argv).await;
        }

        let owner = self
            .inner
            .ring
            .node_for_key(&argv[1])
            .map(|s| s.to_string());
        match owner {
            None => self.inner.local.exec(argv).await,
            Some(owner) if owner == self.inner.local_addr => self.inner.local.exec(argv).await,
            Some(owner) => self.forward(&owner, argv).await,
        }
    }

    /// DEL spanning owners: group keys per node, dispatch the groups
    /// concurrently, and sum the counts. Any error reply wins.
    async fn exec_del(&self, argv: Vec<Vec<u8>>) -> Frame {
        if argv.len() < 2 {
            return Frame::error("ERR wrong number of arguments for 'del' command");
        }

        let mut groups: HashMap<String, Vec<Vec<u8>>> = HashMap::new();
        for key in &argv[1..] {
            let node = self
                .inner
                .ring
                .node_for_key(key)
                .unwrap_or(&self.inner.local_addr)
                .to_string();
            groups.entry(node).or_default().push(key.clone());
        }

        let calls = groups.into_iter().map(|(node, keys)| {
            let mut sub = Vec::with_capacity(keys.len() + 1);
            sub.push(b"DEL".to_vec());
            sub.extend(keys);
            async move {
                if node == self.inner.local_addr {
                    self.inner.local.exec(sub).await
                } else {
                    self.forward(&node, sub).await
                }
            }
        });

        let mut total = 0i64;
        for reply in join_all(calls).await {
            match reply {
                Frame::Integer(n) => total += n,
                Frame::Error(err) => return Frame::Error(err),
                _ => return Frame::error("ERR cluster: DEL unexpected reply"),
            }
        }
        Frame::Integer(total)
    }

    async fn forward(&self, addr: &str, argv: Vec<Vec<u8>>) -> Frame {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Frame::error("ERR server closed");
        }
        let client = self.peer(addr);
        match client.call(&argv).await {
            Ok(frame) => frame,
            Err(err) => Frame::error(format!("ERR cluster forward failed: {err:#}")),
        }
    }

    fn peer(&self, addr: &str) -> Arc<PeerClient> {
        let mut peers = self.inner.peers.lock().unwrap();
        peers
            .entry(addr.to_string())
            .or_insert_with(|| Arc::new(PeerClient::new(addr.to_string())))
            .clone()
    }

    /// Close peer pools, then the local core. Idempotent; concurrent
    /// callers block until the close has finished.
    pub fn close(&self) {
        let peers = self.inner.peers.lock().unwrap();
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for client in peers.values() {
            client.close();
        }
        self.inner.local.close();
    }
}
