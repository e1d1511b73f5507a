//! Single-writer execution core.
//!
//! All keyspace state (the eviction cache, the TTL table, and the
//! per-step eviction list) is owned by one executor thread. Connection
//! handlers submit requests over a bounded channel and await the reply on
//! a oneshot;
//! background workers post their completions back into the same queue as
//! boxed tasks. Nothing else ever touches the state, so the cache and the
//! TTL table need no synchronization at all.
//!
//! The executor also drives active expiration on a 100 ms tick and decides
//! what reaches the append log: write commands verbatim, `EXPIRE` rewritten
//! to its absolute `PEXPIREAT` instant, `PERSIST` only when it succeeded,
//! and one trailing `DEL` per key the current command evicted under byte
//! pressure.

mod hash;
mod list;
mod persist;
mod set;
mod snapshot;
mod string;
mod ttl;

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::sync::oneshot;

use crate::aof::Appender;
use crate::cache::{EvictionCache, LfuCache, LruCache, OnRemove, RemoveReason};
use crate::resp::{encode_array, Frame, FrameReader};
use crate::value::Value;

/// Default byte budget for eviction (100 MiB).
pub const DEFAULT_MAX_BYTES: usize = 100 * 1024 * 1024;

const REQUEST_QUEUE_DEPTH: usize = 1000;
const EXPIRE_TICK: Duration = Duration::from_millis(100);
const EXPIRE_SAMPLE: usize = 20;
const EXEC_TIMEOUT: Duration = Duration::from_secs(5);

const WRONGTYPE_ERR: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";

/// Eviction policy selection. Unknown names fall back to LRU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    Lru,
    Lfu,
}

impl EvictionPolicy {
    pub fn parse(name: &str) -> EvictionPolicy {
        match name.trim().to_ascii_lowercase().as_str() {
            "lfu" => EvictionPolicy::Lfu,
            _ => EvictionPolicy::Lru,
        }
    }
}

/// Runtime configuration for a standalone database.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Append-log path; `None` disables the AOF.
    pub aof_path: Option<PathBuf>,
    /// Snapshot path; `None` disables RDB persistence.
    pub rdb_path: Option<PathBuf>,
    /// Byte budget for eviction; 0 means unlimited.
    pub max_bytes: usize,
    pub eviction: EvictionPolicy,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            aof_path: None,
            rdb_path: None,
            max_bytes: DEFAULT_MAX_BYTES,
            eviction: EvictionPolicy::Lru,
        }
    }
}

type Task = Box<dyn FnOnce(&mut DbState) -> Frame + Send>;

enum Request {
    Command {
        argv: Vec<Vec<u8>>,
        /// False while replaying the append log, so replay never re-logs.
        log_append: bool,
        reply: oneshot::Sender<Frame>,
    },
    /// Internal closure: snapshot apply, rewrite-completion install.
    Task {
        task: Task,
        reply: Option<oneshot::Sender<Frame>>,
    },
    Shutdown,
}

/// Handle to the execution core. Clones share one executor.
#[derive(Clone)]
pub struct Db {
    inner: Arc<DbInner>,
}

struct DbInner {
    tx: SyncSender<Request>,
    aof: Option<Arc<Appender>>,
    rdb_path: Option<PathBuf>,
    closed: AtomicBool,
    executor: Mutex<Option<JoinHandle<()>>>,
}

impl Db {
    /// Build the database and start its executor thread. The keyspace is
    /// empty until [`Db::load`] replays persisted state.
    pub fn new(cfg: DbConfig) -> anyhow::Result<Db> {
        let aof = match &cfg.aof_path {
            Some(path) => Some(Arc::new(Appender::open(path.clone())?)),
            None => None,
        };

        let (tx, rx) = mpsc::sync_channel(REQUEST_QUEUE_DEPTH);
        let rdb_path = cfg.rdb_path.clone();

        let state_aof = aof.clone();
        let state_rdb = rdb_path.clone();
        let state_tx = tx.clone();
        let executor = thread::Builder::new()
            .name("db-executor".to_string())
            .spawn(move || {
                let state = DbState::new(cfg, state_aof, state_rdb, state_tx);
                executor_loop(state, rx);
            })
            .context("spawn db executor thread")?;

        Ok(Db {
            inner: Arc::new(DbInner {
                tx,
                aof,
                rdb_path,
                closed: AtomicBool::new(false),
                executor: Mutex::new(Some(executor)),
            }),
        })
    }

    /// Execute one command and await its reply. A safety timeout bounds the
    /// wait if the executor is wedged.
    pub async fn exec(&self, argv: Vec<Vec<u8>>) -> Frame {
        self.submit(argv, true).await
    }

    async fn submit(&self, argv: Vec<Vec<u8>>, log_append: bool) -> Frame {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Frame::error("ERR server closed");
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        let req = Request::Command {
            argv,
            log_append,
            reply: reply_tx,
        };
        if self.inner.tx.send(req).is_err() {
            return Frame::error("ERR server closed");
        }
        match tokio::time::timeout(EXEC_TIMEOUT, reply_rx).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(_)) => Frame::error("ERR server closed"),
            Err(_) => Frame::error("ERR timeout"),
        }
    }

    /// Restore persisted state: apply the snapshot first, then replay the
    /// append log with logging suppressed. A parse error mid-log aborts the
    /// boot.
    pub async fn load(&self) -> anyhow::Result<()> {
        if let Some(path) = &self.inner.rdb_path {
            if path.exists() {
                match crate::rdb::load(path) {
                    Ok(entries) => {
                        let (reply_tx, reply_rx) = oneshot::channel();
                        let task: Task = Box::new(move |state| {
                            state.apply_snapshot(entries);
                            Frame::ok()
                        });
                        if self
                            .inner
                            .tx
                            .send(Request::Task {
                                task,
                                reply: Some(reply_tx),
                            })
                            .is_err()
                        {
                            anyhow::bail!("server closed during load");
                        }
                        let _ = reply_rx.await;
                    }
                    Err(err) => {
                        tracing::error!(error = ?err, path = %path.display(), "rdb load failed");
                    }
                }
            }
        }

        let Some(aof) = &self.inner.aof else {
            return Ok(());
        };
        let file = match File::open(aof.path()) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err).context("open aof for replay"),
        };
        let mut reader = FrameReader::new(BufReader::new(file));
        let mut replayed = 0u64;
        while let Some(frame) = reader.read_frame().context("aof replay parse")? {
            if let Frame::Array(Some(argv)) = frame {
                if argv.is_empty() {
                    continue;
                }
                let _ = self.submit(argv, false).await;
                replayed += 1;
            }
        }
        tracing::info!(commands = replayed, "aof replay finished");
        Ok(())
    }

    /// Append-log durability barrier; no-op without an AOF.
    pub fn flush_aof(&self) -> anyhow::Result<()> {
        match &self.inner.aof {
            Some(aof) => aof.flush(),
            None => Ok(()),
        }
    }

    /// Stop the executor after draining queued requests, then close the
    /// appender. Idempotent; concurrent callers block until the close has
    /// actually finished.
    pub fn close(&self) {
        let mut executor = self.inner.executor.lock().unwrap();
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.tx.send(Request::Shutdown);
        if let Some(executor) = executor.take() {
            let _ = executor.join();
        }
        if let Some(aof) = &self.inner.aof {
            aof.close();
        }
    }
}

impl Drop for DbInner {
    // The executor keeps its own sender clone for worker completions, so a
    // plain channel disconnect never stops it; an unclosed handle must
    // still shut the thread down.
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.tx.send(Request::Shutdown);
        if let Some(executor) = self.executor.lock().unwrap().take() {
            let _ = executor.join();
        }
        if let Some(aof) = &self.aof {
            aof.close();
        }
    }
}

/// Keyspace state owned exclusively by the executor thread.
struct DbState {
    cache: Box<dyn EvictionCache>,
    /// TTL table and per-step eviction list, shared with the cache's
    /// removal callback.
    side: Rc<RefCell<SideState>>,
    aof: Option<Arc<Appender>>,
    rdb_path: Option<PathBuf>,
    rdb_saving: Arc<AtomicBool>,
    aof_rewriting: bool,
    /// Executor input, handed to background workers for posting results.
    tx: SyncSender<Request>,
}

#[derive(Default)]
struct SideState {
    /// key -> absolute expiration, Unix milliseconds.
    ttl: HashMap<Vec<u8>, i64>,
    /// Keys evicted by byte pressure during the current step.
    evicted: Vec<Vec<u8>>,
}

impl DbState {
    fn new(
        cfg: DbConfig,
        aof: Option<Arc<Appender>>,
        rdb_path: Option<PathBuf>,
        tx: SyncSender<Request>,
    ) -> DbState {
        let side = Rc::new(RefCell::new(SideState::default()));

        // Single point for removal bookkeeping: every removal drops the TTL
        // entry; byte-budget evictions are additionally recorded so the
        // current command can journal them.
        let cb_side = Rc::clone(&side);
        let on_remove: OnRemove = Box::new(move |key, _value, reason| {
            let mut side = cb_side.borrow_mut();
            side.ttl.remove(key);
            if reason == RemoveReason::Evicted {
                side.evicted.push(key.to_vec());
            }
        });

        let cache: Box<dyn EvictionCache> = match cfg.eviction {
            EvictionPolicy::Lru => Box::new(LruCache::new(cfg.max_bytes, Some(on_remove))),
            EvictionPolicy::Lfu => Box::new(LfuCache::new(cfg.max_bytes, Some(on_remove))),
        };

        DbState {
            cache,
            side,
            aof,
            rdb_path,
            rdb_saving: Arc::new(AtomicBool::new(false)),
            aof_rewriting: false,
            tx,
        }
    }

    /// Handle one request; returns false when the executor should stop.
    fn handle(&mut self, req: Request) -> bool {
        match req {
            Request::Command {
                argv,
                log_append,
                reply,
            } => {
                self.side.borrow_mut().evicted.clear();
                let res = self.dispatch(&argv);
                if log_append && !res.is_error() {
                    self.append_to_log(&argv, &res);
                }
                let _ = reply.send(res);
                true
            }
            Request::Task { task, reply } => {
                self.side.borrow_mut().evicted.clear();
                let res = task(self);
                if let Some(reply) = reply {
                    let _ = reply.send(res);
                }
                true
            }
            Request::Shutdown => false,
        }
    }

    fn dispatch(&mut self, argv: &[Vec<u8>]) -> Frame {
        let Some(name) = argv.first() else {
            return Frame::error("ERR empty command");
        };
        let name = String::from_utf8_lossy(name).to_ascii_lowercase();
        match name.as_str() {
            "ping" => Frame::pong(),
            "set" => self.set(argv),
            "get" => self.get(argv),
            "del" => self.del(argv),
            "lpush" => self.lpush(argv),
            "rpush" => self.rpush(argv),
            "lpop" => self.lpop(argv),
            "rpop" => self.rpop(argv),
            "lrange" => self.lrange(argv),
            "llen" => self.llen(argv),
            "hset" => self.hset(argv),
            "hget" => self.hget(argv),
            "hgetall" => self.hgetall(argv),
            "hdel" => self.hdel(argv),
            "sadd" => self.sadd(argv),
            "srem" => self.srem(argv),
            "scard" => self.scard(argv),
            "smembers" => self.smembers(argv),
            "expire" => self.expire(argv),
            "pexpireat" => self.pexpireat(argv),
            "ttl" => self.ttl(argv),
            "persist" => self.persist(argv),
            "save" => self.save(),
            "bgsave" => self.bgsave(),
            "rewriteaof" => self.rewrite_aof(),
            "bgrewriteaof" => self.bg_rewrite_aof(),
            _ => Frame::error(format!("ERR unknown command '{name}'")),
        }
    }

    /// Append-log translation for a successfully executed command, followed
    /// by one `DEL` per key evicted during this step.
    fn append_to_log(&mut self, argv: &[Vec<u8>], res: &Frame) {
        if self.aof.is_some() {
            self.append_command(argv, res);
            let evicted: Vec<Vec<u8>> = std::mem::take(&mut self.side.borrow_mut().evicted);
            if let Some(aof) = &self.aof {
                for key in evicted {
                    aof.append(encode_array(&[b"DEL".to_vec(), key]));
                }
            }
        }
    }

    fn append_command(&self, argv: &[Vec<u8>], res: &Frame) {
        let Some(aof) = &self.aof else { return };
        let name = String::from_utf8_lossy(&argv[0]).to_ascii_lowercase();
        match name.as_str() {
            "expire" => {
                // Persist the absolute instant so replay cannot extend the
                // key's lifetime. A non-positive count deleted the key, so
                // the TTL table no longer has it: log the delete instead.
                if *res != Frame::Integer(1) || argv.len() < 2 {
                    return;
                }
                let key = &argv[1];
                match self.side.borrow().ttl.get(key) {
                    Some(at) => aof.append(encode_array(&[
                        b"PEXPIREAT".to_vec(),
                        key.clone(),
                        at.to_string().into_bytes(),
                    ])),
                    None => aof.append(encode_array(&[b"DEL".to_vec(), key.clone()])),
                }
            }
            "persist" => {
                if *res == Frame::Integer(1) {
                    aof.append(encode_array(argv));
                }
            }
            _ => {
                if is_write_command(&name) {
                    aof.append(encode_array(argv));
                }
            }
        }
    }

    /// Remove the key if its TTL is past due; returns whether it expired.
    /// Runs on every access path that resolves a key.
    fn expire_if_due(&mut self, key: &[u8]) -> bool {
        let due = match self.side.borrow().ttl.get(key) {
            Some(&at) => at <= now_ms(),
            None => false,
        };
        if due {
            self.cache.remove_expired(key);
        }
        due
    }

    /// Active expiration: sample a bounded number of TTL entries and drop
    /// the past-due ones. Unordered map iteration makes this probabilistic,
    /// which is all it needs to be; the lazy path stays authoritative.
    fn active_expire(&mut self) {
        let now = now_ms();
        let due: Vec<Vec<u8>> = self
            .side
            .borrow()
            .ttl
            .iter()
            .take(EXPIRE_SAMPLE)
            .filter(|(_, &at)| at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in due {
            self.cache.remove_expired(&key);
        }
    }
}

fn executor_loop(mut state: DbState, rx: mpsc::Receiver<Request>) {
    let mut next_tick = Instant::now() + EXPIRE_TICK;
    loop {
        let now = Instant::now();
        if now >= next_tick {
            state.active_expire();
            next_tick = now + EXPIRE_TICK;
        }

        let wait = next_tick.saturating_duration_since(Instant::now());
        match rx.recv_timeout(wait) {
            Ok(req) => {
                if !state.handle(req) {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    // Drain requests that were already queued when shutdown began so no
    // submitter is left waiting.
    while let Ok(req) = rx.try_recv() {
        if let Request::Shutdown = req {
            continue;
        }
        state.handle(req);
    }
    state.cache.close();
}

fn is_write_command(name: &str) -> bool {
    matches!(
        name,
        "set" | "del"
            | "lpush"
            | "rpush"
            | "lpop"
            | "rpop"
            | "hset"
            | "hdel"
            | "sadd"
            | "srem"
            | "pexpireat"
    )
}

pub(crate) fn now_ms() -> i64 {
    crate::rdb::unix_time_ms()
}

fn wrong_args(cmd: &str) -> Frame {
    Frame::error(format!("ERR wrong number of arguments for '{cmd}' command"))
}

fn wrong_type() -> Frame {
    Frame::error(WRONGTYPE_ERR)
}

fn parse_int(arg: &[u8]) -> Option<i64> {
    std::str::from_utf8(arg).ok()?.trim().parse().ok()
}

fn int_arg_error() -> Frame {
    Frame::error("ERR value is not an integer or out of range")
}
