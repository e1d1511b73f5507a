//! Pooled RESP client for a single peer node.
//!
//! Request/response over a reused TCP connection: write one command array,
//! read exactly one reply. Healthy connections go back to a bounded idle
//! pool; anything that errors or times out is dropped on the floor so a
//! broken socket is never reused.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;

use crate::resp::{Frame, RespCodec};

const POOL_SIZE: usize = 4;
const DIAL_TIMEOUT: Duration = Duration::from_secs(2);
const CALL_TIMEOUT: Duration = Duration::from_secs(5);

type PeerConn = Framed<TcpStream, RespCodec>;

pub struct PeerClient {
    addr: String,
    pool: Mutex<Vec<PeerConn>>,
    closed: AtomicBool,
}

impl PeerClient {
    pub fn new(addr: impl Into<String>) -> PeerClient {
        PeerClient {
            addr: addr.into(),
            pool: Mutex::new(Vec::with_capacity(POOL_SIZE)),
            closed: AtomicBool::new(false),
        }
    }

    /// Send `argv` and return the peer's single reply. The whole call is
    /// bounded by one overall deadline.
    pub async fn call(&self, argv: &[Vec<u8>]) -> anyhow::Result<Frame> {
        if self.closed.load(Ordering::SeqCst) {
            anyhow::bail!("peer client closed");
        }

        let mut conn = match self.acquire().await {
            Ok(conn) => conn,
            Err(err) => return Err(err),
        };

        let res = timeout(CALL_TIMEOUT, async {
            conn.send(Frame::Array(Some(argv.to_vec()))).await?;
            match conn.next().await {
                Some(Ok(frame)) => Ok(frame),
                Some(Err(err)) => Err(anyhow::Error::from(err)),
                None => Err(anyhow::anyhow!("peer closed connection")),
            }
        })
        .await;

        match res {
            Ok(Ok(frame)) => {
                self.release(conn);
                Ok(frame)
            }
            // The connection is dropped here rather than returned: a failed
            // or timed-out exchange leaves it in an unknown framing state.
            Ok(Err(err)) => Err(err),
            Err(_) => anyhow::bail!("peer call timed out after {CALL_TIMEOUT:?}"),
        }
    }

    async fn acquire(&self) -> anyhow::Result<PeerConn> {
        if let Some(conn) = self.pool.lock().unwrap().pop() {
            return Ok(conn);
        }
        let stream = timeout(DIAL_TIMEOUT, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| anyhow::anyhow!("connect to {} timed out", self.addr))??;
        Ok(Framed::new(stream, RespCodec))
    }

    fn release(&self, conn: PeerConn) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut pool = self.pool.lock().unwrap();
        if pool.len() < POOL_SIZE {
            pool.push(conn);
        }
    }

    /// Drop all idle connections and refuse further calls. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.pool.lock().unwrap().clear();
    }
}
