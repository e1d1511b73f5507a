//! TCP front-end.
//!
//! One task per connection, each driving a framed RESP stream: decode a
//! command array, hand it to the database, write the reply. Replies on a
//! connection always go out in request order.
//!
//! Graceful shutdown stops the accept loop, cancels every connection task
//! (which unblocks their reads), waits for them to drain within the grace
//! period, and finally closes the database so the append log is drained and
//! fsynced. The `SHUTDOWN` command answers `+OK` first and triggers the
//! same sequence asynchronously so the reply reaches the wire.

use std::net::SocketAddr;
use std::sync::Mutex;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::resp::{Frame, RespCodec};
use crate::Database;

/// Grace period the SHUTDOWN command and signal handlers allow for
/// connection drain.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Listening server handle. Clones share one accept loop and one database.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    db: Database,
    addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    tracker: TaskTracker,
    token: CancellationToken,
}

impl Server {
    /// Bind `addr` (a bare `:port` listens on all interfaces). Binding is
    /// the one startup failure that aborts the process.
    pub async fn bind(addr: &str, db: Database) -> anyhow::Result<Server> {
        let listener = TcpListener::bind(listen_addr(addr))
            .await
            .with_context(|| format!("bind {addr}"))?;
        let local = listener.local_addr().context("listener local addr")?;
        Ok(Server {
            inner: Arc::new(ServerInner {
                db,
                addr: local,
                listener: Mutex::new(Some(listener)),
                tracker: TaskTracker::new(),
                token: CancellationToken::new(),
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.addr
    }

    pub fn database(&self) -> &Database {
        &self.inner.db
    }

    /// Accept connections until shutdown is triggered.
    pub async fn serve(&self) -> anyhow::Result<()> {
        let listener = self
            .inner
            .listener
            .lock()
            .unwrap()
            .take()
            .context("server already running")?;

        loop {
            tokio::select! {
                _ = self.inner.token.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, peer)) => {
                            let server = self.clone();
                            self.inner.tracker.spawn(async move {
                                if let Err(err) = handle_connection(socket, server).await {
                                    tracing::debug!(error = ?err, %peer, "connection closed");
                                }
                            });
                        }
                        Err(err) => {
                            if self.inner.token.is_cancelled() {
                                return Ok(());
                            }
                            tracing::warn!(error = ?err, "accept failed");
                        }
                    }
                }
            }
        }
    }

    /// Stop accepting, cancel connections, wait up to `grace` for handlers
    /// to exit, then close the database. Safe to call more than once and
    /// from multiple sites.
    pub async fn shutdown(&self, grace: Duration) {
        self.inner.token.cancel();
        self.inner.tracker.close();
        if tokio::time::timeout(grace, self.inner.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!("shutdown grace period expired with handlers still running");
        }
        // Best effort even when the grace period expired: the database is
        // still closed so persistence drains.
        self.inner.db.close();
    }
}

async fn handle_connection(socket: TcpStream, server: Server) -> anyhow::Result<()> {
    let mut framed = Framed::new(socket, RespCodec);
    loop {
        let frame = tokio::select! {
            _ = server.inner.token.cancelled() => return Ok(()),
            frame = framed.next() => frame,
        };
        match frame {
            None => return Ok(()),
            Some(Err(err)) => {
                // Surface the protocol error to the peer, then drop the
                // connection; the stream is beyond recovery.
                let _ = framed.send(Frame::error(err.to_string())).await;
                return Err(err.into());
            }
            Some(Ok(Frame::Array(Some(argv)))) => {
                if argv
                    .first()
                    .is_some_and(|name| name.eq_ignore_ascii_case(b"shutdown"))
                {
                    let _ = framed.send(Frame::ok()).await;
                    let server = server.clone();
                    tokio::spawn(async move {
                        server.shutdown(SHUTDOWN_GRACE).await;
                    });
                    return Ok(());
                }
                let reply = server.inner.db.exec(argv).await;
                framed.send(reply).await?;
            }
            Some(Ok(_)) => {
                framed
                    .send(Frame::error("ERR protocol error: expected array"))
                    .await?;
            }
        }
    }
}

/// Accept `:port` shorthand for an all-interfaces listen address.
pub fn listen_addr(addr: &str) -> String {
    if let Some(port) = addr.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        addr.to_string()
    }
}
