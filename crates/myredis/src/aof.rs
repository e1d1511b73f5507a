//! Append-only command log.
//!
//! A dedicated appender thread owns the live file descriptor. Callers hand
//! it tasks over a bounded channel: serialized command payloads, rewrite
//! control transitions, and flush barriers. The thread fsyncs once per
//! second on its own clock; a flush barrier makes durability explicit so
//! tests and shutdown paths never wait on wall-clock timing.
//!
//! During a rewrite window every appended payload is mirrored into an
//! in-memory rewrite buffer. `finish_rewrite` replays that buffer onto the
//! freshly rewritten temp file and atomically installs it as the live log.
//! The install is remove-then-rename because rename cannot overwrite on
//! every platform; if the rename fails after the remove, the appender
//! reopens the live path so the log keeps accepting writes.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Context;

const TASK_QUEUE_DEPTH: usize = 1000;
const SYNC_INTERVAL: Duration = Duration::from_secs(1);

enum AofTask {
    /// Pre-serialized RESP array to append.
    Payload(Vec<u8>),
    StartRewrite(mpsc::Sender<anyhow::Result<()>>),
    AbortRewrite(mpsc::Sender<()>),
    FinishRewrite {
        tmp: PathBuf,
        done: mpsc::Sender<anyhow::Result<()>>,
    },
    Flush(mpsc::Sender<()>),
}

/// Handle to the appender thread. Cheap to share; all methods are safe to
/// call after `close` (they become no-ops or report the closed state).
pub struct Appender {
    path: PathBuf,
    tx: Mutex<Option<SyncSender<AofTask>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Appender {
    /// Open (or create) the log at `path` and start the appender thread.
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).context("create aof dir")?;
            }
        }
        let file = open_for_append(&path).context("open aof file")?;

        let (tx, rx) = mpsc::sync_channel(TASK_QUEUE_DEPTH);
        let worker_path = path.clone();
        let worker = thread::Builder::new()
            .name("aof-appender".to_string())
            .spawn(move || appender_loop(worker_path, file, rx))
            .context("spawn aof appender thread")?;

        Ok(Self {
            path,
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Enqueue one serialized command. Dropped silently once closed; write
    /// failures are the appender's to log, data loss is bounded by the
    /// fsync interval.
    pub fn append(&self, payload: Vec<u8>) {
        if let Some(tx) = self.sender() {
            let _ = tx.send(AofTask::Payload(payload));
        }
    }

    /// Enter rewrite mode. Fails if a rewrite is already in progress.
    pub fn start_rewrite(&self) -> anyhow::Result<()> {
        let (done_tx, done_rx) = mpsc::channel();
        self.submit(AofTask::StartRewrite(done_tx))?;
        done_rx.recv().context("aof appender stopped")?
    }

    /// Leave rewrite mode and discard the rewrite buffer.
    pub fn abort_rewrite(&self) -> anyhow::Result<()> {
        let (done_tx, done_rx) = mpsc::channel();
        self.submit(AofTask::AbortRewrite(done_tx))?;
        done_rx.recv().context("aof appender stopped")?;
        Ok(())
    }

    /// Concatenate the rewrite buffer onto `tmp`, fsync it, and install it
    /// as the live log.
    pub fn finish_rewrite(&self, tmp: PathBuf) -> anyhow::Result<()> {
        let (done_tx, done_rx) = mpsc::channel();
        self.submit(AofTask::FinishRewrite { tmp, done: done_tx })?;
        done_rx.recv().context("aof appender stopped")?
    }

    /// Durability barrier: returns once every payload enqueued before it is
    /// written and fsynced.
    pub fn flush(&self) -> anyhow::Result<()> {
        let (done_tx, done_rx) = mpsc::channel();
        self.submit(AofTask::Flush(done_tx))?;
        done_rx.recv().context("aof appender stopped")?;
        Ok(())
    }

    /// Stop the appender: drain queued tasks, final fsync, join the thread.
    /// Idempotent; concurrent callers block until the appender has stopped.
    pub fn close(&self) {
        let mut worker = self.worker.lock().unwrap();
        drop(self.tx.lock().unwrap().take());
        if let Some(worker) = worker.take() {
            let _ = worker.join();
        }
    }

    fn sender(&self) -> Option<SyncSender<AofTask>> {
        self.tx.lock().unwrap().clone()
    }

    fn submit(&self, task: AofTask) -> anyhow::Result<()> {
        let Some(tx) = self.sender() else {
            anyhow::bail!("aof appender closed");
        };
        tx.send(task).map_err(|_| anyhow::anyhow!("aof appender stopped"))
    }
}

impl Drop for Appender {
    fn drop(&mut self) {
        self.close();
    }
}

fn open_for_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn appender_loop(live_path: PathBuf, file: File, rx: mpsc::Receiver<AofTask>) {
    let mut file = Some(file);
    let mut rewriting = false;
    let mut rewrite_buf: Vec<Vec<u8>> = Vec::new();
    let mut next_sync = Instant::now() + SYNC_INTERVAL;

    loop {
        let now = Instant::now();
        if now >= next_sync {
            sync_live(&file);
            next_sync = now + SYNC_INTERVAL;
        }

        let wait = next_sync.saturating_duration_since(Instant::now());
        let task = match rx.recv_timeout(wait) {
            Ok(task) => task,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        match task {
            AofTask::Payload(data) => {
                match file.as_mut() {
                    Some(f) => {
                        if let Err(err) = f.write_all(&data) {
                            tracing::warn!(error = ?err, "aof write failed");
                        }
                    }
                    None => tracing::warn!("aof payload dropped: live file unavailable"),
                }
                if rewriting {
                    rewrite_buf.push(data);
                }
            }
            AofTask::StartRewrite(done) => {
                let res = if rewriting {
                    Err(anyhow::anyhow!("rewrite already in progress"))
                } else {
                    rewriting = true;
                    rewrite_buf.clear();
                    Ok(())
                };
                let _ = done.send(res);
            }
            AofTask::AbortRewrite(done) => {
                rewriting = false;
                rewrite_buf.clear();
                let _ = done.send(());
            }
            AofTask::FinishRewrite { tmp, done } => {
                let res = if rewriting {
                    install_rewrite(&mut file, &live_path, &tmp, &rewrite_buf)
                } else {
                    Err(anyhow::anyhow!("rewrite not started"))
                };
                if res.is_ok() {
                    rewriting = false;
                    rewrite_buf.clear();
                }
                let _ = done.send(res);
            }
            AofTask::Flush(done) => {
                sync_live(&file);
                let _ = done.send(());
            }
        }
    }

    sync_live(&file);
}

fn sync_live(file: &Option<File>) {
    if let Some(f) = file {
        if let Err(err) = f.sync_all() {
            tracing::warn!(error = ?err, "aof fsync failed");
        }
    }
}

/// Append the rewrite buffer to `tmp`, fsync it, then swap it in as the
/// live log and reopen the live descriptor.
fn install_rewrite(
    file: &mut Option<File>,
    live: &Path,
    tmp: &Path,
    rewrite_buf: &[Vec<u8>],
) -> anyhow::Result<()> {
    anyhow::ensure!(!tmp.as_os_str().is_empty(), "empty rewrite tmp filename");

    {
        let mut tmp_file = OpenOptions::new()
            .append(true)
            .open(tmp)
            .context("open rewrite tmp file")?;
        for data in rewrite_buf {
            tmp_file.write_all(data).context("append rewrite buffer")?;
        }
        tmp_file.sync_all().context("sync rewrite tmp file")?;
    }

    // Close the live descriptor before the swap; rename cannot overwrite an
    // open target everywhere.
    if let Some(f) = file.take() {
        let _ = f.sync_all();
    }
    let _ = fs::remove_file(live);
    if let Err(err) = fs::rename(tmp, live) {
        // Recover a usable descriptor on the expected live path; data already
        // durable on tmp may be lost, which the caller surfaces as an error.
        match open_for_append(live) {
            Ok(f) => *file = Some(f),
            Err(reopen_err) => {
                tracing::error!(error = ?reopen_err, "aof reopen after failed install");
            }
        }
        return Err(err).context("install rewritten aof");
    }

    *file = Some(open_for_append(live).context("reopen aof after install")?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resp::encode_array;

    fn argv(parts: &[&str]) -> Vec<Vec<u8>> {
        parts.iter().map(|p| p.as_bytes().to_vec()).collect()
    }

    #[test]
    fn append_then_flush_is_durable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.aof");
        let appender = Appender::open(&path).unwrap();

        appender.append(encode_array(&argv(&["SET", "k", "v"])));
        appender.append(encode_array(&argv(&["DEL", "k"])));
        appender.flush().unwrap();

        let data = fs::read(&path).unwrap();
        let mut expected = encode_array(&argv(&["SET", "k", "v"]));
        expected.extend_from_slice(&encode_array(&argv(&["DEL", "k"])));
        assert_eq!(data, expected);
        appender.close();
    }

    #[test]
    fn close_drains_queued_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.aof");
        let appender = Appender::open(&path).unwrap();
        for i in 0..100 {
            appender.append(encode_array(&argv(&["SET", &format!("k{i}"), "v"])));
        }
        appender.close();
        let data = fs::read(&path).unwrap();
        assert!(data.ends_with(&encode_array(&argv(&["SET", "k99", "v"]))));
    }

    #[test]
    fn finish_rewrite_installs_tmp_plus_buffered_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.aof");
        let appender = Appender::open(&path).unwrap();

        appender.append(encode_array(&argv(&["SET", "old", "1"])));
        appender.start_rewrite().unwrap();
        // Accepted during the window: lands on the live file and in the
        // rewrite buffer.
        appender.append(encode_array(&argv(&["SET", "during", "2"])));

        let tmp = dir.path().join("node.aof.rewrite.tmp");
        fs::write(&tmp, encode_array(&argv(&["SET", "base", "0"]))).unwrap();
        appender.finish_rewrite(tmp.clone()).unwrap();

        let mut expected = encode_array(&argv(&["SET", "base", "0"]));
        expected.extend_from_slice(&encode_array(&argv(&["SET", "during", "2"])));
        appender.flush().unwrap();
        assert_eq!(fs::read(&path).unwrap(), expected);
        assert!(!tmp.exists());

        // The reopened live file keeps accepting appends.
        appender.append(encode_array(&argv(&["SET", "after", "3"])));
        appender.flush().unwrap();
        expected.extend_from_slice(&encode_array(&argv(&["SET", "after", "3"])));
        assert_eq!(fs::read(&path).unwrap(), expected);
        appender.close();
    }

    #[test]
    fn second_start_rewrite_fails() {
        let dir = tempfile::tempdir().unwrap();
        let appender = Appender::open(dir.path().join("node.aof")).unwrap();
        appender.start_rewrite().unwrap();
        assert!(appender.start_rewrite().is_err());
        appender.abort_rewrite().unwrap();
        // After an abort the window can be reopened.
        appender.start_rewrite().unwrap();
        appender.close();
    }

    #[test]
    fn finish_without_start_fails() {
        let dir = tempfile::tempdir().unwrap();
        let appender = Appender::open(dir.path().join("node.aof")).unwrap();
        let tmp = dir.path().join("node.aof.tmp");
        fs::write(&tmp, b"").unwrap();
        assert!(appender.finish_rewrite(tmp).is_err());
        appender.close();
    }

    #[test]
    fn operations_after_close_report_closed() {
        let dir = tempfile::tempdir().unwrap();
        let appender = Appender::open(dir.path().join("node.aof")).unwrap();
        appender.close();
        appender.append(encode_array(&argv(&["SET", "k", "v"])));
        assert!(appender.flush().is_err());
        assert!(appender.start_rewrite().is_err());
    }
}
