//! Snapshot and append-log admin commands: SAVE / BGSAVE / REWRITEAOF /
//! BGREWRITEAOF.
//!
//! Background variants take their deep-copy snapshot inside the executor,
//! then hand pure file I/O to a worker thread. The rewrite worker posts its
//! result back into the executor's queue, so the install step and the
//! `aof_rewriting` flag stay executor-serialized.

use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

use anyhow::Context;

use crate::rdb::{self, EntryData, SnapshotEntry};

use super::*;

/// Element batch size for container reconstruction commands.
const REWRITE_BATCH: usize = 512;

impl DbState {
    /// SAVE: synchronous snapshot write; blocks the executor.
    pub(super) fn save(&mut self) -> Frame {
        let Some(path) = self.rdb_path.clone() else {
            return Frame::error("ERR rdb is disabled (use --rdb to enable)");
        };
        let entries = self.snapshot_entries();
        match rdb::save(&path, &entries) {
            Ok(()) => Frame::ok(),
            Err(err) => Frame::error(format!("ERR rdb save failed: {err:#}")),
        }
    }

    /// BGSAVE: snapshot inside the executor, file write on a worker. A
    /// second BGSAVE while one runs is refused.
    pub(super) fn bgsave(&mut self) -> Frame {
        let Some(path) = self.rdb_path.clone() else {
            return Frame::error("ERR rdb is disabled (use --rdb to enable)");
        };
        if self
            .rdb_saving
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Frame::error("ERR Background save already in progress");
        }

        let entries = self.snapshot_entries();
        let saving = Arc::clone(&self.rdb_saving);
        let _ = thread::Builder::new()
            .name("rdb-save".to_string())
            .spawn(move || {
                if let Err(err) = rdb::save(&path, &entries) {
                    tracing::error!(error = ?err, path = %path.display(), "background rdb save failed");
                }
                saving.store(false, Ordering::SeqCst);
            });
        Frame::Status("Background saving started".to_string())
    }

    /// REWRITEAOF: synchronous rewrite. Start the rewrite window, snapshot,
    /// materialize reconstruction commands into a temp file, install it.
    pub(super) fn rewrite_aof(&mut self) -> Frame {
        let Some(aof) = self.aof.clone() else {
            return Frame::error("ERR aof is disabled");
        };
        if self.aof_rewriting {
            return Frame::error("ERR Background append only file rewriting already in progress");
        }
        self.aof_rewriting = true;

        let res = (|| {
            if let Err(err) = aof.start_rewrite() {
                return Frame::error(format!("ERR start rewrite failed: {err:#}"));
            }
            let entries = self.snapshot_entries();
            let tmp = rewrite_tmp_path(aof.path());
            if let Err(err) = write_aof_from_snapshot(&tmp, &entries) {
                let _ = aof.abort_rewrite();
                let _ = fs::remove_file(&tmp);
                return Frame::error(format!("ERR rewrite write failed: {err:#}"));
            }
            if let Err(err) = aof.finish_rewrite(tmp.clone()) {
                let _ = aof.abort_rewrite();
                let _ = fs::remove_file(&tmp);
                return Frame::error(format!("ERR rewrite finish failed: {err:#}"));
            }
            Frame::ok()
        })();

        self.aof_rewriting = false;
        res
    }

    /// BGREWRITEAOF: start the window and snapshot synchronously, write the
    /// temp file on a worker, install when the worker's result arrives back
    /// through the executor queue.
    pub(super) fn bg_rewrite_aof(&mut self) -> Frame {
        let Some(aof) = self.aof.clone() else {
            return Frame::error("ERR aof is disabled");
        };
        if self.aof_rewriting {
            return Frame::error("ERR Background append only file rewriting already in progress");
        }
        self.aof_rewriting = true;

        if let Err(err) = aof.start_rewrite() {
            self.aof_rewriting = false;
            return Frame::error(format!("ERR start rewrite failed: {err:#}"));
        }

        let entries = self.snapshot_entries();
        let tmp = rewrite_tmp_path(aof.path());
        let tx = self.tx.clone();
        let _ = thread::Builder::new()
            .name("aof-rewrite".to_string())
            .spawn(move || {
                let result = write_aof_from_snapshot(&tmp, &entries);
                let task: Task = Box::new(move |state| {
                    state.handle_rewrite_done(tmp, result);
                    Frame::ok()
                });
                let _ = tx.send(Request::Task { task, reply: None });
            });
        Frame::Status("Background append only file rewriting started".to_string())
    }

    /// Install step for a background rewrite, run on the executor.
    fn handle_rewrite_done(&mut self, tmp: PathBuf, result: anyhow::Result<()>) {
        if !self.aof_rewriting {
            let _ = fs::remove_file(&tmp);
            return;
        }
        let Some(aof) = self.aof.clone() else {
            self.aof_rewriting = false;
            let _ = fs::remove_file(&tmp);
            return;
        };

        let install = match result {
            Ok(()) => aof.finish_rewrite(tmp.clone()),
            Err(err) => Err(err),
        };
        if let Err(err) = install {
            tracing::warn!(error = ?err, "background aof rewrite failed");
            let _ = aof.abort_rewrite();
            let _ = fs::remove_file(&tmp);
        }
        self.aof_rewriting = false;
    }
}

fn rewrite_tmp_path(aof_path: &Path) -> PathBuf {
    let dir = aof_path.parent().unwrap_or_else(|| Path::new("."));
    let base = aof_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "aof".to_string());
    dir.join(format!(".{}.rewrite.{}.tmp", base, now_ms()))
}

/// Write the minimal command sequence that reconstructs `entries` into
/// `tmp`, fsynced. Entries are emitted in key order and containers are
/// rebuilt in sorted batches so the output is stable.
fn write_aof_from_snapshot(tmp: &Path, entries: &[SnapshotEntry]) -> anyhow::Result<()> {
    anyhow::ensure!(!tmp.as_os_str().is_empty(), "empty rewrite tmp filename");
    if let Some(parent) = tmp.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).context("create rewrite dir")?;
        }
    }

    let file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(tmp)
        .context("open rewrite tmp file")?;
    let mut writer = BufWriter::with_capacity(256 * 1024, file);

    let mut ordered: Vec<&SnapshotEntry> = entries.iter().collect();
    ordered.sort_by(|a, b| a.key.cmp(&b.key));

    for entry in ordered {
        for cmd in entry_to_commands(entry) {
            writer.write_all(&encode_array(&cmd))?;
        }
    }

    writer.flush()?;
    writer.get_ref().sync_all().context("sync rewrite tmp file")?;
    Ok(())
}

/// Reconstruction commands for one entry: the value-building command(s)
/// followed by `PEXPIREAT` when the key carries an expiry.
fn entry_to_commands(entry: &SnapshotEntry) -> Vec<Vec<Vec<u8>>> {
    let key = entry.key.clone();
    let mut out = Vec::new();

    match &entry.data {
        EntryData::Str(b) => {
            out.push(vec![b"SET".to_vec(), key.clone(), b.clone()]);
        }
        EntryData::List(items) => {
            // RPUSH left-to-right preserves order.
            for chunk in items.chunks(REWRITE_BATCH) {
                let mut cmd = Vec::with_capacity(2 + chunk.len());
                cmd.push(b"RPUSH".to_vec());
                cmd.push(key.clone());
                cmd.extend(chunk.iter().cloned());
                out.push(cmd);
            }
        }
        EntryData::Hash(fields) => {
            let mut sorted: Vec<&(Vec<u8>, Vec<u8>)> = fields.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(&b.0));
            for chunk in sorted.chunks(REWRITE_BATCH) {
                let mut cmd = Vec::with_capacity(2 + chunk.len() * 2);
                cmd.push(b"HSET".to_vec());
                cmd.push(key.clone());
                for (field, value) in chunk {
                    cmd.push(field.clone());
                    cmd.push(value.clone());
                }
                out.push(cmd);
            }
        }
        EntryData::Set(members) => {
            let mut sorted: Vec<&Vec<u8>> = members.iter().collect();
            sorted.sort();
            for chunk in sorted.chunks(REWRITE_BATCH) {
                let mut cmd = Vec::with_capacity(2 + chunk.len());
                cmd.push(b"SADD".to_vec());
                cmd.push(key.clone());
                cmd.extend(chunk.iter().map(|m| (*m).clone()));
                out.push(cmd);
            }
        }
    }

    if entry.expire_at_ms > 0 {
        out.push(vec![
            b"PEXPIREAT".to_vec(),
            key,
            entry.expire_at_ms.to_string().into_bytes(),
        ]);
    }
    out
}
