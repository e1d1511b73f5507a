//! Point-in-time snapshot file.
//!
//! Self-described binary dump of the whole keyspace: a magic tag, the
//! creation timestamp, then a count-prefixed sequence of typed entries with
//! absolute expirations. Hash fields and set members are written sorted so
//! the same keyspace always serializes to the same bytes. The format is
//! this project's own; it is not upstream-RDB compatible.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;

const MAGIC: &[u8; 6] = b"MYRDB1";

const TYPE_STRING: u8 = 1;
const TYPE_LIST: u8 = 2;
const TYPE_HASH: u8 = 3;
const TYPE_SET: u8 = 4;

/// Type-specific payload of one snapshot entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryData {
    Str(Vec<u8>),
    /// List elements, left to right.
    List(Vec<Vec<u8>>),
    Hash(Vec<(Vec<u8>, Vec<u8>)>),
    Set(Vec<Vec<u8>>),
}

/// One key in the snapshot. `expire_at_ms` of 0 means no expiry; any other
/// value is an absolute wall-clock instant in Unix milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub key: Vec<u8>,
    pub expire_at_ms: i64,
    pub data: EntryData,
}

/// Write `entries` to `path` atomically: tmp file, fsync, rename. On
/// platforms where rename cannot overwrite, the old file is removed first;
/// a failed save leaves the previous snapshot untouched.
pub fn save(path: &Path, entries: &[SnapshotEntry]) -> anyhow::Result<()> {
    anyhow::ensure!(!path.as_os_str().is_empty(), "empty rdb filename");
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).context("create rdb dir")?;
        }
    }

    let tmp = path.with_extension("rdb.tmp");
    let result = write_tmp(&tmp, entries, unix_time_ms());
    if let Err(err) = result {
        let _ = fs::remove_file(&tmp);
        return Err(err);
    }

    let _ = fs::remove_file(path);
    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(err).context("install rdb snapshot");
    }
    Ok(())
}

fn write_tmp(tmp: &Path, entries: &[SnapshotEntry], created_at_ms: i64) -> anyhow::Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(tmp)
        .context("open rdb temp file")?;
    let mut writer = BufWriter::with_capacity(256 * 1024, file);
    save_to_writer(&mut writer, entries, created_at_ms)?;
    writer.flush()?;
    writer.get_ref().sync_all().context("sync rdb temp file")?;
    Ok(())
}

/// Serialize `entries` to `w`. Entries are sorted by key and container
/// contents are sorted, so output bytes depend only on the keyspace and the
/// timestamp passed in.
pub fn save_to_writer(
    w: &mut impl Write,
    entries: &[SnapshotEntry],
    created_at_ms: i64,
) -> anyhow::Result<()> {
    let mut ordered: Vec<&SnapshotEntry> = entries.iter().collect();
    ordered.sort_by(|a, b| a.key.cmp(&b.key));

    w.write_all(MAGIC)?;
    write_i64(w, created_at_ms)?;
    write_u32(w, ordered.len() as u32)?;

    for entry in ordered {
        match &entry.data {
            EntryData::Str(b) => {
                w.write_all(&[TYPE_STRING])?;
                write_header(w, entry)?;
                write_bytes(w, b)?;
            }
            EntryData::List(items) => {
                w.write_all(&[TYPE_LIST])?;
                write_header(w, entry)?;
                write_u32(w, items.len() as u32)?;
                for item in items {
                    write_bytes(w, item)?;
                }
            }
            EntryData::Hash(fields) => {
                w.write_all(&[TYPE_HASH])?;
                write_header(w, entry)?;
                let mut sorted: Vec<&(Vec<u8>, Vec<u8>)> = fields.iter().collect();
                sorted.sort_by(|a, b| a.0.cmp(&b.0));
                write_u32(w, sorted.len() as u32)?;
                for (field, value) in sorted {
                    write_bytes(w, field)?;
                    write_bytes(w, value)?;
                }
            }
            EntryData::Set(members) => {
                w.write_all(&[TYPE_SET])?;
                write_header(w, entry)?;
                let mut sorted: Vec<&Vec<u8>> = members.iter().collect();
                sorted.sort();
                write_u32(w, sorted.len() as u32)?;
                for member in sorted {
                    write_bytes(w, member)?;
                }
            }
        }
    }
    Ok(())
}

fn write_header(w: &mut impl Write, entry: &SnapshotEntry) -> anyhow::Result<()> {
    write_bytes(w, &entry.key)?;
    write_i64(w, entry.expire_at_ms)?;
    Ok(())
}

/// Read a snapshot from `path`.
pub fn load(path: &Path) -> anyhow::Result<Vec<SnapshotEntry>> {
    let file = File::open(path).context("open rdb file")?;
    load_from_reader(&mut BufReader::with_capacity(256 * 1024, file))
}

/// Read a snapshot from `r`, validating the magic header.
pub fn load_from_reader(r: &mut impl Read) -> anyhow::Result<Vec<SnapshotEntry>> {
    let mut magic = [0u8; 6];
    r.read_exact(&mut magic).context("read rdb header")?;
    anyhow::ensure!(&magic == MAGIC, "invalid rdb header");

    let _created_at_ms = read_i64(r)?;
    let count = read_u32(r)?;

    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let tag = read_u8(r)?;
        let key = read_bytes(r)?;
        let expire_at_ms = read_i64(r)?;
        let data = match tag {
            TYPE_STRING => EntryData::Str(read_bytes(r)?),
            TYPE_LIST => {
                let n = read_u32(r)?;
                let mut items = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    items.push(read_bytes(r)?);
                }
                EntryData::List(items)
            }
            TYPE_HASH => {
                let n = read_u32(r)?;
                let mut fields = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    let field = read_bytes(r)?;
                    let value = read_bytes(r)?;
                    fields.push((field, value));
                }
                EntryData::Hash(fields)
            }
            TYPE_SET => {
                let n = read_u32(r)?;
                let mut members = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    members.push(read_bytes(r)?);
                }
                EntryData::Set(members)
            }
            other => anyhow::bail!("unknown rdb entry type {other}"),
        };
        entries.push(SnapshotEntry {
            key,
            expire_at_ms,
            data,
        });
    }
    Ok(entries)
}

pub fn unix_time_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn write_u32(w: &mut impl Write, v: u32) -> std::io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_i64(w: &mut impl Write, v: i64) -> std::io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_bytes(w: &mut impl Write, b: &[u8]) -> std::io::Result<()> {
    w.write_all(&(b.len() as u32).to_le_bytes())?;
    w.write_all(b)
}

fn read_u8(r: &mut impl Read) -> anyhow::Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf).context("rdb entry short u8")?;
    Ok(buf[0])
}

fn read_u32(r: &mut impl Read) -> anyhow::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf).context("rdb entry short u32")?;
    Ok(u32::from_le_bytes(buf))
}

fn read_i64(r: &mut impl Read) -> anyhow::Result<i64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf).context("rdb entry short i64")?;
    Ok(i64::from_le_bytes(buf))
}

fn read_bytes(r: &mut impl Read) -> anyhow::Result<Vec<u8>> {
    let n = read_u32(r)? as usize;
    let mut buf = vec![0u8; n];
    r.read_exact(&mut buf).context("rdb entry short payload")?;
    Ok(buf)
}
