//! Restart scenarios: append-log replay, eviction durability, absolute
//! TTLs, rewrite compaction, and snapshot recovery.

use std::time::Duration;

use myredis::{Db, DbConfig, EvictionPolicy, Frame};

fn argv(parts: &[&str]) -> Vec<Vec<u8>> {
    parts.iter().map(|p| p.as_bytes().to_vec()).collect()
}

fn bulk(s: &str) -> Frame {
    Frame::Bulk(Some(s.as_bytes().to_vec()))
}

async fn run(db: &Db, parts: &[&str]) -> Frame {
    db.exec(argv(parts)).await
}

#[tokio::test]
async fn eviction_does_not_resurrect_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let aof = dir.path().join("node.aof");

    // First run: a tiny budget forces k1 out when k2 arrives
    // (each entry charges key 2 + value 10 = 12 bytes, 24 > 20).
    let db1 = Db::new(DbConfig {
        aof_path: Some(aof.clone()),
        max_bytes: 20,
        ..DbConfig::default()
    })
    .unwrap();
    assert_eq!(run(&db1, &["SET", "k1", "0123456789"]).await, Frame::ok());
    assert_eq!(run(&db1, &["SET", "k2", "abcdefghij"]).await, Frame::ok());
    db1.flush_aof().unwrap();
    db1.close();

    let data = std::fs::read(&aof).unwrap();
    assert!(
        data.windows(b"\r\n$3\r\nDEL\r\n".len())
            .any(|w| w == b"\r\n$3\r\nDEL\r\n"),
        "expected a DEL record for the evicted key, got {:?}",
        String::from_utf8_lossy(&data)
    );

    // Second run with the default budget: the evicted key must stay gone.
    let db2 = Db::new(DbConfig {
        aof_path: Some(aof),
        ..DbConfig::default()
    })
    .unwrap();
    db2.load().await.unwrap();
    assert_eq!(run(&db2, &["GET", "k1"]).await, Frame::null_bulk());
    assert_eq!(run(&db2, &["GET", "k2"]).await, bulk("abcdefghij"));
    db2.close();
}

#[tokio::test]
async fn expire_is_replayed_as_absolute_instant() {
    let dir = tempfile::tempdir().unwrap();
    let aof = dir.path().join("node.aof");

    let db1 = Db::new(DbConfig {
        aof_path: Some(aof.clone()),
        ..DbConfig::default()
    })
    .unwrap();
    run(&db1, &["SET", "keep", "v"]).await;
    assert_eq!(run(&db1, &["EXPIRE", "keep", "100"]).await, Frame::Integer(1));
    run(&db1, &["SET", "short", "v"]).await;
    assert_eq!(run(&db1, &["EXPIRE", "short", "1"]).await, Frame::Integer(1));
    db1.flush_aof().unwrap();
    db1.close();

    // The log must carry PEXPIREAT, never the relative EXPIRE.
    let data = std::fs::read(&aof).unwrap();
    let text = String::from_utf8_lossy(&data);
    assert!(text.contains("PEXPIREAT"));
    assert!(!text.contains("EXPIRE\r\n"));

    tokio::time::sleep(Duration::from_millis(1100)).await;

    let db2 = Db::new(DbConfig {
        aof_path: Some(aof),
        ..DbConfig::default()
    })
    .unwrap();
    db2.load().await.unwrap();
    // `short` expired across the restart; `keep` kept a shrunken TTL.
    assert_eq!(run(&db2, &["GET", "short"]).await, Frame::null_bulk());
    assert_eq!(run(&db2, &["GET", "keep"]).await, bulk("v"));
    let Frame::Integer(ttl) = run(&db2, &["TTL", "keep"]).await else {
        panic!("expected integer ttl");
    };
    assert!(ttl > 0 && ttl <= 99, "ttl must not be extended, got {ttl}");
    db2.close();
}

#[tokio::test]
async fn expire_with_nonpositive_seconds_logs_a_delete() {
    let dir = tempfile::tempdir().unwrap();
    let aof = dir.path().join("node.aof");

    let db1 = Db::new(DbConfig {
        aof_path: Some(aof.clone()),
        ..DbConfig::default()
    })
    .unwrap();
    run(&db1, &["SET", "gone", "v"]).await;
    assert_eq!(run(&db1, &["EXPIRE", "gone", "0"]).await, Frame::Integer(1));
    db1.flush_aof().unwrap();
    db1.close();

    let db2 = Db::new(DbConfig {
        aof_path: Some(aof),
        ..DbConfig::default()
    })
    .unwrap();
    db2.load().await.unwrap();
    assert_eq!(run(&db2, &["GET", "gone"]).await, Frame::null_bulk());
    db2.close();
}

#[tokio::test]
async fn persist_survives_restart_only_on_success() {
    let dir = tempfile::tempdir().unwrap();
    let aof = dir.path().join("node.aof");

    let db1 = Db::new(DbConfig {
        aof_path: Some(aof.clone()),
        ..DbConfig::default()
    })
    .unwrap();
    run(&db1, &["SET", "k", "v"]).await;
    run(&db1, &["EXPIRE", "k", "100"]).await;
    assert_eq!(run(&db1, &["PERSIST", "k"]).await, Frame::Integer(1));
    db1.flush_aof().unwrap();
    db1.close();

    let db2 = Db::new(DbConfig {
        aof_path: Some(aof),
        ..DbConfig::default()
    })
    .unwrap();
    db2.load().await.unwrap();
    assert_eq!(run(&db2, &["TTL", "k"]).await, Frame::Integer(-1));
    db2.close();
}

#[tokio::test]
async fn rewriteaof_compacts_while_preserving_state() {
    let dir = tempfile::tempdir().unwrap();
    let aof = dir.path().join("node.aof");

    let db1 = Db::new(DbConfig {
        aof_path: Some(aof.clone()),
        ..DbConfig::default()
    })
    .unwrap();
    // Churn that a rewrite should collapse.
    for i in 0..20 {
        run(&db1, &["SET", "counter", &i.to_string()]).await;
    }
    run(&db1, &["RPUSH", "l", "x", "y"]).await;
    run(&db1, &["HSET", "h", "f", "v"]).await;
    run(&db1, &["SADD", "s", "m1", "m2"]).await;
    run(&db1, &["SET", "dropped", "v"]).await;
    run(&db1, &["DEL", "dropped"]).await;
    db1.flush_aof().unwrap();
    let before = std::fs::read(&aof).unwrap().len();

    assert_eq!(run(&db1, &["REWRITEAOF"]).await, Frame::ok());
    db1.close();

    let after = std::fs::read(&aof).unwrap().len();
    assert!(after < before, "rewrite should shrink the log: {after} >= {before}");

    let db2 = Db::new(DbConfig {
        aof_path: Some(aof),
        ..DbConfig::default()
    })
    .unwrap();
    db2.load().await.unwrap();
    assert_eq!(run(&db2, &["GET", "counter"]).await, bulk("19"));
    assert_eq!(
        run(&db2, &["LRANGE", "l", "0", "-1"]).await,
        Frame::Array(Some(vec![b"x".to_vec(), b"y".to_vec()]))
    );
    assert_eq!(run(&db2, &["HGET", "h", "f"]).await, bulk("v"));
    assert_eq!(run(&db2, &["SCARD", "s"]).await, Frame::Integer(2));
    assert_eq!(run(&db2, &["GET", "dropped"]).await, Frame::null_bulk());
    db2.close();
}

#[tokio::test]
async fn bgrewriteaof_keeps_writes_accepted_during_the_window() {
    let dir = tempfile::tempdir().unwrap();
    let aof = dir.path().join("node.aof");

    let db1 = Db::new(DbConfig {
        aof_path: Some(aof.clone()),
        ..DbConfig::default()
    })
    .unwrap();
    run(&db1, &["SET", "base", "v"]).await;
    let Frame::Status(status) = run(&db1, &["BGREWRITEAOF"]).await else {
        panic!("expected status reply");
    };
    assert_eq!(status, "Background append only file rewriting started");
    // Writes racing the background rewrite must survive the install.
    run(&db1, &["SET", "during", "w"]).await;

    // A synchronous rewrite can only start once the background one has
    // installed; poll it as a completion barrier.
    let mut settled = false;
    for _ in 0..100 {
        if run(&db1, &["REWRITEAOF"]).await == Frame::ok() {
            settled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(settled, "background rewrite never completed");
    db1.close();

    let db2 = Db::new(DbConfig {
        aof_path: Some(aof),
        ..DbConfig::default()
    })
    .unwrap();
    db2.load().await.unwrap();
    assert_eq!(run(&db2, &["GET", "base"]).await, bulk("v"));
    assert_eq!(run(&db2, &["GET", "during"]).await, bulk("w"));
    db2.close();
}

#[tokio::test]
async fn snapshot_save_and_load_with_absolute_ttl() {
    let dir = tempfile::tempdir().unwrap();
    let rdb = dir.path().join("node.rdb");

    let db1 = Db::new(DbConfig {
        rdb_path: Some(rdb.clone()),
        eviction: EvictionPolicy::Lfu,
        ..DbConfig::default()
    })
    .unwrap();
    run(&db1, &["SET", "k1", "v1"]).await;
    run(&db1, &["LPUSH", "l1", "a", "b", "c"]).await;
    run(&db1, &["HSET", "h1", "f1", "v1", "f2", "v2"]).await;
    run(&db1, &["SADD", "s1", "m1", "m2", "m3"]).await;

    run(&db1, &["SET", "expiring", "v"]).await;
    run(&db1, &["SET", "live", "v"]).await;
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64;
    run(&db1, &["PEXPIREAT", "expiring", &(now + 500).to_string()]).await;
    run(&db1, &["PEXPIREAT", "live", &(now + 3000).to_string()]).await;

    assert_eq!(run(&db1, &["SAVE"]).await, Frame::ok());
    db1.close();

    tokio::time::sleep(Duration::from_millis(700)).await;

    let db2 = Db::new(DbConfig {
        rdb_path: Some(rdb),
        ..DbConfig::default()
    })
    .unwrap();
    db2.load().await.unwrap();

    assert_eq!(run(&db2, &["GET", "k1"]).await, bulk("v1"));
    assert_eq!(
        run(&db2, &["LRANGE", "l1", "0", "-1"]).await,
        Frame::Array(Some(vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]))
    );
    assert_eq!(run(&db2, &["HGET", "h1", "f2"]).await, bulk("v2"));
    assert_eq!(run(&db2, &["SCARD", "s1"]).await, Frame::Integer(3));

    // The short-lived key expired across the restart; the surviving one
    // kept its absolute deadline.
    assert_eq!(run(&db2, &["GET", "expiring"]).await, Frame::null_bulk());
    assert_eq!(run(&db2, &["GET", "live"]).await, bulk("v"));
    let Frame::Integer(ttl) = run(&db2, &["TTL", "live"]).await else {
        panic!("expected integer ttl");
    };
    assert!((0..=2).contains(&ttl), "ttl must shrink across restart, got {ttl}");
    db2.close();
}

#[tokio::test]
async fn snapshot_plus_log_layered_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let aof = dir.path().join("node.aof");
    let rdb = dir.path().join("node.rdb");

    let db1 = Db::new(DbConfig {
        aof_path: Some(aof.clone()),
        rdb_path: Some(rdb.clone()),
        ..DbConfig::default()
    })
    .unwrap();
    run(&db1, &["SET", "in-snapshot", "1"]).await;
    assert_eq!(run(&db1, &["SAVE"]).await, Frame::ok());
    // Arrives after the snapshot: only the log has it.
    run(&db1, &["SET", "in-log-only", "2"]).await;
    db1.flush_aof().unwrap();
    db1.close();

    let db2 = Db::new(DbConfig {
        aof_path: Some(aof),
        rdb_path: Some(rdb),
        ..DbConfig::default()
    })
    .unwrap();
    db2.load().await.unwrap();
    assert_eq!(run(&db2, &["GET", "in-snapshot"]).await, bulk("1"));
    assert_eq!(run(&db2, &["GET", "in-log-only"]).await, bulk("2"));
    db2.close();
}

#[tokio::test]
async fn corrupt_log_fails_the_boot() {
    let dir = tempfile::tempdir().unwrap();
    let aof = dir.path().join("node.aof");

    let db1 = Db::new(DbConfig {
        aof_path: Some(aof.clone()),
        ..DbConfig::default()
    })
    .unwrap();
    run(&db1, &["SET", "k", "v"]).await;
    db1.flush_aof().unwrap();
    db1.close();

    // Truncate mid-frame.
    let mut data = std::fs::read(&aof).unwrap();
    data.truncate(data.len() - 3);
    std::fs::write(&aof, data).unwrap();

    let db2 = Db::new(DbConfig {
        aof_path: Some(aof),
        ..DbConfig::default()
    })
    .unwrap();
    assert!(db2.load().await.is_err());
    db2.close();
}
