//! Integration tests: the engine surface end to end, including reopen
//! recovery, expiry, rotation + GC and discard accounting.

use std::time::Duration;

use tempfile::TempDir;

use barrel_core::{BarrelEngine, BarrelError, DataType, IndexMode, IoType, Options};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn open(dir: &TempDir) -> std::sync::Arc<BarrelEngine> {
    BarrelEngine::open(Options::new(dir.path())).unwrap()
}

// ---------------------------------------------------------------------------
// Persistence across reopen
// ---------------------------------------------------------------------------

#[test]
fn test_set_get_survives_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let engine = open(&dir);
        engine.set(b"a", b"1").unwrap();
        engine.set(b"a", b"2").unwrap();
        assert_eq!(engine.get(b"a").unwrap(), b"2");
        engine.close().unwrap();
    }
    let engine = open(&dir);
    assert_eq!(engine.get(b"a").unwrap(), b"2");
    engine.close().unwrap();
}

#[test]
fn test_tombstone_survives_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let engine = open(&dir);
        engine.set(b"k", b"v").unwrap();
        engine.delete(b"k").unwrap();
        assert!(matches!(engine.get(b"k"), Err(BarrelError::KeyNotFound)));
        engine.close().unwrap();
    }
    let engine = open(&dir);
    assert!(matches!(engine.get(b"k"), Err(BarrelError::KeyNotFound)));
    engine.close().unwrap();
}

#[test]
fn test_all_types_survive_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let engine = open(&dir);
        engine.set(b"str", b"value").unwrap();
        engine.rpush(b"list", &[b"a", b"b"]).unwrap();
        engine.hset(b"hash", b"field", b"hv").unwrap();
        engine.sadd(b"set", &[b"m1", b"m2"]).unwrap();
        engine.zadd(b"zset", 2.0, b"two").unwrap();
        engine.zadd(b"zset", 1.0, b"one").unwrap();
        engine.close().unwrap();
    }
    let engine = open(&dir);
    assert_eq!(engine.get(b"str").unwrap(), b"value");
    assert_eq!(
        engine.lrange(b"list", 0, -1).unwrap(),
        vec![b"a".to_vec(), b"b".to_vec()]
    );
    assert_eq!(engine.hget(b"hash", b"field").unwrap(), b"hv");
    assert!(engine.sis_member(b"set", b"m1").unwrap());
    assert_eq!(engine.scard(b"set").unwrap(), 2);
    assert_eq!(engine.zscore(b"zset", b"one").unwrap(), Some(1.0));
    assert_eq!(
        engine.zrange(b"zset", 0, -1).unwrap(),
        vec![b"one".to_vec(), b"two".to_vec()]
    );
    engine.close().unwrap();
}

#[test]
fn test_list_pops_survive_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let engine = open(&dir);
        engine.rpush(b"l", &[b"a", b"b", b"c"]).unwrap();
        assert_eq!(engine.lpop(b"l").unwrap(), Some(b"a".to_vec()));
        engine.close().unwrap();
    }
    let engine = open(&dir);
    assert_eq!(engine.llen(b"l").unwrap(), 2);
    assert_eq!(
        engine.lrange(b"l", 0, -1).unwrap(),
        vec![b"b".to_vec(), b"c".to_vec()]
    );
    engine.close().unwrap();
}

#[test]
fn test_mmap_backend_roundtrip() {
    let dir = TempDir::new().unwrap();
    let mut opts = Options::new(dir.path());
    opts.io_type = IoType::Mmap;
    opts.log_file_size_threshold = 64 * 1024;
    {
        let engine = BarrelEngine::open(opts.clone()).unwrap();
        engine.set(b"mapped", b"value").unwrap();
        engine.rpush(b"l", &[b"x"]).unwrap();
        engine.close().unwrap();
    }
    let engine = BarrelEngine::open(opts).unwrap();
    assert_eq!(engine.get(b"mapped").unwrap(), b"value");
    assert_eq!(engine.lpop(b"l").unwrap(), Some(b"x".to_vec()));
    engine.close().unwrap();
}

#[test]
fn test_key_value_mem_mode() {
    let dir = TempDir::new().unwrap();
    let mut opts = Options::new(dir.path());
    opts.index_mode = IndexMode::KeyValueMem;
    {
        let engine = BarrelEngine::open(opts.clone()).unwrap();
        engine.set(b"inline", b"kept in memory").unwrap();
        engine.close().unwrap();
    }
    let engine = BarrelEngine::open(opts).unwrap();
    assert_eq!(engine.get(b"inline").unwrap(), b"kept in memory");
    engine.close().unwrap();
}

// ---------------------------------------------------------------------------
// Expiry
// ---------------------------------------------------------------------------

#[test]
fn test_set_ex_expires() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    engine.set_ex(b"ttl", b"v", Duration::from_secs(1)).unwrap();
    assert_eq!(engine.get(b"ttl").unwrap(), b"v");

    std::thread::sleep(Duration::from_secs(2));
    assert!(matches!(engine.get(b"ttl"), Err(BarrelError::KeyNotFound)));
    engine.close().unwrap();
}

#[test]
fn test_expired_key_absent_after_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let engine = open(&dir);
        engine.set_ex(b"ttl", b"v", Duration::from_secs(1)).unwrap();
        engine.close().unwrap();
    }
    std::thread::sleep(Duration::from_secs(2));
    let engine = open(&dir);
    assert!(matches!(engine.get(b"ttl"), Err(BarrelError::KeyNotFound)));
    engine.close().unwrap();
}

// ---------------------------------------------------------------------------
// Rotation, GC and discard accounting
// ---------------------------------------------------------------------------

#[test]
fn test_rotation_and_gc_preserve_live_data() {
    let dir = TempDir::new().unwrap();
    let mut opts = Options::new(dir.path());
    opts.log_file_size_threshold = 1024;
    let engine = BarrelEngine::open(opts).unwrap();

    // 100 distinct keys with 64-byte values spread over many 1 KiB files,
    // then overwrite the first half to create dead bytes.
    for i in 0..100 {
        let key = format!("k{:03}", i);
        engine.set(key.as_bytes(), &[b'x'; 64]).unwrap();
    }
    for i in 0..50 {
        let key = format!("k{:03}", i);
        engine.set(key.as_bytes(), &[b'y'; 64]).unwrap();
    }

    // Let the discard consumer drain, then collect.
    std::thread::sleep(Duration::from_millis(300));
    engine.run_log_file_gc(DataType::String, 0, 0.1).unwrap();

    for i in 0..100 {
        let key = format!("k{:03}", i);
        let expected = if i < 50 { vec![b'y'; 64] } else { vec![b'x'; 64] };
        assert_eq!(engine.get(key.as_bytes()).unwrap(), expected, "key {}", i);
    }
    engine.close().unwrap();

    // And everything still reads back after a reopen.
    let engine = open(&dir);
    for i in 0..100 {
        let key = format!("k{:03}", i);
        let expected = if i < 50 { vec![b'y'; 64] } else { vec![b'x'; 64] };
        assert_eq!(engine.get(key.as_bytes()).unwrap(), expected, "key {}", i);
    }
    engine.close().unwrap();
}

#[test]
fn test_discard_table_flags_churned_file() {
    let dir = TempDir::new().unwrap();
    let mut opts = Options::new(dir.path());
    // Small cap so 100 overwrites of one key dominate a single file: each
    // entry is ~22 bytes, so 99 dead entries put the file past half dead.
    opts.log_file_size_threshold = 4096;
    let engine = BarrelEngine::open(opts).unwrap();

    for i in 0..100 {
        let value = format!("value-{:03}", i);
        engine.set(b"churn", value.as_bytes()).unwrap();
    }

    // 99 of 100 entries are dead; the file must show up as a candidate
    // once the channel drains.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    loop {
        let ccl = engine.discard_candidates(DataType::String, 0, 0.5).unwrap();
        if ccl == vec![0] {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "discard accounting never flagged the churned file"
        );
        std::thread::sleep(Duration::from_millis(20));
    }
    engine.close().unwrap();
}

#[test]
fn test_explicit_gc_rejects_concurrent_run() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    engine.set(b"k", b"v").unwrap();
    // Two runs in sequence are fine; the flag must not stick.
    engine.run_log_file_gc(DataType::String, 0, 0.9).unwrap();
    engine.run_log_file_gc(DataType::String, 0, 0.9).unwrap();
    engine.close().unwrap();
}

// ---------------------------------------------------------------------------
// Directory lock
// ---------------------------------------------------------------------------

#[test]
fn test_concurrent_open_rejected() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    assert!(BarrelEngine::open(Options::new(dir.path())).is_err());
    engine.close().unwrap();
}

// ---------------------------------------------------------------------------
// Concurrency smoke
// ---------------------------------------------------------------------------

#[test]
fn test_concurrent_readers_and_writers() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);

    for i in 0..100 {
        engine.set(format!("k{}", i).as_bytes(), format!("v{}", i).as_bytes()).unwrap();
    }

    let mut handles = Vec::new();
    for t in 0..4 {
        let engine = engine.clone();
        handles.push(std::thread::spawn(move || {
            for i in 0..100 {
                if t % 2 == 0 {
                    let value = engine.get(format!("k{}", i).as_bytes()).unwrap();
                    assert!(value.starts_with(b"v"));
                } else {
                    engine
                        .set(format!("k{}", i).as_bytes(), format!("w{}-{}", t, i).as_bytes())
                        .unwrap();
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    // Every key still resolves to one of the written values.
    for i in 0..100 {
        let value = engine.get(format!("k{}", i).as_bytes()).unwrap();
        assert!(value.starts_with(b"v") || value.starts_with(b"w"));
    }
    engine.close().unwrap();
}
