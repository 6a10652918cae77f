//! Persistence integration tests.
//!
//! Verifies:
//! - Update log roundtrip through RocksDB
//! - Restart recovery: close the log, reopen, entries and heads survive
//! - Bucket isolation
//! - A relay over RocksDB restores documents after a restart

use std::sync::Arc;

use loom_collab::document;
use loom_collab::fanout::LocalFanOut;
use loom_collab::relay::Relay;
use loom_collab::storage::{bucket_name, RocksLog, StoreConfig, UpdateLog};
use tempfile::tempdir;
use tokio::time::{timeout, Duration};
use yrs::{Doc, GetString, Text, Transact};

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn text_of(doc: &Doc) -> String {
    let text = doc.get_or_insert_text("content");
    let txn = doc.transact();
    text.get_string(&txn)
}

/// Insert at the end of `doc` and return the update it produced.
fn make_update(doc: &Doc, chunk: &str) -> Vec<u8> {
    let sv = document::encode_state_vector(doc);
    {
        let text = doc.get_or_insert_text("content");
        let mut txn = doc.transact_mut();
        let len = text.get_string(&txn).len() as u32;
        text.insert(&mut txn, len, chunk);
    }
    document::encode_diff(doc, &sv).unwrap()
}

/// Generate repetitive text of given approximate byte count.
fn repetitive_text(approx_bytes: usize) -> String {
    let pattern = "The quick brown fox jumps over the lazy dog. ";
    pattern.repeat(approx_bytes / pattern.len() + 1)
}

// ─── Log roundtrip ───────────────────────────────────────────────────────────

#[test]
fn test_entries_survive_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");
    let source = Doc::new();
    let updates: Vec<Vec<u8>> = ["alpha ", "beta ", "gamma"]
        .iter()
        .map(|chunk| make_update(&source, chunk))
        .collect();

    {
        let log = RocksLog::open(StoreConfig::for_testing(&path)).unwrap();
        for (i, update) in updates.iter().enumerate() {
            assert_eq!(log.append("doc:updates", update).unwrap(), i as u64 + 1);
        }
        log.sync().unwrap();
    }

    let log = RocksLog::open(StoreConfig::for_testing(&path)).unwrap();
    assert_eq!(log.len("doc:updates").unwrap(), 3);
    assert_eq!(log.read_from("doc:updates", 0).unwrap(), updates);
    assert_eq!(log.read_from("doc:updates", 2).unwrap(), vec![updates[2].clone()]);
    assert!(log.read_from("doc:updates", 3).unwrap().is_empty());

    let head = log.head("doc:updates").unwrap().unwrap();
    assert_eq!(head.length, 3);
    assert_eq!(head.total_bytes, updates.iter().map(|u| u.len() as u64).sum::<u64>());

    let restored = Doc::new();
    document::apply_updates(&restored, &log.read_from("doc:updates", 0).unwrap(), &document::origin("test"))
        .unwrap();
    assert_eq!(text_of(&restored), "alpha beta gamma");
}

#[test]
fn test_large_entries_roundtrip() {
    let dir = tempdir().unwrap();
    let log = RocksLog::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
    let doc = Doc::new();
    let update = make_update(&doc, &repetitive_text(256 * 1024));

    log.append("big:updates", &update).unwrap();
    assert_eq!(log.read_from("big:updates", 0).unwrap(), vec![update]);
}

#[test]
fn test_buckets_are_isolated() {
    let dir = tempdir().unwrap();
    let log = RocksLog::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();

    // "a" is a prefix of "ab"; keys must not collide
    log.append("a", &[1]).unwrap();
    log.append("ab", &[2]).unwrap();
    log.append("ab", &[3]).unwrap();

    assert_eq!(log.read_from("a", 0).unwrap(), vec![vec![1]]);
    assert_eq!(log.read_from("ab", 0).unwrap(), vec![vec![2], vec![3]]);

    let mut buckets = log.list_buckets().unwrap();
    buckets.sort();
    assert_eq!(buckets, vec!["a".to_string(), "ab".to_string()]);

    assert_eq!(log.clear("ab").unwrap(), 2);
    assert_eq!(log.len("ab").unwrap(), 0);
    assert_eq!(log.len("a").unwrap(), 1);
}

// ─── Relay restart ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_relay_restores_document_after_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");

    {
        let log: Arc<dyn UpdateLog> = Arc::new(RocksLog::open(StoreConfig::for_testing(&path)).unwrap());
        let relay = Relay::new(log.clone(), LocalFanOut::new().connect());
        let binding = relay.bind("report", Doc::new()).unwrap();
        binding.wait_synced().await.unwrap();

        let mut events = binding.subscribe();
        {
            let text = binding.doc().get_or_insert_text("content");
            let mut txn = binding.doc().transact_mut();
            text.insert(&mut txn, 0, "durable");
        }
        timeout(Duration::from_secs(2), events.recv()).await.unwrap();
        assert_eq!(log.len(&bucket_name("report")).unwrap(), 1);

        drop(events);
        drop(binding);
        relay.shutdown().await;
    }

    let log: Arc<dyn UpdateLog> = Arc::new(RocksLog::open(StoreConfig::for_testing(&path)).unwrap());
    let relay = Relay::new(log, LocalFanOut::new().connect());
    let binding = relay.bind("report", Doc::new()).unwrap();
    timeout(Duration::from_secs(2), binding.wait_synced()).await.unwrap().unwrap();
    assert_eq!(text_of(binding.doc()), "durable");
    assert_eq!(binding.clocks().applied, 1);
}
