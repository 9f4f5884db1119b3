//! End-to-end shard handoff over the storage layer: drain, dump, stream,
//! ingest, resume. Exercises the sender and receiver halves against two
//! real engine instances without a network in between.

use std::fs;
use std::sync::Arc;

use rocksdb::Options;
use tempfile::TempDir;

use node::migrate::{ShardImporter, ShardMigrator};
use node::shard::{Db, ShardTable};

fn open_db(dir: &TempDir) -> Arc<Db> {
    let mut opts = Options::default();
    opts.create_if_missing(true);
    opts.set_allow_ingest_behind(true);
    Arc::new(Db::open(&opts, dir.path()).unwrap())
}

fn shard_contents(db: &Db, shard: u32) -> Vec<(Vec<u8>, Vec<u8>)> {
    let cf = db.cf_handle(&shard.to_string()).unwrap();
    db.iterator_cf(&cf, rocksdb::IteratorMode::Start)
        .map(|item| {
            let (k, v) = item.unwrap();
            (k.to_vec(), v.to_vec())
        })
        .collect()
}

#[test]
fn handoff_moves_every_key_and_respects_watermark() {
    let sender_dir = TempDir::new().unwrap();
    let receiver_dir = TempDir::new().unwrap();
    let sender_scratch = TempDir::new().unwrap();
    let receiver_scratch = TempDir::new().unwrap();

    let sender_db = open_db(&sender_dir);
    let receiver_db = open_db(&receiver_dir);
    let sender_table = ShardTable::new(sender_db.clone());
    let receiver_table = ShardTable::new(receiver_db.clone());

    let source = sender_table.create(0).unwrap();
    for i in 0..200u32 {
        assert!(source.try_ref());
        source.put(format!("k{i:05}").as_bytes(), b"v").unwrap();
        source.unref();
    }

    // Drain: no writers were in flight, so the dump may start right away,
    // and new writes are refused from here on.
    assert!(source.unref_drain());
    assert!(!source.try_ref());

    let target = receiver_table.add(0, "sender:1").unwrap();
    assert!(target.is_importing());

    let files = ShardMigrator::new(sender_db.clone(), sender_scratch.path(), 0, 0, 1024)
        .unwrap()
        .dump_shard()
        .unwrap();
    assert!(files.len() > 2);

    let mut importer = ShardImporter::new(receiver_db.clone(), receiver_scratch.path(), 0).unwrap();
    let mut ingested = 0u64;
    for file in &files {
        let data = fs::read(&file.path).unwrap();
        importer.write_file(file.number, &data, &file.largest_key).unwrap();
        target.set_largest_key(file.largest_key.clone());
        ingested += 1;
        // The watermark grows monotonically with the stream.
        assert_eq!(importer.next_file(), ingested);
    }

    assert_eq!(shard_contents(&sender_db, 0), shard_contents(&receiver_db, 0));
    assert_eq!(target.largest_key(), files.last().unwrap().largest_key);

    // Keys at or below the watermark are served locally.
    assert_eq!(target.get(b"k00000").unwrap(), Some(b"v".to_vec()));

    importer.clear_state().unwrap();
    sender_table.remove(0).unwrap();
    assert!(sender_table.is_empty());
}

#[test]
fn receiver_crash_resumes_at_first_unrecorded_file() {
    let sender_dir = TempDir::new().unwrap();
    let receiver_dir = TempDir::new().unwrap();
    let sender_scratch = TempDir::new().unwrap();
    let receiver_scratch = TempDir::new().unwrap();

    let sender_db = open_db(&sender_dir);
    let receiver_db = open_db(&receiver_dir);
    let sender_table = ShardTable::new(sender_db.clone());
    let receiver_table = ShardTable::new(receiver_db.clone());

    let source = sender_table.create(3).unwrap();
    for i in 0..120u32 {
        source.put(format!("key-{i:04}").as_bytes(), b"payload").unwrap();
    }
    source.unref_drain();
    receiver_table.add(3, "sender:1").unwrap();

    let files = ShardMigrator::new(sender_db.clone(), sender_scratch.path(), 3, 0, 512)
        .unwrap()
        .dump_shard()
        .unwrap();
    assert!(files.len() >= 2);

    // First attempt ingests only the first file, then "crashes".
    {
        let mut importer =
            ShardImporter::new(receiver_db.clone(), receiver_scratch.path(), 3).unwrap();
        let data = fs::read(&files[0].path).unwrap();
        importer.write_file(files[0].number, &data, &files[0].largest_key).unwrap();
    }

    // Reboot: the importer picks up where the sidecar says, and a resumed
    // dump regenerates exactly the missing tail.
    let mut importer = ShardImporter::new(receiver_db.clone(), receiver_scratch.path(), 3).unwrap();
    assert_eq!(importer.next_file(), 1);
    let resumed = ShardMigrator::new(
        sender_db.clone(),
        sender_scratch.path(),
        3,
        importer.next_file(),
        512,
    )
    .unwrap()
    .dump_shard()
    .unwrap();
    assert_eq!(resumed.len(), files.len() - 1);
    for file in &resumed {
        let data = fs::read(&file.path).unwrap();
        importer.write_file(file.number, &data, &file.largest_key).unwrap();
    }

    assert_eq!(shard_contents(&sender_db, 3), shard_contents(&receiver_db, 3));
}
