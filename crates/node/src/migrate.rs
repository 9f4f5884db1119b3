//! Shard migration: the sender-side dump and the receiver-side import
//!
//! A migrating shard travels as a sequence of numbered bulk-ingest files.
//! The sender walks a snapshot of the drained keyspace and cuts it into
//! files of roughly a fixed target size; the receiver ingests each file
//! under the engine's ingest-behind mode so writes accepted during the
//! import are never overwritten. File boundaries only depend on the
//! (immutable, already handed-over) data, which makes a resume after a
//! crash on either side deterministic.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rocksdb::{IngestExternalFileOptions, Options, SstFileWriter, WriteBatch};
use tracing::{info, warn};

use gv_core::info::ShardId;

use crate::shard::{sidecar_key, Db, ShardError};

/// Target size of one streamed bulk-ingest file.
pub const DEFAULT_FILE_TARGET: u64 = 4 << 20;

/// One finished dump file, ready to stream.
pub struct SstFile {
    pub number: u64,
    pub path: PathBuf,
    pub largest_key: Vec<u8>,
}

/// Sender side: dumps a drained shard into bulk files under the scratch
/// directory.
pub struct ShardMigrator {
    db: Arc<Db>,
    shard: ShardId,
    dir: PathBuf,
    start_from: u64,
    target: u64,
}

impl ShardMigrator {
    pub fn new(
        db: Arc<Db>,
        scratch: &Path,
        shard: ShardId,
        start_from: u64,
        target: u64,
    ) -> Result<Self, ShardError> {
        let dir = scratch.join(shard.to_string());
        fs::create_dir_all(&dir)?;
        Ok(Self {
            db,
            shard,
            dir,
            start_from,
            target: target.max(1),
        })
    }

    fn file_path(&self, number: u64) -> PathBuf {
        self.dir.join(format!("{number:06}.sst"))
    }

    /// Walk a snapshot of the shard and write the bulk files numbered from
    /// zero. Files below `start_from` are re-walked to keep the numbering
    /// identical but not written: the receiver already has them.
    pub fn dump_shard(&self) -> Result<Vec<SstFile>, ShardError> {
        let cf = self
            .db
            .cf_handle(&self.shard.to_string())
            .ok_or(ShardError::MissingCf(self.shard))?;
        let opts = Options::default();
        let snapshot = self.db.snapshot();
        let mut iter = snapshot.raw_iterator_cf(&cf);
        iter.seek_to_first();

        let mut files = Vec::new();
        let mut number: u64 = 0;
        let mut size: u64 = 0;
        let mut largest: Vec<u8> = Vec::new();
        let mut writer: Option<SstFileWriter<'_>> = None;

        while iter.valid() {
            let (Some(key), Some(value)) = (iter.key(), iter.value()) else {
                break;
            };
            if writer.is_none() && number >= self.start_from {
                let mut w = SstFileWriter::create(&opts);
                w.open(self.file_path(number))?;
                writer = Some(w);
            }
            if let Some(w) = writer.as_mut() {
                w.put(key, value)?;
            }
            size += (key.len() + value.len()) as u64;
            largest = key.to_vec();
            iter.next();
            if size >= self.target || !iter.valid() {
                if let Some(mut w) = writer.take() {
                    w.finish()?;
                }
                if number >= self.start_from {
                    files.push(SstFile {
                        number,
                        path: self.file_path(number),
                        largest_key: largest.clone(),
                    });
                }
                number += 1;
                size = 0;
            }
        }
        iter.status()?;
        info!(
            shard = self.shard,
            files = files.len(),
            start_from = self.start_from,
            "dumped shard"
        );
        Ok(files)
    }

    /// Remove the scratch directory for a shard.
    pub fn clear_state(scratch: &Path, shard: ShardId) {
        let dir = scratch.join(shard.to_string());
        if let Err(err) = fs::remove_dir_all(&dir) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(shard, error = %err, "failed to clear migration scratch");
            }
        }
    }
}

/// Receiver side: writes streamed files to disk and ingests them at file
/// boundaries, tracking progress in the sidecar so a crashed import resumes
/// at the first file that is not durably ingested.
pub struct ShardImporter {
    db: Arc<Db>,
    shard: ShardId,
    dir: PathBuf,
    next_file: u64,
}

impl ShardImporter {
    pub fn new(db: Arc<Db>, scratch: &Path, shard: ShardId) -> Result<Self, ShardError> {
        let dir = scratch.join(shard.to_string());
        fs::create_dir_all(&dir)?;
        let next_file = match db.get(sidecar_key(shard, "next_file"))? {
            Some(raw) if raw.len() == 8 => {
                u64::from_le_bytes(raw.as_slice().try_into().unwrap_or([0; 8]))
            }
            _ => 0,
        };
        let mut importer = Self {
            db,
            shard,
            dir,
            next_file,
        };
        importer.recover_leftovers()?;
        Ok(importer)
    }

    /// First file index the sender should stream.
    pub fn next_file(&self) -> u64 {
        self.next_file
    }

    pub fn largest_key(&self) -> Result<Vec<u8>, ShardError> {
        Ok(self
            .db
            .get(sidecar_key(self.shard, "largest_key"))?
            .unwrap_or_default())
    }

    fn file_path(&self, number: u64) -> PathBuf {
        self.dir.join(format!("{number:06}.sst"))
    }

    /// A fully written file whose progress was recorded before the crash is
    /// re-ingested (harmless under ingest-behind); anything newer is thrown
    /// away and will be streamed again.
    fn recover_leftovers(&mut self) -> Result<(), ShardError> {
        let mut leftovers: Vec<(u64, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("sst") {
                let _ = fs::remove_file(&path);
                continue;
            }
            let number = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok());
            match number {
                Some(number) => leftovers.push((number, path)),
                None => {
                    let _ = fs::remove_file(&path);
                }
            }
        }
        leftovers.sort();
        for (number, path) in leftovers {
            if number < self.next_file {
                info!(shard = self.shard, number, "re-ingesting leftover file");
                self.ingest(&path)?;
            }
            let _ = fs::remove_file(&path);
        }
        Ok(())
    }

    /// Persist one streamed file and ingest it. Progress is recorded before
    /// the ingest: replaying the same file after a crash is idempotent,
    /// skipping it would lose keys.
    pub fn write_file(
        &mut self,
        number: u64,
        data: &[u8],
        largest_key: &[u8],
    ) -> Result<(), ShardError> {
        let path = self.file_path(number);
        let tmp = self.dir.join(format!("{number:06}.tmp"));
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &path)?;

        let mut batch = WriteBatch::default();
        batch.put(sidecar_key(self.shard, "largest_key"), largest_key);
        batch.put(
            sidecar_key(self.shard, "next_file"),
            (number + 1).to_le_bytes(),
        );
        self.db.write(batch)?;
        self.next_file = number + 1;

        self.ingest(&path)?;
        let _ = fs::remove_file(&path);
        Ok(())
    }

    fn ingest(&self, path: &Path) -> Result<(), ShardError> {
        let cf = self
            .db
            .cf_handle(&self.shard.to_string())
            .ok_or(ShardError::MissingCf(self.shard))?;
        let mut opts = IngestExternalFileOptions::default();
        opts.set_ingest_behind(true);
        self.db
            .ingest_external_file_cf_opts(&cf, &opts, vec![path.to_path_buf()])?;
        Ok(())
    }

    /// Forget everything about this import: sidecar entries and scratch
    /// files. Called once the coordinator has recorded the migration as
    /// over.
    pub fn clear_state(&self) -> Result<(), ShardError> {
        let mut batch = WriteBatch::default();
        batch.delete(sidecar_key(self.shard, "largest_key"));
        batch.delete(sidecar_key(self.shard, "next_file"));
        batch.delete(sidecar_key(self.shard, "old_address"));
        self.db.write(batch)?;
        if let Err(err) = fs::remove_dir_all(&self.dir) {
            if err.kind() != std::io::ErrorKind::NotFound {
                return Err(err.into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_db(dir: &Path) -> Arc<Db> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_allow_ingest_behind(true);
        Arc::new(Db::open(&opts, dir).unwrap())
    }

    fn fill(db: &Db, shard: ShardId, count: u32) {
        db.create_cf(shard.to_string(), &Options::default())
            .unwrap();
        let cf = db.cf_handle(&shard.to_string()).unwrap();
        for i in 0..count {
            db.put_cf(&cf, format!("key-{i:04}"), format!("value-{i:04}"))
                .unwrap();
        }
    }

    fn collect(db: &Db, shard: ShardId) -> Vec<(Vec<u8>, Vec<u8>)> {
        let cf = db.cf_handle(&shard.to_string()).unwrap();
        db.iterator_cf(&cf, rocksdb::IteratorMode::Start)
            .map(|item| {
                let (k, v) = item.unwrap();
                (k.to_vec(), v.to_vec())
            })
            .collect()
    }

    #[test]
    fn test_dump_and_import_round_trip() {
        let sender_dir = TempDir::new().unwrap();
        let receiver_dir = TempDir::new().unwrap();
        let scratch_a = TempDir::new().unwrap();
        let scratch_b = TempDir::new().unwrap();
        let sender = open_db(sender_dir.path());
        let receiver = open_db(receiver_dir.path());
        fill(&sender, 2, 100);
        receiver.create_cf("2", &Options::default()).unwrap();

        // A small target size forces several files.
        let migrator = ShardMigrator::new(sender.clone(), scratch_a.path(), 2, 0, 256).unwrap();
        let files = migrator.dump_shard().unwrap();
        assert!(files.len() > 1, "expected more than one dump file");

        let mut importer = ShardImporter::new(receiver.clone(), scratch_b.path(), 2).unwrap();
        for file in &files {
            let data = fs::read(&file.path).unwrap();
            importer
                .write_file(file.number, &data, &file.largest_key)
                .unwrap();
        }
        assert_eq!(collect(&sender, 2), collect(&receiver, 2));
        assert_eq!(importer.next_file(), files.len() as u64);
        assert_eq!(
            importer.largest_key().unwrap(),
            files.last().unwrap().largest_key
        );
    }

    #[test]
    fn test_resume_skips_already_written_files() {
        let sender_dir = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let scratch_resume = TempDir::new().unwrap();
        let sender = open_db(sender_dir.path());
        fill(&sender, 5, 80);

        let full = ShardMigrator::new(sender.clone(), scratch.path(), 5, 0, 256)
            .unwrap()
            .dump_shard()
            .unwrap();
        let resumed = ShardMigrator::new(sender.clone(), scratch_resume.path(), 5, 1, 256)
            .unwrap()
            .dump_shard()
            .unwrap();

        // Identical boundaries: the resumed dump is the tail of the full one.
        assert_eq!(resumed.len(), full.len() - 1);
        for (full_file, resumed_file) in full.iter().skip(1).zip(&resumed) {
            assert_eq!(full_file.number, resumed_file.number);
            assert_eq!(full_file.largest_key, resumed_file.largest_key);
            assert_eq!(
                fs::read(&full_file.path).unwrap(),
                fs::read(&resumed_file.path).unwrap()
            );
        }
    }

    #[test]
    fn test_ingest_behind_keeps_newer_writes() {
        let sender_dir = TempDir::new().unwrap();
        let receiver_dir = TempDir::new().unwrap();
        let scratch_a = TempDir::new().unwrap();
        let scratch_b = TempDir::new().unwrap();
        let sender = open_db(sender_dir.path());
        let receiver = open_db(receiver_dir.path());
        fill(&sender, 1, 20);
        receiver.create_cf("1", &Options::default()).unwrap();

        // A write accepted by the new master while the import is running.
        let cf = receiver.cf_handle("1").unwrap();
        receiver.put_cf(&cf, b"key-0003", b"newer").unwrap();
        drop(cf);

        let files = ShardMigrator::new(sender.clone(), scratch_a.path(), 1, 0, 1 << 20)
            .unwrap()
            .dump_shard()
            .unwrap();
        let mut importer = ShardImporter::new(receiver.clone(), scratch_b.path(), 1).unwrap();
        for file in &files {
            let data = fs::read(&file.path).unwrap();
            importer
                .write_file(file.number, &data, &file.largest_key)
                .unwrap();
        }

        let cf = receiver.cf_handle("1").unwrap();
        assert_eq!(
            receiver.get_cf(&cf, b"key-0003").unwrap(),
            Some(b"newer".to_vec())
        );
        assert_eq!(
            receiver.get_cf(&cf, b"key-0004").unwrap(),
            Some(b"value-0004".to_vec())
        );
    }

    #[test]
    fn test_recovery_reingests_recorded_files() {
        let sender_dir = TempDir::new().unwrap();
        let receiver_dir = TempDir::new().unwrap();
        let scratch_a = TempDir::new().unwrap();
        let scratch_b = TempDir::new().unwrap();
        let sender = open_db(sender_dir.path());
        let receiver = open_db(receiver_dir.path());
        fill(&sender, 9, 40);
        receiver.create_cf("9", &Options::default()).unwrap();

        let files = ShardMigrator::new(sender.clone(), scratch_a.path(), 9, 0, 1 << 20)
            .unwrap()
            .dump_shard()
            .unwrap();
        assert_eq!(files.len(), 1);
        let data = fs::read(&files[0].path).unwrap();

        // Simulate a crash after recording progress but before the ingest:
        // the file sits in scratch, the sidecar already points past it.
        let shard_scratch = scratch_b.path().join("9");
        fs::create_dir_all(&shard_scratch).unwrap();
        fs::write(shard_scratch.join("000000.sst"), &data).unwrap();
        receiver
            .put(sidecar_key(9, "next_file"), 1u64.to_le_bytes())
            .unwrap();
        receiver
            .put(sidecar_key(9, "largest_key"), &files[0].largest_key)
            .unwrap();

        let importer = ShardImporter::new(receiver.clone(), scratch_b.path(), 9).unwrap();
        assert_eq!(importer.next_file(), 1);
        assert_eq!(collect(&sender, 9), collect(&receiver, 9));
        // The leftover has been consumed.
        assert!(fs::read_dir(&shard_scratch).unwrap().next().is_none());

        importer.clear_state().unwrap();
        assert_eq!(receiver.get(sidecar_key(9, "next_file")).unwrap(), None);
    }
}
