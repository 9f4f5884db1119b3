//! Merged iteration over the shard keyspaces a node currently owns
//!
//! Shards partition the key space, so no key appears in more than one
//! keyspace and the merge never has to deduplicate. Responses carry bounded
//! batches; the `done` flag tells the client the iterator is exhausted.

use rocksdb::DBRawIteratorWithThreadMode;

use gv_core::status;
use proto::{iterator_request, IteratorRequest, IteratorResponse, KeyValue};

use crate::shard::Db;
use crate::status::code_for;

/// Key/value pairs per response.
pub const BATCH_SIZE: usize = 10;

type RawIter<'a> = DBRawIteratorWithThreadMode<'a, Db>;

#[derive(Clone, Copy, PartialEq)]
enum Direction {
    Forward,
    Reverse,
}

pub struct MultiIterator<'a> {
    iters: Vec<RawIter<'a>>,
    current: Option<usize>,
    direction: Direction,
}

impl<'a> MultiIterator<'a> {
    pub fn new(iters: Vec<RawIter<'a>>) -> Self {
        Self {
            iters,
            current: None,
            direction: Direction::Forward,
        }
    }

    pub fn seek_to_first(&mut self) {
        for iter in &mut self.iters {
            iter.seek_to_first();
        }
        self.direction = Direction::Forward;
        self.pick_min();
    }

    pub fn seek_to_last(&mut self) {
        for iter in &mut self.iters {
            iter.seek_to_last();
        }
        self.direction = Direction::Reverse;
        self.pick_max();
    }

    pub fn seek(&mut self, target: &[u8]) {
        for iter in &mut self.iters {
            iter.seek(target);
        }
        self.direction = Direction::Forward;
        self.pick_min();
    }

    pub fn seek_for_prev(&mut self, target: &[u8]) {
        for iter in &mut self.iters {
            iter.seek_for_prev(target);
        }
        self.direction = Direction::Reverse;
        self.pick_max();
    }

    pub fn valid(&self) -> bool {
        self.current.map_or(false, |i| self.iters[i].valid())
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.current.and_then(|i| self.iters[i].key())
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.current.and_then(|i| self.iters[i].value())
    }

    pub fn next(&mut self) {
        if !self.valid() {
            return;
        }
        if self.direction == Direction::Reverse {
            self.turn(Direction::Forward);
        }
        let Some(i) = self.current else { return };
        self.iters[i].next();
        self.pick_min();
    }

    pub fn prev(&mut self) {
        if !self.valid() {
            return;
        }
        if self.direction == Direction::Forward {
            self.turn(Direction::Reverse);
        }
        let Some(i) = self.current else { return };
        self.iters[i].prev();
        self.pick_max();
    }

    /// Reposition the non-current children around the current key before
    /// changing direction. Keys are disjoint across keyspaces, so a sibling
    /// seek lands strictly beyond the pivot on the new side.
    fn turn(&mut self, direction: Direction) {
        let Some(pivot) = self.key().map(<[u8]>::to_vec) else {
            return;
        };
        let current = self.current;
        for (idx, iter) in self.iters.iter_mut().enumerate() {
            if Some(idx) == current {
                continue;
            }
            match direction {
                Direction::Forward => iter.seek(&pivot),
                Direction::Reverse => iter.seek_for_prev(&pivot),
            }
        }
        self.direction = direction;
    }

    fn pick_min(&mut self) {
        self.current = self
            .iters
            .iter()
            .enumerate()
            .filter(|(_, iter)| iter.valid())
            .min_by(|(_, a), (_, b)| a.key().cmp(&b.key()))
            .map(|(i, _)| i);
    }

    fn pick_max(&mut self) {
        self.current = self
            .iters
            .iter()
            .enumerate()
            .filter(|(_, iter)| iter.valid())
            .max_by(|(_, a), (_, b)| a.key().cmp(&b.key()))
            .map(|(i, _)| i);
    }

    /// First engine error across the children, OK otherwise.
    pub fn status(&self) -> i32 {
        for iter in &self.iters {
            if let Err(err) = iter.status() {
                return code_for(&err);
            }
        }
        status::OK
    }
}

/// Drive the iterator by one client request and build the bounded response
/// batch, guessing the iteration direction from the seek that started it.
pub fn apply_request(it: &mut MultiIterator<'_>, request: &IteratorRequest) -> IteratorResponse {
    use iterator_request::Op;
    match request.op() {
        Op::SeekToFirst => {
            it.seek_to_first();
            next_batch(it)
        }
        Op::SeekToLast => {
            it.seek_to_last();
            prev_batch(it)
        }
        Op::Seek => {
            it.seek(&request.target);
            next_batch(it)
        }
        Op::SeekForPrev => {
            it.seek_for_prev(&request.target);
            prev_batch(it)
        }
        Op::Next => next_batch(it),
        Op::Prev => prev_batch(it),
    }
}

fn next_batch(it: &mut MultiIterator<'_>) -> IteratorResponse {
    let mut kvs = Vec::new();
    for _ in 0..BATCH_SIZE {
        if !it.valid() {
            break;
        }
        kvs.push(KeyValue {
            key: it.key().unwrap_or_default().to_vec(),
            value: it.value().unwrap_or_default().to_vec(),
        });
        it.next();
    }
    IteratorResponse {
        kvs,
        done: !it.valid(),
        status: it.status(),
    }
}

fn prev_batch(it: &mut MultiIterator<'_>) -> IteratorResponse {
    let mut kvs = Vec::new();
    for _ in 0..BATCH_SIZE {
        if !it.valid() {
            break;
        }
        kvs.push(KeyValue {
            key: it.key().unwrap_or_default().to_vec(),
            value: it.value().unwrap_or_default().to_vec(),
        });
        it.prev();
    }
    IteratorResponse {
        kvs,
        done: !it.valid(),
        status: it.status(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rocksdb::Options;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn open_db(dir: &TempDir) -> Arc<Db> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        Arc::new(Db::open(&opts, dir.path()).unwrap())
    }

    /// Keys interleave across the two keyspaces: a,c,e in one, b,d,f in the
    /// other.
    fn seed(db: &Db) {
        db.create_cf("0", &Options::default()).unwrap();
        db.create_cf("1", &Options::default()).unwrap();
        let even = db.cf_handle("0").unwrap();
        let odd = db.cf_handle("1").unwrap();
        for (i, key) in [b"a", b"b", b"c", b"d", b"e", b"f"].iter().enumerate() {
            let cf = if i % 2 == 0 { &even } else { &odd };
            db.put_cf(cf, key.as_slice(), format!("v{i}")).unwrap();
        }
    }

    fn keys(it: &mut MultiIterator<'_>, forward: bool) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while it.valid() {
            out.push(it.key().unwrap().to_vec());
            if forward {
                it.next();
            } else {
                it.prev();
            }
        }
        out
    }

    #[test]
    fn test_forward_merge_orders_across_keyspaces() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        seed(&db);
        let iters = vec![
            db.raw_iterator_cf(&db.cf_handle("0").unwrap()),
            db.raw_iterator_cf(&db.cf_handle("1").unwrap()),
        ];
        let mut it = MultiIterator::new(iters);
        it.seek_to_first();
        assert_eq!(
            keys(&mut it, true),
            vec![
                b"a".to_vec(),
                b"b".to_vec(),
                b"c".to_vec(),
                b"d".to_vec(),
                b"e".to_vec(),
                b"f".to_vec()
            ]
        );
    }

    #[test]
    fn test_reverse_merge_and_seek() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        seed(&db);
        let iters = vec![
            db.raw_iterator_cf(&db.cf_handle("0").unwrap()),
            db.raw_iterator_cf(&db.cf_handle("1").unwrap()),
        ];
        let mut it = MultiIterator::new(iters);
        it.seek_to_last();
        assert_eq!(it.key(), Some(b"f".as_slice()));
        it.seek(b"c");
        assert_eq!(it.key(), Some(b"c".as_slice()));
        it.seek_for_prev(b"cc");
        assert_eq!(it.key(), Some(b"c".as_slice()));
        assert_eq!(
            keys(&mut it, false),
            vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]
        );
    }

    #[test]
    fn test_direction_switch_keeps_order() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        seed(&db);
        let iters = vec![
            db.raw_iterator_cf(&db.cf_handle("0").unwrap()),
            db.raw_iterator_cf(&db.cf_handle("1").unwrap()),
        ];
        let mut it = MultiIterator::new(iters);
        it.seek(b"d");
        assert_eq!(it.key(), Some(b"d".as_slice()));
        it.prev();
        assert_eq!(it.key(), Some(b"c".as_slice()));
        it.next();
        assert_eq!(it.key(), Some(b"d".as_slice()));
    }

    #[test]
    fn test_apply_request_batches_and_done() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        seed(&db);
        let iters = vec![
            db.raw_iterator_cf(&db.cf_handle("0").unwrap()),
            db.raw_iterator_cf(&db.cf_handle("1").unwrap()),
        ];
        let mut it = MultiIterator::new(iters);
        let request = IteratorRequest {
            op: iterator_request::Op::SeekToFirst as i32,
            target: Vec::new(),
        };
        let resp = apply_request(&mut it, &request);
        // Six keys fit in one batch of ten.
        assert_eq!(resp.kvs.len(), 6);
        assert!(resp.done);
        assert_eq!(resp.status, status::OK);
        assert_eq!(resp.kvs[0].key, b"a".to_vec());
    }
}
