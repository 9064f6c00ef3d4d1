//! Stateful iterators over sorted tables, and their compositions.
//!
//! Compaction drives these with an explicit cursor contract
//! (`rewind`/`seek`/`valid`/`next`) rather than `std::iter::Iterator`,
//! because a merge over seekable sources needs to reposition mid-stream.
//! An I/O or checksum failure parks the iterator as invalid and is
//! reported through `err()` so a merge pass can distinguish exhaustion
//! from failure.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use crate::entry::ValueStruct;
use crate::error::Error;
use crate::keys::compare_keys;

use super::block::Block;
use super::table::Table;

pub(crate) trait EntryIterator: Send {
    fn rewind(&mut self);
    fn seek(&mut self, key: &[u8]);
    fn valid(&self) -> bool;
    fn key(&self) -> &[u8];
    fn value(&self) -> ValueStruct;
    fn next(&mut self);
    fn err(&self) -> Option<Error>;
}

/// Forward iterator over one table, loading blocks on demand.
pub(crate) struct TableIterator {
    table: Arc<Table>,
    block_idx: usize,
    block: Option<Block>,
    entry_idx: usize,
    err: Option<Error>,
}

impl TableIterator {
    pub(crate) fn new(table: Arc<Table>) -> TableIterator {
        TableIterator {
            table,
            block_idx: 0,
            block: None,
            entry_idx: 0,
            err: None,
        }
    }

    fn load_block(&mut self, idx: usize) {
        if idx >= self.table.block_count() {
            self.block = None;
            return;
        }
        match self.table.read_block(idx) {
            Ok(block) => {
                self.block_idx = idx;
                self.block = Some(block);
            }
            Err(e) => {
                tracing::warn!(fid = self.table.fid(), block = idx, error = %e, "table block read failed");
                self.err = Some(e);
                self.block = None;
            }
        }
    }
}

impl EntryIterator for TableIterator {
    fn rewind(&mut self) {
        self.err = None;
        self.entry_idx = 0;
        self.load_block(0);
    }

    fn seek(&mut self, key: &[u8]) {
        self.err = None;
        let idx = self.table.block_for(key);
        self.load_block(idx);
        let Some(block) = &self.block else { return };
        self.entry_idx = block.seek(key);
        if self.entry_idx >= block.entry_count() {
            // Past this block; the successor starts the next one.
            self.entry_idx = 0;
            self.load_block(idx + 1);
        }
    }

    fn valid(&self) -> bool {
        self.block.is_some()
    }

    fn key(&self) -> &[u8] {
        self.block.as_ref().expect("valid iterator").key(self.entry_idx)
    }

    fn value(&self) -> ValueStruct {
        let block = self.block.as_ref().expect("valid iterator");
        let mut vs = block.value(self.entry_idx);
        vs.version = crate::keys::parse_ts(block.key(self.entry_idx));
        vs
    }

    fn next(&mut self) {
        let Some(block) = &self.block else { return };
        self.entry_idx += 1;
        if self.entry_idx >= block.entry_count() {
            self.entry_idx = 0;
            self.load_block(self.block_idx + 1);
        }
    }

    fn err(&self) -> Option<Error> {
        self.err.clone()
    }
}

/// Concatenation of disjoint, range-sorted tables (one level's slice).
pub(crate) struct ConcatIterator {
    tables: Vec<Arc<Table>>,
    idx: usize,
    cur: Option<TableIterator>,
}

impl ConcatIterator {
    pub(crate) fn new(tables: Vec<Arc<Table>>) -> ConcatIterator {
        ConcatIterator {
            tables,
            idx: 0,
            cur: None,
        }
    }

    fn open_table(&mut self, idx: usize) {
        if idx >= self.tables.len() {
            self.cur = None;
            return;
        }
        self.idx = idx;
        let mut iter = TableIterator::new(Arc::clone(&self.tables[idx]));
        iter.rewind();
        self.cur = Some(iter);
    }
}

impl EntryIterator for ConcatIterator {
    fn rewind(&mut self) {
        self.open_table(0);
    }

    fn seek(&mut self, key: &[u8]) {
        let idx = self
            .tables
            .partition_point(|t| compare_keys(t.max_key(), key) == Ordering::Less);
        if idx >= self.tables.len() {
            self.cur = None;
            return;
        }
        self.idx = idx;
        let mut iter = TableIterator::new(Arc::clone(&self.tables[idx]));
        iter.seek(key);
        self.cur = Some(iter);
    }

    fn valid(&self) -> bool {
        self.cur.as_ref().is_some_and(|c| c.valid())
    }

    fn key(&self) -> &[u8] {
        self.cur.as_ref().expect("valid iterator").key()
    }

    fn value(&self) -> ValueStruct {
        self.cur.as_ref().expect("valid iterator").value()
    }

    fn next(&mut self) {
        let Some(cur) = &mut self.cur else { return };
        cur.next();
        if !cur.valid() && cur.err().is_none() {
            self.open_table(self.idx + 1);
        }
    }

    fn err(&self) -> Option<Error> {
        self.cur.as_ref().and_then(|c| c.err())
    }
}

struct HeapEntry {
    key: Vec<u8>,
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so the max-heap pops the smallest (key, source) pair;
        // on equal internal keys the lower source index (newer data) wins.
        compare_keys(&self.key, &other.key)
            .then(self.source.cmp(&other.source))
            .reverse()
    }
}

/// K-way merge over sorted sources. Sources must be ordered newest first
/// so ties on identical internal keys resolve to the newest entry.
pub(crate) struct MergeIterator {
    iters: Vec<Box<dyn EntryIterator>>,
    heap: BinaryHeap<HeapEntry>,
}

impl MergeIterator {
    pub(crate) fn new(iters: Vec<Box<dyn EntryIterator>>) -> MergeIterator {
        MergeIterator {
            iters,
            heap: BinaryHeap::new(),
        }
    }

    fn rebuild(&mut self) {
        self.heap.clear();
        for (source, iter) in self.iters.iter().enumerate() {
            if iter.valid() {
                self.heap.push(HeapEntry {
                    key: iter.key().to_vec(),
                    source,
                });
            }
        }
    }
}

impl EntryIterator for MergeIterator {
    fn rewind(&mut self) {
        for iter in &mut self.iters {
            iter.rewind();
        }
        self.rebuild();
    }

    fn seek(&mut self, key: &[u8]) {
        for iter in &mut self.iters {
            iter.seek(key);
        }
        self.rebuild();
    }

    fn valid(&self) -> bool {
        !self.heap.is_empty()
    }

    fn key(&self) -> &[u8] {
        let top = self.heap.peek().expect("valid iterator");
        self.iters[top.source].key()
    }

    fn value(&self) -> ValueStruct {
        let top = self.heap.peek().expect("valid iterator");
        self.iters[top.source].value()
    }

    fn next(&mut self) {
        let Some(top) = self.heap.pop() else { return };
        let iter = &mut self.iters[top.source];
        iter.next();
        if iter.valid() {
            self.heap.push(HeapEntry {
                key: iter.key().to_vec(),
                source: top.source,
            });
        }
    }

    fn err(&self) -> Option<Error> {
        self.iters.iter().find_map(|i| i.err())
    }
}
