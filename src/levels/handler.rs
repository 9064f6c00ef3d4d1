//! Per-level sorted table list.
//!
//! Level 0 holds overlapping tables sorted by fid descending, so a
//! newest-first scan is the storage order. Levels ≥ 1 hold disjoint
//! tables sorted by key range and support binary-searched overlap
//! queries. A table becomes visible to readers only after it was staged
//! through the manifest, and invisible only after the reverse.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use crate::entry::ValueStruct;
use crate::error::Result;
use crate::keys::{compare_keys, parse_key};
use crate::sstable::bloom;
use crate::sstable::table::Table;

use super::status::KeyRange;

pub(crate) struct LevelHandler {
    level: usize,
    inner: RwLock<LevelInner>,
}

struct LevelInner {
    tables: Vec<Arc<Table>>,
    total_size: u64,
}

impl LevelHandler {
    pub(crate) fn new(level: usize) -> LevelHandler {
        LevelHandler {
            level,
            inner: RwLock::new(LevelInner {
                tables: Vec::new(),
                total_size: 0,
            }),
        }
    }

    pub(crate) fn level(&self) -> usize {
        self.level
    }

    pub(crate) fn num_tables(&self) -> usize {
        self.inner.read().unwrap().tables.len()
    }

    pub(crate) fn total_size(&self) -> u64 {
        self.inner.read().unwrap().total_size
    }

    /// Cheap copy of the current table list, in storage order.
    pub(crate) fn tables_snapshot(&self) -> Vec<Arc<Table>> {
        self.inner.read().unwrap().tables.clone()
    }

    /// Whether every fid is still present at this level.
    pub(crate) fn contains_all(&self, fids: &[u64]) -> bool {
        let inner = self.inner.read().unwrap();
        let live: HashSet<u64> = inner.tables.iter().map(|t| t.fid()).collect();
        fids.iter().all(|fid| live.contains(fid))
    }

    fn sort(&self, tables: &mut [Arc<Table>]) {
        if self.level == 0 {
            tables.sort_by(|a, b| b.fid().cmp(&a.fid()));
        } else {
            tables.sort_by(|a, b| compare_keys(a.min_key(), b.min_key()));
        }
    }

    /// Installs the recovered table set wholesale.
    pub(crate) fn init_tables(&self, mut tables: Vec<Arc<Table>>) {
        self.sort(&mut tables);
        let mut inner = self.inner.write().unwrap();
        inner.total_size = tables.iter().map(|t| t.size()).sum();
        inner.tables = tables;
    }

    /// Splices one freshly flushed table in (level 0 only).
    pub(crate) fn add_table(&self, table: Arc<Table>) {
        let mut inner = self.inner.write().unwrap();
        inner.total_size += table.size();
        inner.tables.push(table);
        self.sort(&mut inner.tables);
    }

    /// Removes `to_del` and inserts `to_add` under a single write lock.
    /// Removed tables are marked dead; their files go once the last
    /// reference drops.
    pub(crate) fn replace_tables(&self, to_del: &[Arc<Table>], to_add: &[Arc<Table>]) {
        let del_fids: HashSet<u64> = to_del.iter().map(|t| t.fid()).collect();
        let mut inner = self.inner.write().unwrap();
        let mut removed_size = 0u64;
        inner.tables.retain(|t| {
            if del_fids.contains(&t.fid()) {
                removed_size += t.size();
                t.mark_dead();
                false
            } else {
                true
            }
        });
        inner.total_size = inner.total_size.saturating_sub(removed_size);
        for table in to_add {
            inner.total_size += table.size();
            inner.tables.push(Arc::clone(table));
        }
        self.sort(&mut inner.tables);
    }

    pub(crate) fn delete_tables(&self, to_del: &[Arc<Table>]) {
        self.replace_tables(to_del, &[]);
    }

    /// Tables whose range intersects `range`: a binary-searched
    /// `[left, right)` slice on disjoint levels, everything on level 0.
    pub(crate) fn overlapping_tables(&self, range: &KeyRange) -> Vec<Arc<Table>> {
        let inner = self.inner.read().unwrap();
        if self.level == 0 || range.inf {
            return inner.tables.clone();
        }
        if range.is_empty() {
            return Vec::new();
        }
        let left = inner
            .tables
            .partition_point(|t| compare_keys(t.max_key(), &range.left) == Ordering::Less);
        let right = inner
            .tables
            .partition_point(|t| compare_keys(t.min_key(), &range.right) != Ordering::Greater);
        if left >= right {
            return Vec::new();
        }
        inner.tables[left..right].to_vec()
    }

    /// Point lookup for an internal key. On level 0 tables are consulted
    /// newest-fid first; on higher levels the single candidate is binary
    /// searched. Newer versions win because internal keys sort that way.
    pub(crate) fn get(&self, key: &[u8]) -> Result<Option<ValueStruct>> {
        let user_key = parse_key(key);
        let hash = bloom::hash(user_key);
        let inner = self.inner.read().unwrap();

        if self.level == 0 {
            for table in &inner.tables {
                if user_key < parse_key(table.min_key()) || user_key > parse_key(table.max_key()) {
                    continue;
                }
                if !table.may_contain_hash(hash) {
                    continue;
                }
                if let Some(vs) = table.get(key)? {
                    return Ok(Some(vs));
                }
            }
            return Ok(None);
        }

        let idx = inner
            .tables
            .partition_point(|t| compare_keys(t.max_key(), key) == Ordering::Less);
        let Some(table) = inner.tables.get(idx) else {
            return Ok(None);
        };
        if user_key < parse_key(table.min_key()) {
            return Ok(None);
        }
        if !table.may_contain_hash(hash) {
            return Ok(None);
        }
        table.get(key)
    }
}
