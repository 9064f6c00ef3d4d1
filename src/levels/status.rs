//! Range reservation for in-flight compactions.
//!
//! One mutex guards the set of reserved key ranges and fids per level.
//! Reservation through [`CompactStatus::compare_and_add`] is the moment
//! two compactions are guaranteed not to touch overlapping data.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::keys::{compare_keys, key_with_ts, parse_key};
use crate::sstable::table::Table;

use super::compaction::CompactDef;

/// An inclusive internal-key interval. The empty range overlaps nothing
/// as a destination and everything as a source; `inf` is the sentinel
/// that excludes a whole level (the L0→L0 reservation).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct KeyRange {
    pub(crate) left: Vec<u8>,
    pub(crate) right: Vec<u8>,
    pub(crate) inf: bool,
}

impl KeyRange {
    pub(crate) fn infinite() -> KeyRange {
        KeyRange {
            left: Vec::new(),
            right: Vec::new(),
            inf: true,
        }
    }

    /// The smallest range covering every table: all versions of the
    /// smallest user key through all versions of the largest.
    pub(crate) fn from_tables(tables: &[Arc<Table>]) -> KeyRange {
        let Some(first) = tables.first() else {
            return KeyRange::default();
        };
        let mut min_key = first.min_key();
        let mut max_key = first.max_key();
        for table in &tables[1..] {
            if compare_keys(table.min_key(), min_key) == std::cmp::Ordering::Less {
                min_key = table.min_key();
            }
            if compare_keys(table.max_key(), max_key) == std::cmp::Ordering::Greater {
                max_key = table.max_key();
            }
        }
        KeyRange {
            left: key_with_ts(parse_key(min_key), u64::MAX),
            right: key_with_ts(parse_key(max_key), 0),
            inf: false,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.left.is_empty() && self.right.is_empty() && !self.inf
    }

    pub(crate) fn extend(&mut self, other: &KeyRange) {
        if other.is_empty() {
            return;
        }
        if self.is_empty() {
            *self = other.clone();
            return;
        }
        if self.left.is_empty()
            || compare_keys(&other.left, &self.left) == std::cmp::Ordering::Less
        {
            self.left = other.left.clone();
        }
        if self.right.is_empty()
            || compare_keys(&other.right, &self.right) == std::cmp::Ordering::Greater
        {
            self.right = other.right.clone();
        }
        if other.inf {
            self.inf = true;
        }
    }

    pub(crate) fn overlaps_with(&self, other: &KeyRange) -> bool {
        // An empty source overlaps everything.
        if self.is_empty() {
            return true;
        }
        // An empty destination overlaps nothing.
        if other.is_empty() {
            return false;
        }
        if self.inf || other.inf {
            return true;
        }
        if compare_keys(&self.left, &other.right) == std::cmp::Ordering::Greater {
            return false;
        }
        if compare_keys(&self.right, &other.left) == std::cmp::Ordering::Less {
            return false;
        }
        true
    }
}

#[derive(Default)]
struct LevelCompactStatus {
    ranges: Vec<KeyRange>,
    del_size: u64,
}

impl LevelCompactStatus {
    fn overlaps_with(&self, target: &KeyRange) -> bool {
        self.ranges.iter().any(|r| r.overlaps_with(target))
    }

    /// Removes every reservation equal to `target`.
    fn remove(&mut self, target: &KeyRange) -> bool {
        let before = self.ranges.len();
        self.ranges.retain(|r| r != target);
        self.ranges.len() < before
    }
}

struct CompactStatusInner {
    levels: Vec<LevelCompactStatus>,
    tables: HashSet<u64>,
}

pub(crate) struct CompactStatus {
    inner: Mutex<CompactStatusInner>,
}

impl CompactStatus {
    pub(crate) fn new(max_levels: usize) -> CompactStatus {
        CompactStatus {
            inner: Mutex::new(CompactStatusInner {
                levels: (0..max_levels).map(|_| LevelCompactStatus::default()).collect(),
                tables: HashSet::new(),
            }),
        }
    }

    pub(crate) fn overlaps_with(&self, level: usize, range: &KeyRange) -> bool {
        self.inner.lock().unwrap().levels[level].overlaps_with(range)
    }

    /// Bytes at `level` already claimed by running compactions.
    pub(crate) fn del_size(&self, level: usize) -> u64 {
        self.inner.lock().unwrap().levels[level].del_size
    }

    /// Registers the plan's ranges and fids if nothing conflicting is
    /// running. The plan's tables must still be live in their handlers:
    /// level mutations only happen while the mutating compaction holds
    /// its own reservation, so this check cannot race.
    pub(crate) fn compare_and_add(&self, cd: &CompactDef) -> bool {
        let mut inner = self.inner.lock().unwrap();

        let this_level = cd.this_level.level();
        let next_level = cd.next_level.level();
        if inner.levels[this_level].overlaps_with(&cd.this_range) {
            return false;
        }
        if inner.levels[next_level].overlaps_with(&cd.next_range) {
            return false;
        }

        let top_fids: Vec<u64> = cd.top.iter().map(|t| t.fid()).collect();
        let bot_fids: Vec<u64> = cd.bot.iter().map(|t| t.fid()).collect();
        if !cd.this_level.contains_all(&top_fids) || !cd.next_level.contains_all(&bot_fids) {
            return false;
        }

        inner.levels[this_level].ranges.push(cd.this_range.clone());
        inner.levels[next_level].ranges.push(cd.next_range.clone());
        inner.levels[this_level].del_size += cd.this_size;
        for fid in top_fids.into_iter().chain(bot_fids) {
            inner.tables.insert(fid);
        }
        true
    }

    /// The L0→L0 reservation: claims the whole of level 0 with the
    /// infinite range and picks every candidate not already compacting.
    /// Returns the selected tables, oldest first, or None if fewer than
    /// `min_tables` qualify.
    pub(crate) fn try_reserve_level0(
        &self,
        candidates: &[Arc<Table>],
        min_tables: usize,
    ) -> Option<Vec<Arc<Table>>> {
        let mut inner = self.inner.lock().unwrap();

        let mut selected: Vec<Arc<Table>> = candidates
            .iter()
            .filter(|t| !inner.tables.contains(&t.fid()))
            .cloned()
            .collect();
        if selected.len() < min_tables {
            return None;
        }
        selected.sort_by_key(|t| t.fid());

        inner.levels[0].ranges.push(KeyRange::infinite());
        for table in &selected {
            inner.tables.insert(table.fid());
        }
        Some(selected)
    }

    /// Releases a plan's reservations.
    pub(crate) fn delete(&self, cd: &CompactDef) {
        let mut inner = self.inner.lock().unwrap();

        let this_level = cd.this_level.level();
        let next_level = cd.next_level.level();

        inner.levels[this_level].del_size =
            inner.levels[this_level].del_size.saturating_sub(cd.this_size);
        let mut found = inner.levels[this_level].remove(&cd.this_range);
        if !cd.next_range.is_empty() {
            if this_level != next_level {
                found = inner.levels[next_level].remove(&cd.next_range) && found;
            } else if cd.next_range != cd.this_range {
                // A same-level rewrite reserved two distinct ranges on
                // one level; release the second as well.
                found = inner.levels[this_level].remove(&cd.next_range) && found;
            }
        }
        if !found {
            tracing::error!(
                this_level,
                next_level,
                "compaction status released a range it never reserved"
            );
            debug_assert!(found, "key range not found in compact status");
        }

        for table in cd.top.iter().chain(cd.bot.iter()) {
            inner.tables.remove(&table.fid());
        }
    }
}
