//! The leveled compaction engine: priority selection, plan construction,
//! range reservation, and parallel sub-compaction.
//!
//! Workers tick independently; worker 0 additionally prioritizes level 0.
//! A plan reserves its key ranges in [`super::status::CompactStatus`]
//! before any I/O, runs up to five sub-compactions split along the
//! bottom tables' key space, commits the result through the manifest,
//! and only then swaps tables in the level handlers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, Semaphore};

use crate::config::DiscardStats;
use crate::entry::{now_secs, ValuePointer, ValueStruct, BIT_VALUE_POINTER};
use crate::error::{Error, Result};
use crate::keys::{compare_keys, key_with_ts, parse_key, same_key};
use crate::manifest::ManifestChange;
use crate::sstable::builder::TableBuilder;
use crate::sstable::iterator::{ConcatIterator, EntryIterator, MergeIterator, TableIterator};
use crate::sstable::table::Table;
use crate::sstable::{sync_dir, table_file_path};

use super::handler::LevelHandler;
use super::status::KeyRange;
use super::LevelManager;

/// Upper bound on sub-compaction splits per plan.
const MAX_SPLITS: usize = 5;
/// Minimum bottom-table count per split bucket.
const MIN_SPLIT_WIDTH: usize = 3;
/// L0→L0 coalescing needs at least this many candidates.
const LEVEL0_MIN_COALESCE: usize = 4;
/// L0→L0 skips tables younger than this.
const LEVEL0_COALESCE_MIN_AGE_SECS: u64 = 10;
/// Last-level rewrites skip tables younger than this.
const LAST_LEVEL_MIN_AGE_SECS: u64 = 3600;
/// Last-level rewrites need at least this much reclaimable data.
const LAST_LEVEL_MIN_STALE_BYTES: u32 = 10 << 20;

/// Per-run level sizing: where L0 drains to, how big each level wants to
/// be, and how big its output files should be.
#[derive(Debug, Clone, Default)]
pub(crate) struct Targets {
    pub(crate) base_level: usize,
    pub(crate) target_size: Vec<u64>,
    pub(crate) file_size: Vec<u64>,
}

#[derive(Debug, Clone)]
pub(crate) struct CompactionPriority {
    pub(crate) level: usize,
    pub(crate) score: f64,
    pub(crate) adjusted: f64,
    pub(crate) targets: Targets,
}

/// A fully assembled compaction plan.
pub(crate) struct CompactDef {
    pub(crate) compactor_id: usize,
    pub(crate) adjusted: f64,
    pub(crate) targets: Targets,
    pub(crate) this_level: Arc<LevelHandler>,
    pub(crate) next_level: Arc<LevelHandler>,
    pub(crate) top: Vec<Arc<Table>>,
    pub(crate) bot: Vec<Arc<Table>>,
    pub(crate) this_range: KeyRange,
    pub(crate) next_range: KeyRange,
    pub(crate) splits: Vec<KeyRange>,
    pub(crate) this_size: u64,
}

#[derive(Clone)]
struct SubcompactParams {
    dir: PathBuf,
    block_size: usize,
    bloom_fp: f64,
    file_size: u64,
    /// Output feeds the bottom level: tombstones and expired entries are
    /// elided instead of written as stale shadows.
    drop_dead: bool,
}

impl LevelManager {
    fn last_level(&self) -> &Arc<LevelHandler> {
        self.levels.last().expect("levels are non-empty")
    }

    /// Computes per-level size targets from the bottom up.
    pub(crate) fn level_targets(&self) -> Targets {
        let adjust = |size: u64| size.max(self.config.base_level_size);
        let n = self.levels.len();
        let mut t = Targets {
            base_level: 0,
            target_size: vec![0; n],
            file_size: vec![0; n],
        };

        let mut db_size = self.last_level().total_size();
        for i in (1..n).rev() {
            let target = adjust(db_size);
            t.target_size[i] = target;
            if t.base_level == 0 && target <= self.config.base_level_size {
                t.base_level = i;
            }
            db_size /= self.config.level_size_multiplier;
        }
        if t.base_level == 0 {
            t.base_level = 1;
        }

        let mut table_size = self.config.base_table_size;
        for i in 0..n {
            t.file_size[i] = if i == 0 {
                self.config.mem_table_size
            } else if i <= t.base_level {
                table_size
            } else {
                table_size *= self.config.table_size_multiplier;
                table_size
            };
        }

        // Drain into the deepest empty level to cut write amplification.
        for i in t.base_level + 1..n {
            if self.levels[i].total_size() > 0 {
                break;
            }
            t.base_level = i;
        }

        // A dent: empty base with an underfilled level right below it.
        let b = t.base_level;
        if b < n - 1
            && self.levels[b].total_size() == 0
            && self.levels[b + 1].total_size() < t.target_size[b + 1]
        {
            t.base_level += 1;
        }
        t
    }

    /// Scores every level and returns the ones worth compacting, highest
    /// adjusted score first.
    pub(crate) fn pick_compact_levels(&self) -> Vec<CompactionPriority> {
        let t = self.level_targets();
        let mut prios: Vec<CompactionPriority> = Vec::with_capacity(self.levels.len());

        // L0 scores by table count; everything else by size.
        let l0_score =
            self.levels[0].num_tables() as f64 / self.config.num_level_zero_tables as f64;
        prios.push(CompactionPriority {
            level: 0,
            score: l0_score,
            adjusted: l0_score,
            targets: t.clone(),
        });
        for i in 1..self.levels.len() {
            // Bytes already claimed by running compactions don't count.
            let del_size = self.compact_status.del_size(i);
            let size = self.levels[i].total_size().saturating_sub(del_size);
            let score = size as f64 / t.target_size[i] as f64;
            prios.push(CompactionPriority {
                level: i,
                score,
                adjusted: score,
                targets: t.clone(),
            });
        }

        // Propagate pressure downward: a saturated child soaks up its
        // parent's urgency.
        let mut prev_level = 0;
        for level in t.base_level..self.levels.len() {
            if prios[prev_level].adjusted >= 1.0 {
                const MIN_SCORE: f64 = 0.01;
                if prios[level].score >= MIN_SCORE {
                    let divisor = prios[level].adjusted;
                    prios[prev_level].adjusted /= divisor;
                } else {
                    prios[prev_level].adjusted /= MIN_SCORE;
                }
            }
            prev_level = level;
        }

        prios.retain(|p| p.score >= 1.0);
        prios.sort_by(|a, b| {
            b.adjusted
                .partial_cmp(&a.adjusted)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        prios
    }

    /// One worker tick: try priorities in order until a compaction runs.
    pub(crate) async fn run_once(self: &Arc<Self>, id: usize) -> bool {
        let mut prios = self.pick_compact_levels();
        if id == 0 {
            // Worker 0 serves L0 first whenever it is pending.
            if let Some(idx) = prios.iter().position(|p| p.level == 0) {
                if idx > 0 {
                    let l0 = prios.remove(idx);
                    prios.insert(0, l0);
                }
            }
        }

        for p in prios {
            // Worker 0 runs L0 regardless of its adjusted score.
            if !(id == 0 && p.level == 0) && p.adjusted < 1.0 {
                break;
            }
            match self.do_compact(id, p).await {
                Ok(()) => return true,
                Err(Error::FillTables) => continue,
                Err(e) => {
                    tracing::error!(worker = id, error = %e, "compaction failed");
                    continue;
                }
            }
        }
        false
    }

    async fn do_compact(self: &Arc<Self>, id: usize, p: CompactionPriority) -> Result<()> {
        let level = p.level;
        assert!(level < self.config.max_levels, "priority for unknown level");

        let targets = if p.targets.base_level == 0 {
            self.level_targets()
        } else {
            p.targets.clone()
        };
        let mut cd = CompactDef {
            compactor_id: id,
            adjusted: p.adjusted,
            targets,
            this_level: Arc::clone(&self.levels[level]),
            next_level: Arc::clone(&self.levels[level]),
            top: Vec::new(),
            bot: Vec::new(),
            this_range: KeyRange::default(),
            next_range: KeyRange::default(),
            splits: Vec::new(),
            this_size: 0,
        };

        if level == 0 {
            cd.next_level = Arc::clone(&self.levels[cd.targets.base_level]);
            if !self.fill_tables_l0(&mut cd) {
                return Err(Error::FillTables);
            }
        } else {
            if level != self.config.max_levels - 1 {
                cd.next_level = Arc::clone(&self.levels[level + 1]);
            }
            if !self.fill_tables(&mut cd) {
                return Err(Error::FillTables);
            }
        }

        let result = self.run_compact_def(id, level, &mut cd).await;
        // Release the range reservations whatever happened.
        self.compact_status.delete(&cd);

        if let Err(e) = &result {
            tracing::warn!(worker = id, level, error = %e, "compaction aborted");
        }
        result
    }

    /// L0 drains to the base level; failing that, worker 0 may coalesce
    /// L0 into itself.
    fn fill_tables_l0(&self, cd: &mut CompactDef) -> bool {
        if self.fill_tables_l0_to_lbase(cd) {
            return true;
        }
        self.fill_tables_l0_to_l0(cd)
    }

    fn fill_tables_l0_to_lbase(&self, cd: &mut CompactDef) -> bool {
        assert!(cd.next_level.level() != 0, "base level cannot be zero");
        if cd.adjusted > 0.0 && cd.adjusted < 1.0 {
            return false;
        }

        let top = cd.this_level.tables_snapshot();
        if top.is_empty() {
            return false;
        }

        // Extend a consecutive prefix from the oldest table for as long
        // as the running range keeps overlapping the next table.
        let mut out = Vec::new();
        let mut kr = KeyRange::default();
        for table in top.iter().rev() {
            let dkr = KeyRange::from_tables(std::slice::from_ref(table));
            if kr.overlaps_with(&dkr) {
                out.push(Arc::clone(table));
                kr.extend(&dkr);
            } else {
                break;
            }
        }

        cd.this_range = KeyRange::from_tables(&out);
        cd.top = out;
        cd.bot = cd.next_level.overlapping_tables(&cd.this_range);
        cd.next_range = if cd.bot.is_empty() {
            cd.this_range.clone()
        } else {
            KeyRange::from_tables(&cd.bot)
        };
        self.compact_status.compare_and_add(cd)
    }

    /// Collapses many small, settled L0 tables into one to cut read
    /// amplification. Gated to worker 0 so two workers never take L0
    /// twice.
    fn fill_tables_l0_to_l0(&self, cd: &mut CompactDef) -> bool {
        if cd.compactor_id != 0 {
            return false;
        }

        cd.next_level = Arc::clone(&self.levels[0]);
        cd.next_range = KeyRange::default();
        cd.bot.clear();
        debug_assert_eq!(cd.this_level.level(), 0);

        let now = now_secs();
        let candidates: Vec<Arc<Table>> = cd
            .this_level
            .tables_snapshot()
            .into_iter()
            .filter(|t| t.size() < 2 * cd.targets.file_size[0])
            .filter(|t| now.saturating_sub(t.created_at()) >= LEVEL0_COALESCE_MIN_AGE_SECS)
            .collect();

        let Some(selected) = self
            .compact_status
            .try_reserve_level0(&candidates, LEVEL0_MIN_COALESCE)
        else {
            return false;
        };

        cd.this_range = KeyRange::infinite();
        cd.top = selected;
        // All inputs collapse into a single output table.
        cd.targets.file_size[0] = u32::MAX as u64;
        true
    }

    /// Plans for levels ≥ 1: the last level rewrites itself by stale
    /// bytes, everything else moves its oldest data down.
    fn fill_tables(&self, cd: &mut CompactDef) -> bool {
        let tables = cd.this_level.tables_snapshot();
        if tables.is_empty() {
            return false;
        }
        if cd.this_level.level() == cd.next_level.level() {
            return self.fill_max_level_tables(&tables, cd);
        }

        // Oldest data first, like kOldestLargestSeqFirst.
        let mut sorted = tables;
        sorted.sort_by_key(|t| t.max_version());

        for table in sorted {
            cd.this_size = table.size();
            cd.this_range = KeyRange::from_tables(std::slice::from_ref(&table));
            if self
                .compact_status
                .overlaps_with(cd.this_level.level(), &cd.this_range)
            {
                continue;
            }
            cd.top = vec![Arc::clone(&table)];
            cd.bot = cd.next_level.overlapping_tables(&cd.this_range);

            if cd.bot.is_empty() {
                cd.next_range = cd.this_range.clone();
                if !self.compact_status.compare_and_add(cd) {
                    continue;
                }
                return true;
            }
            cd.next_range = KeyRange::from_tables(&cd.bot);
            if self
                .compact_status
                .overlaps_with(cd.next_level.level(), &cd.next_range)
            {
                continue;
            }
            if !self.compact_status.compare_and_add(cd) {
                continue;
            }
            return true;
        }
        false
    }

    /// Last level → last level: pick the table with the most reclaimable
    /// bytes and, if it is small, widen the rewrite with its key-order
    /// neighbors until the output would reach the target file size.
    fn fill_max_level_tables(&self, tables: &[Arc<Table>], cd: &mut CompactDef) -> bool {
        let mut sorted: Vec<Arc<Table>> = tables.to_vec();
        sorted.sort_by(|a, b| b.stale_data_size().cmp(&a.stale_data_size()));
        if sorted.first().map_or(true, |t| t.stale_data_size() == 0) {
            return false;
        }

        cd.bot.clear();
        let now = now_secs();
        for table in &sorted {
            if now.saturating_sub(table.created_at()) < LAST_LEVEL_MIN_AGE_SECS {
                continue;
            }
            if table.stale_data_size() < LAST_LEVEL_MIN_STALE_BYTES {
                continue;
            }
            cd.this_size = table.size();
            cd.this_range = KeyRange::from_tables(std::slice::from_ref(table));
            // Same range on both slots, or only one max-level compaction
            // could ever run.
            cd.next_range = cd.this_range.clone();
            if self
                .compact_status
                .overlaps_with(cd.this_level.level(), &cd.this_range)
            {
                continue;
            }

            cd.top = vec![Arc::clone(table)];
            let need_size = cd.targets.file_size[cd.this_level.level()];
            if table.size() >= need_size {
                break;
            }

            // `tables` is in key order; extend to the right.
            let start = tables
                .iter()
                .position(|t| t.fid() == table.fid())
                .expect("table came from this level");
            let mut total = table.size();
            for neighbor in &tables[start + 1..] {
                total += neighbor.size();
                if total >= need_size {
                    break;
                }
                cd.bot.push(Arc::clone(neighbor));
                cd.next_range
                    .extend(&KeyRange::from_tables(std::slice::from_ref(neighbor)));
            }
            if !self.compact_status.compare_and_add(cd) {
                cd.bot.clear();
                cd.next_range = KeyRange::default();
                continue;
            }
            return true;
        }
        if cd.top.is_empty() {
            return false;
        }
        self.compact_status.compare_and_add(cd)
    }

    /// Splits the plan into up to five sub-ranges along `bot`'s keys.
    fn add_splits(&self, cd: &mut CompactDef) {
        cd.splits.clear();
        let width = cd.bot.len().div_ceil(MAX_SPLITS).max(MIN_SPLIT_WIDTH);

        let mut skr = cd.this_range.clone();
        skr.extend(&cd.next_range);
        for (i, table) in cd.bot.iter().enumerate() {
            if i == cd.bot.len() - 1 {
                // Trailing open-ended bucket.
                skr.right = Vec::new();
                cd.splits.push(skr.clone());
                return;
            }
            if i % width == width - 1 {
                // All versions of the boundary user key fall right of it.
                skr.right = key_with_ts(parse_key(table.max_key()), u64::MAX);
                cd.splits.push(skr.clone());
                skr.left = skr.right.clone();
            }
        }
    }

    async fn run_compact_def(
        self: &Arc<Self>,
        id: usize,
        level: usize,
        cd: &mut CompactDef,
    ) -> Result<()> {
        if cd.targets.file_size.is_empty() {
            return Err(Error::Corruption("compaction targets not set".to_string()));
        }
        let start = Instant::now();

        if cd.this_level.level() != cd.next_level.level() {
            self.add_splits(cd);
        }
        if cd.splits.is_empty() {
            cd.splits.push(KeyRange::default());
        }

        let new_tables = self.compact_build_tables(level, cd).await?;

        let mut changes = Vec::with_capacity(new_tables.len() + cd.top.len() + cd.bot.len());
        for table in &new_tables {
            changes.push(ManifestChange::Create {
                fid: table.fid(),
                level: cd.next_level.level() as u32,
                checksum: table.checksum_bytes(),
            });
        }
        for table in cd.top.iter().chain(cd.bot.iter()) {
            changes.push(ManifestChange::Delete { fid: table.fid() });
        }
        // The commit point: the manifest records the transition before
        // readers can observe it.
        self.manifest.add_changes(changes)?;

        cd.next_level.replace_tables(&cd.bot, &new_tables);
        cd.this_level.delete_tables(&cd.top);

        tracing::info!(
            worker = id,
            from = cd.this_level.level(),
            to = cd.next_level.level(),
            top = cd.top.len(),
            bot = cd.bot.len(),
            out = new_tables.len(),
            splits = cd.splits.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "compacted tables"
        );
        Ok(())
    }

    /// Runs every sub-compaction concurrently, bounded by a throttle of
    /// `8 + splits` in-flight builders, and collects the output tables.
    async fn compact_build_tables(
        self: &Arc<Self>,
        lev: usize,
        cd: &CompactDef,
    ) -> Result<Vec<Arc<Table>>> {
        let params = SubcompactParams {
            dir: self.config.dir.clone(),
            block_size: self.config.block_size,
            bloom_fp: self.config.bloom_false_positive,
            file_size: cd.targets.file_size[cd.next_level.level()],
            drop_dead: cd.next_level.level() == self.config.max_levels - 1,
        };

        let throttle = Arc::new(Semaphore::new(8 + cd.splits.len()));
        let (tx, mut rx) = mpsc::unbounded_channel::<Arc<Table>>();

        let mut subtasks = Vec::with_capacity(cd.splits.len());
        for kr in cd.splits.clone() {
            let permit = Arc::clone(&throttle)
                .acquire_owned()
                .await
                .map_err(|e| Error::Io(e.to_string()))?;
            let lm = Arc::clone(self);
            let iters = build_source_iterators(lev, &cd.top, &cd.bot);
            let params = params.clone();
            let throttle = Arc::clone(&throttle);
            let tx = tx.clone();
            subtasks.push(tokio::spawn(async move {
                let _permit = permit;
                let merged = MergeIterator::new(iters);
                lm.subcompact(merged, kr, params, throttle, tx).await
            }));
        }
        drop(tx);

        let collector = tokio::spawn(async move {
            let mut tables = Vec::new();
            while let Some(table) = rx.recv().await {
                tables.push(table);
            }
            tables
        });

        let mut first_err: Option<Error> = None;
        for task in subtasks {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    first_err.get_or_insert(e);
                }
                Err(e) => {
                    first_err.get_or_insert(Error::from(e));
                }
            }
        }
        let mut new_tables = collector.await?;

        if first_err.is_none() {
            if let Err(e) = sync_dir(&self.config.dir) {
                first_err = Some(e);
            }
        }
        if let Some(e) = first_err {
            // Uncommitted outputs; unlink them now, revert sweeps any
            // survivors at the next open.
            for table in &new_tables {
                table.mark_dead();
            }
            return Err(e);
        }

        new_tables.sort_by(|a, b| compare_keys(a.max_key(), b.max_key()));
        Ok(new_tables)
    }

    /// Merges one key sub-range into fresh output tables.
    async fn subcompact(
        self: Arc<Self>,
        mut iter: MergeIterator,
        kr: KeyRange,
        params: SubcompactParams,
        throttle: Arc<Semaphore>,
        tx: mpsc::UnboundedSender<Arc<Table>>,
    ) -> Result<()> {
        let mut discard_stats: DiscardStats = HashMap::new();
        if kr.left.is_empty() {
            iter.rewind();
        } else {
            iter.seek(&kr.left);
        }

        let mut last_key: Vec<u8> = Vec::new();
        let mut flushes = Vec::new();
        while iter.valid() {
            if !kr.right.is_empty()
                && compare_keys(iter.key(), &kr.right) != std::cmp::Ordering::Less
            {
                break;
            }

            let mut builder =
                TableBuilder::new(params.block_size, params.bloom_fp, params.file_size);
            while iter.valid() {
                let key = iter.key();
                if !same_key(key, &last_key) {
                    if !kr.right.is_empty()
                        && compare_keys(key, &kr.right) != std::cmp::Ordering::Less
                    {
                        break;
                    }
                    if builder.reached_capacity() {
                        break;
                    }
                    last_key = key.to_vec();
                    let vs = iter.value();
                    if vs.is_deleted_or_expired() {
                        // The newest version is dead. Keep a stale shadow
                        // so older versions below stay covered, unless
                        // this output lands on the bottom level.
                        track_discard(&mut discard_stats, &vs);
                        if !params.drop_dead {
                            builder.add_stale_key(&last_key, &vs);
                        }
                    } else {
                        builder.add_key(&last_key, &vs);
                    }
                } else {
                    // A strictly older version of the key just emitted.
                    track_discard(&mut discard_stats, &iter.value());
                }
                iter.next();
            }
            if builder.is_empty() {
                continue;
            }

            let fid = self.next_fid();
            let path = table_file_path(&params.dir, fid);
            let permit = Arc::clone(&throttle)
                .acquire_owned()
                .await
                .map_err(|e| Error::Io(e.to_string()))?;
            let tx = tx.clone();
            flushes.push(tokio::spawn(async move {
                let _permit = permit;
                let image = builder.finish();
                let table = Table::create(&path, fid, &image)?;
                tracing::debug!(fid, size = table.size(), "wrote compaction output");
                let _ = tx.send(table);
                Ok::<(), Error>(())
            }));
        }

        let mut result = Ok(());
        for flush in flushes {
            match flush.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
                Err(e) => {
                    if result.is_ok() {
                        result = Err(Error::from(e));
                    }
                }
            }
        }
        if let Some(e) = iter.err() {
            if result.is_ok() {
                result = Err(e);
            }
        }
        self.update_discard_stats(discard_stats);
        result
    }

    /// Best-effort hand-off to the value log.
    fn update_discard_stats(&self, stats: DiscardStats) {
        if stats.is_empty() {
            return;
        }
        if let Some(tx) = &self.config.discard_stats {
            if tx.try_send(stats).is_err() {
                tracing::debug!("discard stats channel unavailable, dropping update");
            }
        }
    }
}

fn build_source_iterators(
    lev: usize,
    top: &[Arc<Table>],
    bot: &[Arc<Table>],
) -> Vec<Box<dyn EntryIterator>> {
    let mut iters: Vec<Box<dyn EntryIterator>> = Vec::new();
    if lev == 0 {
        // Newest fid first so merge ties resolve to the newest data.
        for table in top.iter().rev() {
            iters.push(Box::new(TableIterator::new(Arc::clone(table))));
        }
    } else if !top.is_empty() {
        iters.push(Box::new(TableIterator::new(Arc::clone(&top[0]))));
    }
    iters.push(Box::new(ConcatIterator::new(bot.to_vec())));
    iters
}

fn track_discard(stats: &mut DiscardStats, vs: &ValueStruct) {
    if vs.meta & BIT_VALUE_POINTER == 0 {
        return;
    }
    if vs.value.len() < ValuePointer::ENCODED_SIZE {
        return;
    }
    let vp = ValuePointer::decode(&vs.value);
    *stats.entry(vp.fid).or_insert(0) += vp.len as i64;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LsmConfig;
    use crate::keys::key_with_ts;
    use crate::tmpfs::TempDir;

    fn test_config(dir: &TempDir) -> LsmConfig {
        LsmConfig::new(dir.path())
            .max_levels(2)
            .num_level_zero_tables(2)
            .mem_table_size(1 << 20)
            .base_table_size(64 << 10)
            .base_level_size(1 << 20)
    }

    /// Builds a table from (key, version, value) triples and splices it
    /// into `level`, staging it through the manifest first.
    fn inject_table(
        lm: &Arc<LevelManager>,
        level: usize,
        entries: &[(&[u8], u64, &[u8])],
    ) -> Arc<Table> {
        let mut builder = TableBuilder::new(4096, 0.01, 1 << 20);
        let mut sorted: Vec<_> = entries.to_vec();
        sorted.sort_by(|a, b| compare_keys(&key_with_ts(a.0, a.1), &key_with_ts(b.0, b.1)));
        for (key, version, value) in sorted {
            builder.add_key(
                &key_with_ts(key, version),
                &ValueStruct {
                    meta: 0,
                    value: value.to_vec(),
                    expires_at: 0,
                    version,
                },
            );
        }
        let fid = lm.next_fid();
        let path = table_file_path(&lm.config.dir, fid);
        let table = Table::create(&path, fid, &builder.finish()).unwrap();
        lm.manifest
            .add_changes(vec![ManifestChange::Create {
                fid,
                level: level as u32,
                checksum: table.checksum_bytes(),
            }])
            .unwrap();
        lm.levels[level].replace_tables(&[], &[Arc::clone(&table)]);
        table
    }

    #[test]
    fn test_level_targets_small_db() {
        let dir = TempDir::new().unwrap();
        let lm = Arc::new(LevelManager::open(test_config(&dir)).unwrap());
        let t = lm.level_targets();
        assert_eq!(t.base_level, 1);
        assert_eq!(t.file_size[0], 1 << 20);
        assert_eq!(t.target_size[1], 1 << 20);
    }

    #[test]
    fn test_pick_compact_levels_scores_l0_by_count() {
        let dir = TempDir::new().unwrap();
        let lm = Arc::new(LevelManager::open(test_config(&dir)).unwrap());
        inject_table(&lm, 0, &[(b"a", 1, b"v")]);
        inject_table(&lm, 0, &[(b"b", 2, b"v")]);
        inject_table(&lm, 0, &[(b"c", 3, b"v")]);

        let prios = lm.pick_compact_levels();
        let l0 = prios.iter().find(|p| p.level == 0).expect("L0 pending");
        assert!((l0.score - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_pick_compact_levels_quiet_store() {
        let dir = TempDir::new().unwrap();
        let lm = Arc::new(LevelManager::open(test_config(&dir)).unwrap());
        inject_table(&lm, 0, &[(b"a", 1, b"v")]);
        assert!(lm.pick_compact_levels().is_empty());
    }

    #[tokio::test]
    async fn test_l0_to_base_compaction() {
        crate::tmpfs::init_tracing();
        let dir = TempDir::new().unwrap();
        let lm = Arc::new(LevelManager::open(test_config(&dir)).unwrap());

        // Base level: disjoint ranges a..c, d..f, g..i at old versions.
        inject_table(&lm, 1, &[(b"a", 1, b"L1"), (b"b", 1, b"L1"), (b"c", 1, b"L1")]);
        inject_table(&lm, 1, &[(b"d", 1, b"L1"), (b"e", 1, b"L1"), (b"f", 1, b"L1")]);
        inject_table(&lm, 1, &[(b"g", 1, b"L1"), (b"h", 1, b"L1"), (b"i", 1, b"L1")]);

        // L0: overlapping ranges a..m, g..t, p..z, oldest first.
        inject_table(
            &lm,
            0,
            &[(b"a", 10, b"t1"), (b"e", 10, b"t1"), (b"g", 10, b"t1"), (b"m", 10, b"t1")],
        );
        inject_table(
            &lm,
            0,
            &[(b"g", 20, b"t2"), (b"j", 20, b"t2"), (b"t", 20, b"t2")],
        );
        inject_table(
            &lm,
            0,
            &[(b"p", 30, b"t3"), (b"v", 30, b"t3"), (b"z", 30, b"t3")],
        );

        let before = lm.manifest.manifest();
        assert_eq!(before.tables.len(), 6);

        let prios = lm.pick_compact_levels();
        let l0 = prios
            .iter()
            .find(|p| p.level == 0)
            .expect("L0 must be pending")
            .clone();
        lm.do_compact(0, l0).await.unwrap();

        // The consecutive overlap chain covers all three L0 tables, and
        // their joint range a..z drags in every base table.
        assert_eq!(lm.levels[0].num_tables(), 0, "L0 must drain completely");
        let after = lm.manifest.manifest();
        for fid in before.tables.keys() {
            assert!(
                !after.tables.contains_key(fid),
                "old table {fid} must be deleted from the manifest"
            );
        }
        assert!(after.levels[0].is_empty());
        assert!(!after.levels[1].is_empty());

        // The base level is disjoint, sorted, and covers a..z.
        let tables = lm.levels[1].tables_snapshot();
        for window in tables.windows(2) {
            assert!(
                compare_keys(window[0].max_key(), window[1].min_key())
                    == std::cmp::Ordering::Less,
                "base level ranges must stay disjoint"
            );
        }

        // Newest versions won; untouched base keys survived.
        let cases: &[(&[u8], &[u8], u64)] = &[
            (b"a", b"t1", 10),
            (b"b", b"L1", 1),
            (b"e", b"t1", 10),
            (b"g", b"t2", 20),
            (b"j", b"t2", 20),
            (b"p", b"t3", 30),
            (b"z", b"t3", 30),
        ];
        for (key, value, version) in cases {
            let vs = lm
                .get(&key_with_ts(key, u64::MAX))
                .unwrap()
                .unwrap_or_else(|| panic!("missing {}", String::from_utf8_lossy(key)));
            assert_eq!(&vs.value, value);
            assert_eq!(vs.version, *version);
        }
    }

    #[tokio::test]
    async fn test_middle_level_move_without_overlap() {
        let dir = TempDir::new().unwrap();
        let config = LsmConfig::new(dir.path())
            .max_levels(3)
            .num_level_zero_tables(2)
            .mem_table_size(1 << 20)
            .base_table_size(64 << 10)
            .base_level_size(64 << 10);
        let lm = Arc::new(LevelManager::open(config).unwrap());

        // A level-1 table with no overlap below moves down untouched in
        // content, rewritten under a new fid.
        let t = inject_table(&lm, 1, &[(b"a", 1, b"v"), (b"b", 1, b"v")]);
        let old_fid = t.fid();
        drop(t);

        let targets = lm.level_targets();
        let p = CompactionPriority {
            level: 1,
            score: 1.0,
            adjusted: 1.0,
            targets,
        };
        lm.do_compact(1, p).await.unwrap();

        assert_eq!(lm.levels[1].num_tables(), 0);
        assert_eq!(lm.levels[2].num_tables(), 1);
        let m = lm.manifest.manifest();
        assert!(!m.tables.contains_key(&old_fid));
        let vs = lm.get(&key_with_ts(b"a", u64::MAX)).unwrap().unwrap();
        assert_eq!(vs.value, b"v");
    }

    #[tokio::test]
    async fn test_tombstones_elided_at_bottom_level() {
        let dir = TempDir::new().unwrap();
        let lm = Arc::new(LevelManager::open(test_config(&dir)).unwrap());

        // L0 holds a tombstone shadowing a live base-level key. With
        // max_levels = 2 the base level is the bottom, so the tombstone
        // and the dead key both vanish.
        inject_table(&lm, 1, &[(b"doomed", 1, b"old"), (b"keep", 1, b"ok")]);
        let mut builder = TableBuilder::new(4096, 0.01, 1 << 20);
        builder.add_key(
            &key_with_ts(b"doomed", 9),
            &ValueStruct {
                meta: crate::entry::BIT_DELETE,
                value: Vec::new(),
                expires_at: 0,
                version: 9,
            },
        );
        let fid = lm.next_fid();
        let table =
            Table::create(&table_file_path(&lm.config.dir, fid), fid, &builder.finish()).unwrap();
        lm.manifest
            .add_changes(vec![ManifestChange::Create {
                fid,
                level: 0,
                checksum: table.checksum_bytes(),
            }])
            .unwrap();
        lm.levels[0].replace_tables(&[], &[table]);

        let targets = lm.level_targets();
        let p = CompactionPriority {
            level: 0,
            score: 1.0,
            adjusted: 1.0,
            targets,
        };
        lm.do_compact(0, p).await.unwrap();

        assert!(lm.get(&key_with_ts(b"doomed", u64::MAX)).unwrap().is_none());
        let vs = lm.get(&key_with_ts(b"keep", u64::MAX)).unwrap().unwrap();
        assert_eq!(vs.value, b"ok");
    }

    #[test]
    fn test_track_discard_collects_value_pointers() {
        let vp = ValuePointer {
            fid: 3,
            len: 100,
            offset: 0,
        };
        let pointer = ValueStruct {
            meta: BIT_VALUE_POINTER,
            value: vp.encode(),
            expires_at: 0,
            version: 1,
        };
        let plain = ValueStruct {
            meta: 0,
            value: b"inline".to_vec(),
            expires_at: 0,
            version: 1,
        };

        let mut stats = DiscardStats::new();
        track_discard(&mut stats, &pointer);
        track_discard(&mut stats, &pointer);
        track_discard(&mut stats, &plain);
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[&3], 200);
    }

    #[tokio::test]
    async fn test_discard_stats_reach_value_log() {
        crate::tmpfs::init_tracing();
        let dir = TempDir::new().unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        let config = test_config(&dir).discard_stats(tx);
        let lm = Arc::new(LevelManager::open(config).unwrap());

        // An old value-pointer version at the base level, shadowed by a
        // newer inline value at L0. Compaction drops the old version and
        // must report its value-log bytes.
        let vp = ValuePointer {
            fid: 7,
            len: 4096,
            offset: 0,
        };
        let mut builder = TableBuilder::new(4096, 0.01, 1 << 20);
        builder.add_key(
            &key_with_ts(b"k", 1),
            &ValueStruct {
                meta: BIT_VALUE_POINTER,
                value: vp.encode(),
                expires_at: 0,
                version: 1,
            },
        );
        let fid = lm.next_fid();
        let table =
            Table::create(&table_file_path(&lm.config.dir, fid), fid, &builder.finish()).unwrap();
        lm.manifest
            .add_changes(vec![ManifestChange::Create {
                fid,
                level: 1,
                checksum: table.checksum_bytes(),
            }])
            .unwrap();
        lm.levels[1].replace_tables(&[], &[table]);

        inject_table(&lm, 0, &[(b"k", 2, b"fresh")]);

        let p = CompactionPriority {
            level: 0,
            score: 1.0,
            adjusted: 1.0,
            targets: lm.level_targets(),
        };
        lm.do_compact(0, p).await.unwrap();

        let stats = rx.try_recv().expect("discard stats must be forwarded");
        assert_eq!(stats[&7], 4096);
        assert_eq!(lm.get(&key_with_ts(b"k", u64::MAX)).unwrap().unwrap().value, b"fresh");
    }

    #[test]
    fn test_add_splits_buckets() {
        let dir = TempDir::new().unwrap();
        let lm = Arc::new(LevelManager::open(test_config(&dir)).unwrap());

        let mut bot = Vec::new();
        for i in 0..7u8 {
            let key = [b'a' + 2 * i];
            let entries: &[(&[u8], u64, &[u8])] = &[(&key, 1, b"v")];
            bot.push(inject_table(&lm, 1, entries));
        }
        let top = inject_table(&lm, 0, &[(b"a", 9, b"v"), (b"z", 9, b"v")]);

        let mut cd = CompactDef {
            compactor_id: 0,
            adjusted: 1.0,
            targets: lm.level_targets(),
            this_level: Arc::clone(&lm.levels[0]),
            next_level: Arc::clone(&lm.levels[1]),
            top: vec![top],
            bot: bot.clone(),
            this_range: KeyRange::infinite(),
            next_range: KeyRange::from_tables(&bot),
            splits: Vec::new(),
            this_size: 0,
        };
        lm.add_splits(&mut cd);

        // ceil(7/5) = 2 < 3, so width 3: buckets end after indexes 2 and
        // 5, plus the trailing open bucket.
        assert_eq!(cd.splits.len(), 3);
        assert!(cd.splits[2].right.is_empty());
        for pair in cd.splits.windows(2) {
            assert_eq!(pair[0].right, pair[1].left);
        }
    }
}
