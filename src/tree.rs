//! The LSM coordinator.
//!
//! Writes land in the active memtable (WAL first, then the skiplist);
//! when the active table fills it is sealed into the immutables queue
//! and drained to level 0. Reads walk active → immutables newest-first →
//! the level hierarchy. Background compaction workers are scheduler
//! tasks that tick until shutdown.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use rand::Rng;

use crate::config::LsmConfig;
use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::keys::key_with_ts;
use crate::levels::LevelManager;
use crate::memtable::{parse_wal_fid, MemTable};
use crate::scheduler::{BackgroundTask, Context, Scheduler};
use crate::wal::Wal;

pub struct LsmTree {
    config: LsmConfig,
    levels: Arc<LevelManager>,
    active: RwLock<Arc<MemTable>>,
    immutables: RwLock<VecDeque<Arc<MemTable>>>,
    next_mem_fid: AtomicU64,
    next_version: AtomicU64,
    flush_lock: Mutex<()>,
    scheduler: Scheduler,
}

impl LsmTree {
    /// Opens (or creates) a store in `config.dir`: manifest replay, table
    /// reconciliation, and WAL recovery for any memtables that never made
    /// it to level 0.
    pub fn open(config: LsmConfig) -> Result<LsmTree> {
        std::fs::create_dir_all(&config.dir)?;
        let levels = Arc::new(LevelManager::open(config.clone())?);

        let mut wal_fids: Vec<u64> = std::fs::read_dir(&config.dir)?
            .filter_map(|dirent| {
                let dirent = dirent.ok()?;
                dirent.file_name().to_str().and_then(parse_wal_fid)
            })
            .collect();
        wal_fids.sort_unstable();

        let mut max_version = levels.max_version();
        let mut immutables = VecDeque::new();
        for fid in &wal_fids {
            let mem = MemTable::open(&config.dir, *fid, config.arena_size())?;
            max_version = max_version.max(mem.max_version());
            if mem.is_empty() {
                mem.mark_flushed();
                continue;
            }
            tracing::info!(fid, size = mem.wal_size(), "recovered memtable from wal");
            immutables.push_back(Arc::new(mem));
        }

        let next_mem_fid = wal_fids.last().map_or(1, |fid| fid + 1);
        let active = Arc::new(MemTable::create(
            &config.dir,
            next_mem_fid,
            config.arena_size(),
        )?);

        Ok(LsmTree {
            levels,
            active: RwLock::new(active),
            immutables: RwLock::new(immutables),
            next_mem_fid: AtomicU64::new(next_mem_fid + 1),
            next_version: AtomicU64::new(max_version),
            flush_lock: Mutex::new(()),
            config,
            scheduler: Scheduler::new(),
        })
    }

    /// Launches the configured number of compaction workers. Each ticks
    /// on its own interval after a random startup delay; worker 0
    /// prioritizes level 0.
    pub fn start_compactors(&self) {
        let jitter_cap = self.config.compaction_startup_jitter.max(Duration::from_millis(1));
        for worker_id in 0..self.config.num_compactors {
            let startup_delay = rand::thread_rng().gen_range(Duration::ZERO..jitter_cap);
            self.scheduler.register(Arc::new(CompactionTask {
                levels: Arc::clone(&self.levels),
                worker_id,
                interval: self.config.compaction_interval,
                startup_delay,
            }));
        }
    }

    /// Inserts or overwrites one entry. A zero version is stamped from
    /// the store's monotonic counter.
    pub fn set(&self, entry: Entry) -> Result<()> {
        if entry.key.is_empty() {
            return Err(Error::EmptyKey);
        }
        let mut entry = entry;
        if entry.version == 0 {
            entry.version = self.next_version.fetch_add(1, Ordering::SeqCst) + 1;
        } else {
            self.next_version.fetch_max(entry.version, Ordering::SeqCst);
        }

        self.ensure_room(&entry)?;
        {
            let active = self.active.read()?;
            active.set(&entry)?;
        }
        self.flush_immutables()
    }

    /// Writes a tombstone for `key`.
    pub fn del(&self, key: &[u8]) -> Result<()> {
        self.set(Entry::new(key.to_vec(), Vec::new()).mark_tombstone())
    }

    /// Returns the newest live version of `key`.
    pub fn get(&self, key: &[u8]) -> Result<Entry> {
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }
        let internal = key_with_ts(key, u64::MAX);

        let found = 'search: {
            if let Some(vs) = self.active.read()?.get(&internal) {
                break 'search Some(vs);
            }
            {
                let immutables = self.immutables.read()?;
                for mem in immutables.iter().rev() {
                    if let Some(vs) = mem.get(&internal) {
                        break 'search Some(vs);
                    }
                }
            }
            self.levels.get(&internal)?
        };

        match found {
            Some(vs) if !vs.is_deleted_or_expired() => Ok(Entry {
                key: key.to_vec(),
                value: vs.value,
                expires_at: vs.expires_at,
                meta: vs.meta,
                version: vs.version,
            }),
            _ => Err(Error::NotFound),
        }
    }

    /// Flushes the active memtable's WAL to disk.
    pub fn sync(&self) -> Result<()> {
        self.active.read()?.wal.sync()
    }

    /// Rotates the active memtable if `entry` would overfill it.
    fn ensure_room(&self, entry: &Entry) -> Result<()> {
        let full = {
            let active = self.active.read()?;
            self.memtable_full(&active, entry)
        };
        if !full {
            return Ok(());
        }

        let mut active = self.active.write()?;
        if !self.memtable_full(&active, entry) {
            // Another writer rotated first.
            return Ok(());
        }
        let fid = self.next_mem_fid.fetch_add(1, Ordering::SeqCst);
        let fresh = Arc::new(MemTable::create(
            &self.config.dir,
            fid,
            self.config.arena_size(),
        )?);
        let sealed = std::mem::replace(&mut *active, fresh);
        tracing::info!(fid = sealed.fid(), size = sealed.wal_size(), "sealed memtable");
        self.immutables.write()?.push_back(sealed);
        Ok(())
    }

    fn memtable_full(&self, mem: &MemTable, entry: &Entry) -> bool {
        if mem.wal_size() + Wal::encoded_size(entry) > self.config.mem_table_size {
            return true;
        }
        // The arena never grows with readers active; rotate while there
        // is still headroom for the worst-case node.
        let worst_case = (crate::memtable::skiplist::Node::MAX_SIZE
            + entry.key.len()
            + entry.value.len()
            + 64) as u64;
        mem.skiplist.mem_size() as u64 + worst_case > self.config.arena_size() as u64
    }

    /// Drains the immutables queue into level 0, oldest first. Skips out
    /// if another caller is already draining.
    fn flush_immutables(&self) -> Result<()> {
        let Ok(_guard) = self.flush_lock.try_lock() else {
            return Ok(());
        };
        self.drain_immutables()
    }

    fn drain_immutables(&self) -> Result<()> {
        loop {
            let mem = {
                let immutables = self.immutables.read()?;
                immutables.front().cloned()
            };
            let Some(mem) = mem else {
                return Ok(());
            };
            self.levels.flush(&mem)?;
            mem.mark_flushed();
            self.immutables.write()?.pop_front();
        }
    }

    /// Cooperative shutdown: stop the compactors, flush everything still
    /// in memory, close the manifest.
    pub async fn close(&self) -> Result<()> {
        self.scheduler.shutdown().await?;

        let _guard = self.flush_lock.lock()?;
        self.drain_immutables()?;
        let active = {
            let active = self.active.read()?;
            Arc::clone(&active)
        };
        if !active.is_empty() {
            self.levels.flush(&active)?;
        }
        active.mark_flushed();
        self.levels.close()
    }
}

struct CompactionTask {
    levels: Arc<LevelManager>,
    worker_id: usize,
    interval: Duration,
    startup_delay: Duration,
}

#[async_trait::async_trait]
impl BackgroundTask for CompactionTask {
    fn name(&self) -> &'static str {
        "compaction"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn startup_delay(&self) -> Duration {
        self.startup_delay
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        self.levels.run_once(self.worker_id).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    fn test_config(dir: &TempDir) -> LsmConfig {
        LsmConfig::new(dir.path())
            .mem_table_size(1 << 20)
            .num_compactors(2)
            .compaction_interval(Duration::from_millis(20))
            .compaction_startup_jitter(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_read_your_write() -> Result<()> {
        let dir = TempDir::new()?;
        let tree = LsmTree::open(test_config(&dir))?;

        tree.set(Entry::new(&b"k"[..], &b"v"[..]))?;
        let e = tree.get(b"k")?;
        assert_eq!(e.value, b"v");
        assert!(e.version > 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() -> Result<()> {
        let dir = TempDir::new()?;
        let tree = LsmTree::open(test_config(&dir))?;
        assert!(matches!(tree.get(b"nope"), Err(Error::NotFound)));
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_key_rejected() -> Result<()> {
        let dir = TempDir::new()?;
        let tree = LsmTree::open(test_config(&dir))?;
        assert!(matches!(
            tree.set(Entry::new(Vec::new(), &b"v"[..])),
            Err(Error::EmptyKey)
        ));
        assert!(matches!(tree.get(b""), Err(Error::EmptyKey)));
        Ok(())
    }

    #[tokio::test]
    async fn test_versions_are_monotone() -> Result<()> {
        let dir = TempDir::new()?;
        let tree = LsmTree::open(test_config(&dir))?;

        tree.set(Entry::new(&b"k"[..], &b"v1"[..]))?;
        let first = tree.get(b"k")?.version;
        tree.set(Entry::new(&b"k"[..], &b"v2"[..]))?;
        let second = tree.get(b"k")?;

        assert!(second.version > first);
        assert_eq!(second.value, b"v2");
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_shadows_value() -> Result<()> {
        let dir = TempDir::new()?;
        let tree = LsmTree::open(test_config(&dir))?;

        tree.set(Entry::new(&b"k"[..], &b"v"[..]))?;
        tree.del(b"k")?;
        assert!(matches!(tree.get(b"k"), Err(Error::NotFound)));

        // Writing again resurrects the key at a newer version.
        tree.set(Entry::new(&b"k"[..], &b"v2"[..]))?;
        assert_eq!(tree.get(b"k")?.value, b"v2");
        Ok(())
    }

    #[tokio::test]
    async fn test_expired_entry_is_gone() -> Result<()> {
        let dir = TempDir::new()?;
        let tree = LsmTree::open(test_config(&dir))?;

        let mut dead = Entry::new(&b"ttl"[..], &b"v"[..]);
        dead.expires_at = 1;
        tree.set(dead)?;
        assert!(matches!(tree.get(b"ttl"), Err(Error::NotFound)));

        let alive = Entry::new(&b"ttl2"[..], &b"v"[..]).with_ttl(Duration::from_secs(3600));
        tree.set(alive)?;
        assert_eq!(tree.get(b"ttl2")?.value, b"v");
        Ok(())
    }

    #[tokio::test]
    async fn test_rotation_flushes_to_level0() -> Result<()> {
        crate::tmpfs::init_tracing();
        let dir = TempDir::new()?;
        let config = test_config(&dir).mem_table_size(4 << 10);
        let tree = LsmTree::open(config)?;

        for i in 0..200 {
            let key = format!("key_{i:04}");
            let value = vec![b'x'; 64];
            tree.set(Entry::new(key.into_bytes(), value))?;
        }

        assert!(
            tree.levels.levels[0].num_tables() > 0,
            "rotation must have flushed tables to level 0"
        );
        for i in 0..200 {
            let key = format!("key_{i:04}");
            assert_eq!(tree.get(key.as_bytes())?.value, vec![b'x'; 64]);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_wal_recovery_after_drop() -> Result<()> {
        let dir = TempDir::new()?;
        {
            let tree = LsmTree::open(test_config(&dir))?;
            tree.set(Entry::new(&b"durable"[..], &b"yes"[..]))?;
            tree.sync()?;
            // Dropped without close: only the WAL survives.
        }

        let tree = LsmTree::open(test_config(&dir))?;
        assert_eq!(tree.get(b"durable")?.value, b"yes");
        Ok(())
    }

    #[tokio::test]
    async fn test_close_flushes_active() -> Result<()> {
        let dir = TempDir::new()?;
        {
            let tree = LsmTree::open(test_config(&dir))?;
            tree.set(Entry::new(&b"k"[..], &b"v"[..]))?;
            tree.close().await?;
        }

        // Everything lives in tables now; no WAL files remain.
        let wal_count = std::fs::read_dir(dir.path())?
            .filter_map(|d| d.ok())
            .filter(|d| d.file_name().to_string_lossy().ends_with(".wal"))
            .count();
        assert_eq!(wal_count, 0, "close must flush and remove every wal");

        let tree = LsmTree::open(test_config(&dir))?;
        assert_eq!(tree.get(b"k")?.value, b"v");
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_background_compaction_keeps_data() -> Result<()> {
        crate::tmpfs::init_tracing();
        let dir = TempDir::new()?;
        let config = test_config(&dir)
            .mem_table_size(4 << 10)
            .num_level_zero_tables(2)
            .max_levels(3)
            .base_table_size(8 << 10)
            .base_level_size(16 << 10);
        let tree = LsmTree::open(config)?;
        tree.start_compactors();

        for i in 0..500 {
            let key = format!("key_{i:04}");
            let value = format!("value_{i:04}").repeat(8);
            tree.set(Entry::new(key.into_bytes(), value.into_bytes()))?;
        }
        tokio::time::sleep(Duration::from_millis(400)).await;

        for i in 0..500 {
            let key = format!("key_{i:04}");
            let expect = format!("value_{i:04}").repeat(8);
            assert_eq!(tree.get(key.as_bytes())?.value, expect.as_bytes());
        }
        tree.close().await?;
        Ok(())
    }
}
