//! The on-disk level hierarchy and its coordinator.

pub(crate) mod compaction;
pub(crate) mod handler;
pub(crate) mod status;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::LsmConfig;
use crate::entry::ValueStruct;
use crate::error::Result;
use crate::manifest::{ManifestChange, ManifestFile};
use crate::memtable::MemTable;
use crate::sstable::builder::TableBuilder;
use crate::sstable::table::Table;
use crate::sstable::{load_table_fids, sync_dir, table_file_path};

use handler::LevelHandler;
use status::CompactStatus;

/// Owns the level handlers, the manifest, and the compaction machinery.
pub struct LevelManager {
    pub(crate) config: LsmConfig,
    pub(crate) levels: Vec<Arc<LevelHandler>>,
    pub(crate) manifest: ManifestFile,
    pub(crate) compact_status: CompactStatus,
    pub(crate) next_fid: AtomicU64,
}

impl LevelManager {
    /// Opens the directory: replays the manifest, reconciles it against
    /// the files on disk, and loads every live table into its level.
    pub(crate) fn open(config: LsmConfig) -> Result<LevelManager> {
        std::fs::create_dir_all(&config.dir)?;
        let manifest = ManifestFile::open(&config.dir)?;

        // Startup reconciliation: orphan files go, missing files are
        // fatal.
        let fids_on_disk = load_table_fids(&config.dir)?;
        manifest.revert(&fids_on_disk)?;

        let state = manifest.manifest();
        let mut by_level: HashMap<u32, Vec<Arc<Table>>> = HashMap::new();
        let mut max_fid = 0u64;
        for (fid, tm) in &state.tables {
            if tm.level as usize >= config.max_levels {
                return Err(crate::corruption!(
                    "manifest places table {fid} at level {}, but only {} levels are configured",
                    tm.level,
                    config.max_levels
                ));
            }
            let table = Table::open(&table_file_path(&config.dir, *fid), *fid)?;
            max_fid = max_fid.max(*fid);
            by_level.entry(tm.level).or_default().push(table);
        }

        let levels: Vec<Arc<LevelHandler>> = (0..config.max_levels)
            .map(|i| Arc::new(LevelHandler::new(i)))
            .collect();
        for (level, tables) in by_level {
            let count = tables.len();
            levels[level as usize].init_tables(tables);
            tracing::info!(level, tables = count, "recovered level");
        }

        Ok(LevelManager {
            compact_status: CompactStatus::new(config.max_levels),
            config,
            levels,
            manifest,
            next_fid: AtomicU64::new(max_fid + 1),
        })
    }

    /// Assigns the next table fid.
    pub(crate) fn next_fid(&self) -> u64 {
        self.next_fid.fetch_add(1, Ordering::SeqCst)
    }

    /// The largest version recorded in any live table; seeds the version
    /// counter after recovery.
    pub(crate) fn max_version(&self) -> u64 {
        self.levels
            .iter()
            .flat_map(|h| h.tables_snapshot())
            .map(|t| t.max_version())
            .max()
            .unwrap_or(0)
    }

    /// Searches the hierarchy top-down: level 0 newest-fid first, then
    /// each binary-searched deeper level. The first hit wins; anything
    /// below it is older by construction.
    pub(crate) fn get(&self, key: &[u8]) -> Result<Option<ValueStruct>> {
        for handler in &self.levels {
            if let Some(vs) = handler.get(key)? {
                return Ok(Some(vs));
            }
        }
        Ok(None)
    }

    /// Drains one immutable memtable into a fresh level-0 table. The
    /// file is durable before the manifest speaks, and the manifest
    /// speaks before readers see the table.
    pub(crate) fn flush(&self, mem: &MemTable) -> Result<()> {
        let mut builder = TableBuilder::new(
            self.config.block_size,
            self.config.bloom_false_positive,
            self.config.mem_table_size,
        );
        let mut iter = mem.skiplist.iter();
        iter.rewind();
        while iter.valid() {
            let key = iter.key().to_vec();
            let vs = iter.value();
            if vs.is_deleted_or_expired() {
                builder.add_stale_key(&key, &vs);
            } else {
                builder.add_key(&key, &vs);
            }
            iter.next();
        }
        if builder.is_empty() {
            return Ok(());
        }

        let fid = self.next_fid();
        let path = table_file_path(&self.config.dir, fid);
        let table = Table::create(&path, fid, &builder.finish())?;
        sync_dir(&self.config.dir)?;

        self.manifest.add_changes(vec![ManifestChange::Create {
            fid,
            level: 0,
            checksum: table.checksum_bytes(),
        }])?;
        self.levels[0].add_table(table);

        tracing::info!(fid, mem_fid = mem.fid(), "flushed memtable to level 0");
        Ok(())
    }

    pub(crate) fn close(&self) -> Result<()> {
        self.manifest.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Entry;
    use crate::error::Error;
    use crate::keys::key_with_ts;
    use crate::tmpfs::TempDir;

    fn test_config(dir: &TempDir) -> LsmConfig {
        LsmConfig::new(dir.path())
            .max_levels(3)
            .mem_table_size(1 << 20)
    }

    fn filled_memtable(dir: &TempDir, entries: &[(&[u8], u64, &[u8])]) -> MemTable {
        let mt = MemTable::create(dir.path(), 900, 1 << 20).unwrap();
        for (key, version, value) in entries {
            mt.set(&Entry::new(*key, *value).with_version(*version)).unwrap();
        }
        mt
    }

    #[test]
    fn test_flush_then_get() -> Result<()> {
        let dir = TempDir::new()?;
        let lm = LevelManager::open(test_config(&dir))?;
        let mt = filled_memtable(&dir, &[(b"a", 1, b"1"), (b"b", 2, b"2")]);

        lm.flush(&mt)?;
        assert_eq!(lm.levels[0].num_tables(), 1);

        let vs = lm.get(&key_with_ts(b"a", u64::MAX))?.unwrap();
        assert_eq!(vs.value, b"1");
        assert_eq!(vs.version, 1);

        // The manifest saw the table first.
        let m = lm.manifest.manifest();
        assert_eq!(m.tables.len(), 1);
        assert!(m.levels[0].len() == 1);
        Ok(())
    }

    #[test]
    fn test_flush_empty_memtable_is_noop() -> Result<()> {
        let dir = TempDir::new()?;
        let lm = LevelManager::open(test_config(&dir))?;
        let mt = MemTable::create(dir.path(), 901, 1 << 20)?;
        lm.flush(&mt)?;
        assert_eq!(lm.levels[0].num_tables(), 0);
        assert!(lm.manifest.manifest().tables.is_empty());
        Ok(())
    }

    #[test]
    fn test_reopen_recovers_levels() -> Result<()> {
        crate::tmpfs::init_tracing();
        let dir = TempDir::new()?;
        {
            let lm = LevelManager::open(test_config(&dir))?;
            lm.flush(&filled_memtable(&dir, &[(b"k1", 1, b"v1")]))?;
            lm.flush(&filled_memtable(&dir, &[(b"k2", 2, b"v2")]))?;
            lm.close()?;
        }

        let lm = LevelManager::open(test_config(&dir))?;
        assert_eq!(lm.levels[0].num_tables(), 2);
        assert_eq!(lm.get(&key_with_ts(b"k1", u64::MAX))?.unwrap().value, b"v1");
        assert_eq!(lm.get(&key_with_ts(b"k2", u64::MAX))?.unwrap().value, b"v2");
        assert_eq!(lm.max_version(), 2);
        Ok(())
    }

    #[test]
    fn test_open_deletes_orphan_table() -> Result<()> {
        let dir = TempDir::new()?;
        {
            let lm = LevelManager::open(test_config(&dir))?;
            lm.flush(&filled_memtable(&dir, &[(b"k", 1, b"v")]))?;
            lm.close()?;
        }
        // A table file the manifest never heard of.
        let orphan = table_file_path(dir.path(), 42);
        std::fs::write(&orphan, b"not a real table")?;

        let lm = LevelManager::open(test_config(&dir))?;
        assert!(!orphan.exists(), "orphan must be unlinked on open");
        assert_eq!(lm.levels[0].num_tables(), 1);
        Ok(())
    }

    #[test]
    fn test_open_fails_on_missing_table() -> Result<()> {
        let dir = TempDir::new()?;
        let fid = {
            let lm = LevelManager::open(test_config(&dir))?;
            lm.flush(&filled_memtable(&dir, &[(b"k", 1, b"v")]))?;
            lm.close()?;
            lm.levels[0].tables_snapshot()[0].fid()
        };
        std::fs::remove_file(table_file_path(dir.path(), fid))?;

        assert!(matches!(
            LevelManager::open(test_config(&dir)),
            Err(Error::Corruption(_))
        ));
        Ok(())
    }

    #[test]
    fn test_next_fid_continues_after_reopen() -> Result<()> {
        let dir = TempDir::new()?;
        let first_fid = {
            let lm = LevelManager::open(test_config(&dir))?;
            lm.flush(&filled_memtable(&dir, &[(b"k", 1, b"v")]))?;
            lm.levels[0].tables_snapshot()[0].fid()
        };

        let lm = LevelManager::open(test_config(&dir))?;
        assert!(lm.next_fid() > first_fid);
        Ok(())
    }
}
