//! The in-memory write buffer: a lock-free skiplist over a byte arena,
//! paired with a write-ahead log for durability.

pub(crate) mod arena;
pub mod skiplist;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::entry::{Entry, ValueStruct};
use crate::error::{Error, Result};
use crate::keys::key_with_ts;
use crate::wal::Wal;

use skiplist::Skiplist;

pub struct MemTable {
    pub(crate) skiplist: Skiplist,
    pub(crate) wal: Wal,
    fid: u64,
    max_version: AtomicU64,
}

/// WAL filename for a memtable fid. Memtable fids are a separate counter
/// from table fids; the extension keeps the flat directory unambiguous.
pub(crate) fn wal_file_path(dir: &Path, fid: u64) -> PathBuf {
    dir.join(format!("{:05}.wal", fid))
}

/// Parses a memtable fid from a filename; None for anything but `*.wal`.
pub(crate) fn parse_wal_fid(name: &str) -> Option<u64> {
    name.strip_suffix(".wal")?.parse().ok()
}

impl MemTable {
    /// Creates a fresh memtable with an empty WAL. The WAL is unlinked
    /// when the skiplist's last reference is dropped, i.e. after the
    /// memtable reached level 0.
    pub(crate) fn create(dir: &Path, fid: u64, arena_size: u32) -> Result<MemTable> {
        let wal = Wal::open(wal_file_path(dir, fid))?;
        let table = MemTable {
            skiplist: Skiplist::new(arena_size),
            wal,
            fid,
            max_version: AtomicU64::new(0),
        };
        let wal_path = table.wal.path().to_path_buf();
        table.skiplist.set_on_close(Box::new(move || {
            if let Err(e) = std::fs::remove_file(&wal_path) {
                tracing::warn!(path = %wal_path.display(), error = %e, "failed to remove flushed wal");
            }
        }));
        Ok(table)
    }

    /// Rebuilds a memtable from a surviving WAL file.
    pub(crate) fn open(dir: &Path, fid: u64, arena_size: u32) -> Result<MemTable> {
        let table = Self::create(dir, fid, arena_size)?;
        for entry in table.wal.replay()? {
            let entry = entry?;
            table.apply(&entry);
        }
        Ok(table)
    }

    /// Appends to the WAL, then inserts into the skiplist. The insert's
    /// base-level CAS is the point where the write becomes visible.
    pub(crate) fn set(&self, entry: &Entry) -> Result<()> {
        if entry.key.is_empty() {
            return Err(Error::EmptyKey);
        }
        self.wal.append(entry)?;
        self.apply(entry);
        Ok(())
    }

    fn apply(&self, entry: &Entry) {
        let internal = Entry {
            key: key_with_ts(&entry.key, entry.version),
            value: entry.value.clone(),
            expires_at: entry.expires_at,
            meta: entry.meta,
            version: entry.version,
        };
        self.skiplist.add(&internal);
        self.max_version.fetch_max(entry.version, Ordering::SeqCst);
    }

    /// Looks up an internal key (user key + version suffix).
    pub(crate) fn get(&self, key: &[u8]) -> Option<ValueStruct> {
        self.skiplist.get(key)
    }

    pub(crate) fn fid(&self) -> u64 {
        self.fid
    }

    pub(crate) fn wal_size(&self) -> u64 {
        self.wal.size()
    }

    pub(crate) fn max_version(&self) -> u64 {
        self.max_version.load(Ordering::SeqCst)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.skiplist.is_empty()
    }

    /// Releases the memtable's own skiplist reference once its contents
    /// are durable in a level-0 table; the on-close hook removes the WAL.
    pub(crate) fn mark_flushed(&self) {
        self.skiplist.decr_ref();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    const ARENA_SIZE: u32 = 1 << 20;

    #[test]
    fn test_set_and_get() -> Result<()> {
        let dir = TempDir::new()?;
        let mt = MemTable::create(dir.path(), 1, ARENA_SIZE)?;

        mt.set(&Entry::new(&b"k1"[..], &b"v1"[..]).with_version(1))?;
        mt.set(&Entry::new(&b"k2"[..], &b"v2"[..]).with_version(2))?;

        let vs = mt.get(&key_with_ts(b"k1", u64::MAX)).unwrap();
        assert_eq!(vs.value, b"v1");
        assert!(mt.get(&key_with_ts(b"k3", u64::MAX)).is_none());
        assert_eq!(mt.max_version(), 2);
        Ok(())
    }

    #[test]
    fn test_empty_key_rejected() -> Result<()> {
        let dir = TempDir::new()?;
        let mt = MemTable::create(dir.path(), 1, ARENA_SIZE)?;
        assert!(matches!(
            mt.set(&Entry::new(Vec::new(), &b"v"[..])),
            Err(Error::EmptyKey)
        ));
        Ok(())
    }

    #[test]
    fn test_recover_from_wal() -> Result<()> {
        let dir = TempDir::new()?;
        {
            let mt = MemTable::create(dir.path(), 1, ARENA_SIZE)?;
            mt.set(&Entry::new(&b"a"[..], &b"1"[..]).with_version(1))?;
            mt.set(&Entry::new(&b"b"[..], &b"2"[..]).with_version(2))?;
            mt.wal.sync()?;
        }

        let mt = MemTable::open(dir.path(), 1, ARENA_SIZE)?;
        assert_eq!(mt.get(&key_with_ts(b"a", u64::MAX)).unwrap().value, b"1");
        assert_eq!(mt.get(&key_with_ts(b"b", u64::MAX)).unwrap().value, b"2");
        assert_eq!(mt.max_version(), 2);
        Ok(())
    }

    #[test]
    fn test_wal_size_tracks_writes() -> Result<()> {
        let dir = TempDir::new()?;
        let mt = MemTable::create(dir.path(), 1, ARENA_SIZE)?;
        assert_eq!(mt.wal_size(), 0);

        let e = Entry::new(&b"key"[..], &b"value"[..]).with_version(1);
        let expect = Wal::encoded_size(&e);
        mt.set(&e)?;
        assert_eq!(mt.wal_size(), expect);
        Ok(())
    }
}
