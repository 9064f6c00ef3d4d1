//! Sorted string tables: file layout, builder, bloom filter, iterators,
//! and the flat-directory naming scheme.

pub(crate) mod block;
pub(crate) mod bloom;
pub(crate) mod builder;
pub(crate) mod iterator;
pub(crate) mod table;

use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// `<dir>/%05u.sst`, widening automatically for larger fids.
pub(crate) fn table_file_path(dir: &Path, fid: u64) -> PathBuf {
    dir.join(format!("{fid:05}.sst"))
}

/// Parses a table fid from a filename; None for anything but `*.sst`.
pub(crate) fn parse_table_fid(name: &str) -> Option<u64> {
    name.strip_suffix(".sst")?.parse().ok()
}

/// Fids of every `.sst` file in `dir`.
pub(crate) fn load_table_fids(dir: &Path) -> Result<HashSet<u64>> {
    let mut fids = HashSet::new();
    for dirent in std::fs::read_dir(dir)? {
        let dirent = dirent?;
        if !dirent.file_type()?.is_file() {
            continue;
        }
        if let Some(fid) = dirent.file_name().to_str().and_then(parse_table_fid) {
            fids.insert(fid);
        }
    }
    Ok(fids)
}

/// Fsyncs the directory entry so file creations and renames survive a
/// crash.
pub(crate) fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    #[test]
    fn test_table_file_path_padding() {
        let dir = Path::new("/data");
        assert_eq!(table_file_path(dir, 42), PathBuf::from("/data/00042.sst"));
        assert_eq!(
            table_file_path(dir, 1_234_567),
            PathBuf::from("/data/1234567.sst")
        );
    }

    #[test]
    fn test_parse_table_fid() {
        assert_eq!(parse_table_fid("00042.sst"), Some(42));
        assert_eq!(parse_table_fid("1234567.sst"), Some(1234567));
        assert_eq!(parse_table_fid("00042.wal"), None);
        assert_eq!(parse_table_fid("MANIFEST"), None);
    }

    #[test]
    fn test_load_table_fids() -> Result<()> {
        let dir = TempDir::new()?;
        std::fs::write(dir.path().join("00001.sst"), b"x")?;
        std::fs::write(dir.path().join("00007.sst"), b"x")?;
        std::fs::write(dir.path().join("00003.wal"), b"x")?;
        std::fs::write(dir.path().join("MANIFEST"), b"x")?;

        let fids = load_table_fids(dir.path())?;
        assert_eq!(fids, HashSet::from([1, 7]));
        Ok(())
    }
}
