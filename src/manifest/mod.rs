//! Durable change log of which tables exist at which level.
//!
//! The manifest is a WAL for metadata: every table creation or deletion is
//! staged here before the in-memory level state changes, so a crash at any
//! point replays to a consistent table set.
//!
//! # File format
//!
//! ```text
//! +------------------------------+
//! | magic "jvvv" | version u32 BE|
//! +------------------------------+
//! | len u32 BE | crc32c u32 BE   |
//! | ChangeSet payload            |
//! +------------------------------+
//! | ...                          |
//! +------------------------------+
//! ```
//!
//! A trailing torn record is truncated on open. A complete record with a
//! bad CRC, an unknown op, a CREATE of an existing fid, or a DELETE of a
//! missing fid is structural corruption: the store refuses to open.
//!
//! When deletions dominate, the log is rewritten in place: a sibling
//! `REWRITEMANIFEST` containing only CREATEs for live tables is fsynced
//! and atomically renamed over `MANIFEST`.

pub(crate) mod change;

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::corruption;
use crate::error::{Error, Result};
use crate::sstable::{sync_dir, table_file_path};

pub use change::{ChangeSet, ManifestChange};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

pub(crate) const MANIFEST_FILENAME: &str = "MANIFEST";
const MANIFEST_REWRITE_FILENAME: &str = "REWRITEMANIFEST";

const MAGIC_TEXT: [u8; 4] = *b"jvvv";
const MAGIC_VERSION: u32 = 1;

/// Rewrite once this many deletions have accumulated...
pub(crate) const DELETIONS_REWRITE_THRESHOLD: usize = 10_000;
/// ...and deletions outnumber live tables by this factor.
pub(crate) const DELETIONS_RATIO: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableManifest {
    pub level: u32,
    pub checksum: Vec<u8>,
}

/// In-memory image of the log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    pub tables: HashMap<u64, TableManifest>,
    pub levels: Vec<HashSet<u64>>,
    pub creations: usize,
    pub deletions: usize,
}

impl Manifest {
    fn apply_change_set(&mut self, set: &ChangeSet) -> Result<()> {
        for change in &set.changes {
            self.apply_change(change)?;
        }
        Ok(())
    }

    fn apply_change(&mut self, change: &ManifestChange) -> Result<()> {
        match change {
            ManifestChange::Create {
                fid,
                level,
                checksum,
            } => {
                if self.tables.contains_key(fid) {
                    return Err(corruption!("MANIFEST invalid, table {fid} exists"));
                }
                self.tables.insert(
                    *fid,
                    TableManifest {
                        level: *level,
                        checksum: checksum.clone(),
                    },
                );
                while self.levels.len() <= *level as usize {
                    self.levels.push(HashSet::new());
                }
                self.levels[*level as usize].insert(*fid);
                self.creations += 1;
            }
            ManifestChange::Delete { fid } => {
                let Some(tm) = self.tables.remove(fid) else {
                    return Err(corruption!("MANIFEST removes non-existing table {fid}"));
                };
                self.levels[tm.level as usize].remove(fid);
                self.deletions += 1;
            }
        }
        Ok(())
    }

    /// A sequence of CREATEs that recreates the live table set.
    pub fn as_changes(&self) -> Vec<ManifestChange> {
        let mut changes: Vec<_> = self
            .tables
            .iter()
            .map(|(fid, tm)| ManifestChange::Create {
                fid: *fid,
                level: tm.level,
                checksum: tm.checksum.clone(),
            })
            .collect();
        changes.sort_by_key(|c| c.fid());
        changes
    }
}

struct ManifestInner {
    file: File,
    manifest: Manifest,
}

pub struct ManifestFile {
    dir: PathBuf,
    rewrite_threshold: usize,
    deletions_ratio: usize,
    inner: Mutex<ManifestInner>,
}

impl ManifestFile {
    pub fn open(dir: &Path) -> Result<ManifestFile> {
        Self::open_with(dir, DELETIONS_REWRITE_THRESHOLD, DELETIONS_RATIO)
    }

    /// Opens with explicit rewrite policy parameters. Tests use this to
    /// make the rewrite path reachable with small workloads.
    pub fn open_with(
        dir: &Path,
        rewrite_threshold: usize,
        deletions_ratio: usize,
    ) -> Result<ManifestFile> {
        let path = dir.join(MANIFEST_FILENAME);
        if !path.exists() {
            let manifest = Manifest::default();
            let (file, _) = help_rewrite(dir, &manifest)?;
            return Ok(ManifestFile {
                dir: dir.to_path_buf(),
                rewrite_threshold,
                deletions_ratio,
                inner: Mutex::new(ManifestInner { file, manifest }),
            });
        }

        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let (manifest, trunc_offset) = replay(&mut file)?;
        // Drop any half-written trailing record.
        file.set_len(trunc_offset)?;
        file.seek(SeekFrom::End(0))?;

        Ok(ManifestFile {
            dir: dir.to_path_buf(),
            rewrite_threshold,
            deletions_ratio,
            inner: Mutex::new(ManifestInner { file, manifest }),
        })
    }

    /// A snapshot of the current in-memory state.
    pub fn manifest(&self) -> Manifest {
        self.inner.lock().unwrap().manifest.clone()
    }

    /// Applies `changes` in memory (failing fast on corruption), then
    /// either appends one framed record and fsyncs, or rewrites the whole
    /// log when deletion pressure is high. This is the commit point for
    /// every table transition.
    pub fn add_changes(&self, changes: Vec<ManifestChange>) -> Result<()> {
        let set = ChangeSet::new(changes);
        let payload = set.encode();

        let mut inner = self.inner.lock()?;
        inner.manifest.apply_change_set(&set)?;

        let manifest = &inner.manifest;
        if manifest.deletions > self.rewrite_threshold
            && manifest.deletions
                > self.deletions_ratio * (manifest.creations - manifest.deletions)
        {
            let (file, net_creations) = help_rewrite(&self.dir, manifest)?;
            inner.file = file;
            inner.manifest.creations = net_creations;
            inner.manifest.deletions = 0;
        } else {
            let mut frame = Vec::with_capacity(8 + payload.len());
            frame.write_u32::<BigEndian>(payload.len() as u32)?;
            frame.write_u32::<BigEndian>(CRC32.checksum(&payload))?;
            frame.extend_from_slice(&payload);
            inner.file.write_all(&frame)?;
        }
        inner.file.sync_all()?;
        Ok(())
    }

    /// Reconciles the manifest against the `.sst` files actually on disk:
    /// errors if a manifest-listed table is missing, unlinks tables on
    /// disk that the manifest does not know.
    pub fn revert(&self, fids_on_disk: &HashSet<u64>) -> Result<()> {
        let inner = self.inner.lock()?;
        for fid in inner.manifest.tables.keys() {
            if !fids_on_disk.contains(fid) {
                return Err(corruption!("file does not exist for table {fid}"));
            }
        }
        for fid in fids_on_disk {
            if !inner.manifest.tables.contains_key(fid) {
                tracing::warn!(fid, "table file not referenced in MANIFEST, removing");
                std::fs::remove_file(table_file_path(&self.dir, *fid))?;
            }
        }
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        self.inner.lock()?.file.sync_all()?;
        Ok(())
    }
}

/// Replays an existing manifest, returning the rebuilt state and the
/// offset of the last byte successfully consumed.
fn replay(file: &mut File) -> Result<(Manifest, u64)> {
    file.seek(SeekFrom::Start(0))?;
    let mut reader = BufReader::new(file);

    let mut header = [0u8; 8];
    if reader.read_exact(&mut header).is_err() {
        return Err(Error::BadMagic);
    }
    if header[0..4] != MAGIC_TEXT {
        return Err(Error::BadMagic);
    }
    let version = BigEndian::read_u32(&header[4..8]);
    if version != MAGIC_VERSION {
        return Err(Error::UnsupportedVersion(version));
    }

    let mut manifest = Manifest::default();
    let mut offset = 8u64;
    loop {
        let mut frame_header = [0u8; 8];
        match reader.read_exact(&mut frame_header) {
            Ok(()) => {}
            Err(_) => break,
        }
        let len = BigEndian::read_u32(&frame_header[0..4]) as usize;
        let expected = BigEndian::read_u32(&frame_header[4..8]);
        let mut payload = vec![0u8; len];
        if reader.read_exact(&mut payload).is_err() {
            // Torn tail; everything before it still counts.
            break;
        }
        let actual = CRC32.checksum(&payload);
        if actual != expected {
            // A complete record that fails its checksum is corruption,
            // not a torn tail.
            return Err(Error::ChecksumMismatch { actual, expected });
        }
        let set = ChangeSet::decode(&payload)?;
        manifest.apply_change_set(&set)?;
        offset += 8 + len as u64;
    }
    Ok((manifest, offset))
}

/// Writes a fresh manifest containing only CREATEs for live tables and
/// atomically renames it over the live path. Returns the new append
/// handle and the live table count.
fn help_rewrite(dir: &Path, manifest: &Manifest) -> Result<(File, usize)> {
    let rewrite_path = dir.join(MANIFEST_REWRITE_FILENAME);
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&rewrite_path)?;

    let mut buf = Vec::new();
    buf.extend_from_slice(&MAGIC_TEXT);
    buf.write_u32::<BigEndian>(MAGIC_VERSION)?;

    let net_creations = manifest.tables.len();
    if net_creations > 0 {
        let payload = ChangeSet::new(manifest.as_changes()).encode();
        buf.write_u32::<BigEndian>(payload.len() as u32)?;
        buf.write_u32::<BigEndian>(CRC32.checksum(&payload))?;
        buf.extend_from_slice(&payload);
    }

    file.write_all(&buf)?;
    file.sync_all()?;
    drop(file);

    let manifest_path = dir.join(MANIFEST_FILENAME);
    std::fs::rename(&rewrite_path, &manifest_path)?;
    let mut file = OpenOptions::new().read(true).write(true).open(&manifest_path)?;
    file.seek(SeekFrom::End(0))?;
    sync_dir(dir)?;

    Ok((file, net_creations))
}
