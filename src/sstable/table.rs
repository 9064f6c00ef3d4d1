//! Immutable on-disk sorted table.
//!
//! ## File layout
//!
//! ```text
//! +-------------------+
//! | Data Block 0      |
//! +-------------------+
//! | ...               |
//! +-------------------+
//! | Data Block N      |
//! +-------------------+
//! | Index section     |  per-block first key + offset + length,
//! +-------------------+  bloom filter, key range, max version,
//! | Footer (12 bytes) |  creation time, stale bytes, key count
//! +-------------------+
//! ```
//!
//! The footer is `[index_offset u32][index_len u32][index_crc u32]`, all
//! big-endian. Tables are shared as `Arc<Table>`; a table removed from
//! the manifest is marked dead and its file is unlinked when the last
//! reference drops, so compactions holding iterators survive concurrent
//! table replacement.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::entry::ValueStruct;
use crate::error::{Error, Result};
use crate::keys::{compare_keys, parse_ts, same_key};

use super::block::Block;
use super::bloom::{self, Filter};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

pub(crate) const FOOTER_SIZE: usize = 12;

pub(crate) struct BlockHandle {
    pub(crate) first_key: Vec<u8>,
    pub(crate) offset: u32,
    pub(crate) len: u32,
}

pub(crate) struct TableIndex {
    pub(crate) blocks: Vec<BlockHandle>,
    pub(crate) bloom: Filter,
    pub(crate) min_key: Vec<u8>,
    pub(crate) max_key: Vec<u8>,
    pub(crate) max_version: u64,
    pub(crate) created_at: u64,
    pub(crate) stale_bytes: u32,
    pub(crate) key_count: u32,
}

impl TableIndex {
    fn encode_section(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_u32::<BigEndian>(self.blocks.len() as u32)
            .expect("vec write");
        for handle in &self.blocks {
            buf.write_u16::<BigEndian>(handle.first_key.len() as u16)
                .expect("vec write");
            buf.extend_from_slice(&handle.first_key);
            buf.write_u32::<BigEndian>(handle.offset).expect("vec write");
            buf.write_u32::<BigEndian>(handle.len).expect("vec write");
        }
        let bloom = self.bloom.as_bytes();
        buf.write_u32::<BigEndian>(bloom.len() as u32)
            .expect("vec write");
        buf.extend_from_slice(bloom);
        buf.write_u16::<BigEndian>(self.min_key.len() as u16)
            .expect("vec write");
        buf.extend_from_slice(&self.min_key);
        buf.write_u16::<BigEndian>(self.max_key.len() as u16)
            .expect("vec write");
        buf.extend_from_slice(&self.max_key);
        buf.write_u64::<BigEndian>(self.max_version).expect("vec write");
        buf.write_u64::<BigEndian>(self.created_at).expect("vec write");
        buf.write_u32::<BigEndian>(self.stale_bytes).expect("vec write");
        buf.write_u32::<BigEndian>(self.key_count).expect("vec write");
        buf
    }

    /// Appends the index section and footer to a finished data region.
    pub(crate) fn encode_into(&self, out: &mut Vec<u8>) {
        let index_offset = out.len() as u32;
        let section = self.encode_section();
        let checksum = CRC32.checksum(&section);
        out.extend_from_slice(&section);
        out.write_u32::<BigEndian>(index_offset).expect("vec write");
        out.write_u32::<BigEndian>(section.len() as u32)
            .expect("vec write");
        out.write_u32::<BigEndian>(checksum).expect("vec write");
    }

    fn decode_section(buf: &[u8]) -> Result<TableIndex> {
        let mut pos = 0usize;
        let read_u16 = |pos: &mut usize| {
            let v = BigEndian::read_u16(&buf[*pos..]);
            *pos += 2;
            v
        };
        let read_u32 = |pos: &mut usize| {
            let v = BigEndian::read_u32(&buf[*pos..]);
            *pos += 4;
            v
        };
        let read_u64 = |pos: &mut usize| {
            let v = BigEndian::read_u64(&buf[*pos..]);
            *pos += 8;
            v
        };

        let block_count = read_u32(&mut pos) as usize;
        let mut blocks = Vec::with_capacity(block_count);
        for _ in 0..block_count {
            let klen = read_u16(&mut pos) as usize;
            let first_key = buf[pos..pos + klen].to_vec();
            pos += klen;
            let offset = read_u32(&mut pos);
            let len = read_u32(&mut pos);
            blocks.push(BlockHandle {
                first_key,
                offset,
                len,
            });
        }
        let bloom_len = read_u32(&mut pos) as usize;
        let bloom = Filter::from_bytes(buf[pos..pos + bloom_len].to_vec());
        pos += bloom_len;
        let min_klen = read_u16(&mut pos) as usize;
        let min_key = buf[pos..pos + min_klen].to_vec();
        pos += min_klen;
        let max_klen = read_u16(&mut pos) as usize;
        let max_key = buf[pos..pos + max_klen].to_vec();
        pos += max_klen;
        let max_version = read_u64(&mut pos);
        let created_at = read_u64(&mut pos);
        let stale_bytes = read_u32(&mut pos);
        let key_count = read_u32(&mut pos);

        Ok(TableIndex {
            blocks,
            bloom,
            min_key,
            max_key,
            max_version,
            created_at,
            stale_bytes,
            key_count,
        })
    }

    /// Decodes from a complete file image. Returns the index and its CRC,
    /// which doubles as the table checksum recorded in the manifest.
    pub(crate) fn decode(image: &[u8]) -> Result<(TableIndex, u32)> {
        if image.len() < FOOTER_SIZE {
            return Err(Error::Corruption("table file too short".to_string()));
        }
        let footer = &image[image.len() - FOOTER_SIZE..];
        let index_offset = BigEndian::read_u32(&footer[0..4]) as usize;
        let index_len = BigEndian::read_u32(&footer[4..8]) as usize;
        let expected = BigEndian::read_u32(&footer[8..12]);
        if index_offset + index_len + FOOTER_SIZE != image.len() {
            return Err(Error::Corruption("table footer out of bounds".to_string()));
        }
        let section = &image[index_offset..index_offset + index_len];
        let actual = CRC32.checksum(section);
        if actual != expected {
            return Err(Error::ChecksumMismatch { actual, expected });
        }
        Ok((Self::decode_section(section)?, expected))
    }
}

pub(crate) struct Table {
    fid: u64,
    path: PathBuf,
    file: File,
    size: u64,
    index: TableIndex,
    checksum: u32,
    dead: AtomicBool,
}

impl Table {
    /// Writes a finished builder image to `path`, fsyncs it, and opens the
    /// result. The caller fsyncs the directory once per batch.
    pub(crate) fn create(path: &Path, fid: u64, image: &[u8]) -> Result<Arc<Table>> {
        let file = File::create(path)?;
        file.write_all_at(image, 0)?;
        file.sync_all()?;
        drop(file);
        Self::open(path, fid)
    }

    pub(crate) fn open(path: &Path, fid: u64) -> Result<Arc<Table>> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        if size < FOOTER_SIZE as u64 {
            return Err(Error::Corruption(format!(
                "table {fid} too short: {size} bytes"
            )));
        }

        let mut footer = [0u8; FOOTER_SIZE];
        file.read_exact_at(&mut footer, size - FOOTER_SIZE as u64)?;
        let index_offset = BigEndian::read_u32(&footer[0..4]) as u64;
        let index_len = BigEndian::read_u32(&footer[4..8]) as u64;
        let expected = BigEndian::read_u32(&footer[8..12]);
        if index_offset + index_len + FOOTER_SIZE as u64 != size {
            return Err(Error::Corruption(format!(
                "table {fid} footer out of bounds"
            )));
        }

        let mut section = vec![0u8; index_len as usize];
        file.read_exact_at(&mut section, index_offset)?;
        let actual = CRC32.checksum(&section);
        if actual != expected {
            return Err(Error::ChecksumMismatch { actual, expected });
        }
        let index = TableIndex::decode_section(&section)?;

        Ok(Arc::new(Table {
            fid,
            path: path.to_path_buf(),
            file,
            size,
            index,
            checksum: expected,
            dead: AtomicBool::new(false),
        }))
    }

    pub(crate) fn fid(&self) -> u64 {
        self.fid
    }

    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    pub(crate) fn min_key(&self) -> &[u8] {
        &self.index.min_key
    }

    pub(crate) fn max_key(&self) -> &[u8] {
        &self.index.max_key
    }

    pub(crate) fn max_version(&self) -> u64 {
        self.index.max_version
    }

    pub(crate) fn created_at(&self) -> u64 {
        self.index.created_at
    }

    pub(crate) fn stale_data_size(&self) -> u32 {
        self.index.stale_bytes
    }

    pub(crate) fn key_count(&self) -> u32 {
        self.index.key_count
    }

    pub(crate) fn block_count(&self) -> usize {
        self.index.blocks.len()
    }

    /// The table checksum recorded in manifest CREATE records.
    pub(crate) fn checksum_bytes(&self) -> Vec<u8> {
        self.checksum.to_be_bytes().to_vec()
    }

    pub(crate) fn may_contain_hash(&self, hash: u32) -> bool {
        self.index.bloom.may_contain(hash)
    }

    pub(crate) fn read_block(&self, i: usize) -> Result<Block> {
        let handle = &self.index.blocks[i];
        let mut buf = vec![0u8; handle.len as usize];
        self.file.read_exact_at(&mut buf, handle.offset as u64)?;
        Block::decode(buf)
    }

    /// Index of the block that may contain `key`: the last block whose
    /// first key is ≤ `key`, clamped to the first block.
    pub(crate) fn block_for(&self, key: &[u8]) -> usize {
        let p = self
            .index
            .blocks
            .partition_point(|b| compare_keys(&b.first_key, key) != std::cmp::Ordering::Greater);
        p.saturating_sub(1)
    }

    /// Returns the value of the smallest internal key ≥ `key` sharing the
    /// user-key prefix, with the version filled in.
    pub(crate) fn get(&self, key: &[u8]) -> Result<Option<ValueStruct>> {
        let mut block_idx = self.block_for(key);
        let block = self.read_block(block_idx)?;
        let mut entry_idx = block.seek(key);
        let found = if entry_idx < block.entry_count() {
            Some((block.key(entry_idx).to_vec(), block.value(entry_idx)))
        } else {
            // The key sorts past this block; the successor, if any, is the
            // first entry of the next block.
            block_idx += 1;
            if block_idx < self.index.blocks.len() {
                let next = self.read_block(block_idx)?;
                entry_idx = 0;
                Some((next.key(entry_idx).to_vec(), next.value(entry_idx)))
            } else {
                None
            }
        };

        Ok(found.and_then(|(found_key, mut vs)| {
            if !same_key(key, &found_key) {
                return None;
            }
            vs.version = parse_ts(&found_key);
            Some(vs)
        }))
    }

    /// Marks the file for deletion once the last reference drops.
    pub(crate) fn mark_dead(&self) {
        self.dead.store(true, Ordering::SeqCst);
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        if self.dead.load(Ordering::SeqCst) {
            if let Err(e) = std::fs::remove_file(&self.path) {
                tracing::warn!(fid = self.fid, error = %e, "failed to remove dead table");
            }
        }
    }
}
