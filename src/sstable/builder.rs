//! Builds the byte image of one SST file.
//!
//! Keys must be fed in ascending internal-key order. `add_stale_key`
//! records bytes that are already shadowed or dead (tombstones, expired
//! TTLs, superseded versions) so the last-level compaction policy can
//! rank tables by reclaimable space.

use crate::entry::{now_secs, ValueStruct};
use crate::keys::parse_key;

use super::bloom::{self, Filter};
use super::block::BlockBuilder;
use super::table::{BlockHandle, TableIndex};

pub(crate) struct TableBuilder {
    block_size: usize,
    bloom_fp: f64,
    /// Capacity target for this output file; `u32::MAX` disables the
    /// capacity cut-off (the L0→L0 coalescing case).
    target_size: u64,

    cur: BlockBuilder,
    cur_first_key: Vec<u8>,
    blocks: Vec<(Vec<u8>, Vec<u8>)>,
    data_len: u64,

    key_hashes: Vec<u32>,
    key_count: u32,
    stale_bytes: u32,
    min_key: Vec<u8>,
    max_key: Vec<u8>,
    max_version: u64,
}

impl TableBuilder {
    pub(crate) fn new(block_size: usize, bloom_fp: f64, target_size: u64) -> TableBuilder {
        TableBuilder {
            block_size,
            bloom_fp,
            target_size,
            cur: BlockBuilder::new(),
            cur_first_key: Vec::new(),
            blocks: Vec::new(),
            data_len: 0,
            key_hashes: Vec::new(),
            key_count: 0,
            stale_bytes: 0,
            min_key: Vec::new(),
            max_key: Vec::new(),
            max_version: 0,
        }
    }

    pub(crate) fn add_key(&mut self, key: &[u8], vs: &ValueStruct) {
        if self.min_key.is_empty() {
            self.min_key = key.to_vec();
        }
        self.max_key = key.to_vec();
        self.max_version = self.max_version.max(vs.version);
        self.key_hashes.push(bloom::hash(parse_key(key)));
        self.key_count += 1;

        if self.cur.is_empty() {
            self.cur_first_key = key.to_vec();
        }
        self.cur.add(key, vs);

        if self.cur.estimated_size() >= self.block_size {
            self.finish_block();
        }
    }

    /// Adds a key whose bytes are already dead weight in this table.
    pub(crate) fn add_stale_key(&mut self, key: &[u8], vs: &ValueStruct) {
        self.stale_bytes += key.len() as u32 + vs.encoded_size();
        self.add_key(key, vs);
    }

    fn finish_block(&mut self) {
        if self.cur.is_empty() {
            return;
        }
        let builder = std::mem::replace(&mut self.cur, BlockBuilder::new());
        let data = builder.finish();
        self.data_len += data.len() as u64;
        self.blocks
            .push((std::mem::take(&mut self.cur_first_key), data));
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.key_count == 0
    }

    /// Whether the file image has grown to its per-level target.
    pub(crate) fn reached_capacity(&self) -> bool {
        let estimate = self.data_len
            + self.cur.estimated_size() as u64
            // Directory entry per block plus bloom bits.
            + (self.blocks.len() as u64 + 1) * 64
            + (self.key_count as u64 * 10) / 8;
        estimate >= self.target_size
    }

    /// Seals the image: remaining block, bloom filter, index, footer.
    pub(crate) fn finish(mut self) -> Vec<u8> {
        self.finish_block();

        let mut out = Vec::with_capacity(self.data_len as usize + 4096);
        let mut handles = Vec::with_capacity(self.blocks.len());
        for (first_key, data) in self.blocks {
            handles.push(BlockHandle {
                first_key,
                offset: out.len() as u32,
                len: data.len() as u32,
            });
            out.extend_from_slice(&data);
        }

        let bits_per_key = bloom::bloom_bits_per_key(self.key_count as usize, self.bloom_fp);
        let index = TableIndex {
            blocks: handles,
            bloom: Filter::new(&self.key_hashes, bits_per_key),
            min_key: self.min_key,
            max_key: self.max_key,
            max_version: self.max_version,
            created_at: now_secs(),
            stale_bytes: self.stale_bytes,
            key_count: self.key_count,
        };
        index.encode_into(&mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::key_with_ts;

    fn vs(value: &[u8]) -> ValueStruct {
        ValueStruct {
            meta: 0,
            value: value.to_vec(),
            expires_at: 0,
            version: 1,
        }
    }

    #[test]
    fn test_empty_builder() {
        let builder = TableBuilder::new(4096, 0.01, 1 << 20);
        assert!(builder.is_empty());
        assert!(!builder.reached_capacity());
    }

    #[test]
    fn test_tracks_key_range_and_version() {
        let mut builder = TableBuilder::new(4096, 0.01, 1 << 20);
        builder.add_key(&key_with_ts(b"a", 3), &vs(b"1"));
        builder.add_key(&key_with_ts(b"z", 9), &vs(b"2"));

        let image = builder.finish();
        let index = TableIndex::decode(&image).unwrap().0;
        assert_eq!(crate::keys::parse_key(&index.min_key), b"a");
        assert_eq!(crate::keys::parse_key(&index.max_key), b"z");
        assert_eq!(index.key_count, 2);
    }

    #[test]
    fn test_stale_bytes_accumulate() {
        let mut builder = TableBuilder::new(4096, 0.01, 1 << 20);
        let key = key_with_ts(b"dead", 1);
        let value = vs(b"gone");
        builder.add_stale_key(&key, &value);

        let expected = key.len() as u32 + value.encoded_size();
        let image = builder.finish();
        let index = TableIndex::decode(&image).unwrap().0;
        assert_eq!(index.stale_bytes, expected);
    }

    #[test]
    fn test_capacity_with_unbounded_target() {
        let mut builder = TableBuilder::new(512, 0.01, u32::MAX as u64);
        for i in 0..10_000u32 {
            let key = key_with_ts(format!("key_{i:06}").as_bytes(), 1);
            builder.add_key(&key, &vs(b"value"));
        }
        assert!(!builder.reached_capacity());
    }

    #[test]
    fn test_capacity_with_small_target() {
        let mut builder = TableBuilder::new(512, 0.01, 1024);
        for i in 0..100u32 {
            let key = key_with_ts(format!("key_{i:06}").as_bytes(), 1);
            builder.add_key(&key, &vs(b"value"));
        }
        assert!(builder.reached_capacity());
    }
}
