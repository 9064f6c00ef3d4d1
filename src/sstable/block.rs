//! SST data block codec.
//!
//! A block is a run of sorted entries followed by an offset directory and
//! a CRC32C of everything before it:
//!
//! ```text
//! +-----------+-----------+-----+--------------+---------+----------+
//! | entry 0   | entry 1   | ... | offsets u32×n| n u32   | crc u32  |
//! +-----------+-----------+-----+--------------+---------+----------+
//! ```
//!
//! Each entry is `[klen u16][vlen u32][internal key][value struct]`, all
//! integers big-endian. A checksum failure on decode surfaces as
//! `ChecksumMismatch`; callers skip the block at that boundary.

use std::cmp::Ordering;

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::entry::ValueStruct;
use crate::error::{Error, Result};
use crate::keys::compare_keys;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const ENTRY_HEADER_SIZE: usize = 6;

pub(crate) struct BlockBuilder {
    data: Vec<u8>,
    offsets: Vec<u32>,
}

impl BlockBuilder {
    pub(crate) fn new() -> BlockBuilder {
        BlockBuilder {
            data: Vec::new(),
            offsets: Vec::new(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub(crate) fn entry_count(&self) -> usize {
        self.offsets.len()
    }

    /// Encoded size if the block were finished now.
    pub(crate) fn estimated_size(&self) -> usize {
        self.data.len() + self.offsets.len() * 4 + 8
    }

    /// Appends an entry. Keys must arrive in ascending internal-key order.
    pub(crate) fn add(&mut self, key: &[u8], vs: &ValueStruct) {
        self.offsets.push(self.data.len() as u32);
        self.data
            .write_u16::<BigEndian>(key.len() as u16)
            .expect("vec write");
        self.data
            .write_u32::<BigEndian>(vs.encoded_size())
            .expect("vec write");
        self.data.extend_from_slice(key);
        let start = self.data.len();
        self.data.resize(start + vs.encoded_size() as usize, 0);
        vs.encode_into(&mut self.data[start..]);
    }

    pub(crate) fn finish(self) -> Vec<u8> {
        let mut out = self.data;
        for offset in &self.offsets {
            out.write_u32::<BigEndian>(*offset).expect("vec write");
        }
        out.write_u32::<BigEndian>(self.offsets.len() as u32)
            .expect("vec write");
        let checksum = CRC32.checksum(&out);
        out.write_u32::<BigEndian>(checksum).expect("vec write");
        out
    }
}

pub(crate) struct Block {
    data: Vec<u8>,
    offsets: Vec<u32>,
}

impl Block {
    pub(crate) fn decode(buf: Vec<u8>) -> Result<Block> {
        if buf.len() < 8 {
            return Err(Error::Corruption("block too short".to_string()));
        }
        let crc_at = buf.len() - 4;
        let expected = BigEndian::read_u32(&buf[crc_at..]);
        let actual = CRC32.checksum(&buf[..crc_at]);
        if actual != expected {
            return Err(Error::ChecksumMismatch { actual, expected });
        }

        let count = BigEndian::read_u32(&buf[crc_at - 4..crc_at]) as usize;
        if count * 4 + 8 > buf.len() {
            return Err(Error::Corruption(format!(
                "block offset directory out of bounds: {count} entries"
            )));
        }
        let dir_start = crc_at - 4 - count * 4;
        let mut offsets = Vec::with_capacity(count);
        for i in 0..count {
            offsets.push(BigEndian::read_u32(&buf[dir_start + i * 4..dir_start + i * 4 + 4]));
        }
        let mut data = buf;
        data.truncate(dir_start);
        Ok(Block { data, offsets })
    }

    pub(crate) fn entry_count(&self) -> usize {
        self.offsets.len()
    }

    pub(crate) fn key(&self, i: usize) -> &[u8] {
        let offset = self.offsets[i] as usize;
        let klen = BigEndian::read_u16(&self.data[offset..]) as usize;
        &self.data[offset + ENTRY_HEADER_SIZE..offset + ENTRY_HEADER_SIZE + klen]
    }

    pub(crate) fn value(&self, i: usize) -> ValueStruct {
        let offset = self.offsets[i] as usize;
        let klen = BigEndian::read_u16(&self.data[offset..]) as usize;
        let vlen = BigEndian::read_u32(&self.data[offset + 2..]) as usize;
        let start = offset + ENTRY_HEADER_SIZE + klen;
        ValueStruct::decode(&self.data[start..start + vlen])
    }

    /// Index of the first entry with key ≥ `key`; `entry_count()` if none.
    pub(crate) fn seek(&self, key: &[u8]) -> usize {
        let mut lo = 0;
        let mut hi = self.entry_count();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if compare_keys(self.key(mid), key) == Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }
}
