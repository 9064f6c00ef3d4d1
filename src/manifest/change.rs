use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

const CREATE: u8 = 0x01;
const DELETE: u8 = 0x02;

/// One table transition. CREATE places a fid at a level; DELETE retires
/// it. The op is a tagged variant so matches stay exhaustive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestChange {
    Create {
        fid: u64,
        level: u32,
        checksum: Vec<u8>,
    },
    Delete {
        fid: u64,
    },
}

impl ManifestChange {
    pub fn fid(&self) -> u64 {
        match self {
            ManifestChange::Create { fid, .. } | ManifestChange::Delete { fid } => *fid,
        }
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            ManifestChange::Create {
                fid,
                level,
                checksum,
            } => {
                buf.write_u8(CREATE).expect("vec write");
                buf.write_u64::<BigEndian>(*fid).expect("vec write");
                buf.write_u32::<BigEndian>(*level).expect("vec write");
                buf.write_u16::<BigEndian>(checksum.len() as u16)
                    .expect("vec write");
                buf.extend_from_slice(checksum);
            }
            ManifestChange::Delete { fid } => {
                buf.write_u8(DELETE).expect("vec write");
                buf.write_u64::<BigEndian>(*fid).expect("vec write");
            }
        }
    }

    fn decode_from(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let op = cursor.read_u8()?;
        match op {
            CREATE => {
                let fid = cursor.read_u64::<BigEndian>()?;
                let level = cursor.read_u32::<BigEndian>()?;
                let checksum_len = cursor.read_u16::<BigEndian>()? as usize;
                let mut checksum = vec![0u8; checksum_len];
                std::io::Read::read_exact(cursor, &mut checksum)?;
                Ok(ManifestChange::Create {
                    fid,
                    level,
                    checksum,
                })
            }
            DELETE => {
                let fid = cursor.read_u64::<BigEndian>()?;
                Ok(ManifestChange::Delete { fid })
            }
            _ => Err(Error::Corruption(format!("invalid manifest change op: {op}"))),
        }
    }
}

/// The payload of one manifest record: a list of changes applied
/// atomically.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub changes: Vec<ManifestChange>,
}

impl ChangeSet {
    pub fn new(changes: Vec<ManifestChange>) -> ChangeSet {
        ChangeSet { changes }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_u32::<BigEndian>(self.changes.len() as u32)
            .expect("vec write");
        for change in &self.changes {
            change.encode_into(&mut buf);
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<ChangeSet> {
        let mut cursor = Cursor::new(buf);
        let count = cursor.read_u32::<BigEndian>()? as usize;
        let mut changes = Vec::with_capacity(count);
        for _ in 0..count {
            changes.push(ManifestChange::decode_from(&mut cursor)?);
        }
        Ok(ChangeSet { changes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_roundtrip() {
        let set = ChangeSet::new(vec![ManifestChange::Create {
            fid: 42,
            level: 3,
            checksum: vec![0xde, 0xad, 0xbe, 0xef],
        }]);
        assert_eq!(ChangeSet::decode(&set.encode()).unwrap(), set);
    }

    #[test]
    fn test_delete_roundtrip() {
        let set = ChangeSet::new(vec![ManifestChange::Delete { fid: 7 }]);
        assert_eq!(ChangeSet::decode(&set.encode()).unwrap(), set);
    }

    #[test]
    fn test_mixed_roundtrip() {
        let set = ChangeSet::new(vec![
            ManifestChange::Create {
                fid: 10,
                level: 1,
                checksum: vec![],
            },
            ManifestChange::Delete { fid: 3 },
            ManifestChange::Delete { fid: 4 },
        ]);
        assert_eq!(ChangeSet::decode(&set.encode()).unwrap(), set);
    }

    #[test]
    fn test_invalid_op_rejected() {
        let mut buf = ChangeSet::new(vec![ManifestChange::Delete { fid: 1 }]).encode();
        buf[4] = 0xff;
        assert!(matches!(
            ChangeSet::decode(&buf),
            Err(Error::Corruption(_))
        ));
    }
}
