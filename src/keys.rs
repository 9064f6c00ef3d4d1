//! Internal-key helpers.
//!
//! The engine appends an 8-byte suffix to every user key: the big-endian
//! encoding of `u64::MAX - version`. Bytewise-ascending order on the
//! resulting internal keys therefore places newer versions of the same
//! user key first. All comparisons split at the last 8 bytes.

use std::cmp::Ordering;

use byteorder::{BigEndian, ByteOrder};

/// Appends the version suffix to `key`.
pub fn key_with_ts(key: &[u8], ts: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + 8);
    out.extend_from_slice(key);
    out.extend_from_slice(&(u64::MAX - ts).to_be_bytes());
    out
}

/// Strips the version suffix, yielding the user key.
pub fn parse_key(key: &[u8]) -> &[u8] {
    if key.len() < 8 {
        return key;
    }
    &key[..key.len() - 8]
}

/// Extracts the version from an internal key.
pub fn parse_ts(key: &[u8]) -> u64 {
    if key.len() <= 8 {
        return 0;
    }
    u64::MAX - BigEndian::read_u64(&key[key.len() - 8..])
}

/// Key equality ignoring the version suffix.
pub fn same_key(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    parse_key(a) == parse_key(b)
}

/// Compares two internal keys: bytewise on the user-key prefix, tiebreak
/// on the raw suffix (ascending suffix = descending version). Both keys
/// must carry the suffix.
pub fn compare_keys(a: &[u8], b: &[u8]) -> Ordering {
    debug_assert!(a.len() > 8 && b.len() > 8, "keys must carry a version suffix");
    match a[..a.len() - 8].cmp(&b[..b.len() - 8]) {
        Ordering::Equal => a[a.len() - 8..].cmp(&b[b.len() - 8..]),
        ord => ord,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_with_ts_roundtrip() {
        let key = key_with_ts(b"answer", 42);
        assert_eq!(parse_key(&key), b"answer");
        assert_eq!(parse_ts(&key), 42);
    }

    #[test]
    fn test_newer_versions_sort_first() {
        let old = key_with_ts(b"k", 1);
        let new = key_with_ts(b"k", 2);
        assert_eq!(compare_keys(&new, &old), Ordering::Less);
    }

    #[test]
    fn test_prefix_dominates_version() {
        // "a" at any version sorts before "aa" at any version.
        let a = key_with_ts(b"a", 1);
        let aa = key_with_ts(b"aa", u64::MAX);
        assert_eq!(compare_keys(&a, &aa), Ordering::Less);
    }

    #[test]
    fn test_same_key_ignores_version() {
        assert!(same_key(&key_with_ts(b"k", 1), &key_with_ts(b"k", 9)));
        assert!(!same_key(&key_with_ts(b"k", 1), &key_with_ts(b"j", 1)));
    }
}
