//! # B+Tree Engine
//!
//! The ordered-tree logic layered over the storage modules: prefix
//! handling, in-page binary search, root-to-leaf descent, insertion with
//! page splitting, and deletion with rebalancing.
//!
//! Keys on a page are stored with the page's common prefix removed (the
//! prefix is implied by the separators bounding the page in its
//! ancestors), so comparisons and reconstruction always go through the
//! helpers here.

mod prefix;
mod rebalance;
mod search;
mod tree;

pub(crate) use prefix::{common_prefix_len, reduce_separator};
pub(crate) use search::NodePos;

use std::cmp::Ordering;

use smallvec::SmallVec;

use crate::error::{Error, Result};
use crate::storage::MAX_KEY_SIZE;

/// Scratch buffer for keys and prefixes; keys are at most 255 bytes so
/// most fit inline.
pub(crate) type KeyBuf = SmallVec<[u8; 64]>;

/// Compares two keys the way the tree orders them: lexicographic
/// byte-wise, with a shorter key ordering before any of its extensions.
pub fn cmp(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

/// Compares a full query key against a stored (prefix-stripped) key
/// without materializing `prefix ++ stored`.
pub(crate) fn cmp_prefixed(query: &[u8], prefix: &[u8], stored: &[u8]) -> Ordering {
    let n = prefix.len().min(query.len());
    match query[..n].cmp(&prefix[..n]) {
        // The query is a proper prefix of the page prefix, so it sorts
        // before every key on the page.
        Ordering::Equal if query.len() < prefix.len() => Ordering::Less,
        Ordering::Equal => query[prefix.len()..].cmp(stored),
        ord => ord,
    }
}

pub(crate) fn validate_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(Error::Invalid("key must not be empty"));
    }
    if key.len() > MAX_KEY_SIZE {
        return Err(Error::Invalid("key longer than 255 bytes"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmp_is_length_aware_lexicographic() {
        assert_eq!(cmp(b"a", b"b"), Ordering::Less);
        assert_eq!(cmp(b"a", b"a"), Ordering::Equal);
        assert_eq!(cmp(b"a", b"ab"), Ordering::Less);
        assert_eq!(cmp(b"ab", b"a"), Ordering::Greater);
        assert_eq!(cmp(b"\xff", b"\x00\xff"), Ordering::Greater);
    }

    #[test]
    fn cmp_prefixed_matches_full_reconstruction() {
        let cases: &[(&[u8], &[u8], &[u8])] = &[
            (b"keyb", b"key", b"b"),
            (b"keya", b"key", b"b"),
            (b"kez", b"key", b"b"),
            (b"ka", b"key", b"b"),
            (b"k", b"key", b"b"),
            (b"key", b"key", b""),
            (b"zzz", b"key", b"b"),
            (b"keyb", b"", b"keyb"),
        ];
        for &(query, prefix, stored) in cases {
            let mut full = prefix.to_vec();
            full.extend_from_slice(stored);
            assert_eq!(
                cmp_prefixed(query, prefix, stored),
                cmp(query, &full),
                "query={query:?} prefix={prefix:?} stored={stored:?}"
            );
        }
    }

    #[test]
    fn key_validation_bounds() {
        assert!(validate_key(b"").is_err());
        assert!(validate_key(&[0u8; 256]).is_err());
        assert!(validate_key(&[0u8; 255]).is_ok());
        assert!(validate_key(b"x").is_ok());
    }
}
