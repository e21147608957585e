use crate::{
    cancel::CancelToken,
    constants::{INCARNATION_LENGTH, KECCAK_LENGTH},
    kv::{tables, Cursor, KvPair},
    nibbles::{byte_prefix_mask, unpack_into},
    planner::ResolvePlan,
    pool, ResolveError,
};
use std::cmp::Ordering;
use tracing::trace;

/// Which state trie a resolution runs against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrieKind {
    /// The account trie over the `Accounts` bucket.
    Accounts,
    /// A contract storage trie over the `Storage` bucket.
    Storage,
}

impl TrieKind {
    /// The main bucket scanned for this trie.
    pub const fn bucket(&self) -> &'static str {
        match self {
            Self::Accounts => tables::ACCOUNTS,
            Self::Storage => tables::STORAGE,
        }
    }

    /// Returns `true` for the account trie.
    pub const fn is_accounts(&self) -> bool {
        matches!(self, Self::Accounts)
    }
}

/// Returns the shortest byte string of the same length strictly greater
/// than `key`: the rightmost non-`0xff` byte is incremented and everything
/// after it zeroed. `None` when every byte is `0xff`.
pub fn next_subtree(key: &[u8]) -> Option<Vec<u8>> {
    let mut next = key.to_vec();
    for byte in next.iter_mut().rev() {
        if *byte != u8::MAX {
            *byte += 1;
            return Some(next)
        }
        *byte = 0;
    }
    None
}

/// Order over optional bucket keys, `None` sorting after everything.
///
/// Keys longer than a full hash compare their first 32 bytes, then their
/// own tail against the other key's tail past the 8-byte incarnation. This
/// places an account key immediately before the storage keys under the same
/// address, and sorts a contract's cache entries before its storage leaves.
/// Returns `true` when `k1` sorts before or ties `k2`.
pub fn key_is_before(k1: Option<&[u8]>, k2: Option<&[u8]>) -> bool {
    match (k1, k2) {
        (None, _) => false,
        (_, None) => true,
        (Some(k1), Some(k2)) => {
            if k1.len() <= KECCAK_LENGTH {
                return k1 <= k2
            }
            match k1[..KECCAK_LENGTH].cmp(&k2[..KECCAK_LENGTH]) {
                Ordering::Less => true,
                Ordering::Greater => false,
                Ordering::Equal => {
                    k1[KECCAK_LENGTH..] <= k2[KECCAK_LENGTH + INCARNATION_LENGTH..]
                }
            }
        }
    }
}

fn key_of(entry: &Option<KvPair>) -> Option<&[u8]> {
    entry.as_ref().map(|(key, _)| key.as_slice())
}

/// Walks the main and cache buckets in sorted-key lockstep over the planned
/// ranges, calling `f(range_idx, key_nibbles, value, from_cache)` for every
/// leaf and every usable subtree hash, in ascending key order.
///
/// A usable cache entry substitutes for its entire subtree: after emitting
/// it, both cursors seek past the subtree. Cache entries vetoed by the
/// range's resolve set are descended into instead. Empty cache values mark
/// self-destructed subtrees: the owning account, when still live in the
/// main bucket, is emitted as a leaf and the stale subtree is dropped.
///
/// The cancellation token is checked before every cursor call.
pub fn walk_ranges<C, CC, F>(
    kind: TrieKind,
    mut main: C,
    mut cache: CC,
    plan: &ResolvePlan,
    cancel: &CancelToken,
    mut f: F,
) -> Result<(), ResolveError>
where
    C: Cursor,
    CC: Cursor,
    F: FnMut(usize, &[u8], &[u8], bool) -> Result<(), ResolveError>,
{
    let ranges = &plan.ranges;
    if ranges.is_empty() {
        return Ok(())
    }
    let is_accounts = kind.is_accounts();

    let mut key_nibbles = pool::buffer(256);

    let mut range_idx = 0usize;
    let (mut fixed_bytes, mut mask) = byte_prefix_mask(ranges[range_idx].fixed_bits);
    let mut start_key = ranges[range_idx].start_key.as_slice();

    cancel.check()?;
    let mut k = main.seek(start_key)?;
    cancel.check()?;
    let mut ck = cache.seek(start_key)?;

    while k.is_some() || ck.is_some() {
        // For the accounts bucket, a cache key longer than a full account
        // prefix describes a storage subtree whose owner plays no part in
        // this scan; jump the cache to the next account-level sibling.
        if is_accounts {
            if let Some((cache_key, _)) = &ck {
                if cache_key.len() > KECCAK_LENGTH {
                    ck = match next_subtree(&cache_key[..KECCAK_LENGTH - 1]) {
                        Some(next) => {
                            cancel.check()?;
                            cache.seek_to(&next)?
                        }
                        None => None,
                    };
                    continue
                }
            }
        }

        let mut from_cache = key_is_before(key_of(&ck), key_of(&k));
        let mut min_key =
            if from_cache { &ck } else { &k }.as_ref().expect("one cursor has a key").0.clone();

        // Advance the range until the masked fixed prefix of the walked key
        // matches it; a key below the range start re-seeks both cursors.
        if fixed_bytes > 0 {
            let mut cmp = Ordering::Less;
            while cmp != Ordering::Equal {
                let min_key_index = min_key.len().min(fixed_bytes - 1);
                let start_key_index = start_key.len().min(fixed_bytes - 1);
                cmp = min_key[..min_key_index].cmp(&start_key[..start_key_index]);
                if cmp == Ordering::Equal && min_key_index == min_key.len() {
                    // The walked key ran out of bytes, so it sorts below
                    // the range start.
                    cmp = Ordering::Less;
                }
                if cmp == Ordering::Equal {
                    cmp = (min_key[min_key_index] & mask).cmp(&(start_key[start_key_index] & mask));
                }
                match cmp {
                    Ordering::Less => {
                        cancel.check()?;
                        k = main.seek_to(start_key)?;
                        cancel.check()?;
                        ck = cache.seek_to(start_key)?;
                        if k.is_none() && ck.is_none() {
                            return Ok(())
                        }
                        from_cache = key_is_before(key_of(&ck), key_of(&k));
                        min_key = if from_cache { &ck } else { &k }
                            .as_ref()
                            .expect("one cursor has a key")
                            .0
                            .clone();
                    }
                    Ordering::Greater => {
                        range_idx += 1;
                        if range_idx == ranges.len() {
                            return Ok(())
                        }
                        let range = &ranges[range_idx];
                        (fixed_bytes, mask) = byte_prefix_mask(range.fixed_bits);
                        start_key = range.start_key.as_slice();
                        trace!(target: "trie::walker", range_idx, "advanced to next range");
                    }
                    Ordering::Equal => {}
                }
            }
        }

        if !from_cache {
            let (key, value) = k.take().expect("main key was the minimum");
            if !value.is_empty() {
                unpack_into(&key, &mut key_nibbles);
                f(range_idx, &key_nibbles, &value, false)?;
            }
            cancel.check()?;
            k = main.next()?;
            continue
        }

        let (cache_key, cache_value) = ck.take().expect("cache key was the minimum");
        let mut can_use_cache = false;

        if cache_value.is_empty() {
            // Self-destruct tombstone. The account record may still be
            // live; everything below it is stale and gets skipped.
            if is_accounts {
                if let Some((key, value)) = &k {
                    if !value.is_empty() && *key == cache_key {
                        unpack_into(key, &mut key_nibbles);
                        f(range_idx, &key_nibbles, value, false)?;
                    }
                }
            }
        } else {
            let range = &ranges[range_idx];
            unpack_into(&cache_key, &mut key_nibbles);

            if key_nibbles.len() < range.ext_resolve_pos {
                // Above the resolution frontier: go to children, not to
                // the next sibling.
                cancel.check()?;
                ck = cache.next()?;
                continue
            }

            can_use_cache = range.resolve_set.hash_only(&key_nibbles[range.ext_resolve_pos..]);
            if !can_use_cache {
                cancel.check()?;
                ck = cache.next()?;
                continue
            }

            trace!(
                target: "trie::walker",
                key = %alloy_primitives::hex::encode(&cache_key),
                range_idx,
                "substituting cached subtree hash"
            );
            f(range_idx, &key_nibbles, &cache_value, true)?;
        }

        // Skip the entire subtree under the cache key.
        match next_subtree(&cache_key) {
            Some(next) => {
                cancel.check()?;
                k = main.seek(&next)?;
                cancel.check()?;
                ck = cache.seek(&next)?;
            }
            None => {
                if can_use_cache {
                    // The last subtree came from the cache and no sibling
                    // can follow anywhere.
                    break
                }
                ck = None;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        kv::MemDb,
        nibbles::Nibbles,
        planner::{ResolvePlan, ResolveRequest},
    };
    use proptest::prelude::*;

    #[test]
    fn next_subtree_increments() {
        assert_eq!(next_subtree(&[0x00]), Some(vec![0x01]));
        assert_eq!(next_subtree(&[0x01, 0xff]), Some(vec![0x02, 0x00]));
        assert_eq!(next_subtree(&[0xfe, 0xff, 0xff]), Some(vec![0xff, 0x00, 0x00]));
        assert_eq!(next_subtree(&[0xff, 0xff]), None);
        assert_eq!(next_subtree(&[]), None);
    }

    #[test]
    fn key_order_nil_sorts_last() {
        let key = [0u8; 32];
        assert!(key_is_before(Some(&key), None));
        assert!(!key_is_before(None, Some(&key)));
        assert!(!key_is_before(None, None));
    }

    #[test]
    fn key_order_accounts_and_short_prefixes() {
        let low = [0u8; 32];
        let high = [0xffu8; 32];
        assert!(key_is_before(Some(&low), Some(&high)));
        assert!(!key_is_before(Some(&high), Some(&low)));
        // A short cache prefix sorts before the full keys it covers.
        assert!(key_is_before(Some(&[0x00]), Some(&low)));
        // Equal keys tie in favor of the first argument.
        assert!(key_is_before(Some(&low), Some(&low)));
    }

    #[test]
    fn key_order_storage_tail_rule() {
        let account = [0xaa; KECCAK_LENGTH];
        let incarnation = 1u64.to_be_bytes();
        let mut main_key = account.to_vec();
        main_key.extend_from_slice(&incarnation);
        main_key.extend_from_slice(&[0x55; KECCAK_LENGTH]);

        // The account key itself sorts immediately before its storage.
        assert!(key_is_before(Some(&account), Some(&main_key)));

        // A storage-root cache key (account plus incarnation) compares its
        // tail, which begins with the low incarnation bytes, against the
        // slot hash, so it sorts before the contract's storage leaves.
        let mut storage_root = account.to_vec();
        storage_root.extend_from_slice(&incarnation);
        assert!(key_is_before(Some(&storage_root), Some(&main_key)));

        // So does a deeper cache prefix under the same incarnation.
        let mut deeper = storage_root.clone();
        deeper.extend_from_slice(&[0x55, 0x55]);
        assert!(key_is_before(Some(&deeper), Some(&main_key)));

        // A different account wins on the first 32 bytes alone.
        let mut other = [0xab; KECCAK_LENGTH].to_vec();
        other.extend_from_slice(&incarnation);
        assert!(!key_is_before(Some(&other), Some(&main_key)));
    }

    proptest! {
        #[test]
        fn next_subtree_is_the_immediate_successor(b in proptest::collection::vec(any::<u8>(), 1..40)) {
            if let Some(next) = next_subtree(&b) {
                prop_assert_eq!(next.len(), b.len());
                prop_assert!(next > b);
                // Nothing of the same length fits strictly between: the
                // predecessor of `next` is `b` itself.
                let mut pred = next.clone();
                for byte in pred.iter_mut().rev() {
                    if *byte != 0 {
                        *byte -= 1;
                        break
                    }
                    *byte = 0xff;
                }
                prop_assert_eq!(pred, b);
            } else {
                prop_assert!(b.iter().all(|byte| *byte == 0xff));
            }
        }

        #[test]
        fn key_order_is_total_for_distinct_account_keys(
            a in proptest::collection::vec(any::<u8>(), 1..=32),
            b in proptest::collection::vec(any::<u8>(), 1..=32),
        ) {
            prop_assume!(a != b);
            prop_assert_ne!(
                key_is_before(Some(&a), Some(&b)),
                key_is_before(Some(&b), Some(&a))
            );
        }
    }

    type Emission = (usize, Vec<u8>, Vec<u8>, bool);

    fn collect_walk(
        db: &MemDb,
        kind: TrieKind,
        plan: &ResolvePlan,
    ) -> Result<Vec<Emission>, ResolveError> {
        let mut emitted = Vec::new();
        db.view(|tx| {
            walk_ranges(
                kind,
                tx.cursor(kind.bucket()),
                tx.cursor(tables::INTERMEDIATE_TRIE_HASH),
                plan,
                &CancelToken::new(),
                |idx, key, value, from_cache| {
                    emitted.push((idx, key.to_vec(), value.to_vec(), from_cache));
                    Ok(())
                },
            )
        })?;
        Ok(emitted)
    }

    fn account_db(accounts: &[(Vec<u8>, Vec<u8>)], cache: &[(Vec<u8>, Vec<u8>)]) -> MemDb {
        let db = MemDb::new();
        db.put_all(tables::ACCOUNTS, accounts);
        db.put_all(tables::INTERMEDIATE_TRIE_HASH, cache);
        db
    }

    fn whole_trie_plan() -> ResolvePlan {
        ResolvePlan::new(0, &[ResolveRequest::new(Vec::new(), Nibbles::default(), 0)])
    }

    #[test]
    fn plain_scan_without_cache() {
        let db = account_db(
            &[(vec![0x00; 32], b"a".to_vec()), (vec![0xff; 32], b"b".to_vec())],
            &[],
        );
        let emitted = collect_walk(&db, TrieKind::Accounts, &whole_trie_plan()).unwrap();
        assert_eq!(emitted.len(), 2);
        assert!(emitted.iter().all(|(idx, _, _, from_cache)| *idx == 0 && !from_cache));
        assert_eq!(emitted[0].1, vec![0u8; 64]);
        assert_eq!(emitted[1].1, vec![0xfu8; 64]);
    }

    #[test]
    fn cached_subtree_replaces_its_leaves() {
        let stub = vec![0xcd; 32];
        let db = account_db(
            &[(vec![0x00; 32], b"hidden".to_vec()), (vec![0xff; 32], b"live".to_vec())],
            &[(vec![0x00], stub.clone())],
        );
        let emitted = collect_walk(&db, TrieKind::Accounts, &whole_trie_plan()).unwrap();
        assert_eq!(emitted.len(), 2);
        // The stub covers the 0x00.. account entirely.
        assert_eq!(emitted[0], (0, vec![0, 0], stub, true));
        assert_eq!(emitted[1].3, false);
        assert_eq!(emitted[1].1, vec![0xfu8; 64]);
    }

    #[test]
    fn resolve_set_vetoes_descend_into_children() {
        // The request targets a leaf under the cached prefix, so the cache
        // entry cannot stand in for the subtree.
        let hex = Nibbles::from_nibbles(&[0u8; 64]);
        let plan = ResolvePlan::new(0, &[ResolveRequest::new(Vec::new(), hex, 0)]);
        let db = account_db(
            &[(vec![0x00; 32], b"wanted".to_vec())],
            &[(vec![0x00], vec![0xcd; 32])],
        );
        let emitted = collect_walk(&db, TrieKind::Accounts, &plan).unwrap();
        assert_eq!(emitted.len(), 1);
        assert!(!emitted[0].3);
        assert_eq!(emitted[0].2, b"wanted".to_vec());
    }

    #[test]
    fn storage_cache_keys_are_filtered_from_account_walks() {
        let mut storage_cache_key = vec![0x00; 32];
        storage_cache_key.extend_from_slice(&[0x12, 0x34]);
        let db = account_db(
            &[(vec![0xff; 32], b"live".to_vec())],
            &[(storage_cache_key, vec![0xcd; 32])],
        );
        let emitted = collect_walk(&db, TrieKind::Accounts, &whole_trie_plan()).unwrap();
        assert_eq!(emitted.len(), 1);
        assert!(!emitted[0].3);
    }

    #[test]
    fn tombstone_keeps_the_live_account() {
        let account_key = vec![0xaa; 32];
        let db = account_db(
            &[(account_key.clone(), b"live".to_vec())],
            &[(account_key.clone(), Vec::new())],
        );
        let emitted = collect_walk(&db, TrieKind::Accounts, &whole_trie_plan()).unwrap();
        assert_eq!(emitted.len(), 1);
        let (_, key, value, from_cache) = &emitted[0];
        assert_eq!(key, &Nibbles::unpack(&account_key).to_vec());
        assert_eq!(value, &b"live".to_vec());
        assert!(!from_cache);
    }

    #[test]
    fn two_ranges_advance_monotonically() {
        let plan = ResolvePlan::new(
            0,
            &[
                ResolveRequest::new(Vec::new(), Nibbles::from_nibbles(&[0x0, 0x0]), 2),
                ResolveRequest::new(Vec::new(), Nibbles::from_nibbles(&[0xf, 0xf]), 2),
            ],
        );
        let db = account_db(
            &[
                (vec![0x00; 32], b"first".to_vec()),
                // Between the ranges; must not be emitted.
                (vec![0x70; 32], b"skipped".to_vec()),
                (vec![0xff; 32], b"second".to_vec()),
            ],
            &[],
        );
        let emitted = collect_walk(&db, TrieKind::Accounts, &plan).unwrap();
        assert_eq!(emitted.len(), 2);
        assert_eq!(emitted[0].0, 0);
        assert_eq!(emitted[0].2, b"first".to_vec());
        assert_eq!(emitted[1].0, 1);
        assert_eq!(emitted[1].2, b"second".to_vec());
    }

    #[test]
    fn cancellation_aborts_the_walk() {
        let db = account_db(&[(vec![0x00; 32], b"a".to_vec())], &[]);
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = db.view(|tx| {
            walk_ranges(
                TrieKind::Accounts,
                tx.cursor(tables::ACCOUNTS),
                tx.cursor(tables::INTERMEDIATE_TRIE_HASH),
                &whole_trie_plan(),
                &cancel,
                |_, _, _, _| Ok(()),
            )
        });
        assert!(matches!(result, Err(ResolveError::Cancelled)));
    }
}
