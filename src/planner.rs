use crate::{nibbles::Nibbles, resolve_set::ResolveSet};
use tracing::debug;

/// A request to resolve the subtree rooted at
/// `contract || resolve_hex[..resolve_pos]`, loading all children needed to
/// hash the subtree beneath it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolveRequest {
    /// Key prefix selecting the trie: empty for the account trie, hashed
    /// address plus incarnation for a contract storage trie.
    pub contract: Vec<u8>,
    /// Nibble path of the requested key below the contract prefix.
    pub resolve_hex: Nibbles,
    /// How many leading nibbles of `resolve_hex` locate the subtree root.
    pub resolve_pos: usize,
}

impl ResolveRequest {
    /// Creates a request. `resolve_pos` must not exceed the hex length.
    pub fn new(contract: Vec<u8>, resolve_hex: Nibbles, resolve_pos: usize) -> Self {
        assert!(resolve_pos <= resolve_hex.len());
        Self { contract, resolve_hex, resolve_pos }
    }
}

/// One contiguous scan range derived from a group of requests sharing a
/// subtree root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolveRange {
    /// First byte key of the range in scan order.
    pub start_key: Vec<u8>,
    /// Number of leading key bits fixed for the whole range.
    pub fixed_bits: u32,
    /// Resolution position in nibbles, contract prefix included.
    pub ext_resolve_pos: usize,
    /// Hash-substitution oracle for the range.
    pub resolve_set: ResolveSet,
    /// Index of the first request folded into the range.
    pub request: usize,
}

/// The ordered set of scan ranges for one resolution run.
///
/// Adjacent requests sharing `(contract, resolve_hex[..resolve_pos])` fold
/// into a single range with their remaining fragments merged into one
/// resolve set, so every key is processed in exactly one range. The merged
/// walker can only advance ranges monotonically, which the pre-sorted
/// request order guarantees.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolvePlan {
    /// Ranges in ascending `start_key` order.
    pub ranges: Vec<ResolveRange>,
}

impl ResolvePlan {
    /// Plans the scan for `requests`, which must be pre-sorted by
    /// `(contract, resolve_hex[..resolve_pos])`.
    ///
    /// `top_levels` forces expansion of that many nibble levels below each
    /// trie root: a range at `resolve_pos` may substitute hashes only at
    /// depth `max(0, top_levels - resolve_pos)` or below.
    pub fn new(top_levels: usize, requests: &[ResolveRequest]) -> Self {
        debug_assert!(
            requests.windows(2).all(|pair| {
                (&pair[0].contract, &pair[0].resolve_hex[..pair[0].resolve_pos]) <=
                    (&pair[1].contract, &pair[1].resolve_hex[..pair[1].resolve_pos])
            }),
            "requests must be pre-sorted by (contract, resolved prefix)"
        );

        let mut ranges: Vec<ResolveRange> = Vec::new();
        for (index, request) in requests.iter().enumerate() {
            let prefix = request.resolve_hex.slice(0..request.resolve_pos);
            let shares_root = ranges.last().is_some_and(|range| {
                let prev = &requests[range.request];
                prev.contract == request.contract &&
                    prev.resolve_hex[..prev.resolve_pos] == prefix[..]
            });

            if shares_root {
                let range = ranges.last_mut().expect("shares_root implies a previous range");
                range.resolve_set.add_hex(request.resolve_hex.offset(request.resolve_pos));
                continue
            }

            let ext_resolve_pos = request.resolve_pos + 2 * request.contract.len();
            let mut start_key =
                Vec::with_capacity(request.contract.len() + (request.resolve_pos + 1) / 2);
            start_key.extend_from_slice(&request.contract);
            pack_prefix(&prefix, &mut start_key);

            let mut resolve_set = ResolveSet::new(top_levels.saturating_sub(request.resolve_pos));
            resolve_set.add_hex(request.resolve_hex.offset(request.resolve_pos));

            ranges.push(ResolveRange {
                start_key,
                fixed_bits: 4 * ext_resolve_pos as u32,
                ext_resolve_pos,
                resolve_set,
                request: index,
            });
        }

        debug!(
            target: "trie::planner",
            requests = requests.len(),
            ranges = ranges.len(),
            "planned resolution ranges"
        );
        Self { ranges }
    }
}

/// Packs a nibble prefix onto `out`. An odd trailing nibble is padded with
/// a zero low nibble; the pad bytes are ignored by the masked range
/// comparison and only make the seek target the smallest key of the range.
fn pack_prefix(prefix: &Nibbles, out: &mut Vec<u8>) {
    let mut chunks = prefix.chunks_exact(2);
    for pair in &mut chunks {
        out.push((pair[0] << 4) | pair[1]);
    }
    if let [last] = chunks.remainder() {
        out.push(last << 4);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(contract: &[u8], hex: &[u8], pos: usize) -> ResolveRequest {
        ResolveRequest::new(contract.to_vec(), Nibbles::from_nibbles(hex), pos)
    }

    #[test]
    fn folds_requests_sharing_a_root() {
        let requests = vec![
            request(&[], &[1, 2, 3, 4], 2),
            request(&[], &[1, 2, 9, 9], 2),
            request(&[], &[7, 0, 0, 0], 2),
        ];
        let plan = ResolvePlan::new(0, &requests);
        assert_eq!(plan.ranges.len(), 2);

        let first = &plan.ranges[0];
        assert_eq!(first.start_key, vec![0x12]);
        assert_eq!(first.fixed_bits, 8);
        assert_eq!(first.ext_resolve_pos, 2);
        assert_eq!(first.request, 0);
        // Both fragments below [1, 2] landed in the same set.
        assert!(!first.resolve_set.hash_only(&[3, 4]));
        assert!(!first.resolve_set.hash_only(&[9, 9]));
        assert!(first.resolve_set.hash_only(&[5]));

        let second = &plan.ranges[1];
        assert_eq!(second.start_key, vec![0x70]);
        assert_eq!(second.request, 2);
    }

    #[test]
    fn contract_prefix_extends_the_position() {
        let contract = vec![0xab; 32];
        let requests = vec![request(&contract, &[5, 6], 2)];
        let plan = ResolvePlan::new(0, &requests);

        let range = &plan.ranges[0];
        assert_eq!(range.ext_resolve_pos, 2 + 64);
        assert_eq!(range.fixed_bits, 4 * 66);
        let mut expected = contract;
        expected.push(0x56);
        assert_eq!(range.start_key, expected);
    }

    #[test]
    fn odd_position_pads_the_seek_key() {
        let requests = vec![request(&[], &[0xf, 0x1, 0x2], 1)];
        let plan = ResolvePlan::new(0, &requests);
        assert_eq!(plan.ranges[0].start_key, vec![0xf0]);
        assert_eq!(plan.ranges[0].fixed_bits, 4);
    }

    #[test]
    fn min_length_follows_top_levels() {
        let requests = vec![request(&[], &[1, 2, 3, 4], 2)];
        let plan = ResolvePlan::new(5, &requests);
        assert_eq!(plan.ranges[0].resolve_set.min_length(), 3);

        let plan = ResolvePlan::new(1, &requests);
        assert_eq!(plan.ranges[0].resolve_set.min_length(), 0);
    }

    #[test]
    fn planning_is_idempotent() {
        let requests = vec![
            request(&[], &[0, 0, 1], 2),
            request(&[], &[0, 0, 2], 2),
            request(&[0x11; 32], &[3], 0),
        ];
        assert_eq!(ResolvePlan::new(3, &requests), ResolvePlan::new(3, &requests));
    }

    #[test]
    fn empty_requests_plan_no_ranges() {
        assert!(ResolvePlan::new(0, &[]).ranges.is_empty());
    }
}
