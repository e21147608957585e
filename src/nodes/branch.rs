use super::{as_hash, TrieMask};
use alloy_primitives::B256;
use alloy_rlp::{Header, EMPTY_STRING_CODE};

/// A branch node assembled from the tail of the hash-builder stack.
///
/// The children with set bits in the state mask are the last
/// `state_mask.count_ones()` stack items, in ascending nibble order, each
/// already in `rlp_node` form.
#[derive(Debug)]
pub struct BranchNode<'a> {
    stack: &'a [Vec<u8>],
}

impl<'a> BranchNode<'a> {
    /// Creates a branch node reference over the stack.
    pub fn new(stack: &'a [Vec<u8>]) -> Self {
        Self { stack }
    }

    /// RLP encoding: a 17-item list with one slot per nibble plus an empty
    /// value item. Keys are fixed-length in both buckets, so the value slot
    /// is always empty.
    pub fn rlp(&self, state_mask: TrieMask) -> Vec<u8> {
        let mut first_child = self.stack.len() - state_mask.count_ones();

        let mut payload_length = 1;
        for nibble in 0..16 {
            if state_mask.is_set(nibble) {
                payload_length += self.stack[first_child].len();
                first_child += 1;
            } else {
                payload_length += 1;
            }
        }

        let mut out = Vec::with_capacity(payload_length + 4);
        Header { list: true, payload_length }.encode(&mut out);
        let mut child = self.stack.len() - state_mask.count_ones();
        for nibble in 0..16 {
            if state_mask.is_set(nibble) {
                out.extend_from_slice(&self.stack[child]);
                child += 1;
            } else {
                out.push(EMPTY_STRING_CODE);
            }
        }
        out.push(EMPTY_STRING_CODE);
        out
    }

    /// The hashes of the children selected by `hash_mask`, in nibble order.
    /// Children under the hash mask are always in hashed reference form.
    pub fn child_hashes(&self, state_mask: TrieMask, hash_mask: TrieMask) -> Vec<B256> {
        debug_assert!(hash_mask.is_subset_of(state_mask));
        let first_child = self.stack.len() - state_mask.count_ones();
        let mut hashes = Vec::with_capacity(hash_mask.count_ones());
        let mut child = first_child;
        for nibble in 0..16 {
            if state_mask.is_set(nibble) {
                if hash_mask.is_set(nibble) {
                    if let Some(hash) = as_hash(&self.stack[child]) {
                        hashes.push(hash);
                    }
                }
                child += 1;
            }
        }
        hashes
    }
}

/// The compact branch-node record retained for installed subtrees: which
/// children exist, which are backed by further cached subtrees, which have
/// their hashes stored, and the stored hashes themselves.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BranchNodeCompact {
    /// Mask of existing children.
    pub state_mask: TrieMask,
    /// Mask of children whose subtrees are present in the cache bucket.
    pub tree_mask: TrieMask,
    /// Mask of children with stored hashes.
    pub hash_mask: TrieMask,
    /// Stored child hashes, in ascending nibble order of the hash mask.
    pub hashes: Vec<B256>,
    /// The root hash of the node itself; set on the range root only.
    pub root_hash: Option<B256>,
}

impl BranchNodeCompact {
    /// Creates a compact branch node, checking mask consistency.
    pub fn new(
        state_mask: TrieMask,
        tree_mask: TrieMask,
        hash_mask: TrieMask,
        hashes: Vec<B256>,
        root_hash: Option<B256>,
    ) -> Self {
        assert!(tree_mask.is_subset_of(state_mask));
        assert!(hash_mask.is_subset_of(state_mask));
        assert_eq!(hash_mask.count_ones(), hashes.len());
        Self { state_mask, tree_mask, hash_mask, hashes, root_hash }
    }

    /// The stored hash for `nibble`.
    pub fn hash_for_nibble(&self, nibble: u8) -> B256 {
        debug_assert!(self.hash_mask.is_set(nibble));
        let index = (self.hash_mask.get() & ((1u16 << nibble) - 1)).count_ones() as usize;
        self.hashes[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::rlp_hash;
    use alloy_primitives::keccak256;

    #[test]
    fn branch_rlp_layout() {
        let child_a = rlp_hash(keccak256(b"a"));
        let child_b = rlp_hash(keccak256(b"b"));
        let stack = vec![child_a.clone(), child_b.clone()];
        let mask = TrieMask::from_nibble(0) | TrieMask::from_nibble(15);

        let rlp = BranchNode::new(&stack).rlp(mask);
        // Two-byte list header, 2 hashed children (33 bytes each), 14 empty
        // slots, empty value.
        assert_eq!(rlp.len(), 2 + 33 * 2 + 15);
        // Child order follows nibble order.
        assert_eq!(&rlp[2..35], child_a.as_slice());
        assert_eq!(rlp[35..49].iter().filter(|b| **b == 0x80).count(), 14);
        assert_eq!(&rlp[49..82], child_b.as_slice());
        assert_eq!(rlp[82], 0x80);
    }

    #[test]
    fn child_hash_selection() {
        let child_a = rlp_hash(keccak256(b"a"));
        let child_b = rlp_hash(keccak256(b"b"));
        let stack = vec![child_a, child_b.clone()];
        let state_mask = TrieMask::from_nibble(3) | TrieMask::from_nibble(7);
        let hash_mask = TrieMask::from_nibble(7);

        let hashes = BranchNode::new(&stack).child_hashes(state_mask, hash_mask);
        assert_eq!(hashes, vec![keccak256(b"b")]);

        let node = BranchNodeCompact::new(state_mask, TrieMask::default(), hash_mask, hashes, None);
        assert_eq!(node.hash_for_nibble(7), keccak256(b"b"));
    }
}
