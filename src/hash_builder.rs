use crate::{
    constants::EMPTY_ROOT_HASH,
    nibbles::Nibbles,
    nodes::{
        as_hash, rlp_hash, rlp_node, BranchNode, BranchNodeCompact, ExtensionNode, LeafNode,
        TrieMask,
    },
};
use alloy_primitives::{keccak256, B256};
use std::{cmp, collections::HashMap, fmt};
use tracing::trace;

/// The pending payload carried between two steps of the builder.
#[derive(Clone)]
enum HashBuilderValue {
    /// An RLP payload to be placed in a leaf node.
    Bytes(Vec<u8>),
    /// A subtree hash standing in for an entire range of leaves.
    Hash(B256),
}

impl fmt::Debug for HashBuilderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(bytes) => write!(f, "Bytes(0x{})", alloy_primitives::hex::encode(bytes)),
            Self::Hash(hash) => write!(f, "Hash({hash})"),
        }
    }
}

impl Default for HashBuilderValue {
    fn default() -> Self {
        Self::Bytes(Vec::new())
    }
}

/// A streaming constructor of Merkle-Patricia root hashes.
///
/// The builder consumes a strictly increasing sequence of nibble keys with
/// their payloads. Each new key closes the branch and extension nodes whose
/// key ranges are now exceeded, hashes them, and pushes the result back on
/// an internal stack, so the top of the stack always holds the root of the
/// trie built so far. Leaf keys carry a terminator nibble; hash stubs never
/// do.
///
/// Branch nodes with hashed or cache-backed children are additionally
/// retained in compact form; they are the structure delivered to the
/// install hook once a range is finished.
#[derive(Debug, Default)]
pub struct HashBuilder {
    key: Nibbles,
    value: HashBuilderValue,
    stack: Vec<Vec<u8>>,

    state_masks: Vec<TrieMask>,
    tree_masks: Vec<TrieMask>,
    hash_masks: Vec<TrieMask>,

    stored_in_database: bool,

    updated_branch_nodes: Option<HashMap<Nibbles, BranchNodeCompact>>,
}

impl HashBuilder {
    /// Enables or disables retention of closed branch nodes.
    pub fn with_updates(mut self, retain_updates: bool) -> Self {
        if retain_updates {
            self.updated_branch_nodes = Some(HashMap::new());
        }
        self
    }

    /// Returns `true` if nothing was fed into the builder yet.
    pub fn is_empty(&self) -> bool {
        self.key.is_empty() && self.stack.is_empty()
    }

    /// The most recently added key.
    pub fn key(&self) -> &Nibbles {
        &self.key
    }

    /// Adds a leaf element with its RLP payload.
    ///
    /// The key must carry the terminator nibble and come strictly after the
    /// previously added key.
    pub fn add_leaf(&mut self, key: Nibbles, value: &[u8]) {
        assert!(key > self.key, "add_leaf key {key:?} does not advance {:?}", self.key);
        if !self.key.is_empty() {
            self.update(&key);
        }
        trace!(target: "trie::hash_builder", ?key, "adding leaf");
        self.key = key;
        self.value = HashBuilderValue::Bytes(value.to_vec());
    }

    /// Adds a subtree hash standing in for every leaf under `key`.
    ///
    /// `stored_in_database` marks the subtree as backed by a cache-bucket
    /// entry, which is recorded in the tree mask of the parent branch.
    pub fn add_branch(&mut self, key: Nibbles, value: B256, stored_in_database: bool) {
        assert!(
            key > self.key || (self.key.is_empty() && key.is_empty()),
            "add_branch key {key:?} does not advance {:?}",
            self.key
        );
        if !self.key.is_empty() {
            self.update(&key);
        } else if key.is_empty() {
            self.stack.push(rlp_hash(value));
        }
        trace!(target: "trie::hash_builder", ?key, ?value, "adding branch hash");
        self.key = key;
        self.value = HashBuilderValue::Hash(value);
        self.stored_in_database = stored_in_database;
    }

    /// Closes all remaining nodes and returns the root hash.
    pub fn root(&mut self) -> B256 {
        if !self.key.is_empty() {
            self.update(&Nibbles::default());
            self.key = Nibbles::default();
            self.value = HashBuilderValue::default();
        }
        self.current_root()
    }

    /// Takes the branch nodes retained since the last call.
    pub fn take_updates(&mut self) -> HashMap<Nibbles, BranchNodeCompact> {
        self.updated_branch_nodes.take().unwrap_or_default()
    }

    fn current_root(&self) -> B256 {
        match self.stack.last() {
            Some(node_ref) => as_hash(node_ref).unwrap_or_else(|| keccak256(node_ref)),
            None => EMPTY_ROOT_HASH,
        }
    }

    /// Walks the common-prefix chain between the pending key and the
    /// succeeding one, closing every node whose key range is exceeded and
    /// replacing it on the stack by its reference. An empty `succeeding`
    /// closes everything down to the root.
    fn update(&mut self, succeeding: &Nibbles) {
        let mut build_extensions = false;
        let mut current = self.key.clone();
        debug_assert!(!current.is_empty());

        trace!(target: "trie::hash_builder", ?current, ?succeeding, "updating merkle tree");

        loop {
            let preceding_exists = !self.state_masks.is_empty();
            let preceding_len = self.state_masks.len().saturating_sub(1);

            let common_prefix_len = succeeding.common_prefix_length(&current);
            let len = cmp::max(preceding_len, common_prefix_len);
            assert!(len < current.len(), "the key feed must be strictly increasing");

            trace!(
                target: "trie::hash_builder",
                len,
                common_prefix_len,
                preceding_len,
                preceding_exists,
                "prefix lengths after comparing keys"
            );

            // Mark the child slot in the branch forming at depth `len`.
            let extra_digit = current[len];
            if self.state_masks.len() <= len {
                self.state_masks.resize(len + 1, TrieMask::default());
            }
            self.state_masks[len] |= TrieMask::from_nibble(extra_digit);

            if self.tree_masks.len() < current.len() {
                self.resize_masks(current.len());
            }

            let mut len_from = len;
            if !succeeding.is_empty() || preceding_exists {
                len_from += 1;
            }

            // The key without the common prefix.
            let short_node_key = current.offset(len_from);

            if !build_extensions {
                match &self.value {
                    HashBuilderValue::Bytes(leaf_value) => {
                        let leaf_node = LeafNode::new(&short_node_key, leaf_value);
                        trace!(target: "trie::hash_builder", ?short_node_key, "pushing leaf node");
                        self.stack.push(rlp_node(leaf_node.rlp()));
                    }
                    HashBuilderValue::Hash(hash) => {
                        trace!(target: "trie::hash_builder", ?hash, "pushing subtree hash");
                        self.stack.push(rlp_hash(*hash));

                        let last = current[current.len() - 1];
                        if self.stored_in_database {
                            self.tree_masks[current.len() - 1] |= TrieMask::from_nibble(last);
                        }
                        self.hash_masks[current.len() - 1] |= TrieMask::from_nibble(last);

                        build_extensions = true;
                    }
                }
            }

            if build_extensions && !short_node_key.is_empty() {
                self.update_masks(&current, len_from);
                let stack_last = self.stack.pop().expect("extension child on the stack");
                let extension_node = ExtensionNode::new(&short_node_key, &stack_last);
                trace!(target: "trie::hash_builder", ?short_node_key, "pushing extension node");
                self.stack.push(rlp_node(extension_node.rlp()));
                self.resize_masks(len_from);
            }

            if preceding_len <= common_prefix_len && !succeeding.is_empty() {
                return
            }

            if !succeeding.is_empty() || preceding_exists {
                let children = self.push_branch_node(len);
                self.store_branch_node(&current, len, children);
            }

            self.state_masks.resize(len, TrieMask::default());
            self.resize_masks(len);

            if preceding_len == 0 {
                return
            }

            current.truncate(preceding_len);
            while self.state_masks.last() == Some(&TrieMask::default()) {
                self.state_masks.pop();
            }

            build_extensions = true;
        }
    }

    /// Collapses the branch forming at depth `len` into its RLP reference on
    /// the stack. Returns the hashes of its hash-mask children when update
    /// retention is enabled.
    fn push_branch_node(&mut self, len: usize) -> Vec<B256> {
        let state_mask = self.state_masks[len];
        let hash_mask = self.hash_masks[len];

        let branch_node = BranchNode::new(&self.stack);
        let children = if self.updated_branch_nodes.is_some() {
            branch_node.child_hashes(state_mask, hash_mask)
        } else {
            Vec::new()
        };
        let rlp = branch_node.rlp(state_mask);

        let first_child_idx = self.stack.len() - state_mask.count_ones();
        trace!(
            target: "trie::hash_builder",
            new_len = first_child_idx,
            old_len = self.stack.len(),
            "collapsing branch node children"
        );
        self.stack.truncate(first_child_idx);
        self.stack.push(rlp_node(rlp));
        children
    }

    /// Retains the just-collapsed branch in compact form when any of its
    /// children is hashed or cache-backed, and propagates the masks to the
    /// parent level.
    fn store_branch_node(&mut self, current: &Nibbles, len: usize, children: Vec<B256>) {
        if len > 0 {
            self.hash_masks[len - 1] |= TrieMask::from_nibble(current[len - 1]);
        }

        let store_in_db_trie = !self.tree_masks[len].is_empty() || !self.hash_masks[len].is_empty();
        if store_in_db_trie {
            if len > 0 {
                self.tree_masks[len - 1] |= TrieMask::from_nibble(current[len - 1]);
            }

            if self.updated_branch_nodes.is_some() {
                let common_prefix = current.slice(0..len);
                let node = BranchNodeCompact::new(
                    self.state_masks[len],
                    self.tree_masks[len],
                    self.hash_masks[len],
                    children,
                    (len == 0).then(|| self.current_root()),
                );
                trace!(target: "trie::hash_builder", ?common_prefix, ?node, "storing branch node");
                self.updated_branch_nodes.as_mut().expect("retention enabled").insert(common_prefix, node);
            }
        }
    }

    fn update_masks(&mut self, current: &Nibbles, len_from: usize) {
        if len_from > 0 {
            let flag = TrieMask::from_nibble(current[len_from - 1]);

            self.hash_masks[len_from - 1] &= !flag;

            if !self.tree_masks[current.len() - 1].is_empty() {
                self.tree_masks[len_from - 1] |= flag;
            }
        }
    }

    fn resize_masks(&mut self, new_len: usize) {
        self.tree_masks.resize(new_len, TrieMask::default());
        self.hash_masks.resize(new_len, TrieMask::default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::TERMINATOR;
    use alloy_primitives::{hex, U256};
    use hash_db::Hasher;
    use plain_hasher::PlainHasher;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    #[derive(Default, Debug, Clone, PartialEq, Eq)]
    struct KeccakHasher;

    impl Hasher for KeccakHasher {
        type Out = B256;
        type StdHasher = PlainHasher;
        const LENGTH: usize = 32;

        fn hash(x: &[u8]) -> Self::Out {
            keccak256(x)
        }
    }

    fn triehash_root<I, K, V>(iter: I) -> B256
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<[u8]> + Ord,
        V: AsRef<[u8]>,
    {
        triehash::trie_root::<KeccakHasher, _, _, _>(iter)
    }

    fn leaf_key<T: AsRef<[u8]>>(bytes: T) -> Nibbles {
        let mut key = Nibbles::unpack(bytes);
        key.push(TERMINATOR);
        key
    }

    fn assert_trie_root<I, K, V>(iter: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<[u8]> + Ord,
        V: AsRef<[u8]>,
    {
        let data = iter.into_iter().collect::<BTreeMap<_, _>>();

        let mut hb = HashBuilder::default();
        for (key, value) in &data {
            hb.add_leaf(leaf_key(key), value.as_ref());
        }
        assert_eq!(hb.root(), triehash_root(&data));
    }

    #[test]
    fn empty() {
        assert_eq!(HashBuilder::default().root(), EMPTY_ROOT_HASH);
    }

    #[test]
    fn root_of_raw_data() {
        let data = vec![
            (hex!("646f").to_vec(), hex!("76657262").to_vec()),
            (hex!("676f6f64").to_vec(), hex!("7075707079").to_vec()),
            (hex!("676f6b32").to_vec(), hex!("7075707079").to_vec()),
            (hex!("676f6b34").to_vec(), hex!("7075707079").to_vec()),
        ];
        assert_trie_root(data);
    }

    #[test]
    fn root_of_hashed_data() {
        let data = [(B256::with_last_byte(1), U256::from(2)), (B256::repeat_byte(3), U256::from(4))]
            .map(|(k, v)| (keccak256(k), alloy_rlp::encode(v)));
        assert_trie_root(data);
    }

    #[test]
    fn root_of_known_hash() {
        let root_hash =
            B256::from(hex!("9fa752911d55c3a1246133fe280785afbdba41f357e9cae1131d5f5b0a078b9c"));
        let mut hb = HashBuilder::default();
        hb.add_branch(Nibbles::default(), root_hash, false);
        assert_eq!(hb.root(), root_hash);
    }

    #[test]
    fn stub_and_leaf_retain_root_node() {
        let stub = keccak256(b"subtree");
        let mut leaf = Nibbles::from_nibbles(&[0xf; 64]);
        leaf.push(TERMINATOR);

        let mut hb = HashBuilder::default().with_updates(true);
        hb.add_branch(Nibbles::from_nibbles(&[0x0, 0x0]), stub, true);
        hb.add_leaf(leaf, &alloy_rlp::encode(U256::from(1)));
        let root = hb.root();

        let updates = hb.take_updates();
        let node = updates.get(&Nibbles::default()).expect("root branch node retained");
        assert_eq!(node.state_mask, TrieMask::from_nibble(0) | TrieMask::from_nibble(15));
        assert_eq!(node.root_hash, Some(root));
    }

    proptest! {
        #[test]
        fn arbitrary_hashed_root(state: BTreeMap<[u8; 32], u64>) {
            assert_trie_root(
                state
                    .iter()
                    .map(|(k, v)| (keccak256(k), alloy_rlp::encode(U256::from(*v)))),
            );
        }
    }
}
