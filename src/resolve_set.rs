use crate::nibbles::Nibbles;
use tracing::trace;

/// The per-range oracle deciding whether a nibble prefix may be replaced by
/// its cached subtree hash.
///
/// The set holds the nibble fragments of a range's resolution requests,
/// relative to the range root. A prefix is *inside* a fragment when either
/// is a prefix of the other (equality included); such prefixes lie on the
/// path to a requested subtree and must be descended into. Everything else
/// at depth `min_length` or below may contribute only its hash.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolveSet {
    hexes: Vec<Nibbles>,
    min_length: usize,
}

impl ResolveSet {
    /// Creates an oracle forcing expansion of the top `min_length` nibble
    /// levels regardless of the added fragments.
    pub fn new(min_length: usize) -> Self {
        Self { hexes: Vec::new(), min_length }
    }

    /// The minimum prefix length eligible for hash substitution.
    pub fn min_length(&self) -> usize {
        self.min_length
    }

    /// Adds a request fragment.
    ///
    /// An empty fragment asks for the whole subtree rooted at the range and
    /// constrains nothing; only `min_length` then governs substitution.
    pub fn add_hex(&mut self, hex: Nibbles) {
        if hex.is_empty() {
            return
        }
        if let Err(position) = self.hexes.binary_search(&hex) {
            self.hexes.insert(position, hex);
        }
    }

    /// Returns `true` iff the subtree at `prefix` contributes only its hash
    /// to the parent: the prefix is long enough and outside every added
    /// fragment.
    pub fn hash_only(&self, prefix: &[u8]) -> bool {
        if prefix.len() < self.min_length {
            return false
        }
        // The only fragments that can be in a containment relation with the
        // prefix are its sorted neighbors: the greatest fragment <= prefix
        // may be a prefix of it, the least fragment > prefix may extend it.
        let partition = self.hexes.partition_point(|hex| &hex[..] <= prefix);
        if partition > 0 && prefix.starts_with(&self.hexes[partition - 1]) {
            trace!(target: "trie::resolve_set", ?prefix, "prefix extends a requested fragment");
            return false
        }
        if let Some(next) = self.hexes.get(partition) {
            if next.starts_with(prefix) {
                trace!(target: "trie::resolve_set", ?prefix, "prefix leads to a requested fragment");
                return false
            }
        }
        true
    }
}
