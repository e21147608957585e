use alloy_primitives::{keccak256, B256};
use alloy_rlp::EMPTY_STRING_CODE;

mod branch;
pub use branch::{BranchNode, BranchNodeCompact};

mod extension;
pub use extension::ExtensionNode;

mod leaf;
pub use leaf::LeafNode;

mod mask;
pub use mask::TrieMask;

/// Given an RLP-encoded node, returns either the encoding itself (when it
/// fits inline) or `RLP(keccak(RLP(node)))`.
pub(crate) fn rlp_node(rlp: Vec<u8>) -> Vec<u8> {
    if rlp.len() < B256::len_bytes() {
        rlp
    } else {
        rlp_hash(keccak256(&rlp))
    }
}

/// Quick encoding of a 32-byte hash as an RLP string.
pub(crate) fn rlp_hash(hash: B256) -> Vec<u8> {
    let mut out = Vec::with_capacity(B256::len_bytes() + 1);
    out.push(EMPTY_STRING_CODE + B256::len_bytes() as u8);
    out.extend_from_slice(hash.as_slice());
    out
}

/// Extracts the hash from a node reference in [`rlp_hash`] form.
pub(crate) fn as_hash(node_ref: &[u8]) -> Option<B256> {
    if node_ref.len() == B256::len_bytes() + 1 && node_ref[0] == EMPTY_STRING_CODE + 32 {
        Some(B256::from_slice(&node_ref[1..]))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::b256;

    #[test]
    fn hash_encoding_roundtrip() {
        let hash = b256!("56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421");
        let encoded = rlp_hash(hash);
        assert_eq!(encoded.len(), 33);
        assert_eq!(as_hash(&encoded), Some(hash));
        assert_eq!(as_hash(&encoded[..32]), None);
    }

    #[test]
    fn short_nodes_stay_inline() {
        let short = vec![0xc2, 0x80, 0x80];
        assert_eq!(rlp_node(short.clone()), short);
        let long = vec![0xaa; 32];
        assert_eq!(rlp_node(long.clone()), rlp_hash(keccak256(&long)));
    }
}
