use crate::nibbles::Nibbles;
use alloy_rlp::{Encodable, Header};

/// An extension node: a shared key fragment followed by a reference to the
/// single child, which is already in `rlp_node` form.
#[derive(Debug)]
pub struct ExtensionNode<'a> {
    key: &'a Nibbles,
    child: &'a [u8],
}

impl<'a> ExtensionNode<'a> {
    /// Creates an extension node reference.
    pub fn new(key: &'a Nibbles, child: &'a [u8]) -> Self {
        debug_assert!(!key.is_empty());
        debug_assert!(!key.is_leaf(), "extension node key must not carry the terminator");
        Self { key, child }
    }

    /// RLP encoding: `[hex_prefix(key), child]`, the child spliced in raw.
    pub fn rlp(&self) -> Vec<u8> {
        let path = self.key.encode_compact();
        let payload_length = path.as_slice().length() + self.child.len();
        let mut out = Vec::with_capacity(payload_length + 4);
        Header { list: true, payload_length }.encode(&mut out);
        path.as_slice().encode(&mut out);
        out.extend_from_slice(self.child);
        out
    }
}
