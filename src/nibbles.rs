use crate::constants::TERMINATOR;
use std::{
    fmt,
    ops::{Deref, Range},
};

/// A sequence of 4-bit values, one per byte.
///
/// Keys fed to the hash builder may carry a trailing [`TERMINATOR`] nibble
/// marking leaf termination; intermediate prefixes never do.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Nibbles {
    hex_data: Vec<u8>,
}

impl fmt::Debug for Nibbles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nibbles(0x{})", alloy_primitives::hex::encode(&self.hex_data))
    }
}

impl Deref for Nibbles {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.hex_data
    }
}

impl From<Vec<u8>> for Nibbles {
    fn from(hex_data: Vec<u8>) -> Self {
        Self { hex_data }
    }
}

impl Nibbles {
    /// Creates a nibble sequence from raw nibble values.
    pub fn from_nibbles(nibbles: &[u8]) -> Self {
        debug_assert!(nibbles.iter().all(|n| *n <= TERMINATOR));
        Self { hex_data: nibbles.to_vec() }
    }

    /// Unpacks a byte key into nibbles, high nibble first. The result has
    /// length `2 * bytes.len()` and no terminator.
    pub fn unpack<T: AsRef<[u8]>>(bytes: T) -> Self {
        let mut hex_data = Vec::with_capacity(bytes.as_ref().len() * 2);
        unpack_into(bytes.as_ref(), &mut hex_data);
        Self { hex_data }
    }

    /// Packs an even-length nibble sequence back into bytes. Inverse of
    /// [`Nibbles::unpack`].
    pub fn pack(&self) -> Vec<u8> {
        debug_assert!(self.hex_data.len() % 2 == 0, "pack requires an even nibble count");
        self.hex_data.chunks_exact(2).map(|pair| (pair[0] << 4) | pair[1]).collect()
    }

    /// The number of nibbles.
    pub fn len(&self) -> usize {
        self.hex_data.len()
    }

    /// Returns `true` if the sequence is empty.
    pub fn is_empty(&self) -> bool {
        self.hex_data.is_empty()
    }

    /// Returns `true` if the sequence ends with the terminator nibble.
    pub fn is_leaf(&self) -> bool {
        self.hex_data.last() == Some(&TERMINATOR)
    }

    /// The number of leading nibbles shared with `other`.
    pub fn common_prefix_length(&self, other: &Self) -> usize {
        self.hex_data.iter().zip(other.hex_data.iter()).take_while(|(a, b)| a == b).count()
    }

    /// A copy of the sub-sequence in `range`.
    pub fn slice(&self, range: Range<usize>) -> Self {
        Self { hex_data: self.hex_data[range].to_vec() }
    }

    /// A copy of the sequence with the first `index` nibbles removed.
    pub fn offset(&self, index: usize) -> Self {
        self.slice(index..self.hex_data.len())
    }

    /// Shortens the sequence to `len` nibbles.
    pub fn truncate(&mut self, len: usize) {
        self.hex_data.truncate(len);
    }

    /// Appends a single nibble.
    pub fn push(&mut self, nibble: u8) {
        self.hex_data.push(nibble);
    }

    /// Encodes the sequence in hex-prefix (compact) form. The leaf flag is
    /// taken from the trailing terminator, which is not itself encoded.
    ///
    /// ```text
    /// node type    path length    |    prefix    hexchar
    /// --------------------------------------------------
    /// extension    even           |    0000      0x0
    /// extension    odd            |    0001      0x1
    /// leaf         even           |    0010      0x2
    /// leaf         odd            |    0011      0x3
    /// ```
    pub fn encode_compact(&self) -> Vec<u8> {
        let is_leaf = self.is_leaf();
        let mut hex = if is_leaf {
            &self.hex_data[..self.hex_data.len() - 1]
        } else {
            &self.hex_data[..]
        };

        let mut compact = Vec::with_capacity(hex.len() / 2 + 1);
        let first = if hex.len() % 2 == 1 {
            let first = 0x10 | hex[0];
            hex = &hex[1..];
            first
        } else {
            0x00
        };
        compact.push(first | if is_leaf { 0x20 } else { 0x00 });
        for pair in hex.chunks_exact(2) {
            compact.push((pair[0] << 4) | pair[1]);
        }
        compact
    }
}

/// Unpacks `bytes` into `out`, clearing it first. Buffer-reusing variant of
/// [`Nibbles::unpack`] for hot paths.
pub fn unpack_into(bytes: &[u8], out: &mut Vec<u8>) {
    out.clear();
    out.reserve(bytes.len() * 2);
    for byte in bytes {
        out.push(byte >> 4);
        out.push(byte & 0x0f);
    }
}

/// Returns `(bytes, mask)` for comparing a `bits`-bit key prefix:
/// `bytes = (bits + 7) / 8` full bytes, of which the last is compared under
/// `mask`. Fixed prefixes are nibble-aligned, so the mask is `0xf0` for an
/// odd nibble count and `0xff` otherwise.
pub fn byte_prefix_mask(bits: u32) -> (usize, u8) {
    let fixed_bytes = ((bits + 7) / 8) as usize;
    let shift = bits % 8;
    let mask = if shift == 0 { 0xff } else { 0xffu8 << (8 - shift) };
    (fixed_bytes, mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn unpack_pack_roundtrip() {
        let bytes = [0x12, 0xaf, 0x00, 0xff];
        let nibbles = Nibbles::unpack(bytes);
        assert_eq!(&nibbles[..], [0x1, 0x2, 0xa, 0xf, 0x0, 0x0, 0xf, 0xf]);
        assert_eq!(nibbles.pack(), bytes);
    }

    #[test]
    fn compact_encoding_vectors() {
        // Vectors from the canonical hex-prefix specification.
        let cases: &[(&[u8], &[u8])] = &[
            (&[1, 2, 3, 4, 5], &[0x11, 0x23, 0x45]),
            (&[0, 1, 2, 3, 4, 5], &[0x00, 0x01, 0x23, 0x45]),
            (&[15, 1, 12, 11, 8, 16], &[0x3f, 0x1c, 0xb8]),
            (&[0, 15, 1, 12, 11, 8, 16], &[0x20, 0x0f, 0x1c, 0xb8]),
        ];
        for (hex, compact) in cases {
            assert_eq!(Nibbles::from_nibbles(hex).encode_compact(), *compact);
        }
    }

    #[test]
    fn terminator_marks_leaf() {
        let mut key = Nibbles::unpack([0xab]);
        assert!(!key.is_leaf());
        key.push(TERMINATOR);
        assert!(key.is_leaf());
    }

    #[test]
    fn common_prefix() {
        let a = Nibbles::from_nibbles(&[1, 2, 3, 4]);
        let b = Nibbles::from_nibbles(&[1, 2, 4]);
        assert_eq!(a.common_prefix_length(&b), 2);
        assert_eq!(a.common_prefix_length(&a), 4);
        assert_eq!(a.common_prefix_length(&Nibbles::default()), 0);
    }

    #[test]
    fn prefix_masks() {
        assert_eq!(byte_prefix_mask(0), (0, 0xff));
        assert_eq!(byte_prefix_mask(4), (1, 0xf0));
        assert_eq!(byte_prefix_mask(8), (1, 0xff));
        assert_eq!(byte_prefix_mask(12), (2, 0xf0));
        assert_eq!(byte_prefix_mask(256), (32, 0xff));
    }

    proptest! {
        #[test]
        fn unpack_preserves_order(a: Vec<u8>, b: Vec<u8>) {
            // Lexicographic order of byte keys survives nibble expansion.
            prop_assert_eq!(a.cmp(&b), Nibbles::unpack(&a).cmp(&Nibbles::unpack(&b)));
        }
    }
}
