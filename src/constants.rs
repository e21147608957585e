use alloy_primitives::{b256, B256};

/// Root hash of an empty trie: `keccak256(rlp(""))`.
pub const EMPTY_ROOT_HASH: B256 =
    b256!("56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421");

/// Hash of empty code: `keccak256([])`.
pub const KECCAK_EMPTY: B256 =
    b256!("c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470");

/// Length in bytes of a hashed key (address hash or slot hash).
pub const KECCAK_LENGTH: usize = 32;

/// Length in bytes of the incarnation infix of storage keys.
pub const INCARNATION_LENGTH: usize = 8;

/// A nibble value marking leaf termination in an unpacked key.
pub const TERMINATOR: u8 = 0x10;
