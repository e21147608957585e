use thiserror::Error;

mod mem;
pub use mem::{BucketRef, MemCursor, MemDb, ReadTx, WriteTx};

/// Names of the buckets the resolver reads. The cache bucket is created on
/// demand before a resolution run; the main buckets are owned by the state
/// write path.
pub mod tables {
    /// Main bucket of account records keyed by `keccak(address)`.
    pub const ACCOUNTS: &str = "Accounts";

    /// Main bucket of storage values keyed by
    /// `keccak(address) || incarnation || keccak(slot)`.
    pub const STORAGE: &str = "Storage";

    /// Cache bucket mapping nibble-path prefixes to subtree hashes, with
    /// empty values marking self-destructed subtrees.
    pub const INTERMEDIATE_TRIE_HASH: &str = "IntermediateTrieHash";
}

/// Errors produced by the key-value backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DatabaseError {
    /// A cursor operation failed.
    #[error("cursor operation failed: {0}")]
    Cursor(String),

    /// A write referenced a bucket that was never created.
    #[error("bucket {0} does not exist")]
    BucketMissing(String),
}

/// A key-value pair copied out of the store.
pub type KvPair = (Vec<u8>, Vec<u8>);

/// Ordered iteration over the byte keys of one bucket inside a read
/// transaction. `None` marks the end of the bucket.
pub trait Cursor {
    /// Positions at the first entry.
    fn first(&mut self) -> Result<Option<KvPair>, DatabaseError>;

    /// Positions at the first entry with a key not less than `key`.
    fn seek(&mut self, key: &[u8]) -> Result<Option<KvPair>, DatabaseError>;

    /// Same contract as [`Cursor::seek`]; a separate entry point because
    /// some backends distinguish prefix seek from range seek.
    fn seek_to(&mut self, key: &[u8]) -> Result<Option<KvPair>, DatabaseError> {
        self.seek(key)
    }

    /// Advances to the entry after the current one.
    fn next(&mut self) -> Result<Option<KvPair>, DatabaseError>;
}

/// Capability probe for the resolver: direct two-cursor access requires the
/// embedded store. Backends without it are refused with
/// [`crate::ResolveError::BackendUnavailable`].
pub trait Backend {
    /// The embedded store behind this backend, if any.
    fn embedded(&self) -> Option<&MemDb>;
}
