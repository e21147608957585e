use crate::kv::DatabaseError;
use thiserror::Error;

/// Errors surfaced by a resolution run.
///
/// The walker aborts on the first error; the read view is released and the
/// error reaches the caller unmodified. Retry policy is a collaborator
/// concern.
#[derive(Error, Debug)]
pub enum ResolveError {
    /// The cancellation token was observed before a key-value store call.
    #[error("resolution cancelled")]
    Cancelled,

    /// The resolver was handed a backend without embedded cursor access.
    #[error("embedded key-value backend required, none available")]
    BackendUnavailable,

    /// A stored record could not be decoded.
    #[error("malformed record in bucket {bucket} at key 0x{key}: {reason}")]
    MalformedRecord {
        /// Bucket the record was read from.
        bucket: &'static str,
        /// Hex-encoded offending key.
        key: String,
        /// Decode failure detail.
        reason: String,
    },

    /// The walk produced a non-monotone key feed. Unreachable by
    /// construction; treated as a bug in the walker.
    #[error("non-monotone feed in range {range}: key 0x{key} does not advance the builder")]
    BuilderInvariant {
        /// Index of the range being built.
        range: usize,
        /// Hex-encoded nibble key of the offending emission.
        key: String,
    },

    /// The install hook rejected a built subtree.
    #[error("install hook failed for range {range}")]
    HookFailed {
        /// Index of the range whose root was being installed.
        range: usize,
        /// Error returned by the hook.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A cursor operation failed in the key-value backend.
    #[error(transparent)]
    Database(#[from] DatabaseError),
}
