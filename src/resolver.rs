use crate::{
    account::Account,
    cancel::CancelToken,
    constants::{KECCAK_LENGTH, TERMINATOR},
    hash_builder::HashBuilder,
    kv::{tables, Backend},
    nibbles::Nibbles,
    nodes::BranchNodeCompact,
    planner::{ResolvePlan, ResolveRequest},
    walker::walk_ranges,
    ResolveError,
};
use alloy_primitives::{hex, B256};
use alloy_rlp::{Decodable, Encodable};
use std::collections::HashMap;
use tracing::{debug, trace};

pub use crate::walker::TrieKind;

/// The internal nodes materialized while building one range, keyed by
/// nibble path relative to the range root.
pub type SubtreeNodes = HashMap<Nibbles, BranchNodeCompact>;

/// Receiver of resolved subtrees, called once per range after its
/// structural build finishes.
pub trait SubtreeHook {
    /// Installs a built subtree. An error aborts the resolution and is
    /// surfaced as [`ResolveError::HookFailed`].
    fn install(
        &mut self,
        request: &ResolveRequest,
        nodes: SubtreeNodes,
        root_hash: B256,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

impl<F> SubtreeHook for F
where
    F: FnMut(
        &ResolveRequest,
        SubtreeNodes,
        B256,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>,
{
    fn install(
        &mut self,
        request: &ResolveRequest,
        nodes: SubtreeNodes,
        root_hash: B256,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self(request, nodes, root_hash)
    }
}

/// Resolves a batch of subtree requests against the main and cache buckets
/// of an embedded store.
///
/// The resolver plans the scan, walks both buckets in lockstep and feeds
/// the emissions through a [`HashBuilder`], handing every finished range to
/// the install hook. The whole run is scoped to one read snapshot; the
/// cache bucket is created beforehand in a short write transaction when
/// missing.
#[derive(Debug)]
pub struct CachedResolver<H> {
    top_levels: usize,
    requests: Vec<ResolveRequest>,
    hook: H,
    cancel: CancelToken,
}

impl<H: SubtreeHook> CachedResolver<H> {
    /// Creates a resolver.
    ///
    /// `requests` must be pre-sorted by `(contract,
    /// resolve_hex[..resolve_pos])`. `top_levels` forces expansion of that
    /// many nibble levels below each trie root regardless of the cache.
    pub fn new(top_levels: usize, requests: Vec<ResolveRequest>, hook: H) -> Self {
        Self { top_levels, requests, hook, cancel: CancelToken::new() }
    }

    /// Attaches a cancellation token observed before every cursor call.
    pub fn with_cancellation(self, cancel: CancelToken) -> Self {
        Self { cancel, ..self }
    }

    /// Runs the resolution against `db` for the given trie.
    ///
    /// On success every range with content has been installed through the
    /// hook; on error nothing further is delivered and the first error is
    /// returned unmodified.
    pub fn resolve(
        &mut self,
        db: &dyn Backend,
        block_number: u64,
        kind: TrieKind,
    ) -> Result<(), ResolveError> {
        let plan = ResolvePlan::new(self.top_levels, &self.requests);
        debug!(
            target: "trie::resolver",
            block_number,
            ?kind,
            requests = self.requests.len(),
            ranges = plan.ranges.len(),
            "resolving subtries"
        );

        let db = db.embedded().ok_or(ResolveError::BackendUnavailable)?;
        db.update(|tx| {
            tx.create_bucket_if_missing(tables::INTERMEDIATE_TRIE_HASH);
            Ok::<_, ResolveError>(())
        })?;

        let cancel = self.cancel.clone();
        let mut state = WalkState {
            kind,
            requests: &self.requests,
            plan: &plan,
            hook: &mut self.hook,
            hash_builder: HashBuilder::default().with_updates(true),
            key_idx: 0,
            fed: false,
            last_key: Nibbles::default(),
            rlp_buf: Vec::with_capacity(128),
        };

        db.view(|tx| {
            walk_ranges(
                kind,
                tx.cursor(kind.bucket()),
                tx.cursor(tables::INTERMEDIATE_TRIE_HASH),
                &plan,
                &cancel,
                |range_idx, key, value, from_cache| state.step(range_idx, key, value, from_cache),
            )
        })?;

        state.finalize_root()
    }
}

/// Mutable walk state: the builder for the current range and the bookmark
/// of which range is being built.
struct WalkState<'a, H> {
    kind: TrieKind,
    requests: &'a [ResolveRequest],
    plan: &'a ResolvePlan,
    hook: &'a mut H,
    hash_builder: HashBuilder,
    key_idx: usize,
    fed: bool,
    last_key: Nibbles,
    rlp_buf: Vec<u8>,
}

impl<H: SubtreeHook> WalkState<'_, H> {
    /// Consumes one walker emission: decodes the payload and advances the
    /// hash builder. A change of range finalizes the previous root first.
    fn step(
        &mut self,
        range_idx: usize,
        key_nibbles: &[u8],
        value: &[u8],
        from_cache: bool,
    ) -> Result<(), ResolveError> {
        if range_idx != self.key_idx {
            self.finalize_root()?;
            self.key_idx = range_idx;
        }
        if value.is_empty() {
            return Ok(())
        }

        let range = &self.plan.ranges[range_idx];
        let mut key = Nibbles::from_nibbles(&key_nibbles[range.ext_resolve_pos..]);
        if !from_cache {
            key.push(TERMINATOR);
        }

        if self.fed && key <= self.last_key {
            return Err(ResolveError::BuilderInvariant {
                range: range_idx,
                key: packed_hex(key_nibbles),
            })
        }

        trace!(
            target: "trie::resolver",
            range_idx,
            ?key,
            from_cache,
            "feeding the hash builder"
        );

        if from_cache {
            if value.len() != KECCAK_LENGTH {
                return Err(ResolveError::MalformedRecord {
                    bucket: tables::INTERMEDIATE_TRIE_HASH,
                    key: packed_hex(key_nibbles),
                    reason: format!("subtree hash of {} bytes", value.len()),
                })
            }
            self.hash_builder.add_branch(key.clone(), B256::from_slice(value), true);
        } else if self.kind.is_accounts() {
            let account = Account::decode(&mut &value[..]).map_err(|err| {
                ResolveError::MalformedRecord {
                    bucket: tables::ACCOUNTS,
                    key: packed_hex(key_nibbles),
                    reason: err.to_string(),
                }
            })?;
            self.rlp_buf.clear();
            account.encode_for_hashing(&mut self.rlp_buf);
            self.hash_builder.add_leaf(key.clone(), &self.rlp_buf);
        } else {
            if value.len() > KECCAK_LENGTH {
                return Err(ResolveError::MalformedRecord {
                    bucket: tables::STORAGE,
                    key: packed_hex(key_nibbles),
                    reason: format!("storage value of {} bytes", value.len()),
                })
            }
            self.rlp_buf.clear();
            value.encode(&mut self.rlp_buf);
            self.hash_builder.add_leaf(key.clone(), &self.rlp_buf);
        }

        self.fed = true;
        self.last_key = key;
        Ok(())
    }

    /// Closes the root of the range under construction and hands it to the
    /// install hook. Ranges without emissions install nothing.
    fn finalize_root(&mut self) -> Result<(), ResolveError> {
        if !self.fed {
            return Ok(())
        }

        let root_hash = self.hash_builder.root();
        let nodes = self.hash_builder.take_updates();
        let request = &self.requests[self.plan.ranges[self.key_idx].request];
        debug!(
            target: "trie::resolver",
            range = self.key_idx,
            %root_hash,
            nodes = nodes.len(),
            "installing resolved subtree"
        );
        self.hook
            .install(request, nodes, root_hash)
            .map_err(|source| ResolveError::HookFailed { range: self.key_idx, source })?;

        self.hash_builder = HashBuilder::default().with_updates(true);
        self.fed = false;
        self.last_key = Nibbles::default();
        Ok(())
    }
}

/// Hex form of an unpacked key for error reporting. Walk emissions always
/// unpack whole bytes, so the nibble count is even.
fn packed_hex(key_nibbles: &[u8]) -> String {
    hex::encode(Nibbles::from_nibbles(key_nibbles).pack())
}
