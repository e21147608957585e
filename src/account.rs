use crate::constants::{EMPTY_ROOT_HASH, KECCAK_EMPTY};
use alloy_primitives::{B256, U256};
use alloy_rlp::{Decodable, Encodable, Header};

/// An account record as stored in the main `Accounts` bucket.
///
/// The stored form is an RLP list of `[nonce, balance, storage_root,
/// code_hash]` with an optional trailing `storage_size` element for
/// contracts whose storage footprint is tracked.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Account {
    /// Transaction count of the account.
    pub nonce: u64,
    /// Balance in wei.
    pub balance: U256,
    /// Root hash of the contract storage trie.
    pub storage_root: B256,
    /// Hash of the contract bytecode.
    pub code_hash: B256,
    /// Tracked storage footprint, when present.
    pub storage_size: Option<u64>,
}

impl Default for Account {
    fn default() -> Self {
        Self {
            nonce: 0,
            balance: U256::ZERO,
            storage_root: EMPTY_ROOT_HASH,
            code_hash: KECCAK_EMPTY,
            storage_size: None,
        }
    }
}

impl Account {
    /// Returns `true` if the account has no code and no storage, i.e. it
    /// hashes with the empty constants.
    pub fn is_not_contract(&self) -> bool {
        self.code_hash == KECCAK_EMPTY && self.storage_root == EMPTY_ROOT_HASH
    }

    /// Appends the 4-field trie leaf payload to `out`. The optional storage
    /// size is a storage-bucket concern and never part of the hashed form.
    pub fn encode_for_hashing(&self, out: &mut Vec<u8>) {
        let payload_length = self.nonce.length() +
            self.balance.length() +
            self.storage_root.length() +
            self.code_hash.length();
        Header { list: true, payload_length }.encode(out);
        self.nonce.encode(out);
        self.balance.encode(out);
        self.storage_root.encode(out);
        self.code_hash.encode(out);
    }
}

impl Encodable for Account {
    fn encode(&self, out: &mut dyn alloy_rlp::BufMut) {
        let mut payload_length = self.nonce.length() +
            self.balance.length() +
            self.storage_root.length() +
            self.code_hash.length();
        if let Some(size) = self.storage_size {
            payload_length += size.length();
        }
        Header { list: true, payload_length }.encode(out);
        self.nonce.encode(out);
        self.balance.encode(out);
        self.storage_root.encode(out);
        self.code_hash.encode(out);
        if let Some(size) = self.storage_size {
            size.encode(out);
        }
    }

    fn length(&self) -> usize {
        let mut payload_length = self.nonce.length() +
            self.balance.length() +
            self.storage_root.length() +
            self.code_hash.length();
        if let Some(size) = self.storage_size {
            payload_length += size.length();
        }
        payload_length + Header { list: true, payload_length }.length()
    }
}

impl Decodable for Account {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let mut payload = Header::decode_bytes(buf, true)?;
        let nonce = u64::decode(&mut payload)?;
        let balance = U256::decode(&mut payload)?;
        let storage_root = B256::decode(&mut payload)?;
        let code_hash = B256::decode(&mut payload)?;
        let storage_size =
            if payload.is_empty() { None } else { Some(u64::decode(&mut payload)?) };
        if !payload.is_empty() {
            return Err(alloy_rlp::Error::ListLengthMismatch {
                expected: 5,
                got: 6,
            })
        }
        Ok(Self { nonce, balance, storage_root, code_hash, storage_size })
    }
}
