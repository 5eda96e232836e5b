use std::collections::{BTreeMap, BTreeSet, HashMap};

use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use parking_lot::Mutex;
use prover_mpt::{MptError, NodeBag, PartialTrie, StateAccount, EMPTY_ROOT_HASH, KECCAK_EMPTY};
use reth_primitives::Header;
use reth_storage_errors::db::DatabaseError;
use reth_storage_errors::provider::ProviderError;
use reth_trie::HashedPostState;
use revm::db::DatabaseRef;
use revm::primitives::{AccountInfo, Bytecode};

use crate::stages::StageError;

/// A state access the witness could not answer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MissingAccess {
    Account(Address),
    Slot(Address, B256),
    Code(B256),
    Ancestor(u64),
}

impl MissingAccess {
    /// Maps the access onto the stage-level error naming it.
    pub fn into_stage_error(self) -> StageError {
        match self {
            MissingAccess::Account(address) => StageError::MissingWitness {
                address,
                slot: None,
            },
            MissingAccess::Slot(address, slot) => StageError::MissingWitness {
                address,
                slot: Some(slot),
            },
            MissingAccess::Code(hash) => {
                StageError::ProofInvalid(format!("witness is missing bytecode {hash}"))
            }
            MissingAccess::Ancestor(number) => StageError::MissingAncestor(number),
        }
    }
}

/// The outcome of committing a post-state onto the witness.
#[derive(Clone, Debug)]
pub struct StateUpdate {
    pub root: B256,
    /// Trie nodes created by the commit, absent from the witness bag.
    pub committed: Vec<Bytes>,
}

/// A read-only state database and chain view over a witness: a bag of MPT
/// nodes, contract bytecodes, and an ancestor header chain.
///
/// Keys resolve against the pre-state root through the bag. A key whose
/// proof path ends in a proven absence reads as the canonical empty account
/// or zero slot; a path that dead-ends in an unresolvable digest is a
/// missing-witness condition, recorded and surfaced as an error.
pub struct WitnessState {
    bag: NodeBag,
    state_root: B256,
    state: PartialTrie,
    codes: HashMap<B256, Bytecode>,
    ancestor_hashes: HashMap<u64, B256>,
    used_codes: Mutex<BTreeSet<B256>>,
    lowest_ancestor: Mutex<Option<u64>>,
    missing: Mutex<Option<MissingAccess>>,
}

impl WitnessState {
    pub fn new(
        bag: NodeBag,
        state_root: B256,
        codes: HashMap<B256, Bytecode>,
        ancestor_hashes: HashMap<u64, B256>,
    ) -> Self {
        Self {
            bag,
            state_root,
            state: PartialTrie::from_root(state_root),
            codes,
            ancestor_hashes,
            used_codes: Mutex::new(BTreeSet::new()),
            lowest_ancestor: Mutex::new(None),
            missing: Mutex::new(None),
        }
    }

    pub fn bag(&self) -> &NodeBag {
        &self.bag
    }

    /// Code hashes served so far, ascending.
    pub fn used_codes(&self) -> Vec<B256> {
        self.used_codes.lock().iter().copied().collect()
    }

    /// The lowest block number answered via `BLOCKHASH`, if any.
    pub fn lowest_ancestor_used(&self) -> Option<u64> {
        *self.lowest_ancestor.lock()
    }

    /// The first state access the witness failed to cover, if any.
    pub fn take_missing(&self) -> Option<MissingAccess> {
        self.missing.lock().take()
    }

    fn record_missing(&self, access: MissingAccess) -> ProviderError {
        let mut missing = self.missing.lock();
        if missing.is_none() {
            *missing = Some(access);
        }
        ProviderError::Database(DatabaseError::Other(format!("missing witness: {access:?}")))
    }

    fn account(&self, hashed_address: B256) -> Result<Option<StateAccount>, MptError> {
        match self.state.get(hashed_address, &self.bag)? {
            Some(encoded) => {
                let account = alloy_rlp::decode_exact::<StateAccount>(&encoded).map_err(|err| {
                    MptError::BadEncoding(format!("account leaf payload: {err}"))
                })?;
                Ok(Some(account))
            }
            None => Ok(None),
        }
    }

    /// Applies a hashed post-state on top of the witness and returns the
    /// resulting state root along with the nodes created by the commit.
    ///
    /// Storage tries are updated first so account leaves can embed their new
    /// storage roots; iteration is in key order to keep the walk (and thus
    /// the usage marks in the bag) deterministic.
    pub fn commit(&self, post: &HashedPostState) -> Result<StateUpdate, StageError> {
        let mut state = self.state.clone();
        let mut committed: Vec<(B256, Vec<u8>)> = Vec::new();
        let mut storage_roots: BTreeMap<B256, B256> = BTreeMap::new();

        let storages: BTreeMap<&B256, _> = post.storages.iter().collect();
        for (hashed_address, storage) in storages {
            let prior_root = match self.account(*hashed_address)? {
                Some(account) => account.storage_root,
                None => EMPTY_ROOT_HASH,
            };
            let mut trie = if storage.wiped {
                PartialTrie::empty()
            } else {
                PartialTrie::from_root(prior_root)
            };

            let slots: BTreeMap<&B256, &U256> = storage.storage.iter().collect();
            for (hashed_slot, value) in slots {
                if value.is_zero() {
                    trie.remove(*hashed_slot, &self.bag)?;
                } else {
                    trie.insert(*hashed_slot, alloy_rlp::encode(value), &self.bag)?;
                }
            }

            storage_roots.insert(*hashed_address, trie.root()?);
            committed.extend(trie.nodes()?);
        }

        // Accounts with storage-only changes still need their leaf rewritten
        // with the new storage root.
        let mut accounts: BTreeMap<B256, Option<reth_primitives::Account>> =
            post.accounts.iter().map(|(k, v)| (*k, *v)).collect();
        for hashed_address in storage_roots.keys() {
            if !accounts.contains_key(hashed_address) {
                let existing = self.account(*hashed_address)?.unwrap_or_default();
                accounts.insert(
                    *hashed_address,
                    Some(reth_primitives::Account {
                        nonce: existing.nonce,
                        balance: existing.balance,
                        bytecode_hash: (existing.code_hash != KECCAK_EMPTY)
                            .then_some(existing.code_hash),
                    }),
                );
            }
        }

        for (hashed_address, update) in accounts {
            match update {
                None => {
                    state.remove(hashed_address, &self.bag)?;
                }
                Some(account) => {
                    let storage_root = match storage_roots.get(&hashed_address) {
                        Some(root) => *root,
                        None => self
                            .account(hashed_address)?
                            .map(|a| a.storage_root)
                            .unwrap_or(EMPTY_ROOT_HASH),
                    };

                    // EIP-158: a touched account that ends up empty leaves
                    // the trie entirely.
                    let code_hash = account.bytecode_hash.unwrap_or(KECCAK_EMPTY);
                    if account.nonce == 0
                        && account.balance.is_zero()
                        && code_hash == KECCAK_EMPTY
                        && storage_root == EMPTY_ROOT_HASH
                    {
                        state.remove(hashed_address, &self.bag)?;
                        continue;
                    }

                    let leaf = StateAccount {
                        nonce: account.nonce,
                        balance: account.balance,
                        storage_root,
                        code_hash,
                    };
                    state.insert(hashed_address, alloy_rlp::encode(leaf), &self.bag)?;
                }
            }
        }

        let root = state.root()?;
        committed.extend(state.nodes()?);
        committed.retain(|(hash, _)| !self.bag.contains(hash));
        committed.sort_by_key(|(hash, _)| *hash);
        committed.dedup_by_key(|(hash, _)| *hash);

        Ok(StateUpdate {
            root,
            committed: committed.into_iter().map(|(_, rlp)| rlp.into()).collect(),
        })
    }
}

impl DatabaseRef for WitnessState {
    type Error = ProviderError;

    fn basic_ref(&self, address: Address) -> Result<Option<AccountInfo>, Self::Error> {
        let account = match self.account(keccak256(address)) {
            Ok(account) => account,
            Err(MptError::MissingNode(_)) => {
                return Err(self.record_missing(MissingAccess::Account(address)))
            }
            Err(err) => return Err(ProviderError::Database(DatabaseError::Other(err.to_string()))),
        };

        Ok(account.map(|account| {
            let code = if account.code_hash != KECCAK_EMPTY {
                self.used_codes.lock().insert(account.code_hash);
                self.codes.get(&account.code_hash).cloned()
            } else {
                None
            };
            AccountInfo {
                balance: account.balance,
                nonce: account.nonce,
                code_hash: account.code_hash,
                code,
            }
        }))
    }

    fn code_by_hash_ref(&self, code_hash: B256) -> Result<Bytecode, Self::Error> {
        if code_hash == KECCAK_EMPTY {
            return Ok(Bytecode::default());
        }
        self.used_codes.lock().insert(code_hash);
        self.codes
            .get(&code_hash)
            .cloned()
            .ok_or_else(|| self.record_missing(MissingAccess::Code(code_hash)))
    }

    fn storage_ref(&self, address: Address, index: U256) -> Result<U256, Self::Error> {
        let slot = B256::from(index);
        let account = match self.account(keccak256(address)) {
            Ok(Some(account)) => account,
            // A proven-absent account has all-zero storage.
            Ok(None) => return Ok(U256::ZERO),
            Err(MptError::MissingNode(_)) => {
                return Err(self.record_missing(MissingAccess::Account(address)))
            }
            Err(err) => return Err(ProviderError::Database(DatabaseError::Other(err.to_string()))),
        };

        if account.storage_root == EMPTY_ROOT_HASH {
            return Ok(U256::ZERO);
        }

        let storage = PartialTrie::from_root(account.storage_root);
        match storage.get(keccak256(slot), &self.bag) {
            Ok(Some(encoded)) => alloy_rlp::decode_exact::<U256>(&encoded).map_err(|err| {
                ProviderError::Database(DatabaseError::Other(format!(
                    "storage leaf payload: {err}"
                )))
            }),
            Ok(None) => Ok(U256::ZERO),
            Err(MptError::MissingNode(_)) => {
                Err(self.record_missing(MissingAccess::Slot(address, slot)))
            }
            Err(err) => Err(ProviderError::Database(DatabaseError::Other(err.to_string()))),
        }
    }

    fn block_hash_ref(&self, number: u64) -> Result<B256, Self::Error> {
        match self.ancestor_hashes.get(&number) {
            Some(hash) => {
                let mut lowest = self.lowest_ancestor.lock();
                *lowest = Some(lowest.map_or(number, |current| current.min(number)));
                Ok(*hash)
            }
            None => Err(self.record_missing(MissingAccess::Ancestor(number))),
        }
    }
}

/// Validates that `ancestors` is a contiguous, hash-linked chain starting at
/// the block's parent, and returns the `number -> hash` view the EVM reads
/// via `BLOCKHASH`.
pub fn validate_ancestors(
    header: &Header,
    ancestors: &[Header],
) -> Result<HashMap<u64, B256>, StageError> {
    let mut hashes = HashMap::with_capacity(ancestors.len());
    let mut expected_hash = header.parent_hash;
    let mut expected_number = header.number.checked_sub(1);

    for ancestor in ancestors {
        let number = ancestor.number;
        if expected_number != Some(number) {
            return Err(StageError::ProofInvalid(format!(
                "ancestor chain is not contiguous at block {number}"
            )));
        }
        let hash = ancestor.hash_slow();
        if hash != expected_hash {
            return Err(StageError::ProofInvalid(format!(
                "ancestor {number} hashes to {hash}, expected {expected_hash}"
            )));
        }
        hashes.insert(number, hash);
        expected_hash = ancestor.parent_hash;
        expected_number = number.checked_sub(1);
    }

    Ok(hashes)
}

/// Builds the `code hash -> bytecode` map, rejecting entries whose declared
/// hash does not match their bytes.
pub fn build_code_map(codes: &[Bytes]) -> Result<HashMap<B256, Bytecode>, StageError> {
    let mut map = HashMap::with_capacity(codes.len());
    for code in codes {
        let hash = keccak256(code);
        if let Some(previous) = map.insert(hash, Bytecode::new_raw(code.clone())) {
            if previous.original_bytes() != *code {
                return Err(StageError::Internal(format!(
                    "two different bytecodes claim hash {hash}"
                )));
            }
        }
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sealed_chain(len: u64) -> (Header, Vec<Header>) {
        // Build parent-linked headers from the lowest number up.
        let mut headers: Vec<Header> = Vec::new();
        let mut parent_hash = B256::ZERO;
        for number in 0..=len {
            let header = Header {
                number,
                parent_hash,
                gas_limit: 30_000_000,
                ..Default::default()
            };
            parent_hash = header.hash_slow();
            headers.push(header);
        }
        let head = headers.pop().expect("nonempty");
        headers.reverse();
        (head, headers)
    }

    #[test]
    fn valid_ancestor_chain_passes() {
        let (head, ancestors) = sealed_chain(5);
        let hashes = validate_ancestors(&head, &ancestors).unwrap();
        assert_eq!(hashes.len(), 5);
        assert_eq!(hashes[&4], head.parent_hash);
    }

    #[test]
    fn tampered_ancestor_fails() {
        let (head, mut ancestors) = sealed_chain(5);
        ancestors[2].parent_hash = B256::repeat_byte(0xde);
        let err = validate_ancestors(&head, &ancestors).unwrap_err();
        assert!(matches!(err, StageError::ProofInvalid(_)));
    }

    #[test]
    fn gapped_ancestor_chain_fails() {
        let (head, mut ancestors) = sealed_chain(5);
        ancestors.remove(1);
        let err = validate_ancestors(&head, &ancestors).unwrap_err();
        assert!(matches!(err, StageError::ProofInvalid(_)));
    }

    #[test]
    fn block_hash_outside_range_is_missing_ancestor() {
        let (head, ancestors) = sealed_chain(3);
        let hashes = validate_ancestors(&head, &ancestors).unwrap();
        let state = WitnessState::new(NodeBag::default(), EMPTY_ROOT_HASH, HashMap::new(), hashes);

        assert!(state.block_hash_ref(2).is_ok());
        assert!(state.block_hash_ref(10).is_err());
        assert_eq!(state.take_missing(), Some(MissingAccess::Ancestor(10)));
        assert_eq!(state.lowest_ancestor_used(), Some(2));
    }

    #[test]
    fn absent_account_reads_as_empty() {
        // Empty pre-state: every account is proven absent.
        let state =
            WitnessState::new(NodeBag::default(), EMPTY_ROOT_HASH, HashMap::new(), HashMap::new());
        let address = Address::repeat_byte(0x42);
        assert_eq!(state.basic_ref(address).unwrap(), None);
        assert_eq!(state.storage_ref(address, U256::from(1)).unwrap(), U256::ZERO);
        assert!(state.take_missing().is_none());
    }

    #[test]
    fn unresolvable_root_is_missing_witness() {
        // Non-empty root with an empty bag: nothing can be proven.
        let state = WitnessState::new(
            NodeBag::default(),
            B256::repeat_byte(0x01),
            HashMap::new(),
            HashMap::new(),
        );
        let address = Address::repeat_byte(0x42);
        assert!(state.basic_ref(address).is_err());
        assert_eq!(state.take_missing(), Some(MissingAccess::Account(address)));
    }

    #[test]
    fn duplicate_code_bytes_are_tolerated_once() {
        let code = Bytes::from_static(b"\x60\x00");
        let map = build_code_map(&[code.clone(), code.clone()]).unwrap();
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn missing_code_is_recorded() {
        let state =
            WitnessState::new(NodeBag::default(), EMPTY_ROOT_HASH, HashMap::new(), HashMap::new());
        let hash = keccak256(b"unknown code");
        assert!(state.code_by_hash_ref(hash).is_err());
        assert_eq!(state.take_missing(), Some(MissingAccess::Code(hash)));
    }

    #[test]
    fn commit_over_empty_prestate_builds_accounts() {
        use reth_trie::HashedPostState;

        let state =
            WitnessState::new(NodeBag::default(), EMPTY_ROOT_HASH, HashMap::new(), HashMap::new());

        let mut post = HashedPostState::default();
        let hashed_address = keccak256(Address::repeat_byte(0x01));
        post.accounts.insert(
            hashed_address,
            Some(reth_primitives::Account {
                nonce: 1,
                balance: U256::from(1000),
                bytecode_hash: None,
            }),
        );

        let update = state.commit(&post).unwrap();
        assert_ne!(update.root, EMPTY_ROOT_HASH);
        assert!(!update.committed.is_empty());

        // Committing the removal brings the trie back to empty. The nodes
        // committed above are needed to resolve the removal.
        let mut bag = NodeBag::default();
        for node in &update.committed {
            bag.insert_node(node.to_vec());
        }
        let state = WitnessState::new(bag, update.root, HashMap::new(), HashMap::new());
        let mut post = HashedPostState::default();
        post.accounts.insert(hashed_address, None);
        let update = state.commit(&post).unwrap();
        assert_eq!(update.root, EMPTY_ROOT_HASH);
    }
}
