use std::collections::{BTreeMap, BTreeSet};

use alloy_primitives::{Address, B256, U256};
use parking_lot::Mutex;
use revm::db::DatabaseRef;
use revm::primitives::{AccountInfo, Bytecode, KECCAK_EMPTY};

/// Everything the EVM observed through a [`TrackingDb`] during one stage.
///
/// Destructed and created accounts are not in here: those are derived from
/// the post-execution bundle diff, which sees writes rather than reads.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AccessRecord {
    /// Touched accounts, each with the raw storage slot keys read from it.
    pub accounts: BTreeMap<Address, BTreeSet<B256>>,
    /// Code hashes observed on touched accounts.
    pub code_hashes: BTreeSet<B256>,
    /// Block numbers whose hash was requested via `BLOCKHASH`.
    pub block_hashes: BTreeSet<u64>,
}

/// A state decorator recording every delegated read.
///
/// The tracker is append-only while a stage runs; [`TrackingDb::into_record`]
/// freezes it into an immutable access set at stage exit.
pub struct TrackingDb<D> {
    inner: D,
    record: Mutex<AccessRecord>,
}

impl<D> TrackingDb<D> {
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            record: Mutex::new(AccessRecord::default()),
        }
    }

    pub fn into_record(self) -> AccessRecord {
        self.record.into_inner()
    }
}

impl<D: DatabaseRef> DatabaseRef for TrackingDb<D> {
    type Error = D::Error;

    fn basic_ref(&self, address: Address) -> Result<Option<AccountInfo>, Self::Error> {
        let info = self.inner.basic_ref(address)?;
        let mut record = self.record.lock();
        record.accounts.entry(address).or_default();
        if let Some(info) = &info {
            if info.code_hash != KECCAK_EMPTY {
                record.code_hashes.insert(info.code_hash);
            }
        }
        Ok(info)
    }

    fn code_by_hash_ref(&self, code_hash: B256) -> Result<Bytecode, Self::Error> {
        if code_hash != KECCAK_EMPTY {
            self.record.lock().code_hashes.insert(code_hash);
        }
        self.inner.code_by_hash_ref(code_hash)
    }

    fn storage_ref(&self, address: Address, index: U256) -> Result<U256, Self::Error> {
        let value = self.inner.storage_ref(address, index)?;
        self.record
            .lock()
            .accounts
            .entry(address)
            .or_default()
            .insert(B256::from(index));
        Ok(value)
    }

    fn block_hash_ref(&self, number: u64) -> Result<B256, Self::Error> {
        let hash = self.inner.block_hash_ref(number)?;
        self.record.lock().block_hashes.insert(number);
        Ok(hash)
    }
}
