use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use alloy::providers::Provider;
use alloy::transports::Transport;
use alloy_primitives::{Address, B256, U256};
use parking_lot::Mutex;
use reth_storage_errors::db::DatabaseError;
use reth_storage_errors::provider::ProviderError;
use revm::db::DatabaseRef;
use revm::primitives::{AccountInfo, Bytecode, KECCAK_EMPTY};

use super::ChainClient;

/// A read-only EVM state database backed by live RPC calls, pinned at the
/// pre-state of the block being executed.
///
/// Accounts are materialized from `eth_getProof` (which carries balance,
/// nonce, code hash and storage root in one round-trip) and memoized, so a
/// transaction touching the same account repeatedly costs one request.
/// Bytecodes are kept by hash for `code_by_hash` calls.
pub struct RpcStateDb<P, T> {
    client: Arc<ChainClient<P, T>>,
    /// The pre-state block: target block number minus one.
    block: u64,
    accounts: Mutex<HashMap<Address, AccountInfo>>,
    codes: Mutex<HashMap<B256, Bytecode>>,
}

/// Bridges the executor's synchronous `Database` calls onto the async RPC
/// client. Requires a multi-threaded runtime.
fn block_on<F: Future>(future: F) -> F::Output {
    tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(future))
}

fn remote_error(err: impl std::fmt::Display) -> ProviderError {
    ProviderError::Database(DatabaseError::Other(err.to_string()))
}

impl<P, T> RpcStateDb<P, T>
where
    P: Provider<T>,
    T: Transport + Clone,
{
    /// A state view at the state *after* block `block`, i.e. the pre-state
    /// of block `block + 1`.
    pub fn new(client: Arc<ChainClient<P, T>>, block: u64) -> Self {
        Self {
            client,
            block,
            accounts: Mutex::new(HashMap::new()),
            codes: Mutex::new(HashMap::new()),
        }
    }

    /// The bytecodes fetched so far, keyed by code hash.
    pub fn known_codes(&self) -> HashMap<B256, Bytecode> {
        self.codes.lock().clone()
    }

    fn fetch_account(&self, address: Address) -> Result<AccountInfo, ProviderError> {
        let (proof, code) = block_on(async {
            let proof = self.client.proof(address, vec![], self.block).await?;
            let code = if proof.code_hash == KECCAK_EMPTY {
                None
            } else {
                Some(self.client.code(address, self.block).await?)
            };
            Ok::<_, crate::stages::StageError>((proof, code))
        })
        .map_err(remote_error)?;

        let code = code.map(Bytecode::new_raw);
        if let Some(code) = &code {
            self.codes.lock().insert(proof.code_hash, code.clone());
        }

        Ok(AccountInfo {
            balance: proof.balance,
            nonce: proof.nonce,
            code_hash: proof.code_hash,
            code,
        })
    }
}

impl<P, T> DatabaseRef for RpcStateDb<P, T>
where
    P: Provider<T>,
    T: Transport + Clone,
{
    type Error = ProviderError;

    fn basic_ref(&self, address: Address) -> Result<Option<AccountInfo>, Self::Error> {
        if let Some(info) = self.accounts.lock().get(&address) {
            return Ok(Some(info.clone()));
        }
        let info = self.fetch_account(address)?;
        self.accounts.lock().insert(address, info.clone());
        Ok(Some(info))
    }

    fn code_by_hash_ref(&self, code_hash: B256) -> Result<Bytecode, Self::Error> {
        if code_hash == KECCAK_EMPTY {
            return Ok(Bytecode::default());
        }
        self.codes
            .lock()
            .get(&code_hash)
            .cloned()
            .ok_or_else(|| remote_error(format!("unknown code hash {code_hash}")))
    }

    fn storage_ref(&self, address: Address, index: U256) -> Result<U256, Self::Error> {
        block_on(self.client.storage(address, B256::from(index), self.block))
            .map_err(remote_error)
    }

    fn block_hash_ref(&self, number: u64) -> Result<B256, Self::Error> {
        block_on(self.client.block_hash(number)).map_err(remote_error)
    }
}
