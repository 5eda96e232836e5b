//! Generation, persistence and verification of prover inputs for
//! EVM-compatible blocks.
//!
//! Given a block number and an archive node, the pipeline produces a
//! self-contained artifact from which an offline prover (or any EVM
//! executor) can re-execute exactly that block and validate the resulting
//! post-state root, with no further network access:
//!
//! 1. **Preflight** executes the block against remote-backed state while
//!    recording every access, then persists the raw proofs and bytecodes as
//!    a heavy intermediate artifact.
//! 2. **Prepare** re-executes against in-memory state seeded only from the
//!    recorded proofs and distills the minimal Merkle-Patricia witness.
//! 3. **Execute** re-executes against the witness alone, verifying the
//!    post-state root, receipts root, gas and logs bloom.
//!
//! Each stage is independently runnable; artifacts flow through the store
//! layer so the expensive archive-RPC work is paid once.

pub mod chain;
pub mod cli;
pub mod evm;
pub mod generator;
pub mod include;
pub mod input;
pub mod proto;
pub mod rpc;
pub mod stages;
pub mod stores;
pub mod telemetry;

/// The build identifier reported by the `version` subcommand.
pub fn version() -> String {
    format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}
