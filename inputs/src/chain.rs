//! Chain configuration resolution.
//!
//! The artifacts embed a geth-style [`ChainConfig`] so any consumer can
//! derive hardfork activations without a chain registry. For execution the
//! config is mapped onto a [`ChainSpec`]: well-known chains use the
//! battle-tested presets, everything else is built from the config itself.

use std::sync::Arc;

use alloy_genesis::{ChainConfig, Genesis};
use alloy_primitives::{uint, U256};
use reth_chainspec::{ChainSpec, HOLESKY, MAINNET, SEPOLIA};

use crate::stages::StageError;

/// Ethereum mainnet terminal total difficulty.
const MAINNET_TTD: U256 = uint!(58_750_000_000_000_000_000_000_U256);

/// The geth-style chain configuration for a supported chain id.
pub fn config_for(chain_id: u64) -> Result<ChainConfig, StageError> {
    match chain_id {
        1 => Ok(mainnet_config()),
        11155111 => Ok(sepolia_config()),
        17000 => Ok(holesky_config()),
        other => Err(StageError::InvalidInput(format!(
            "unsupported chain id {other}; known chains: 1, 11155111, 17000"
        ))),
    }
}

/// Maps a chain configuration onto an executable [`ChainSpec`].
pub fn spec_from_config(config: &ChainConfig) -> Result<Arc<ChainSpec>, StageError> {
    match config.chain_id {
        1 => Ok(MAINNET.clone()),
        11155111 => Ok(SEPOLIA.clone()),
        17000 => Ok(HOLESKY.clone()),
        _ => {
            let genesis = Genesis {
                config: config.clone(),
                ..Default::default()
            };
            Ok(Arc::new(ChainSpec::from(genesis)))
        }
    }
}

fn mainnet_config() -> ChainConfig {
    ChainConfig {
        chain_id: 1,
        homestead_block: Some(1_150_000),
        dao_fork_block: Some(1_920_000),
        dao_fork_support: true,
        eip150_block: Some(2_463_000),
        eip155_block: Some(2_675_000),
        eip158_block: Some(2_675_000),
        byzantium_block: Some(4_370_000),
        constantinople_block: Some(7_280_000),
        petersburg_block: Some(7_280_000),
        istanbul_block: Some(9_069_000),
        muir_glacier_block: Some(9_200_000),
        berlin_block: Some(12_244_000),
        london_block: Some(12_965_000),
        arrow_glacier_block: Some(13_773_000),
        gray_glacier_block: Some(15_050_000),
        shanghai_time: Some(1_681_338_455),
        cancun_time: Some(1_710_338_135),
        prague_time: Some(1_746_612_311),
        terminal_total_difficulty: Some(MAINNET_TTD),
        terminal_total_difficulty_passed: true,
        ..Default::default()
    }
}

fn sepolia_config() -> ChainConfig {
    ChainConfig {
        chain_id: 11155111,
        homestead_block: Some(0),
        eip150_block: Some(0),
        eip155_block: Some(0),
        eip158_block: Some(0),
        byzantium_block: Some(0),
        constantinople_block: Some(0),
        petersburg_block: Some(0),
        istanbul_block: Some(0),
        berlin_block: Some(0),
        london_block: Some(0),
        merge_netsplit_block: Some(1_735_371),
        shanghai_time: Some(1_677_557_088),
        cancun_time: Some(1_706_655_072),
        prague_time: Some(1_741_159_776),
        terminal_total_difficulty: Some(U256::from(17_000_000_000_000_000u64)),
        terminal_total_difficulty_passed: true,
        ..Default::default()
    }
}

fn holesky_config() -> ChainConfig {
    ChainConfig {
        chain_id: 17000,
        homestead_block: Some(0),
        eip150_block: Some(0),
        eip155_block: Some(0),
        eip158_block: Some(0),
        byzantium_block: Some(0),
        constantinople_block: Some(0),
        petersburg_block: Some(0),
        istanbul_block: Some(0),
        berlin_block: Some(0),
        london_block: Some(0),
        shanghai_time: Some(1_696_000_704),
        cancun_time: Some(1_707_305_664),
        prague_time: Some(1_740_434_112),
        terminal_total_difficulty: Some(U256::ZERO),
        terminal_total_difficulty_passed: true,
        ..Default::default()
    }
}

/// The total difficulty handed to the executor.
///
/// Post-merge headers carry zero difficulty, but hardfork selection against
/// a TTD condition needs a value past the terminal threshold; the chain's
/// final difficulty is the canonical choice. Pre-merge, the header's own
/// difficulty keeps TTD conditions inactive, and block-number conditions
/// decide.
pub fn total_difficulty_for(spec: &ChainSpec, header_difficulty: U256) -> U256 {
    if header_difficulty.is_zero() {
        spec.paris_block_and_final_difficulty
            .map(|(_, difficulty)| difficulty)
            .unwrap_or(U256::ZERO)
    } else {
        header_difficulty
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_chains_resolve() {
        assert_eq!(config_for(1).unwrap().chain_id, 1);
        assert_eq!(config_for(11155111).unwrap().chain_id, 11155111);
        assert_eq!(config_for(17000).unwrap().chain_id, 17000);
        assert!(matches!(
            config_for(1337).unwrap_err(),
            StageError::InvalidInput(_)
        ));
    }

    #[test]
    fn mainnet_spec_uses_preset() {
        let spec = spec_from_config(&mainnet_config()).unwrap();
        assert_eq!(spec.chain.id(), 1);
    }

    #[test]
    fn custom_chain_builds_from_config() {
        let config = ChainConfig {
            chain_id: 1337,
            london_block: Some(0),
            ..Default::default()
        };
        let spec = spec_from_config(&config).unwrap();
        assert_eq!(spec.chain.id(), 1337);
    }

    #[test]
    fn post_merge_total_difficulty_crosses_ttd() {
        let spec = spec_from_config(&mainnet_config()).unwrap();
        let td = total_difficulty_for(&spec, U256::ZERO);
        assert!(td >= MAINNET_TTD);

        let pre_merge = U256::from(7_000_000_000_000u64);
        assert_eq!(total_difficulty_for(&spec, pre_merge), pre_merge);
    }
}
