//! Hard-coded genesis blocks.

use kestrel_consensus::{ChainParams, COIN};
use kestrel_primitives::hash::hex_to_bytes;
use kestrel_primitives::{Block, BlockHeader, OutPoint, Transaction, TxIn, TxOut};
use kestrel_script::{push_data, push_int};

use crate::validation::ValidationError;

const GENESIS_HEADLINE: &str =
    "The Times 03/Jan/2009 Chancellor on brink of second bailout for banks";
const GENESIS_PUBKEY_HEX: &str = "04678afdb0fe5548271967f1a67130b7105cd6a828e03909a67962e0ea1f61deb649f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5f";

fn genesis_script_sig(bits: u32) -> Vec<u8> {
    let mut script = Vec::new();
    push_int(&mut script, i64::from(bits));
    push_int(&mut script, 4);
    push_data(&mut script, GENESIS_HEADLINE.as_bytes());
    script
}

fn genesis_script_pubkey() -> Result<Vec<u8>, ValidationError> {
    let pubkey = hex_to_bytes(GENESIS_PUBKEY_HEX)
        .ok_or_else(|| ValidationError::Error("invalid genesis pubkey".to_string()))?;
    let mut script = Vec::with_capacity(pubkey.len() + 2);
    push_data(&mut script, &pubkey);
    script.push(0xac);
    Ok(script)
}

/// Constructs the genesis block for `params` and checks it against the
/// hard-coded hash.
pub fn build_genesis_block(params: &ChainParams) -> Result<Block, ValidationError> {
    let consensus = &params.consensus;

    let tx = Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig: genesis_script_sig(0x1d00_ffff),
            sequence: u32::MAX,
        }],
        vout: vec![TxOut::new(50 * COIN, genesis_script_pubkey()?)],
        lock_time: 0,
    };

    let merkle_root = tx.txid();
    let block = Block {
        header: BlockHeader {
            version: 1,
            prev_block: [0u8; 32],
            merkle_root,
            time: consensus.genesis_time,
            bits: consensus.genesis_bits,
            nonce: consensus.genesis_nonce,
        },
        transactions: vec![tx],
    };

    let hash = block.hash();
    if hash != consensus.hash_genesis_block {
        return Err(ValidationError::Error(format!(
            "genesis hash mismatch for {}",
            params.network.as_str()
        )));
    }
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_consensus::{chain_params, Network};

    #[test]
    fn all_networks_build_their_hard_coded_genesis() {
        for network in [Network::Mainnet, Network::Testnet, Network::Regtest] {
            let params = chain_params(network);
            let block = build_genesis_block(&params).expect("genesis builds");
            assert_eq!(block.hash(), params.consensus.hash_genesis_block);
            assert_eq!(block.merkle_root(), block.header.merkle_root);
            assert!(block.transactions[0].is_coinbase());
        }
    }
}
