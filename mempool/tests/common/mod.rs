#![allow(dead_code)]

use bitcoin::blockdata::opcodes;
use bitcoin::blockdata::script::Builder;
use bitcoin::hashes::Hash;
use bitcoin::{
    absolute, block, transaction, Amount, Block, CompactTarget, OutPoint, ScriptBuf, Sequence,
    Transaction, TxIn, TxMerkleNode, TxOut, Witness,
};
use std::sync::Arc;

use chain::{Chain, ChainConfig, ChainEntry, NetworkParams};
use storage::MemoryBackend;

/// OP_TRUE output, spendable with an empty scriptSig.
pub fn anyone_can_spend() -> ScriptBuf {
    Builder::new()
        .push_opcode(opcodes::all::OP_PUSHNUM_1)
        .into_script()
}

/// Coinbase paying the full subsidy to an anyone-can-spend output. `salt`
/// varies the scriptSig so parallel branches get distinct transactions.
pub fn coinbase(height: u32, value: u64, salt: i64) -> Transaction {
    Transaction {
        version: transaction::Version::ONE,
        lock_time: absolute::LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: Builder::new()
                .push_int(height as i64)
                .push_int(salt)
                .into_script(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(value),
            script_pubkey: anyone_can_spend(),
        }],
    }
}

/// Spend of an anyone-can-spend outpoint.
pub fn spend(prevout: OutPoint, value: u64) -> Transaction {
    Transaction {
        version: transaction::Version::ONE,
        lock_time: absolute::LockTime::ZERO,
        input: vec![TxIn {
            previous_output: prevout,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(value),
            script_pubkey: anyone_can_spend(),
        }],
    }
}

/// Mine one regtest block on top of `prev` containing `txs` after the
/// coinbase.
pub fn mine_block(
    prev: &ChainEntry,
    txs: Vec<Transaction>,
    params: &NetworkParams,
    salt: i64,
) -> Block {
    let height = prev.height + 1;
    let subsidy = params.get_block_subsidy(height);

    let mut txdata = vec![coinbase(height, subsidy, salt)];
    txdata.extend(txs);

    let header = block::Header {
        version: block::Version::from_consensus(4),
        prev_blockhash: prev.hash,
        merkle_root: TxMerkleNode::all_zeros(),
        time: prev.time + 10,
        bits: CompactTarget::from_consensus(prev.bits),
        nonce: 0,
    };

    let mut block = Block { header, txdata };
    block.header.merkle_root = block
        .compute_merkle_root()
        .expect("block has transactions");
    while block
        .header
        .validate_pow(block.header.target())
        .is_err()
    {
        block.header.nonce += 1;
    }
    block
}

/// A branch of empty blocks starting on `start`, built offline.
pub fn mine_branch(
    start: &ChainEntry,
    count: usize,
    params: &NetworkParams,
    salt: i64,
) -> Vec<Block> {
    let mut blocks = Vec::with_capacity(count);
    let mut prev = start.clone();
    for _ in 0..count {
        let block = mine_block(&prev, Vec::new(), params, salt);
        prev = ChainEntry::from_block_header(&block.header, Some(&prev));
        blocks.push(block);
    }
    blocks
}

/// Regtest chain over an in-memory backend, coinbase maturity zeroed so
/// tests can spend coinbases immediately.
pub async fn regtest_chain() -> (Arc<MemoryBackend>, Chain) {
    regtest_chain_with(ChainConfig::default()).await
}

pub async fn regtest_chain_with(config: ChainConfig) -> (Arc<MemoryBackend>, Chain) {
    let mut params = NetworkParams::regtest();
    params.coinbase_maturity = 0;

    let backend = Arc::new(MemoryBackend::new());
    let chain = Chain::open(backend.clone(), params, config)
        .await
        .expect("open chain");
    (backend, chain)
}

/// All `(key, value)` records under a one-byte key prefix.
pub fn snapshot(backend: &MemoryBackend, prefix: u8) -> Vec<(Vec<u8>, Vec<u8>)> {
    use storage::Backend;
    backend.scan_prefix(&[prefix]).expect("scan backend")
}
