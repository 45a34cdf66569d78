//! Relay policy: pool limits and transaction standardness.

use bitcoin::blockdata::script::Instruction;
use bitcoin::{ScriptBuf, Transaction, TxOut};
use chain::ValidationError;
use storage::CoinView;

/// Rolling minimum fee-rate halflife in seconds.
pub const FEE_HALFLIFE: u64 = 60 * 60 * 12;

/// Entries older than this are the first eviction victims.
pub const MEMPOOL_EXPIRY: u64 = 72 * 60 * 60;

/// Weight cap for standard transactions.
pub const MAX_STANDARD_TX_WEIGHT: u64 = 400_000;

const MAX_SCRIPTSIG_SIZE: usize = 1650;
const MAX_OP_RETURN_SIZE: usize = 83;
const MAX_P2SH_SIGOPS: usize = 15;

#[derive(Debug, Clone)]
pub struct MempoolOptions {
    /// Memory-usage bound in bytes.
    pub max_size: usize,
    pub max_orphans: usize,
    /// Age past which entries are expired, seconds.
    pub expiry_time: u64,
    /// Minimum relay fee rate, satoshis per kvB.
    pub min_relay_fee: u64,
    /// Let high-priority transactions in below the relay fee.
    pub relay_priority: bool,
    /// Rate-limit free transactions.
    pub limit_free: bool,
    /// Free relay allowance, kB per ten-minute decay window.
    pub limit_free_relay: u64,
    pub require_standard: bool,
    pub reject_absurd_fees: bool,
    /// Accept witness transactions before segwit activates.
    pub premature_witness: bool,
    /// Maximum in-pool ancestor chain length.
    pub ancestor_limit: usize,
    pub max_tx_sigops_cost: usize,
    /// Maintain the in-memory address index.
    pub index_address: bool,
}

impl Default for MempoolOptions {
    fn default() -> Self {
        Self {
            max_size: 100_000_000,
            max_orphans: 100,
            expiry_time: MEMPOOL_EXPIRY,
            min_relay_fee: 1000,
            relay_priority: true,
            limit_free: true,
            limit_free_relay: 15,
            require_standard: true,
            reject_absurd_fees: true,
            premature_witness: false,
            ancestor_limit: 25,
            max_tx_sigops_cost: 16_000,
            index_address: false,
        }
    }
}

/// Fee required for `size` virtual bytes at `rate` sat/kvB.
pub fn get_min_fee(size: usize, rate: u64) -> u64 {
    rate.saturating_mul(size as u64) / 1000
}

/// Output template whitelist plus dust and data-carrier limits.
pub fn check_standard(tx: &Transaction) -> Result<(), ValidationError> {
    let version = tx.version.0;
    if !(1..=2).contains(&version) {
        return Err(ValidationError::nonstandard("version"));
    }

    if tx.weight().to_wu() > MAX_STANDARD_TX_WEIGHT {
        return Err(ValidationError::nonstandard("tx-size"));
    }

    for input in &tx.input {
        if input.script_sig.len() > MAX_SCRIPTSIG_SIZE {
            return Err(ValidationError::nonstandard("scriptsig-size"));
        }
        if !input.script_sig.is_push_only() {
            return Err(ValidationError::nonstandard("scriptsig-not-pushonly"));
        }
    }

    let mut op_returns = 0usize;
    for output in &tx.output {
        let script = &output.script_pubkey;
        if script.is_op_return() {
            op_returns += 1;
            if script.len() > MAX_OP_RETURN_SIZE {
                return Err(ValidationError::nonstandard("data-carrier-size"));
            }
            continue;
        }

        if !is_standard_script(script) {
            return Err(ValidationError::nonstandard("scriptpubkey"));
        }

        if is_dust(output) {
            return Err(ValidationError::nonstandard("dust"));
        }
    }
    if op_returns > 1 {
        return Err(ValidationError::nonstandard("multi-op-return"));
    }

    Ok(())
}

fn is_standard_script(script: &bitcoin::Script) -> bool {
    script.is_p2pk()
        || script.is_p2pkh()
        || script.is_p2sh()
        || script.is_p2wpkh()
        || script.is_p2wsh()
        || script.is_p2tr()
}

fn is_dust(output: &TxOut) -> bool {
    output.value < TxOut::minimal_non_dust(output.script_pubkey.clone()).value
}

/// Input-side standardness: every spent output must be a recognized
/// template, and P2SH redeems stay under the sigop cap.
pub fn has_standard_inputs(tx: &Transaction, view: &CoinView) -> bool {
    for input in &tx.input {
        let Ok(Some(coin)) = view.get(&input.previous_output) else {
            return false;
        };
        let script = &coin.output.script_pubkey;

        if script.is_p2sh() {
            let Some(redeem) = last_push(&input.script_sig) else {
                return false;
            };
            if redeem.count_sigops() > MAX_P2SH_SIGOPS {
                return false;
            }
            continue;
        }

        if !is_standard_script(script) {
            return false;
        }
    }
    true
}

/// Final data push of a scriptSig (the P2SH redeem script).
fn last_push(script_sig: &bitcoin::Script) -> Option<ScriptBuf> {
    let mut last: Option<Vec<u8>> = None;
    for instruction in script_sig.instructions() {
        match instruction {
            Ok(Instruction::PushBytes(bytes)) => last = Some(bytes.as_bytes().to_vec()),
            _ => return None,
        }
    }
    last.map(ScriptBuf::from_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::{
        absolute, transaction, Amount, OutPoint, ScriptBuf, Sequence, TxIn, Txid, Witness,
    };

    fn base_tx() -> Transaction {
        Transaction {
            version: transaction::Version::ONE,
            lock_time: absolute::LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint {
                    txid: Txid::from_byte_array([1u8; 32]),
                    vout: 0,
                },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(50_000),
                script_pubkey: p2pkh(0xab),
            }],
        }
    }

    fn p2pkh(fill: u8) -> ScriptBuf {
        let mut bytes = vec![0x76, 0xa9, 0x14];
        bytes.extend_from_slice(&[fill; 20]);
        bytes.extend_from_slice(&[0x88, 0xac]);
        ScriptBuf::from_bytes(bytes)
    }

    #[test]
    fn plain_tx_is_standard() {
        assert!(check_standard(&base_tx()).is_ok());
    }

    #[test]
    fn weird_version_is_nonstandard() {
        let mut tx = base_tx();
        tx.version = transaction::Version(3);
        assert_eq!(check_standard(&tx).unwrap_err().code, "version");
    }

    #[test]
    fn oversized_op_return_rejected() {
        let mut tx = base_tx();
        let mut data = vec![0x6a, 0x4c, 90];
        data.extend_from_slice(&[0u8; 90]);
        tx.output.push(TxOut {
            value: Amount::ZERO,
            script_pubkey: ScriptBuf::from_bytes(data),
        });
        assert_eq!(check_standard(&tx).unwrap_err().code, "data-carrier-size");
    }

    #[test]
    fn two_op_returns_rejected() {
        let mut tx = base_tx();
        for _ in 0..2 {
            tx.output.push(TxOut {
                value: Amount::ZERO,
                script_pubkey: ScriptBuf::from_bytes(vec![0x6a]),
            });
        }
        assert_eq!(check_standard(&tx).unwrap_err().code, "multi-op-return");
    }

    #[test]
    fn non_push_scriptsig_rejected() {
        let mut tx = base_tx();
        // OP_DUP is not a push.
        tx.input[0].script_sig = ScriptBuf::from_bytes(vec![0x76]);
        assert_eq!(
            check_standard(&tx).unwrap_err().code,
            "scriptsig-not-pushonly"
        );
    }

    #[test]
    fn min_fee_scales_with_size() {
        assert_eq!(get_min_fee(250, 1000), 250);
        assert_eq!(get_min_fee(1000, 1000), 1000);
        assert_eq!(get_min_fee(0, 1000), 0);
    }
}
