//! Context-free transaction checks and lock-time evaluation shared by the
//! chain and the mempool.

use bitcoin::Transaction;
use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};
use storage::CoinView;

use crate::db::ChainDB;
use crate::entry::ChainEntry;
use crate::error::{ChainError, ValidationError};
use crate::params::{LOCKTIME_THRESHOLD, MAX_MONEY};

/// BIP68 sequence field layout.
pub const SEQUENCE_DISABLE_FLAG: u32 = 1 << 31;
pub const SEQUENCE_TYPE_FLAG: u32 = 1 << 22;
pub const SEQUENCE_MASK: u32 = 0x0000_ffff;
/// Time-based locks count in units of `2^9` (512) seconds.
pub const SEQUENCE_GRANULARITY: u32 = 9;

/// Current unix time in seconds.
pub fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Structural sanity: everything that can be checked without context.
pub fn check_tx_sanity(tx: &Transaction) -> Result<(), ValidationError> {
    if tx.input.is_empty() {
        return Err(ValidationError::invalid("bad-txns-vin-empty", 100));
    }
    if tx.output.is_empty() {
        return Err(ValidationError::invalid("bad-txns-vout-empty", 100));
    }
    if tx.weight().to_wu() > 4_000_000 {
        return Err(ValidationError::invalid("bad-txns-oversize", 100));
    }

    let mut total = 0u64;
    for output in &tx.output {
        let value = output.value.to_sat();
        if value > MAX_MONEY {
            return Err(ValidationError::invalid("bad-txns-vout-toolarge", 100));
        }
        total = total.saturating_add(value);
        if total > MAX_MONEY {
            return Err(ValidationError::invalid("bad-txns-txouttotal-toolarge", 100));
        }
    }

    let mut seen = HashSet::with_capacity(tx.input.len());
    for input in &tx.input {
        if !seen.insert(input.previous_output) {
            return Err(ValidationError::invalid("bad-txns-inputs-duplicate", 100));
        }
    }

    if tx.is_coinbase() {
        let len = tx.input[0].script_sig.len();
        if !(2..=100).contains(&len) {
            return Err(ValidationError::invalid("bad-cb-length", 100));
        }
    } else {
        for input in &tx.input {
            if input.previous_output.is_null() {
                return Err(ValidationError::invalid("bad-txns-prevout-null", 10));
            }
        }
    }

    Ok(())
}

/// Absolute lock-time finality at the given height and time cutoff.
pub fn is_final(tx: &Transaction, height: u32, time: u32) -> bool {
    let locktime = tx.lock_time.to_consensus_u32();
    if locktime == 0 {
        return true;
    }
    let cutoff = if locktime < LOCKTIME_THRESHOLD {
        height
    } else {
        time
    };
    if locktime < cutoff {
        return true;
    }
    tx.input.iter().all(|input| input.sequence.0 == u32::MAX)
}

/// BIP68 relative lock evaluation for a spend at `height` whose inputs
/// resolve through `view`. `prev` is the entry the spending block builds on
/// (the tip for mempool checks). Unconfirmed parent coins are treated as
/// confirming at `height`.
pub async fn verify_sequence_locks(
    db: &ChainDB,
    prev: &ChainEntry,
    tx: &Transaction,
    view: &CoinView,
    height: u32,
) -> Result<bool, ChainError> {
    if tx.version.0 < 2 {
        return Ok(true);
    }

    let mut min_height: Option<u32> = None;
    let mut min_time: Option<u32> = None;

    for input in &tx.input {
        let sequence = input.sequence.0;
        if sequence & SEQUENCE_DISABLE_FLAG != 0 {
            continue;
        }

        let Some(coin) = view.get(&input.previous_output)? else {
            return Ok(false);
        };
        let coin_height = if coin.is_confirmed() {
            coin.height
        } else {
            height
        };
        let value = sequence & SEQUENCE_MASK;

        if sequence & SEQUENCE_TYPE_FLAG != 0 {
            let mtp_height = coin_height.saturating_sub(1).min(prev.height);
            let ancestor = db.get_ancestor(prev, mtp_height).await?;
            let coin_time = db.median_time_past(&ancestor).await?;
            let lock = coin_time.saturating_add(value << SEQUENCE_GRANULARITY);
            min_time = Some(min_time.map_or(lock, |t| t.max(lock)));
        } else {
            let lock = coin_height.saturating_add(value);
            min_height = Some(min_height.map_or(lock, |h| h.max(lock)));
        }
    }

    if let Some(required) = min_height {
        if height < required {
            return Ok(false);
        }
    }
    if let Some(required) = min_time {
        let mtp = db.median_time_past(prev).await?;
        if mtp < required {
            return Ok(false);
        }
    }

    Ok(true)
}

/// Sum of resolved input values, or the reject reason when inputs are
/// missing, immature or out of range.
pub fn check_inputs(
    tx: &Transaction,
    view: &CoinView,
    height: u32,
    maturity: u32,
) -> Result<u64, ChainError> {
    let mut total_in = 0u64;

    for input in &tx.input {
        let Some(coin) = view.get(&input.previous_output)? else {
            return Err(ValidationError::invalid("bad-txns-inputs-missingorspent", 100).into());
        };

        if !coin.is_mature(height, maturity) {
            return Err(
                ValidationError::invalid("bad-txns-premature-spend-of-coinbase", 100).into(),
            );
        }

        let value = coin.value().to_sat();
        if value > MAX_MONEY {
            return Err(ValidationError::invalid("bad-txns-inputvalues-outofrange", 100).into());
        }
        total_in = total_in.saturating_add(value);
        if total_in > MAX_MONEY {
            return Err(ValidationError::invalid("bad-txns-inputvalues-outofrange", 100).into());
        }
    }

    let total_out: u64 = tx.output.iter().map(|o| o.value.to_sat()).sum();
    if total_in < total_out {
        return Err(ValidationError::invalid("bad-txns-in-belowout", 100).into());
    }

    Ok(total_in - total_out)
}
