use bitcoin::consensus::encode::{deserialize_partial, serialize};
use bitcoin::{Transaction, Txid};
use chain::ChainError;
use storage::{CoinView, StorageError};

/// Priority above which a transaction may enter for free: one coin-day of
/// age per 250 bytes.
pub const FREE_THRESHOLD: f64 = 100_000_000.0 * 144.0 / 250.0;

/// One admitted transaction with the metadata admission and eviction work
/// from. Descendant aggregates are maintained by the pool as spenders come
/// and go.
#[derive(Debug, Clone)]
pub struct MempoolEntry {
    pub tx: Transaction,
    pub hash: Txid,
    /// Chain height when the entry was admitted.
    pub height: u32,
    /// Virtual size in bytes.
    pub size: usize,
    /// Priority at the entry height.
    pub priority: f64,
    /// Fee in satoshis.
    pub fee: u64,
    /// Receive time, unix seconds.
    pub ts: u64,
    /// Total resolved input value in satoshis.
    pub value: u64,
    /// Spends at least one in-pool (unconfirmed) output.
    pub dependencies: bool,
    /// In-pool descendants, this entry excluded.
    pub desc_count: usize,
    pub desc_size: usize,
    pub desc_fees: u64,
}

impl MempoolEntry {
    /// Build an entry from a transaction whose inputs all resolve against
    /// `view`. A deficit (outputs above inputs) leaves the fee at zero;
    /// input checking rejects such transactions during verification.
    pub fn from_tx(
        tx: Transaction,
        view: &CoinView,
        height: u32,
        ts: u64,
    ) -> Result<Self, ChainError> {
        let hash = tx.compute_txid();
        let size = tx.vsize();

        let mut value = 0u64;
        let mut priority = 0f64;
        let mut dependencies = false;

        for input in &tx.input {
            if let Some(coin) = view.get(&input.previous_output)? {
                let sat = coin.value().to_sat();
                value = value.saturating_add(sat);
                if coin.is_confirmed() {
                    let age = height.saturating_sub(coin.height);
                    priority += sat as f64 * age as f64;
                } else {
                    dependencies = true;
                }
            }
        }
        priority /= size.max(1) as f64;

        let output_value: u64 = tx.output.iter().map(|o| o.value.to_sat()).sum();
        let fee = value.saturating_sub(output_value);

        Ok(Self {
            tx,
            hash,
            height,
            size,
            priority,
            fee,
            ts,
            value,
            dependencies,
            desc_count: 0,
            desc_size: 0,
            desc_fees: 0,
        })
    }

    /// Fee rate in satoshis per kilo-vbyte.
    pub fn fee_rate(&self) -> u64 {
        if self.size == 0 {
            return 0;
        }
        self.fee.saturating_mul(1000) / self.size as u64
    }

    /// Priority recomputed at a later height: confirmed input value keeps
    /// aging while the entry sits in the pool.
    pub fn priority_at(&self, height: u32) -> f64 {
        let delta = height.saturating_sub(self.height);
        self.priority + (self.value as f64 * delta as f64) / self.size.max(1) as f64
    }

    pub fn is_free(&self, height: u32) -> bool {
        self.priority_at(height) > FREE_THRESHOLD
    }

    /// Rough in-memory footprint used for the pool size bound.
    pub fn mem_usage(&self) -> usize {
        self.tx.total_size() + 160
    }

    /// Serialize for pool persistence across restarts. Descendant
    /// aggregates are rebuilt on load, not stored.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = serialize(&self.tx);
        buf.extend_from_slice(&self.height.to_le_bytes());
        buf.extend_from_slice(&(self.size as u64).to_le_bytes());
        buf.extend_from_slice(&self.priority.to_bits().to_le_bytes());
        buf.extend_from_slice(&self.fee.to_le_bytes());
        buf.extend_from_slice(&self.ts.to_le_bytes());
        buf.extend_from_slice(&self.value.to_le_bytes());
        buf.push(u8::from(self.dependencies));
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, ChainError> {
        let (tx, mut off) = deserialize_partial::<Transaction>(data)
            .map_err(|e| StorageError::corrupt(format!("bad entry transaction: {e}")))?;

        let height = u32::from_le_bytes(
            take(data, &mut off, 4)?.try_into().expect("slice length checked"),
        );
        let size = u64::from_le_bytes(
            take(data, &mut off, 8)?.try_into().expect("slice length checked"),
        ) as usize;
        let priority = f64::from_bits(u64::from_le_bytes(
            take(data, &mut off, 8)?.try_into().expect("slice length checked"),
        ));
        let fee = u64::from_le_bytes(
            take(data, &mut off, 8)?.try_into().expect("slice length checked"),
        );
        let ts = u64::from_le_bytes(
            take(data, &mut off, 8)?.try_into().expect("slice length checked"),
        );
        let value = u64::from_le_bytes(
            take(data, &mut off, 8)?.try_into().expect("slice length checked"),
        );
        let dependencies = take(data, &mut off, 1)?[0] != 0;

        let hash = tx.compute_txid();
        Ok(Self {
            tx,
            hash,
            height,
            size,
            priority,
            fee,
            ts,
            value,
            dependencies,
            desc_count: 0,
            desc_size: 0,
            desc_fees: 0,
        })
    }
}

fn take<'a>(data: &'a [u8], off: &mut usize, n: usize) -> Result<&'a [u8], StorageError> {
    let slice = data
        .get(*off..*off + n)
        .ok_or_else(|| StorageError::corrupt("truncated mempool entry"))?;
    *off += n;
    Ok(slice)
}
