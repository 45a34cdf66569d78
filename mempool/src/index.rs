//! Optional in-memory address index over pool contents.

use bitcoin::{OutPoint, Script, Transaction, Txid};
use std::collections::{HashMap, HashSet};

/// Script-keyed lookup of pool transactions and the unspent outputs they
/// create. Maintained only when the pool is configured with
/// `index_address`.
#[derive(Debug, Default)]
pub struct MempoolIndex {
    txs: HashMap<Vec<u8>, HashSet<Txid>>,
    coins: HashMap<Vec<u8>, HashSet<OutPoint>>,
}

impl MempoolIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tx: &Transaction) {
        let txid = tx.compute_txid();
        for (vout, output) in tx.output.iter().enumerate() {
            let key = output.script_pubkey.as_bytes().to_vec();
            self.txs.entry(key.clone()).or_default().insert(txid);
            self.coins.entry(key).or_default().insert(OutPoint {
                txid,
                vout: vout as u32,
            });
        }
    }

    pub fn remove(&mut self, tx: &Transaction) {
        let txid = tx.compute_txid();
        for (vout, output) in tx.output.iter().enumerate() {
            let key = output.script_pubkey.as_bytes().to_vec();
            if let Some(set) = self.txs.get_mut(&key) {
                set.remove(&txid);
                if set.is_empty() {
                    self.txs.remove(&key);
                }
            }
            if let Some(set) = self.coins.get_mut(&key) {
                set.remove(&OutPoint {
                    txid,
                    vout: vout as u32,
                });
                if set.is_empty() {
                    self.coins.remove(&key);
                }
            }
        }
    }

    pub fn txs_by_script(&self, script: &Script) -> Vec<Txid> {
        self.txs
            .get(script.as_bytes())
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn coins_by_script(&self, script: &Script) -> Vec<OutPoint> {
        self.coins
            .get(script.as_bytes())
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }
}
