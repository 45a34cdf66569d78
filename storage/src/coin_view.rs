//! Block-local UTXO overlay.
//!
//! Seeded with the on-disk bundles a block references, mutated while the
//! block is applied, and written back as one batch. Spends are mirrored into
//! an undo list so the whole mutation can be reversed on disconnect.

use bitcoin::{OutPoint, Transaction, Txid};
use std::collections::BTreeMap;

use crate::coins::{Coin, Coins, UndoCoins};
use crate::error::StorageError;

#[derive(Debug, Default)]
pub struct CoinView {
    map: BTreeMap<Txid, Coins>,
    undo: UndoCoins,
}

impl CoinView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, coins: Coins) {
        self.map.insert(coins.hash, coins);
    }

    pub fn add_tx(&mut self, tx: &Transaction, height: u32) {
        self.add(Coins::from_tx(tx, height));
    }

    /// Insert a single resolved coin, creating its bundle if necessary.
    pub fn add_coin(&mut self, prevout: OutPoint, coin: Coin) {
        let bundle = self.map.entry(prevout.txid).or_insert_with(|| {
            Coins::new(prevout.txid, coin.version, coin.height, coin.coinbase)
        });
        bundle.add(prevout.vout, coin.output);
    }

    pub fn entry(&self, hash: &Txid) -> Option<&Coins> {
        self.map.get(hash)
    }

    pub fn entry_mut(&mut self, hash: &Txid) -> Option<&mut Coins> {
        self.map.get_mut(hash)
    }

    pub fn has_entry(&self, hash: &Txid) -> bool {
        self.map.contains_key(hash)
    }

    pub fn get(&self, prevout: &OutPoint) -> Result<Option<Coin>, StorageError> {
        match self.map.get(&prevout.txid) {
            Some(coins) => coins.get(prevout.vout),
            None => Ok(None),
        }
    }

    pub fn has(&self, prevout: &OutPoint) -> bool {
        self.map
            .get(&prevout.txid)
            .is_some_and(|coins| coins.has(prevout.vout))
    }

    /// Remove and return a coin, recording its pre-spend state for undo.
    pub fn spend(&mut self, prevout: &OutPoint) -> Result<Option<Coin>, StorageError> {
        let Some(coins) = self.map.get_mut(&prevout.txid) else {
            return Ok(None);
        };
        let coin = coins.spend(prevout.vout)?;
        if let Some(coin) = &coin {
            self.undo.push(*prevout, coin.clone());
        }
        Ok(coin)
    }

    /// True when every input of `tx` resolves against this view.
    pub fn fill_coins(&self, tx: &Transaction) -> bool {
        tx.input.iter().all(|input| {
            input.previous_output.is_null() || self.has(&input.previous_output)
        })
    }

    /// Bundles in deterministic (txid) order.
    pub fn to_vec(&self) -> Vec<&Coins> {
        self.map.values().collect()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn undo(&self) -> &UndoCoins {
        &self.undo
    }

    pub fn take_undo(&mut self) -> UndoCoins {
        std::mem::take(&mut self.undo)
    }

    pub fn into_parts(self) -> (BTreeMap<Txid, Coins>, UndoCoins) {
        (self.map, self.undo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::{absolute, transaction, Amount, ScriptBuf, Sequence, TxIn, TxOut, Witness};

    fn anyone_can_spend(value: u64) -> TxOut {
        TxOut {
            value: Amount::from_sat(value),
            script_pubkey: ScriptBuf::from_bytes(vec![0x51]),
        }
    }

    fn tx_spending(prevout: OutPoint, value: u64) -> Transaction {
        Transaction {
            version: transaction::Version::ONE,
            lock_time: absolute::LockTime::ZERO,
            input: vec![TxIn {
                previous_output: prevout,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![anyone_can_spend(value)],
        }
    }

    #[test]
    fn spend_records_undo() {
        let txid = Txid::from_byte_array([3u8; 32]);
        let mut view = CoinView::new();
        let mut coins = Coins::new(txid, 1, 7, false);
        coins.add(0, anyone_can_spend(900));
        coins.add(1, anyone_can_spend(100));
        view.add(coins);

        let prevout = OutPoint { txid, vout: 0 };
        let spent = view.spend(&prevout).unwrap().unwrap();
        assert_eq!(spent.value(), Amount::from_sat(900));
        assert!(!view.has(&prevout));
        assert!(view.has(&OutPoint { txid, vout: 1 }));

        assert_eq!(view.undo().len(), 1);
        assert_eq!(view.undo().items()[0].0, prevout);

        // Double spend resolves to nothing and records nothing.
        assert!(view.spend(&prevout).unwrap().is_none());
        assert_eq!(view.undo().len(), 1);
    }

    #[test]
    fn fill_coins_requires_every_input() {
        let txid = Txid::from_byte_array([4u8; 32]);
        let mut view = CoinView::new();
        let mut coins = Coins::new(txid, 1, 1, false);
        coins.add(0, anyone_can_spend(500));
        view.add(coins);

        let known = tx_spending(OutPoint { txid, vout: 0 }, 400);
        assert!(view.fill_coins(&known));

        let unknown = tx_spending(
            OutPoint {
                txid: Txid::from_byte_array([5u8; 32]),
                vout: 0,
            },
            400,
        );
        assert!(!view.fill_coins(&unknown));
    }

    #[test]
    fn add_tx_exposes_new_outputs() {
        let parent = tx_spending(
            OutPoint {
                txid: Txid::from_byte_array([6u8; 32]),
                vout: 0,
            },
            250,
        );
        let mut view = CoinView::new();
        view.add_tx(&parent, 12);

        let outpoint = OutPoint {
            txid: parent.compute_txid(),
            vout: 0,
        };
        let coin = view.get(&outpoint).unwrap().unwrap();
        assert_eq!(coin.height, 12);
        assert_eq!(coin.value(), Amount::from_sat(250));
    }

    #[test]
    fn iteration_order_is_deterministic() {
        let mut view = CoinView::new();
        for fill in [9u8, 1, 5] {
            let mut coins = Coins::new(Txid::from_byte_array([fill; 32]), 1, 1, false);
            coins.add(0, anyone_can_spend(10));
            view.add(coins);
        }
        let hashes: Vec<_> = view.to_vec().iter().map(|c| c.hash).collect();
        let mut sorted = hashes.clone();
        sorted.sort();
        assert_eq!(hashes, sorted);
    }
}
