//! Transaction pool: admission control, orphan resolution, fee-rate
//! eviction and conflict tracking.
//!
//! The pool is the sole authority for mempool-level double-spend
//! detection: `spents` maps every outpoint spent by a pool transaction to
//! its spender. A loose transaction colliding there is rejected;
//! replacement happens only when the chain confirms a conflicting
//! transaction or a reorg reinserts one.

use bitcoin::{Block, BlockHash, OutPoint, Transaction, TxOut, Txid};
use rand::Rng;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use chain::verification::{
    check_inputs, check_tx_sanity, is_final, unix_time, verify_sequence_locks,
};
use chain::{
    mandatory_verify_flags, standard_verify_flags, ChainDB, ChainEntry, ChainError,
    ValidationError, VersionBits, DEPLOYMENT_CSV, DEPLOYMENT_SEGWIT,
};
use storage::{Coin, CoinView, UNCONFIRMED_HEIGHT};

use crate::entry::MempoolEntry;
use crate::index::MempoolIndex;
use crate::policy::{
    check_standard, get_min_fee, has_standard_inputs, MempoolOptions, FEE_HALFLIFE,
};

/// Notifications emitted by the pool. `Tx` precedes `Added` for
/// admissions; `Confirmed` precedes `Removed` for confirmations.
#[derive(Debug, Clone)]
pub enum MempoolEvent {
    Tx(Arc<Transaction>),
    Added(Arc<Transaction>),
    Removed(Arc<Transaction>),
    Confirmed {
        tx: Arc<Transaction>,
        block: BlockHash,
    },
    Unconfirmed {
        tx: Arc<Transaction>,
        block: BlockHash,
    },
    Conflict(Arc<Transaction>),
    BadOrphan {
        hash: Txid,
        code: String,
    },
}

/// Admission outcome for a loose transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Added,
    /// Parked until its missing parents arrive.
    Orphan,
}

/// Sink for fee observations, consumed by an external estimator.
pub trait FeeSink: Send {
    fn observe_tx(&mut self, entry: &MempoolEntry);
    fn observe_block(&mut self, height: u32, confirmed: &[Txid]);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RemovalKind {
    Evict,
    Conflict,
    Confirm,
}

#[derive(Debug, Clone, Serialize)]
pub struct MempoolInfo {
    pub count: usize,
    pub size: usize,
    pub total_vsize: usize,
    pub total_fee: u64,
    pub min_fee_rate: u64,
    pub orphans: usize,
}

pub struct Mempool {
    db: Arc<ChainDB>,
    options: MempoolOptions,
    version_bits: VersionBits,

    entries: HashMap<Txid, MempoolEntry>,
    spents: HashMap<OutPoint, Txid>,
    orphans: HashMap<Txid, Transaction>,
    /// Missing parent txid -> orphans waiting on it.
    waiting: HashMap<Txid, HashSet<Txid>>,
    index: Option<MempoolIndex>,

    /// Running memory-usage estimate in bytes.
    size: usize,
    total_vsize: usize,
    total_fee: u64,

    rolling_min_fee: u64,
    last_fee_update: u64,
    free_count: f64,
    last_free_time: u64,

    tip_hash: BlockHash,
    tip_height: u32,

    events: broadcast::Sender<MempoolEvent>,
    estimator: Option<Box<dyn FeeSink>>,
}

impl Mempool {
    pub async fn new(db: Arc<ChainDB>, options: MempoolOptions) -> Result<Self, ChainError> {
        let tip = db.tip().await?;
        let index = options.index_address.then(MempoolIndex::new);
        let (events, _) = broadcast::channel(1024);

        Ok(Self {
            db,
            options,
            version_bits: VersionBits::new(),
            entries: HashMap::new(),
            spents: HashMap::new(),
            orphans: HashMap::new(),
            waiting: HashMap::new(),
            index,
            size: 0,
            total_vsize: 0,
            total_fee: 0,
            rolling_min_fee: 0,
            last_fee_update: unix_time(),
            free_count: 0.0,
            last_free_time: unix_time(),
            tip_hash: tip.hash,
            tip_height: tip.height,
            events,
            estimator: None,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MempoolEvent> {
        self.events.subscribe()
    }

    pub fn set_fee_estimator(&mut self, sink: Box<dyn FeeSink>) {
        self.estimator = Some(sink);
    }

    // ---- queries -------------------------------------------------------

    pub fn has(&self, hash: &Txid) -> bool {
        self.entries.contains_key(hash)
    }

    pub fn get(&self, hash: &Txid) -> Option<&MempoolEntry> {
        self.entries.get(hash)
    }

    pub fn has_orphan(&self, hash: &Txid) -> bool {
        self.orphans.contains_key(hash)
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_spent(&self, outpoint: &OutPoint) -> bool {
        self.spents.contains_key(outpoint)
    }

    /// Chain tip this pool last synchronized against.
    pub fn tip(&self) -> (BlockHash, u32) {
        (self.tip_hash, self.tip_height)
    }

    pub fn get_spender(&self, outpoint: &OutPoint) -> Option<&MempoolEntry> {
        self.spents
            .get(outpoint)
            .and_then(|hash| self.entries.get(hash))
    }

    pub fn info(&self) -> MempoolInfo {
        MempoolInfo {
            count: self.entries.len(),
            size: self.size,
            total_vsize: self.total_vsize,
            total_fee: self.total_fee,
            min_fee_rate: self.rolling_min_fee,
            orphans: self.orphans.len(),
        }
    }

    pub fn txs_by_script(&self, script: &bitcoin::Script) -> Vec<Txid> {
        self.index
            .as_ref()
            .map(|index| index.txs_by_script(script))
            .unwrap_or_default()
    }

    pub fn coins_by_script(&self, script: &bitcoin::Script) -> Vec<OutPoint> {
        self.index
            .as_ref()
            .map(|index| index.coins_by_script(script))
            .unwrap_or_default()
    }

    /// An output created by a pool transaction, unless something in the
    /// pool already spends it.
    fn get_pool_coin(&self, outpoint: &OutPoint) -> Option<Coin> {
        if self.spents.contains_key(outpoint) {
            return None;
        }
        let entry = self.entries.get(&outpoint.txid)?;
        let output = entry.tx.output.get(outpoint.vout as usize)?;
        Some(Coin {
            version: entry.tx.version.0,
            height: UNCONFIRMED_HEIGHT,
            coinbase: false,
            output: output.clone(),
        })
    }

    /// Resolve a transaction's inputs from the pool first, then the chain.
    async fn build_view(&self, tx: &Transaction) -> Result<CoinView, ChainError> {
        let mut view = CoinView::new();
        for input in &tx.input {
            let prevout = input.previous_output;
            if view.has(&prevout) {
                continue;
            }
            if let Some(coin) = self.get_pool_coin(&prevout) {
                view.add_coin(prevout, coin);
            } else if let Some(coin) = self.db.read_coin(&prevout).await? {
                view.add_coin(prevout, coin);
            }
        }
        Ok(view)
    }

    // ---- admission -----------------------------------------------------

    /// Admit a loose transaction, then retry any orphans it unblocks.
    pub async fn add_tx(&mut self, tx: Transaction) -> Result<TxStatus, ChainError> {
        let hash = tx.compute_txid();
        let status = self.insert_tx(tx).await?;
        if status == TxStatus::Added {
            self.process_waiting(hash).await;
        }
        Ok(status)
    }

    /// The fail-fast admission pipeline for a single transaction.
    async fn insert_tx(&mut self, tx: Transaction) -> Result<TxStatus, ChainError> {
        let hash = tx.compute_txid();
        let height = self.tip_height;

        // Already known, here or on chain.
        if self.entries.contains_key(&hash) {
            return Err(
                ValidationError::new("alreadyknown", "txn-already-in-mempool", 0).into(),
            );
        }
        if self.db.has_coins(&hash).await? {
            return Err(ValidationError::new("alreadyknown", "txn-already-known", 0).into());
        }

        check_tx_sanity(&tx)?;

        if tx.is_coinbase() {
            return Err(ValidationError::new("coinbase", "coinbase", 100).into());
        }

        let tip = self.db.tip().await?;
        let csv_active = self
            .version_bits
            .is_active(&self.db, Some(&tip), DEPLOYMENT_CSV)
            .await?;
        let segwit_active = self
            .version_bits
            .is_active(&self.db, Some(&tip), DEPLOYMENT_SEGWIT)
            .await?;

        if self.options.require_standard && tx.version.0 >= 2 && !csv_active {
            return Err(
                ValidationError::new("premature-version2-tx", "premature-version2-tx", 0).into(),
            );
        }

        if !segwit_active && !self.options.premature_witness {
            let has_witness = tx.input.iter().any(|input| !input.witness.is_empty());
            if has_witness {
                return Err(ValidationError::new("no-witness-yet", "no-witness-yet", 0).into());
            }
        }

        let next_height = height + 1;
        let time_cutoff = if csv_active {
            self.db.median_time_past(&tip).await?
        } else {
            unix_time() as u32
        };
        if !is_final(&tx, next_height, time_cutoff) {
            return Err(ValidationError::new("non-final", "non-final", 0).into());
        }

        if self.options.require_standard {
            check_standard(&tx)?;
        }

        // Double spend against the pool.
        for input in &tx.input {
            if self.spents.contains_key(&input.previous_output) {
                return Err(
                    ValidationError::new("duplicate", "bad-txns-inputs-spent", 0).into(),
                );
            }
        }

        let view = self.build_view(&tx).await?;
        if !view.fill_coins(&tx) {
            let missing: Vec<Txid> = tx
                .input
                .iter()
                .filter(|input| !view.has(&input.previous_output))
                .map(|input| input.previous_output.txid)
                .collect();
            self.store_orphan(tx, missing);
            return Ok(TxStatus::Orphan);
        }

        let entry = MempoolEntry::from_tx(tx, &view, height, unix_time())?;
        self.verify_entry(&tip, &entry, &view, csv_active).await?;

        self.insert_entry(entry);

        if self.size > self.options.max_size {
            self.limit_size();
            if !self.entries.contains_key(&hash) {
                return Err(ValidationError::new("insufficientfee", "mempool full", 0).into());
            }
        }

        trace!(%hash, count = self.entries.len(), "transaction admitted");
        Ok(TxStatus::Added)
    }

    /// Policy and consensus verification of a candidate entry.
    async fn verify_entry(
        &mut self,
        tip: &Arc<ChainEntry>,
        entry: &MempoolEntry,
        view: &CoinView,
        csv_active: bool,
    ) -> Result<(), ChainError> {
        let next_height = self.tip_height + 1;

        if csv_active
            && !verify_sequence_locks(&self.db, tip, &entry.tx, view, next_height).await?
        {
            return Err(ValidationError::new("non-BIP68-final", "bad-txns-nonfinal", 0).into());
        }

        if self.options.require_standard && !has_standard_inputs(&entry.tx, view) {
            return Err(ValidationError::nonstandard("bad-txns-nonstandard-inputs").into());
        }

        let sigops = entry.tx.total_sigop_cost(|outpoint: &OutPoint| {
            view.get(outpoint).ok().flatten().map(|coin| coin.output)
        });
        if sigops > self.options.max_tx_sigops_cost {
            return Err(ValidationError::nonstandard("bad-txns-too-many-sigops").into());
        }

        // Rolling minimum fee rate.
        let min_rate = self.min_fee_rate();
        let reject_fee = get_min_fee(entry.size, min_rate);
        if entry.fee < reject_fee {
            return Err(
                ValidationError::new("insufficientfee", "mempool min fee not met", 0).into(),
            );
        }

        let relay_fee = get_min_fee(entry.size, self.options.min_relay_fee);
        if self.options.relay_priority && entry.fee < relay_fee {
            if !entry.is_free(next_height) {
                return Err(
                    ValidationError::new("insufficientfee", "insufficient priority", 0).into(),
                );
            }

            if self.options.limit_free {
                let now = unix_time();
                let elapsed = now.saturating_sub(self.last_free_time);
                self.free_count *= (1.0 - 1.0 / 600.0f64).powf(elapsed as f64);
                self.last_free_time = now;

                if self.free_count > self.options.limit_free_relay as f64 * 10.0 * 1000.0 {
                    return Err(ValidationError::new(
                        "insufficientfee",
                        "rate limited free transaction",
                        0,
                    )
                    .into());
                }
                self.free_count += entry.size as f64;
                debug!(free_count = self.free_count, "free transaction accepted");
            }
        }

        if self.options.reject_absurd_fees && entry.fee > relay_fee.saturating_mul(10_000) {
            return Err(ValidationError::new("highfee", "absurdly-high-fee", 0).into());
        }

        if self.count_ancestors(&entry.tx) > self.options.ancestor_limit {
            return Err(ValidationError::nonstandard("too-long-mempool-chain").into());
        }

        check_inputs(
            &entry.tx,
            view,
            next_height,
            self.db.params().coinbase_maturity,
        )?;

        // Script verification: standard flags first, mandatory flags to
        // classify the failure.
        let mut spent = spent_outputs(&entry.tx, view);
        if entry
            .tx
            .verify_with_flags(|op: &OutPoint| spent.remove(op), standard_verify_flags())
            .is_err()
        {
            let mut spent = spent_outputs(&entry.tx, view);
            return match entry
                .tx
                .verify_with_flags(|op: &OutPoint| spent.remove(op), mandatory_verify_flags())
            {
                Ok(()) => Err(ValidationError::new(
                    "nonmandatory-script-verify-flag",
                    "non-mandatory-script-verify-flag",
                    0,
                )
                .into()),
                Err(_) => Err(ValidationError::new(
                    "mandatory-script-verify-flag",
                    "mandatory-script-verify-flag-failed",
                    100,
                )
                .into()),
            };
        }

        Ok(())
    }

    /// Distinct in-pool ancestors, stopping once the limit is exceeded.
    fn count_ancestors(&self, tx: &Transaction) -> usize {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<Txid> = tx
            .input
            .iter()
            .map(|input| input.previous_output.txid)
            .collect();

        while let Some(parent) = queue.pop_front() {
            if seen.len() > self.options.ancestor_limit {
                break;
            }
            let Some(entry) = self.entries.get(&parent) else {
                continue;
            };
            if seen.insert(parent) {
                queue.extend(entry.tx.input.iter().map(|input| input.previous_output.txid));
            }
        }
        seen.len()
    }

    /// Exponentially decaying rolling minimum fee rate, halved below half
    /// capacity and quartered below a quarter.
    fn min_fee_rate(&mut self) -> u64 {
        if self.rolling_min_fee == 0 {
            return 0;
        }

        let mut halflife = FEE_HALFLIFE;
        if self.size < self.options.max_size / 4 {
            halflife /= 4;
        } else if self.size < self.options.max_size / 2 {
            halflife /= 2;
        }

        let now = unix_time();
        let elapsed = now.saturating_sub(self.last_fee_update);
        if elapsed > 0 {
            let decayed = self.rolling_min_fee as f64
                * 0.5f64.powf(elapsed as f64 / halflife as f64);
            self.rolling_min_fee = decayed as u64;
            self.last_fee_update = now;

            if self.rolling_min_fee < self.options.min_relay_fee / 2 {
                self.rolling_min_fee = 0;
            }
        }
        self.rolling_min_fee
    }

    // ---- bookkeeping ---------------------------------------------------

    fn insert_entry(&mut self, entry: MempoolEntry) {
        let hash = entry.hash;

        for input in &entry.tx.input {
            self.spents.insert(input.previous_output, hash);
        }
        if let Some(index) = self.index.as_mut() {
            index.insert(&entry.tx);
        }

        self.size += entry.mem_usage();
        self.total_vsize += entry.size;
        self.total_fee += entry.fee;

        // Feed descendant aggregates of every in-pool ancestor.
        let ancestors = self.ancestor_hashes(&entry.tx);
        for ancestor in ancestors {
            if let Some(parent) = self.entries.get_mut(&ancestor) {
                parent.desc_count += 1;
                parent.desc_size += entry.size;
                parent.desc_fees += entry.fee;
            }
        }

        if let Some(estimator) = self.estimator.as_mut() {
            estimator.observe_tx(&entry);
        }

        let tx = Arc::new(entry.tx.clone());
        self.entries.insert(hash, entry);

        self.emit(MempoolEvent::Tx(tx.clone()));
        self.emit(MempoolEvent::Added(tx));
    }

    fn ancestor_hashes(&self, tx: &Transaction) -> HashSet<Txid> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<Txid> = tx
            .input
            .iter()
            .map(|input| input.previous_output.txid)
            .collect();
        while let Some(parent) = queue.pop_front() {
            let Some(entry) = self.entries.get(&parent) else {
                continue;
            };
            if seen.insert(parent) {
                queue.extend(entry.tx.input.iter().map(|input| input.previous_output.txid));
            }
        }
        seen
    }

    /// Remove one entry, keeping every index consistent. Descendants must
    /// already be gone.
    fn remove_entry(&mut self, hash: &Txid, kind: RemovalKind) -> Option<MempoolEntry> {
        let entry = self.entries.remove(hash)?;

        for input in &entry.tx.input {
            if self.spents.get(&input.previous_output) == Some(hash) {
                self.spents.remove(&input.previous_output);
            }
        }
        if let Some(index) = self.index.as_mut() {
            index.remove(&entry.tx);
        }

        self.size = self.size.saturating_sub(entry.mem_usage());
        self.total_vsize = self.total_vsize.saturating_sub(entry.size);
        self.total_fee = self.total_fee.saturating_sub(entry.fee);

        let ancestors = self.ancestor_hashes(&entry.tx);
        for ancestor in ancestors {
            if let Some(parent) = self.entries.get_mut(&ancestor) {
                parent.desc_count = parent.desc_count.saturating_sub(1);
                parent.desc_size = parent.desc_size.saturating_sub(entry.size);
                parent.desc_fees = parent.desc_fees.saturating_sub(entry.fee);
            }
        }

        let tx = Arc::new(entry.tx.clone());
        if kind == RemovalKind::Conflict {
            self.emit(MempoolEvent::Conflict(tx.clone()));
        }
        self.emit(MempoolEvent::Removed(tx));

        Some(entry)
    }

    /// Remove an entry and, first, everything in the pool spending its
    /// outputs. Descendants-first keeps the spent index consistent.
    fn remove_with_descendants(&mut self, hash: Txid, kind: RemovalKind) {
        let output_count = match self.entries.get(&hash) {
            Some(entry) => entry.tx.output.len() as u32,
            None => return,
        };

        for vout in 0..output_count {
            let outpoint = OutPoint { txid: hash, vout };
            if let Some(spender) = self.spents.get(&outpoint).copied() {
                self.remove_with_descendants(spender, kind);
            }
        }

        self.remove_entry(&hash, kind);
    }

    /// Remove pool spenders conflicting with a confirmed or reinserted
    /// transaction, transitively.
    fn remove_double_spends(&mut self, tx: &Transaction) {
        for input in &tx.input {
            if let Some(spender) = self.spents.get(&input.previous_output).copied() {
                warn!(conflict = %spender, "removing double-spending pool transaction");
                self.remove_with_descendants(spender, RemovalKind::Conflict);
            }
        }
    }

    /// Enforce the size bound: expired entries first, then the cheapest,
    /// descendants included. Each eviction bumps the rolling minimum rate.
    fn limit_size(&mut self) {
        let now = unix_time();

        while self.size > self.options.max_size {
            let expired = self
                .entries
                .values()
                .filter(|e| now.saturating_sub(e.ts) > self.options.expiry_time)
                .min_by_key(|e| e.ts)
                .map(|e| e.hash);

            let victim = expired.or_else(|| {
                self.entries
                    .values()
                    .min_by_key(|e| (e.fee_rate(), e.hash))
                    .map(|e| e.hash)
            });

            let Some(victim) = victim else {
                break;
            };

            let rate = self
                .entries
                .get(&victim)
                .map(|e| e.fee_rate())
                .unwrap_or(0);
            info!(%victim, rate, "evicting transaction to satisfy size bound");
            self.remove_with_descendants(victim, RemovalKind::Evict);

            let bumped = rate.saturating_add(self.options.min_relay_fee);
            if bumped > self.min_fee_rate() {
                self.rolling_min_fee = bumped;
                self.last_fee_update = now;
            }
        }
    }

    // ---- orphans -------------------------------------------------------

    fn store_orphan(&mut self, tx: Transaction, missing: Vec<Txid>) {
        if self.orphans.len() >= self.options.max_orphans {
            // Uniformly random victim, matching the unbounded-peer threat
            // model rather than any arrival order.
            let victims: Vec<Txid> = self.orphans.keys().copied().collect();
            let victim = victims[rand::thread_rng().gen_range(0..victims.len())];
            self.remove_orphan(&victim);
            debug!(%victim, "orphan pool full, evicted random orphan");
        }

        let hash = tx.compute_txid();
        debug!(%hash, missing = missing.len(), "storing orphan transaction");
        for parent in missing {
            self.waiting.entry(parent).or_default().insert(hash);
        }
        self.orphans.insert(hash, tx);
    }

    fn remove_orphan(&mut self, hash: &Txid) -> Option<Transaction> {
        let tx = self.orphans.remove(hash)?;
        for input in &tx.input {
            let parent = input.previous_output.txid;
            if let Some(set) = self.waiting.get_mut(&parent) {
                set.remove(hash);
                if set.is_empty() {
                    self.waiting.remove(&parent);
                }
            }
        }
        Some(tx)
    }

    /// Retry orphans whose missing parent just became available, cascading
    /// through orphan chains.
    async fn process_waiting(&mut self, parent: Txid) {
        let mut queue: VecDeque<Txid> = VecDeque::new();
        if let Some(set) = self.waiting.remove(&parent) {
            queue.extend(set);
        }

        while let Some(orphan_hash) = queue.pop_front() {
            let Some(orphan) = self.remove_orphan(&orphan_hash) else {
                continue;
            };

            match self.insert_tx(orphan).await {
                Ok(TxStatus::Added) => {
                    debug!(%orphan_hash, "orphan resolved");
                    if let Some(set) = self.waiting.remove(&orphan_hash) {
                        queue.extend(set);
                    }
                }
                Ok(TxStatus::Orphan) => {
                    // Still missing other parents; re-parked.
                }
                Err(err) => {
                    let code = match &err {
                        ChainError::Verification(v) => v.code.clone(),
                        other => other.to_string(),
                    };
                    warn!(%orphan_hash, %code, "orphan failed verification");
                    self.emit(MempoolEvent::BadOrphan {
                        hash: orphan_hash,
                        code,
                    });
                }
            }
        }
    }

    // ---- chain synchronization -----------------------------------------

    /// A block connected: drop confirmed transactions (the chain owns
    /// their inputs now), purge conflicts, resolve orphans against the new
    /// chain state.
    pub async fn add_block(&mut self, entry: &ChainEntry, block: &Block) {
        self.tip_hash = entry.hash;
        self.tip_height = entry.height;

        let mut confirmed = Vec::new();
        for tx in block.txdata.iter().skip(1) {
            let hash = tx.compute_txid();

            if self.entries.contains_key(&hash) {
                let arc = Arc::new(tx.clone());
                self.emit(MempoolEvent::Confirmed {
                    tx: arc,
                    block: entry.hash,
                });
                self.remove_entry(&hash, RemovalKind::Confirm);
                confirmed.push(hash);
            } else {
                self.remove_double_spends(tx);
            }

            // An orphan identical to a confirmed tx is moot.
            self.remove_orphan(&hash);
        }

        if let Some(estimator) = self.estimator.as_mut() {
            estimator.observe_block(entry.height, &confirmed);
        }
        self.last_fee_update = unix_time();

        // Coins created by this block may satisfy waiting orphans.
        let hashes: Vec<Txid> = block.txdata.iter().map(|tx| tx.compute_txid()).collect();
        for hash in hashes {
            self.process_waiting(hash).await;
        }

        debug!(
            height = entry.height,
            confirmed = confirmed.len(),
            pool = self.entries.len(),
            "block absorbed"
        );
    }

    /// A block disconnected: previously confirmed transactions return to
    /// the pool. The network already accepted them, so fee and
    /// standardness gates are bypassed.
    pub async fn remove_block(&mut self, entry: &ChainEntry, block: &Block) {
        self.tip_hash = entry.prev_block;
        self.tip_height = entry.height.saturating_sub(1);

        for tx in block.txdata.iter().skip(1).rev() {
            let hash = tx.compute_txid();
            if self.entries.contains_key(&hash) {
                continue;
            }

            // A newer loose spender loses to the reinserted transaction.
            self.remove_double_spends(tx);

            match self.reinsert_tx(tx.clone()).await {
                Ok(()) => {
                    // Children of this block land before their parents, so
                    // each reinsertion may unpark earlier ones.
                    self.process_waiting(hash).await;
                }
                Err(err) => {
                    debug!(%hash, %err, "disconnected transaction not reinserted");
                }
            }

            self.emit(MempoolEvent::Unconfirmed {
                tx: Arc::new(tx.clone()),
                block: entry.hash,
            });
        }

        debug!(height = entry.height, pool = self.entries.len(), "block unwound");
    }

    /// Reinsertion path for reorgs: resolve inputs and book the entry,
    /// parking as orphan when parents are still missing.
    async fn reinsert_tx(&mut self, tx: Transaction) -> Result<(), ChainError> {
        check_tx_sanity(&tx)?;

        let view = self.build_view(&tx).await?;
        if !view.fill_coins(&tx) {
            let missing: Vec<Txid> = tx
                .input
                .iter()
                .filter(|input| !view.has(&input.previous_output))
                .map(|input| input.previous_output.txid)
                .collect();
            self.store_orphan(tx, missing);
            return Ok(());
        }

        let entry = MempoolEntry::from_tx(tx, &view, self.tip_height, unix_time())?;
        self.insert_entry(entry);
        Ok(())
    }

    fn emit(&self, event: MempoolEvent) {
        let _ = self.events.send(event);
    }
}

fn spent_outputs(tx: &Transaction, view: &CoinView) -> HashMap<OutPoint, TxOut> {
    tx.input
        .iter()
        .filter_map(|input| {
            view.get(&input.previous_output)
                .ok()
                .flatten()
                .map(|coin| (input.previous_output, coin.output))
        })
        .collect()
}
