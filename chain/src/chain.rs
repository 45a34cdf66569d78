//! Block connection state machine.
//!
//! A received block moves through: sanity checks, parent resolution
//! (parking as an orphan when the parent is unknown), contextual
//! verification against the parent, then branch selection. Strictly greater
//! chainwork is required to displace the tip, so the first-seen branch wins
//! ties. The component lock is held across an entire connect, disconnect or
//! reorganization, so observers never see a half-applied block.

use bitcoin::{Block, BlockHash, OutPoint, Target, TxOut};
use dashmap::{DashMap, DashSet};
use num_bigint::BigUint;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use storage::{Backend, CoinView};

use crate::db::{ChainDB, ChainDbOptions};
use crate::deployments::{BlockFlags, VersionBits};
use crate::entry::ChainEntry;
use crate::error::{ChainError, ValidationError};
use crate::events::{ChainEvent, ChainEvents};
use crate::params::NetworkParams;
use crate::verification::{
    check_inputs, check_tx_sanity, is_final, unix_time, verify_sequence_locks,
};

/// Maximum tolerated clock drift for block timestamps.
const MAX_TIME_DRIFT: u64 = 2 * 60 * 60;

#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub db: ChainDbOptions,
    pub use_checkpoints: bool,
    pub max_orphans: usize,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            db: ChainDbOptions::default(),
            use_checkpoints: true,
            max_orphans: 100,
        }
    }
}

/// Outcome of handing a block to the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    /// Became part of the main chain (extension or reorganization).
    Connected,
    /// Stored, but on a branch with less work than the tip.
    SideChain,
    /// Parked until its parent arrives.
    Orphan,
    /// Hash already known; ignored.
    AlreadyKnown,
}

struct OrphanBlock {
    block: Block,
    received: Instant,
}

/// Snapshot of chain state for an embedding RPC layer.
#[derive(Debug, Clone, Serialize)]
pub struct ChainInfo {
    pub network: String,
    pub height: u32,
    pub tip: String,
    pub chainwork: String,
    pub orphans: usize,
}

/// Contextual verification outcome for one block.
struct BlockContext {
    flags: BlockFlags,
    verify_scripts: bool,
}

pub struct Chain {
    db: Arc<ChainDB>,
    config: ChainConfig,
    version_bits: VersionBits,
    /// Orphans keyed by the parent hash they wait for. Several blocks may
    /// race on the same missing parent, so each key holds a list.
    orphans: DashMap<BlockHash, Vec<OrphanBlock>>,
    /// Orphan hash -> parent key in `orphans`.
    orphan_index: DashMap<BlockHash, BlockHash>,
    invalid: DashSet<BlockHash>,
    events: ChainEvents,
    lock: tokio::sync::Mutex<()>,
}

impl Chain {
    pub async fn open(
        backend: Arc<dyn Backend>,
        params: NetworkParams,
        config: ChainConfig,
    ) -> Result<Self, ChainError> {
        let db = Arc::new(ChainDB::open(backend, params, config.db.clone()).await?);
        let tip = db.tip().await?;
        info!(height = tip.height, tip = %tip.hash, "chain ready");

        Ok(Self {
            db,
            config,
            version_bits: VersionBits::new(),
            orphans: DashMap::new(),
            orphan_index: DashMap::new(),
            invalid: DashSet::new(),
            events: ChainEvents::default(),
            lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn db(&self) -> &Arc<ChainDB> {
        &self.db
    }

    pub fn params(&self) -> &NetworkParams {
        self.db.params()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChainEvent> {
        self.events.subscribe()
    }

    pub async fn tip(&self) -> Result<Arc<ChainEntry>, ChainError> {
        self.db.tip().await
    }

    pub async fn height(&self) -> Result<u32, ChainError> {
        Ok(self.db.tip().await?.height)
    }

    pub fn has_orphan(&self, hash: &BlockHash) -> bool {
        self.orphan_index.contains_key(hash)
    }

    pub fn orphan_count(&self) -> usize {
        self.orphan_index.len()
    }

    /// Version field for a block built on the current tip.
    pub async fn compute_block_version(&self) -> Result<i32, ChainError> {
        let tip = self.db.tip().await?;
        self.version_bits
            .compute_block_version(&self.db, &tip)
            .await
    }

    pub async fn get_locator(&self) -> Result<Vec<BlockHash>, ChainError> {
        self.db.get_locator(None).await
    }

    pub async fn get_info(&self) -> Result<ChainInfo, ChainError> {
        let tip = self.db.tip().await?;
        Ok(ChainInfo {
            network: format!("{:?}", self.params().network).to_lowercase(),
            height: tip.height,
            tip: tip.hash.to_string(),
            chainwork: tip.chainwork.to_hex_string(),
            orphans: self.orphan_index.len(),
        })
    }

    /// Ingest a block, then re-enter any orphans unblocked by it.
    pub async fn add(&self, block: Block) -> Result<BlockStatus, ChainError> {
        let _guard = self.lock.lock().await;

        let mut queue = VecDeque::new();
        queue.push_back(block);
        let mut first: Option<BlockStatus> = None;

        while let Some(block) = queue.pop_front() {
            let hash = block.block_hash();
            let status = match self.add_inner(block).await {
                Ok(status) => status,
                Err(err) => {
                    if first.is_none() {
                        return Err(err);
                    }
                    warn!(%hash, %err, "orphan resolution failed");
                    continue;
                }
            };

            if matches!(status, BlockStatus::Connected | BlockStatus::SideChain) {
                if let Some((_, orphans)) = self.orphans.remove(&hash) {
                    for orphan in orphans {
                        let orphan_hash = orphan.block.block_hash();
                        self.orphan_index.remove(&orphan_hash);
                        debug!(parent = %hash, orphan = %orphan_hash, "resuming parked orphan");
                        queue.push_back(orphan.block);
                    }
                }
            }

            if first.is_none() {
                first = Some(status);
            }
        }

        Ok(first.expect("queue held at least the submitted block"))
    }

    async fn add_inner(&self, block: Block) -> Result<BlockStatus, ChainError> {
        let hash = block.block_hash();

        if self.invalid.contains(&hash) {
            return Err(ValidationError::new("duplicate", "known-invalid", 100).into());
        }
        if self.db.has_entry(&hash).await? || self.orphan_index.contains_key(&hash) {
            debug!(%hash, "block already known");
            return Ok(BlockStatus::AlreadyKnown);
        }

        if let Err(err) = self.check_block_sanity(&block) {
            self.invalid.insert(hash);
            return Err(err.into());
        }

        let prev_hash = block.header.prev_blockhash;
        let Some(prev) = self.db.get_entry(&prev_hash).await? else {
            self.store_orphan(block);
            return Ok(BlockStatus::Orphan);
        };

        let ctx = match self.verify_context(&block, &prev).await {
            Ok(ctx) => ctx,
            Err(err) => {
                if err.verification().is_some_and(|v| v.is_ban_worthy()) {
                    self.invalid.insert(hash);
                }
                return Err(err);
            }
        };

        let entry = ChainEntry::from_block_header(&block.header, Some(&prev));
        let tip = self.db.tip().await?;

        if entry.chainwork > tip.chainwork {
            if prev.hash == tip.hash {
                self.connect(&entry, &block, &prev, &ctx).await?;
                info!(height = entry.height, hash = %entry.hash, "chain extended");
            } else {
                // Store the block first so the reorganization can walk
                // persistent records only.
                self.db.save(&entry, &block, None, false).await?;
                self.reorganize(&entry).await?;
            }
            self.emit_block(&entry, &block);
            Ok(BlockStatus::Connected)
        } else {
            self.db.save(&entry, &block, None, false).await?;
            debug!(
                height = entry.height,
                hash = %entry.hash,
                "competitor block stored on side chain"
            );
            self.emit_block(&entry, &block);
            Ok(BlockStatus::SideChain)
        }
    }

    fn emit_block(&self, entry: &ChainEntry, block: &Block) {
        self.events.emit(ChainEvent::Block {
            entry: Arc::new(entry.clone()),
            block: Arc::new(block.clone()),
        });
    }

    // ---- verification --------------------------------------------------

    /// Context-free block checks: proof of work and structure.
    fn check_block_sanity(&self, block: &Block) -> Result<(), ValidationError> {
        let params = self.params();

        let target = block.header.target();
        if target == Target::ZERO || target > params.pow_limit {
            return Err(ValidationError::invalid("bad-diffbits", 100));
        }
        if block.header.validate_pow(target).is_err() {
            return Err(ValidationError::invalid("high-hash", 50));
        }

        if block.txdata.is_empty() {
            return Err(ValidationError::invalid("bad-cb-missing", 100));
        }
        if !block.txdata[0].is_coinbase() {
            return Err(ValidationError::invalid("bad-cb-missing", 100));
        }
        if block.txdata[1..].iter().any(|tx| tx.is_coinbase()) {
            return Err(ValidationError::invalid("bad-cb-multiple", 100));
        }
        if !block.check_merkle_root() {
            return Err(ValidationError::invalid("bad-txnmrklroot", 100));
        }
        if block.weight().to_wu() > params.max_block_weight {
            return Err(ValidationError::invalid("bad-blk-weight", 100));
        }

        for tx in &block.txdata {
            check_tx_sanity(tx)?;
        }

        Ok(())
    }

    /// Checks that depend on the parent: timestamps, difficulty, version
    /// gates, checkpoints, deployments and transaction finality.
    async fn verify_context(
        &self,
        block: &Block,
        prev: &Arc<ChainEntry>,
    ) -> Result<BlockContext, ChainError> {
        let params = self.params();
        let hash = block.block_hash();
        let height = prev.height + 1;

        let mtp = self.db.median_time_past(prev).await?;
        if block.header.time <= mtp {
            return Err(ValidationError::invalid("time-too-old", 0).into());
        }
        if u64::from(block.header.time) > unix_time() + MAX_TIME_DRIFT {
            return Err(ValidationError::invalid("time-too-new", 0).into());
        }

        let expected = self.get_target(prev, block.header.time).await?;
        if block.header.bits.to_consensus() != expected {
            return Err(ValidationError::invalid("bad-diffbits", 100).into());
        }

        // Reject versions once a super-majority of the network has moved on.
        let version = block.header.version.to_consensus();
        for required in [2, 3, 4] {
            if version < required
                && self
                    .db
                    .is_super_majority(required, params.majority_reject_outdated, prev)
                    .await?
            {
                return Err(ValidationError::invalid("bad-version", 0).into());
            }
        }

        let last_checkpoint = params.last_checkpoint();
        if self.config.use_checkpoints && height <= last_checkpoint {
            if let Some(expected_hash) = params.checkpoints.get(&height) {
                if hash != *expected_hash {
                    return Err(ValidationError::invalid("checkpoint-mismatch", 100).into());
                }
            }
            if !self.db.is_main_chain(&prev.hash).await? {
                return Err(
                    ValidationError::invalid("bad-fork-prior-to-checkpoint", 100).into(),
                );
            }
        }
        let verify_scripts = !self.config.use_checkpoints || height > last_checkpoint;

        let flags = self.version_bits.block_flags(&self.db, prev, &hash).await?;

        // The coinbase height commitment is mandatory above the activation
        // height, and already below it for version-2 blocks once a
        // super-majority of the window has upgraded.
        let mut enforce_coinbase_height = height >= params.bip34_height;
        if !enforce_coinbase_height
            && version >= 2
            && self
                .db
                .is_super_majority(2, params.majority_enforce_upgrade, prev)
                .await?
        {
            enforce_coinbase_height = true;
        }
        if enforce_coinbase_height {
            match block.bip34_block_height() {
                Ok(found) if found == u64::from(height) => {}
                _ => return Err(ValidationError::invalid("bad-cb-height", 100).into()),
            }
        }

        if flags.segwit {
            if !block.check_witness_commitment() {
                return Err(ValidationError::invalid("bad-witness-merkle-match", 100).into());
            }
        } else {
            let has_witness = block
                .txdata
                .iter()
                .any(|tx| tx.input.iter().any(|input| !input.witness.is_empty()));
            if has_witness {
                return Err(ValidationError::invalid("unexpected-witness", 100).into());
            }
        }

        let time_cutoff = if flags.mtp_locktime {
            mtp
        } else {
            block.header.time
        };
        for tx in &block.txdata {
            if !is_final(tx, height, time_cutoff) {
                return Err(ValidationError::invalid("bad-txns-nonfinal", 10).into());
            }
        }

        Ok(BlockContext {
            flags,
            verify_scripts,
        })
    }

    /// Expected compact target for the block after `prev`.
    async fn get_target(&self, prev: &Arc<ChainEntry>, time: u32) -> Result<u32, ChainError> {
        let params = self.params();
        let height = prev.height + 1;

        if params.no_retargeting {
            return Ok(prev.bits);
        }

        if height % params.retarget_interval != 0 {
            if params.allow_min_difficulty {
                // A block may drop to minimum difficulty once spacing has
                // doubled; otherwise inherit the last real target.
                if time > prev.time + params.target_spacing * 2 {
                    return Ok(params.pow_limit_bits);
                }
                let mut walk = prev.clone();
                while !walk.is_genesis()
                    && walk.height % params.retarget_interval != 0
                    && walk.bits == params.pow_limit_bits
                {
                    walk = self
                        .db
                        .get_entry(&walk.prev_block)
                        .await?
                        .ok_or_else(|| ChainError::Format("broken ancestor chain".into()))?;
                }
                return Ok(walk.bits);
            }
            return Ok(prev.bits);
        }

        let first = self
            .db
            .get_ancestor(prev, height - params.retarget_interval)
            .await?;

        let mut timespan = prev.time.saturating_sub(first.time);
        timespan = timespan.clamp(params.target_timespan / 4, params.target_timespan * 4);

        let old_target = Target::from_compact(bitcoin::CompactTarget::from_consensus(prev.bits));
        let old = BigUint::from_bytes_be(&old_target.to_be_bytes());
        let adjusted = old * BigUint::from(timespan) / BigUint::from(params.target_timespan);

        let limit = BigUint::from_bytes_be(&params.pow_limit.to_be_bytes());
        if adjusted > limit {
            return Ok(params.pow_limit_bits);
        }

        let bytes = adjusted.to_bytes_be();
        let mut be = [0u8; 32];
        be[32 - bytes.len()..].copy_from_slice(&bytes);
        let new_target = Target::from_be_bytes(be);
        Ok(new_target.to_compact_lossy().to_consensus())
    }

    /// Resolve, verify and apply every transaction of a block against a
    /// fresh coin view. Nothing is persisted here; any failure leaves disk
    /// untouched.
    async fn verify_block_txs(
        &self,
        entry: &ChainEntry,
        block: &Block,
        prev: &Arc<ChainEntry>,
        ctx: &BlockContext,
    ) -> Result<CoinView, ChainError> {
        let params = self.params();
        let height = entry.height;
        let mut view = self.db.get_coin_view(block).await?;

        let mut sigops_cost = 0usize;
        let mut fees = 0u64;

        for (index, tx) in block.txdata.iter().enumerate() {
            if index > 0 {
                if !view.fill_coins(tx) {
                    return Err(
                        ValidationError::invalid("bad-txns-inputs-missingorspent", 100).into(),
                    );
                }

                let fee = check_inputs(tx, &view, height, params.coinbase_maturity)?;
                fees = fees.saturating_add(fee);

                if ctx.flags.sequence_locks
                    && !verify_sequence_locks(&self.db, prev, tx, &view, height).await?
                {
                    return Err(ValidationError::new(
                        "non-BIP68-final",
                        "bad-txns-nonfinal",
                        100,
                    )
                    .into());
                }
            }

            sigops_cost += tx.total_sigop_cost(|outpoint: &OutPoint| {
                view.get(outpoint).ok().flatten().map(|coin| coin.output)
            });
            if sigops_cost > params.max_block_sigops_cost as usize {
                return Err(ValidationError::invalid("bad-blk-sigops", 100).into());
            }

            if index > 0 && ctx.verify_scripts {
                let mut spent: HashMap<OutPoint, TxOut> = tx
                    .input
                    .iter()
                    .filter_map(|input| {
                        view.get(&input.previous_output)
                            .ok()
                            .flatten()
                            .map(|coin| (input.previous_output, coin.output))
                    })
                    .collect();

                tx.verify_with_flags(
                    |outpoint: &OutPoint| spent.remove(outpoint),
                    ctx.flags.script_flags,
                )
                .map_err(|err| {
                    debug!(txid = %tx.compute_txid(), ?err, "script verification failed");
                    ValidationError::new(
                        "mandatory-script-verify-flag",
                        "mandatory-script-verify-flag-failed",
                        100,
                    )
                })?;
            }

            if index > 0 {
                for input in &tx.input {
                    view.spend(&input.previous_output)?;
                }
            }
            view.add_tx(tx, height);
        }

        let reward = fees.saturating_add(params.get_block_subsidy(height));
        let coinbase_out: u64 = block.txdata[0]
            .output
            .iter()
            .map(|o| o.value.to_sat())
            .sum();
        if coinbase_out > reward {
            return Err(ValidationError::invalid("bad-cb-amount", 100).into());
        }

        Ok(view)
    }

    // ---- connection ----------------------------------------------------

    async fn connect(
        &self,
        entry: &ChainEntry,
        block: &Block,
        prev: &Arc<ChainEntry>,
        ctx: &BlockContext,
    ) -> Result<(), ChainError> {
        let view = match self.verify_block_txs(entry, block, prev, ctx).await {
            Ok(view) => view,
            Err(err) => {
                if err.verification().is_some_and(|v| v.is_ban_worthy()) {
                    self.invalid.insert(entry.hash);
                }
                return Err(err);
            }
        };

        self.db.save(entry, block, Some(&view), true).await?;

        self.events.emit(ChainEvent::Connect {
            entry: Arc::new(entry.clone()),
            block: Arc::new(block.clone()),
        });
        Ok(())
    }

    /// Switch the main chain to the branch ending in `target`, which has
    /// already been stored as a side chain.
    async fn reorganize(&self, target: &ChainEntry) -> Result<(), ChainError> {
        let tip = self.db.tip().await?;
        let old_tip = tip.hash;
        let target_entry = self
            .db
            .get_entry(&target.hash)
            .await?
            .ok_or_else(|| ChainError::Format("reorg target not stored".into()))?;
        let fork = self.db.find_fork(&tip, &target_entry).await?;

        warn!(
            fork_height = fork.height,
            old_tip = %old_tip,
            new_tip = %target.hash,
            "chain reorganization"
        );

        // Disconnect the old branch down to the fork, remembering the
        // blocks so a failed switch can be rolled back.
        let mut disconnected: Vec<(Arc<ChainEntry>, Block)> = Vec::new();
        let mut current = tip;
        while current.hash != fork.hash {
            let (block, _view) = self.db.disconnect(&current).await?;
            self.events.emit(ChainEvent::Disconnect {
                entry: current.clone(),
                block: Arc::new(block.clone()),
            });
            disconnected.push((current.clone(), block));
            current = self
                .db
                .get_entry(&current.prev_block)
                .await?
                .ok_or_else(|| ChainError::Format("broken ancestor chain".into()))?;
        }

        // New branch, fork (exclusive) to target, oldest first.
        let mut branch = Vec::new();
        let mut walk = target_entry;
        while walk.hash != fork.hash {
            branch.push(walk.clone());
            walk = self
                .db
                .get_entry(&walk.prev_block)
                .await?
                .ok_or_else(|| ChainError::Format("broken ancestor chain".into()))?;
        }
        branch.reverse();

        let mut prev = fork.clone();
        for entry in &branch {
            let block = match self.db.get_block(&entry.hash).await? {
                Some(block) => block,
                None => {
                    self.rollback(&fork, &disconnected).await?;
                    return Err(ChainError::ReorgTooDeep(entry.hash));
                }
            };

            match self.reconnect_one(entry, &block, &prev).await {
                Ok(()) => prev = entry.clone(),
                Err(err) => {
                    warn!(hash = %entry.hash, %err, "invalid block on new branch, rolling back");
                    self.invalid.insert(entry.hash);
                    self.rollback(&fork, &disconnected).await?;
                    return Err(err);
                }
            }
        }

        info!(
            depth = disconnected.len(),
            connected = branch.len(),
            new_tip = %target.hash,
            "reorganization complete"
        );
        self.events.emit(ChainEvent::Reorg {
            old_tip,
            new_tip: target.hash,
        });
        Ok(())
    }

    async fn reconnect_one(
        &self,
        entry: &Arc<ChainEntry>,
        block: &Block,
        prev: &Arc<ChainEntry>,
    ) -> Result<(), ChainError> {
        let ctx = self.verify_context(block, prev).await?;
        let view = self.verify_block_txs(entry, block, prev, &ctx).await?;
        self.db.reconnect(entry, block, &view).await?;

        self.events.emit(ChainEvent::Connect {
            entry: entry.clone(),
            block: Arc::new(block.clone()),
        });
        Ok(())
    }

    /// Restore the old branch after a failed switch. The blocks were valid
    /// when first connected, so re-verification cannot fail here short of
    /// store corruption.
    async fn rollback(
        &self,
        fork: &Arc<ChainEntry>,
        disconnected: &[(Arc<ChainEntry>, Block)],
    ) -> Result<(), ChainError> {
        let mut current = self.db.tip().await?;
        while current.hash != fork.hash {
            let (block, _view) = self.db.disconnect(&current).await?;
            self.events.emit(ChainEvent::Disconnect {
                entry: current.clone(),
                block: Arc::new(block.clone()),
            });
            current = self
                .db
                .get_entry(&current.prev_block)
                .await?
                .ok_or_else(|| ChainError::Format("broken ancestor chain".into()))?;
        }

        for (entry, block) in disconnected.iter().rev() {
            let prev = self
                .db
                .get_entry(&entry.prev_block)
                .await?
                .ok_or_else(|| ChainError::Format("broken ancestor chain".into()))?;
            self.reconnect_one(entry, block, &prev).await?;
        }
        Ok(())
    }

    // ---- orphans -------------------------------------------------------

    fn store_orphan(&self, block: Block) {
        if self.orphan_index.len() >= self.config.max_orphans {
            self.evict_oldest_orphan();
        }

        let hash = block.block_hash();
        let prev = block.header.prev_blockhash;
        warn!(%hash, parent = %prev, "orphan block parked");

        self.orphan_index.insert(hash, prev);
        self.orphans.entry(prev).or_default().push(OrphanBlock {
            block,
            received: Instant::now(),
        });
    }

    fn evict_oldest_orphan(&self) {
        let mut oldest: Option<(BlockHash, Instant, BlockHash)> = None;
        for entry in self.orphans.iter() {
            for orphan in entry.value() {
                let received = orphan.received;
                if oldest.as_ref().map_or(true, |(_, t, _)| received < *t) {
                    oldest = Some((*entry.key(), received, orphan.block.block_hash()));
                }
            }
        }

        let Some((parent, _, hash)) = oldest else {
            return;
        };

        let mut parent_empty = false;
        if let Some(mut list) = self.orphans.get_mut(&parent) {
            list.retain(|orphan| orphan.block.block_hash() != hash);
            parent_empty = list.is_empty();
        }
        if parent_empty {
            self.orphans.remove(&parent);
        }
        self.orphan_index.remove(&hash);
        debug!(%hash, "evicted oldest orphan block");
    }
}
