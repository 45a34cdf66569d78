//! Persistent chain store.
//!
//! Single keyspace, partitioned by one-byte prefixes with big-endian
//! integer suffixes so height-keyed records are range-scannable:
//!
//! ```text
//! V                     schema version (u32 LE)
//! R                     tip hash
//! e[hash]               chain entry (header + height + chainwork)
//! h[hash]               height (u32 LE)
//! H[height]             main-chain hash at height
//! n[hash]               next main-chain hash
//! b[hash]               raw block (absent in SPV mode)
//! c[txid]               compressed coins bundle
//! u[hash]               undo coins for the block
//! q[height]             queued prune target
//! T / C (W variants)    optional address index
//! ```

use bitcoin::consensus::encode::{deserialize, serialize};
use bitcoin::hashes::Hash;
use bitcoin::{Block, BlockHash, MerkleBlock, OutPoint, Script, Txid};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::{debug, info, trace};

use storage::{Backend, Coin, CoinView, Coins, StorageError, UndoCoins, WriteBatch};

use crate::entry::ChainEntry;
use crate::error::ChainError;
use crate::params::{NetworkParams, MEDIAN_TIME_SPAN};

/// Bumped whenever a persisted record format changes.
pub const SCHEMA_VERSION: u32 = 1;

mod keys {
    use super::*;

    pub const VERSION: &[u8] = b"V";
    pub const TIP: &[u8] = b"R";

    pub fn entry(hash: &BlockHash) -> Vec<u8> {
        prefixed(b'e', hash.as_ref())
    }

    pub fn height(hash: &BlockHash) -> Vec<u8> {
        prefixed(b'h', hash.as_ref())
    }

    pub fn hash_by_height(height: u32) -> Vec<u8> {
        prefixed(b'H', &height.to_be_bytes())
    }

    pub fn next(hash: &BlockHash) -> Vec<u8> {
        prefixed(b'n', hash.as_ref())
    }

    pub fn block(hash: &BlockHash) -> Vec<u8> {
        prefixed(b'b', hash.as_ref())
    }

    pub fn coins(txid: &Txid) -> Vec<u8> {
        prefixed(b'c', txid.as_ref())
    }

    pub fn undo(hash: &BlockHash) -> Vec<u8> {
        prefixed(b'u', hash.as_ref())
    }

    pub fn prune(height: u32) -> Vec<u8> {
        prefixed(b'q', &height.to_be_bytes())
    }

    fn prefixed(prefix: u8, rest: &[u8]) -> Vec<u8> {
        let mut key = Vec::with_capacity(1 + rest.len());
        key.push(prefix);
        key.extend_from_slice(rest);
        key
    }

    /// Script-derived address key: 20-byte hashes use the bare `T`/`C`
    /// prefixes, 32-byte witness programs the `W` variants.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum AddrKey {
        Hash20([u8; 20]),
        Hash32([u8; 32]),
    }

    pub fn addr_key(script: &Script) -> Option<AddrKey> {
        let bytes = script.as_bytes();
        if script.is_p2pkh() {
            Some(AddrKey::Hash20(
                bytes[3..23].try_into().expect("template length"),
            ))
        } else if script.is_p2sh() || script.is_p2wpkh() {
            Some(AddrKey::Hash20(
                bytes[2..22].try_into().expect("template length"),
            ))
        } else if script.is_p2wsh() || script.is_p2tr() {
            Some(AddrKey::Hash32(
                bytes[2..34].try_into().expect("template length"),
            ))
        } else {
            None
        }
    }

    fn addr_prefixed(kind: u8, addr: &AddrKey) -> Vec<u8> {
        let mut key = Vec::with_capacity(2 + 32 + 36);
        match addr {
            AddrKey::Hash20(hash) => {
                key.push(kind);
                key.extend_from_slice(hash);
            }
            AddrKey::Hash32(hash) => {
                key.push(b'W');
                key.push(kind);
                key.extend_from_slice(hash);
            }
        }
        key
    }

    pub fn addr_tx(addr: &AddrKey, txid: &Txid) -> Vec<u8> {
        let mut key = addr_prefixed(b'T', addr);
        key.extend_from_slice(txid.as_ref());
        key
    }

    pub fn addr_tx_prefix(addr: &AddrKey) -> Vec<u8> {
        addr_prefixed(b'T', addr)
    }

    pub fn addr_coin(addr: &AddrKey, outpoint: &OutPoint) -> Vec<u8> {
        let mut key = addr_prefixed(b'C', addr);
        key.extend_from_slice(outpoint.txid.as_ref());
        key.extend_from_slice(&outpoint.vout.to_be_bytes());
        key
    }

    pub fn addr_coin_prefix(addr: &AddrKey) -> Vec<u8> {
        addr_prefixed(b'C', addr)
    }
}

#[derive(Debug, Clone)]
pub struct ChainDbOptions {
    /// Headers-and-coins only: block bodies are not stored.
    pub spv: bool,
    pub prune: bool,
    /// Blocks (and undo data) retained behind the tip when pruning.
    pub keep_blocks: u32,
    pub prune_after_height: u32,
    pub index_address: bool,
}

impl Default for ChainDbOptions {
    fn default() -> Self {
        Self {
            spv: false,
            prune: false,
            keep_blocks: 288,
            prune_after_height: 1000,
            index_address: false,
        }
    }
}

/// Persistent block/header/UTXO index with LRU-cached entry and coins
/// layers. All mutation happens through atomic batches; readers may run
/// concurrently with the single chain writer.
pub struct ChainDB {
    backend: Arc<dyn Backend>,
    params: NetworkParams,
    options: ChainDbOptions,
    tip: RwLock<BlockHash>,
    entry_cache: Mutex<LruCache<BlockHash, Arc<ChainEntry>>>,
    height_cache: Mutex<LruCache<u32, BlockHash>>,
    coin_cache: Mutex<LruCache<Txid, Arc<[u8]>>>,
}

impl ChainDB {
    /// Open the store, verifying the schema version and writing the
    /// network genesis state on first use.
    pub async fn open(
        backend: Arc<dyn Backend>,
        params: NetworkParams,
        options: ChainDbOptions,
    ) -> Result<Self, ChainError> {
        match backend.get(keys::VERSION)? {
            Some(raw) => {
                let found = raw
                    .as_slice()
                    .try_into()
                    .map(u32::from_le_bytes)
                    .map_err(|_| StorageError::corrupt("bad schema version record"))?;
                if found != SCHEMA_VERSION {
                    return Err(StorageError::Version {
                        found,
                        expected: SCHEMA_VERSION,
                    }
                    .into());
                }
            }
            None => backend.put(keys::VERSION, &SCHEMA_VERSION.to_le_bytes())?,
        }

        let cache_size = ((params.retarget_interval as usize + 1) * 2) + 100;
        let cache_size = NonZeroUsize::new(cache_size).expect("cache size is nonzero");
        let coin_cache_size = NonZeroUsize::new(100_000).expect("nonzero");

        let genesis_hash = params.genesis().block_hash();
        let db = Self {
            backend,
            params,
            options,
            tip: RwLock::new(genesis_hash),
            entry_cache: Mutex::new(LruCache::new(cache_size)),
            height_cache: Mutex::new(LruCache::new(cache_size)),
            coin_cache: Mutex::new(LruCache::new(coin_cache_size)),
        };

        match db.backend.get(keys::TIP)? {
            Some(raw) => {
                let hash = decode_hash(&raw)?;
                *db.tip.write() = hash;
                let tip = db
                    .get_entry(&hash)
                    .await?
                    .ok_or_else(|| StorageError::corrupt("tip entry missing"))?;
                info!(height = tip.height, %hash, "chain store opened");
            }
            None => {
                let genesis = db.params.genesis();
                let entry = ChainEntry::from_block_header(&genesis.header, None);
                let view = CoinView::new();
                db.save(&entry, &genesis, Some(&view), true).await?;
                info!(%genesis_hash, network = ?db.params.network, "initialized genesis state");
            }
        }

        Ok(db)
    }

    pub fn params(&self) -> &NetworkParams {
        &self.params
    }

    pub fn options(&self) -> &ChainDbOptions {
        &self.options
    }

    pub fn tip_hash(&self) -> BlockHash {
        *self.tip.read()
    }

    pub async fn tip(&self) -> Result<Arc<ChainEntry>, ChainError> {
        let hash = self.tip_hash();
        self.get_entry(&hash)
            .await?
            .ok_or_else(|| StorageError::corrupt("tip entry missing").into())
    }

    // ---- entries -------------------------------------------------------

    pub async fn get_entry(
        &self,
        hash: &BlockHash,
    ) -> Result<Option<Arc<ChainEntry>>, ChainError> {
        if let Some(entry) = self.entry_cache.lock().get(hash) {
            return Ok(Some(entry.clone()));
        }

        let Some(raw) = self.backend.get(&keys::entry(hash))? else {
            return Ok(None);
        };
        let entry = Arc::new(ChainEntry::decode(&raw)?);
        self.entry_cache.lock().put(*hash, entry.clone());
        Ok(Some(entry))
    }

    pub async fn has_entry(&self, hash: &BlockHash) -> Result<bool, ChainError> {
        if self.entry_cache.lock().contains(hash) {
            return Ok(true);
        }
        Ok(self.backend.has(&keys::entry(hash))?)
    }

    pub async fn get_entry_by_height(
        &self,
        height: u32,
    ) -> Result<Option<Arc<ChainEntry>>, ChainError> {
        let cached = self.height_cache.lock().get(&height).copied();
        let hash = match cached {
            Some(hash) => hash,
            None => {
                let Some(raw) = self.backend.get(&keys::hash_by_height(height))? else {
                    return Ok(None);
                };
                let hash = decode_hash(&raw)?;
                self.height_cache.lock().put(height, hash);
                hash
            }
        };
        self.get_entry(&hash).await
    }

    pub async fn get_height(&self, hash: &BlockHash) -> Result<Option<u32>, ChainError> {
        if let Some(entry) = self.entry_cache.lock().get(hash) {
            return Ok(Some(entry.height));
        }
        let Some(raw) = self.backend.get(&keys::height(hash))? else {
            return Ok(None);
        };
        let height = raw
            .as_slice()
            .try_into()
            .map(u32::from_le_bytes)
            .map_err(|_| StorageError::corrupt("bad height record"))?;
        Ok(Some(height))
    }

    pub async fn is_main_chain(&self, hash: &BlockHash) -> Result<bool, ChainError> {
        if *hash == self.tip_hash() {
            return Ok(true);
        }
        let Some(height) = self.get_height(hash).await? else {
            return Ok(false);
        };
        match self.backend.get(&keys::hash_by_height(height))? {
            Some(raw) => Ok(decode_hash(&raw)? == *hash),
            None => Ok(false),
        }
    }

    pub async fn get_next_hash(
        &self,
        hash: &BlockHash,
    ) -> Result<Option<BlockHash>, ChainError> {
        match self.backend.get(&keys::next(hash))? {
            Some(raw) => Ok(Some(decode_hash(&raw)?)),
            None => Ok(None),
        }
    }

    // ---- ancestors, locators, median time ------------------------------

    /// Ancestor of `entry` at `height`, using the height index when the
    /// entry is on the main chain and parent links otherwise.
    pub async fn get_ancestor(
        &self,
        entry: &ChainEntry,
        height: u32,
    ) -> Result<Arc<ChainEntry>, ChainError> {
        if height > entry.height {
            return Err(ChainError::Format(format!(
                "ancestor height {height} above entry height {}",
                entry.height
            )));
        }

        if self.is_main_chain(&entry.hash).await? {
            if let Some(ancestor) = self.get_entry_by_height(height).await? {
                return Ok(ancestor);
            }
        }

        let mut current = self
            .get_entry(&entry.hash)
            .await?
            .ok_or_else(|| ChainError::Format("entry not stored".into()))?;
        while current.height > height {
            current = self
                .get_entry(&current.prev_block)
                .await?
                .ok_or_else(|| ChainError::Format("broken ancestor chain".into()))?;
        }
        Ok(current)
    }

    /// Up to `max` ancestors starting at `entry` (inclusive), newest first.
    pub async fn get_ancestors(
        &self,
        entry: &ChainEntry,
        max: usize,
    ) -> Result<Vec<Arc<ChainEntry>>, ChainError> {
        let mut out = Vec::with_capacity(max);
        let mut current = self
            .get_entry(&entry.hash)
            .await?
            .ok_or_else(|| ChainError::Format("entry not stored".into()))?;
        loop {
            if out.len() >= max {
                break;
            }
            let genesis = current.is_genesis();
            out.push(current.clone());
            if genesis {
                break;
            }
            current = self
                .get_entry(&current.prev_block)
                .await?
                .ok_or_else(|| ChainError::Format("broken ancestor chain".into()))?;
        }
        Ok(out)
    }

    /// Median timestamp over `entry` and its ten ancestors.
    pub async fn median_time_past(&self, entry: &ChainEntry) -> Result<u32, ChainError> {
        let ancestors = self.get_ancestors(entry, MEDIAN_TIME_SPAN).await?;
        let mut times: Vec<u32> = ancestors.iter().map(|e| e.time).collect();
        times.sort_unstable();
        Ok(times[times.len() / 2])
    }

    /// Super-majority version check over the trailing majority window.
    pub async fn is_super_majority(
        &self,
        version: i32,
        required: u32,
        prev: &ChainEntry,
    ) -> Result<bool, ChainError> {
        let mut count = 0u32;
        let mut walk = self
            .get_entry(&prev.hash)
            .await?
            .ok_or_else(|| ChainError::Format("entry not stored".into()))?;
        for _ in 0..self.params.majority_window {
            if walk.version >= version {
                count += 1;
                if count >= required {
                    return Ok(true);
                }
            }
            if walk.is_genesis() {
                break;
            }
            walk = self
                .get_entry(&walk.prev_block)
                .await?
                .ok_or_else(|| ChainError::Format("broken ancestor chain".into()))?;
        }
        Ok(count >= required)
    }

    /// Block locator with exponential step-back, ending at genesis.
    pub async fn get_locator(
        &self,
        start: Option<BlockHash>,
    ) -> Result<Vec<BlockHash>, ChainError> {
        let hash = start.unwrap_or_else(|| self.tip_hash());
        let mut entry = match self.get_entry(&hash).await? {
            Some(entry) => entry,
            None => self.tip().await?,
        };

        let mut locator = Vec::with_capacity(32);
        let mut step = 1u32;
        loop {
            locator.push(entry.hash);
            if entry.is_genesis() {
                break;
            }
            if locator.len() >= 10 {
                step = step.saturating_mul(2);
            }
            let height = entry.height.saturating_sub(step);
            entry = self.get_ancestor(&entry, height).await?;
        }
        Ok(locator)
    }

    /// Last common ancestor of two stored entries.
    pub async fn find_fork(
        &self,
        a: &ChainEntry,
        b: &ChainEntry,
    ) -> Result<Arc<ChainEntry>, ChainError> {
        let mut a = self.get_ancestor(a, a.height.min(b.height)).await?;
        let mut b = self.get_ancestor(b, a.height.min(b.height)).await?;

        while a.hash != b.hash {
            if a.is_genesis() || b.is_genesis() {
                return Err(ChainError::Format("no common ancestor".into()));
            }
            a = self
                .get_entry(&a.prev_block)
                .await?
                .ok_or_else(|| ChainError::Format("broken ancestor chain".into()))?;
            b = self
                .get_entry(&b.prev_block)
                .await?
                .ok_or_else(|| ChainError::Format("broken ancestor chain".into()))?;
        }
        Ok(a)
    }

    // ---- blocks --------------------------------------------------------

    pub async fn get_block(&self, hash: &BlockHash) -> Result<Option<Block>, ChainError> {
        let Some(raw) = self.backend.get(&keys::block(hash))? else {
            return Ok(None);
        };
        let block = deserialize(&raw)
            .map_err(|e| StorageError::corrupt(format!("bad block record: {e}")))?;
        Ok(Some(block))
    }

    pub async fn has_block(&self, hash: &BlockHash) -> Result<bool, ChainError> {
        Ok(self.backend.has(&keys::block(hash))?)
    }

    /// Partial merkle tree for SPV consumers, covering the given txids.
    pub async fn get_merkle_block(
        &self,
        hash: &BlockHash,
        match_txids: &HashSet<Txid>,
    ) -> Result<Option<MerkleBlock>, ChainError> {
        let Some(block) = self.get_block(hash).await? else {
            return Ok(None);
        };
        Ok(Some(MerkleBlock::from_block_with_predicate(
            &block,
            |txid| match_txids.contains(txid),
        )))
    }

    // ---- coins ---------------------------------------------------------

    pub async fn get_raw_coins(&self, txid: &Txid) -> Result<Option<Arc<[u8]>>, ChainError> {
        if let Some(raw) = self.coin_cache.lock().get(txid) {
            return Ok(Some(raw.clone()));
        }
        let Some(raw) = self.backend.get(&keys::coins(txid))? else {
            return Ok(None);
        };
        let raw: Arc<[u8]> = raw.into();
        self.coin_cache.lock().put(*txid, raw.clone());
        Ok(Some(raw))
    }

    pub async fn get_coins(&self, txid: &Txid) -> Result<Option<Coins>, ChainError> {
        match self.get_raw_coins(txid).await? {
            Some(raw) => Ok(Some(Coins::decode(*txid, raw)?)),
            None => Ok(None),
        }
    }

    pub async fn has_coins(&self, txid: &Txid) -> Result<bool, ChainError> {
        if self.coin_cache.lock().contains(txid) {
            return Ok(true);
        }
        Ok(self.backend.has(&keys::coins(txid))?)
    }

    /// Resolve one coin without decoding its whole bundle.
    pub async fn read_coin(&self, prevout: &OutPoint) -> Result<Option<Coin>, ChainError> {
        match self.get_coins(&prevout.txid).await? {
            Some(coins) => Ok(coins.get(prevout.vout)?),
            None => Ok(None),
        }
    }

    /// Seed a view with every on-disk bundle the block references.
    pub async fn get_coin_view(&self, block: &Block) -> Result<CoinView, ChainError> {
        let mut view = CoinView::new();
        let mut seen = HashSet::new();
        for tx in block.txdata.iter().filter(|tx| !tx.is_coinbase()) {
            for input in &tx.input {
                let txid = input.previous_output.txid;
                if seen.insert(txid) {
                    if let Some(coins) = self.get_coins(&txid).await? {
                        view.add(coins);
                    }
                }
            }
        }
        Ok(view)
    }

    pub async fn get_undo_coins(&self, hash: &BlockHash) -> Result<UndoCoins, ChainError> {
        match self.backend.get(&keys::undo(hash))? {
            Some(raw) => Ok(UndoCoins::decode(&raw)?),
            None => Ok(UndoCoins::new()),
        }
    }

    /// View with the exact inputs the block saw when it was connected:
    /// current bundles plus the stored undo coins pushed back in.
    pub async fn get_undo_view(&self, block: &Block) -> Result<CoinView, ChainError> {
        let mut view = self.get_coin_view(block).await?;
        let undo = self.get_undo_coins(&block.block_hash()).await?;
        for (prevout, coin) in undo.items() {
            view.add_coin(*prevout, coin.clone());
        }
        Ok(view)
    }

    // ---- mutation ------------------------------------------------------

    /// Persist a block and its entry in one atomic batch. With `connect`,
    /// also advance the main chain: pointers, UTXO mutation, undo record
    /// and prune scheduling.
    pub async fn save(
        &self,
        entry: &ChainEntry,
        block: &Block,
        view: Option<&CoinView>,
        connect: bool,
    ) -> Result<(), ChainError> {
        let mut batch = WriteBatch::new();

        batch.put(keys::height(&entry.hash), entry.height.to_le_bytes().to_vec());
        batch.put(keys::entry(&entry.hash), entry.encode());
        if !self.options.spv {
            batch.put(keys::block(&entry.hash), serialize(block));
        }

        if connect {
            let view =
                view.ok_or_else(|| ChainError::Format("connect requires a coin view".into()))?;
            self.connect_batch(&mut batch, entry, block, view)?;
        }

        self.backend.write(batch)?;

        self.entry_cache
            .lock()
            .put(entry.hash, Arc::new(entry.clone()));
        if connect {
            *self.tip.write() = entry.hash;
            self.height_cache.lock().put(entry.height, entry.hash);
            trace!(height = entry.height, hash = %entry.hash, "block saved and connected");
        } else {
            debug!(height = entry.height, hash = %entry.hash, "block saved on side chain");
        }

        Ok(())
    }

    /// Re-attach an already stored side-chain block to the main chain.
    pub async fn reconnect(
        &self,
        entry: &ChainEntry,
        block: &Block,
        view: &CoinView,
    ) -> Result<(), ChainError> {
        let mut batch = WriteBatch::new();
        self.connect_batch(&mut batch, entry, block, view)?;
        self.backend.write(batch)?;

        *self.tip.write() = entry.hash;
        self.height_cache.lock().put(entry.height, entry.hash);
        debug!(height = entry.height, hash = %entry.hash, "block reconnected");
        Ok(())
    }

    fn connect_batch(
        &self,
        batch: &mut WriteBatch,
        entry: &ChainEntry,
        block: &Block,
        view: &CoinView,
    ) -> Result<(), ChainError> {
        batch.put(keys::next(&entry.prev_block), entry.hash.to_byte_array().to_vec());
        batch.put(
            keys::hash_by_height(entry.height),
            entry.hash.to_byte_array().to_vec(),
        );
        batch.put(keys::TIP, entry.hash.to_byte_array().to_vec());

        self.apply_view(batch, view);

        let undo = view.undo();
        if !undo.is_empty() {
            batch.put(keys::undo(&entry.hash), undo.encode());
        }

        if self.options.prune && entry.height >= self.options.prune_after_height {
            batch.put(
                keys::prune(entry.height + self.options.keep_blocks),
                entry.hash.to_byte_array().to_vec(),
            );
        }
        if self.options.prune {
            if let Some(raw) = self.backend.get(&keys::prune(entry.height))? {
                let target = decode_hash(&raw)?;
                debug!(height = entry.height, %target, "pruning block and undo data");
                batch.del(keys::block(&target));
                batch.del(keys::undo(&target));
                batch.del(keys::prune(entry.height));
            }
        }

        if self.options.index_address {
            self.index_block(batch, block, view.undo(), true);
        }

        Ok(())
    }

    fn apply_view(&self, batch: &mut WriteBatch, view: &CoinView) {
        let mut cache = self.coin_cache.lock();
        for coins in view.to_vec() {
            let key = keys::coins(&coins.hash);
            if coins.is_empty() {
                batch.del(key);
                cache.pop(&coins.hash);
            } else {
                let raw: Arc<[u8]> = coins.encode().into();
                batch.put(key, raw.to_vec());
                cache.put(coins.hash, raw);
            }
        }
    }

    /// Detach the tip block, pushing its undo coins back into the UTXO
    /// set. Returns the block and the resulting view for observers.
    pub async fn disconnect(
        &self,
        entry: &ChainEntry,
    ) -> Result<(Block, CoinView), ChainError> {
        let block = self
            .get_block(&entry.hash)
            .await?
            .ok_or(ChainError::ReorgTooDeep(entry.hash))?;
        let undo = self.get_undo_coins(&entry.hash).await?;

        let block_txids: HashSet<Txid> =
            block.txdata.iter().map(|tx| tx.compute_txid()).collect();

        let mut view = CoinView::new();
        // Bundles created by this block vanish entirely.
        for tx in &block.txdata {
            view.add(Coins::new(
                tx.compute_txid(),
                tx.version.0,
                entry.height,
                tx.is_coinbase(),
            ));
        }
        // Restore spent coins, except those created inside the block.
        for (prevout, coin) in undo.items() {
            if block_txids.contains(&prevout.txid) {
                continue;
            }
            if !view.has_entry(&prevout.txid) {
                let coins = match self.get_coins(&prevout.txid).await? {
                    Some(coins) => coins,
                    None => Coins::new(prevout.txid, coin.version, coin.height, coin.coinbase),
                };
                view.add(coins);
            }
            if let Some(bundle) = view.entry_mut(&prevout.txid) {
                bundle.add(prevout.vout, coin.output.clone());
            }
        }

        let mut batch = WriteBatch::new();
        batch.del(keys::next(&entry.prev_block));
        batch.del(keys::hash_by_height(entry.height));
        batch.put(keys::TIP, entry.prev_block.to_byte_array().to_vec());
        batch.del(keys::undo(&entry.hash));
        self.apply_view(&mut batch, &view);
        if self.options.index_address {
            self.index_block(&mut batch, &block, &undo, false);
        }

        self.backend.write(batch)?;

        *self.tip.write() = entry.prev_block;
        self.height_cache.lock().pop(&entry.height);
        debug!(height = entry.height, hash = %entry.hash, "block disconnected");

        Ok((block, view))
    }

    // ---- address index -------------------------------------------------

    fn index_block(
        &self,
        batch: &mut WriteBatch,
        block: &Block,
        undo: &UndoCoins,
        connect: bool,
    ) {
        let spent: std::collections::HashMap<OutPoint, &Coin> = undo
            .items()
            .iter()
            .map(|(prevout, coin)| (*prevout, coin))
            .collect();

        for tx in &block.txdata {
            let txid = tx.compute_txid();

            for (vout, output) in tx.output.iter().enumerate() {
                let Some(addr) = keys::addr_key(&output.script_pubkey) else {
                    continue;
                };
                let outpoint = OutPoint {
                    txid,
                    vout: vout as u32,
                };
                if connect {
                    batch.put(keys::addr_tx(&addr, &txid), Vec::new());
                    batch.put(keys::addr_coin(&addr, &outpoint), Vec::new());
                } else {
                    batch.del(keys::addr_tx(&addr, &txid));
                    batch.del(keys::addr_coin(&addr, &outpoint));
                }
            }

            for input in tx.input.iter().filter(|i| !i.previous_output.is_null()) {
                let Some(coin) = spent.get(&input.previous_output) else {
                    continue;
                };
                let Some(addr) = keys::addr_key(&coin.output.script_pubkey) else {
                    continue;
                };
                if connect {
                    batch.put(keys::addr_tx(&addr, &txid), Vec::new());
                    batch.del(keys::addr_coin(&addr, &input.previous_output));
                } else {
                    batch.del(keys::addr_tx(&addr, &txid));
                    batch.put(keys::addr_coin(&addr, &input.previous_output), Vec::new());
                }
            }
        }
    }

    /// Txids that ever funded or spent the given script (requires the
    /// address index).
    pub async fn get_tx_hashes_by_address(
        &self,
        script: &Script,
    ) -> Result<Vec<Txid>, ChainError> {
        let Some(addr) = keys::addr_key(script) else {
            return Ok(Vec::new());
        };
        let prefix = keys::addr_tx_prefix(&addr);
        let mut out = Vec::new();
        for (key, _) in self.backend.scan_prefix(&prefix)? {
            let tail = &key[prefix.len()..];
            let bytes: [u8; 32] = tail
                .try_into()
                .map_err(|_| StorageError::corrupt("bad address index key"))?;
            out.push(Txid::from_byte_array(bytes));
        }
        Ok(out)
    }

    /// Unspent outpoints currently held by the given script (requires the
    /// address index).
    pub async fn get_coins_by_address(
        &self,
        script: &Script,
    ) -> Result<Vec<OutPoint>, ChainError> {
        let Some(addr) = keys::addr_key(script) else {
            return Ok(Vec::new());
        };
        let prefix = keys::addr_coin_prefix(&addr);
        let mut out = Vec::new();
        for (key, _) in self.backend.scan_prefix(&prefix)? {
            let tail = &key[prefix.len()..];
            if tail.len() != 36 {
                return Err(StorageError::corrupt("bad address index key").into());
            }
            let txid_bytes: [u8; 32] = tail[..32].try_into().expect("slice length checked");
            let vout = u32::from_be_bytes(tail[32..].try_into().expect("slice length checked"));
            out.push(OutPoint {
                txid: Txid::from_byte_array(txid_bytes),
                vout,
            });
        }
        Ok(out)
    }
}

fn decode_hash(raw: &[u8]) -> Result<BlockHash, StorageError> {
    let bytes: [u8; 32] = raw
        .try_into()
        .map_err(|_| StorageError::corrupt("bad hash record"))?;
    Ok(BlockHash::from_byte_array(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::MemoryBackend;

    async fn open_regtest() -> (Arc<MemoryBackend>, ChainDB) {
        let backend = Arc::new(MemoryBackend::new());
        let db = ChainDB::open(
            backend.clone(),
            NetworkParams::regtest(),
            ChainDbOptions::default(),
        )
        .await
        .unwrap();
        (backend, db)
    }

    #[tokio::test]
    async fn open_initializes_genesis() {
        let (_backend, db) = open_regtest().await;

        let tip = db.tip().await.unwrap();
        assert_eq!(tip.height, 0);
        assert!(tip.is_genesis());
        assert_eq!(tip.hash, db.params().genesis().block_hash());
        assert!(db.is_main_chain(&tip.hash).await.unwrap());

        let by_height = db.get_entry_by_height(0).await.unwrap().unwrap();
        assert_eq!(by_height.hash, tip.hash);
    }

    #[tokio::test]
    async fn reopen_preserves_tip() {
        let (backend, db) = open_regtest().await;
        let tip = db.tip_hash();
        drop(db);

        let db = ChainDB::open(
            backend,
            NetworkParams::regtest(),
            ChainDbOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(db.tip_hash(), tip);
    }

    #[tokio::test]
    async fn schema_version_is_enforced() {
        let backend = Arc::new(MemoryBackend::new());
        backend.put(b"V", &99u32.to_le_bytes()).unwrap();

        let result = ChainDB::open(
            backend,
            NetworkParams::regtest(),
            ChainDbOptions::default(),
        )
        .await;
        assert!(matches!(
            result,
            Err(ChainError::Storage(StorageError::Version {
                found: 99,
                expected: SCHEMA_VERSION
            }))
        ));
    }

    #[tokio::test]
    async fn locator_starts_at_tip_and_ends_at_genesis() {
        let (_backend, db) = open_regtest().await;
        let locator = db.get_locator(None).await.unwrap();
        assert_eq!(locator.len(), 1);
        assert_eq!(locator[0], db.tip_hash());
    }

    #[tokio::test]
    async fn median_time_of_genesis_is_its_timestamp() {
        let (_backend, db) = open_regtest().await;
        let tip = db.tip().await.unwrap();
        let mtp = db.median_time_past(&tip).await.unwrap();
        assert_eq!(mtp, tip.time);
    }
}
