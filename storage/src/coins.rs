//! Compressed per-transaction UTXO bundles.
//!
//! All unspent outputs of one transaction are stored as a single record:
//! a varint version, a `(height << 1) | coinbase` code word, then one entry
//! per output. Spent outputs collapse to a single `0xFF` byte; pubkey-hash
//! and script-hash outputs compress to a one-byte prefix plus the 20-byte
//! hash; everything else is stored as a length-prefixed script. Decoding is
//! deferred: the initial scan only records entry offsets into the shared
//! buffer, so reading one coin out of a many-output bundle never touches the
//! other entries.

use bitcoin::consensus::encode::{deserialize_partial, serialize, VarInt};
use bitcoin::{Amount, OutPoint, ScriptBuf, Transaction, TxOut, Txid};
use std::sync::Arc;

use crate::error::StorageError;

/// Height code for coins that are not yet in a block.
pub const UNCONFIRMED_HEIGHT: u32 = 0x7fff_ffff;

const SLOT_SPENT: u8 = 0xff;
const PREFIX_RAW: u8 = 0;
const PREFIX_PUBKEY_HASH: u8 = 1;
const PREFIX_SCRIPT_HASH: u8 = 2;

/// One unspent output, resolved with its confirmation context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coin {
    pub version: i32,
    pub height: u32,
    pub coinbase: bool,
    pub output: TxOut,
}

impl Coin {
    pub fn is_confirmed(&self) -> bool {
        self.height != UNCONFIRMED_HEIGHT
    }

    pub fn value(&self) -> Amount {
        self.output.value
    }

    /// Whether a spend at `height` satisfies coinbase maturity.
    pub fn is_mature(&self, height: u32, maturity: u32) -> bool {
        if !self.coinbase {
            return true;
        }
        if !self.is_confirmed() {
            return false;
        }
        height.saturating_sub(self.height) >= maturity
    }
}

#[derive(Debug, Clone)]
enum CoinSlot {
    Spent,
    Cached(TxOut),
    /// Entry bytes `[offset, offset + len)` in the shared raw buffer,
    /// decoded on demand.
    Deferred { offset: usize, len: usize },
}

/// All unspent outputs of one transaction.
#[derive(Debug, Clone)]
pub struct Coins {
    pub version: i32,
    pub hash: Txid,
    pub height: u32,
    pub coinbase: bool,
    slots: Vec<CoinSlot>,
    raw: Option<Arc<[u8]>>,
}

impl Coins {
    pub fn new(hash: Txid, version: i32, height: u32, coinbase: bool) -> Self {
        Self {
            version,
            hash,
            height,
            coinbase,
            slots: Vec::new(),
            raw: None,
        }
    }

    /// Bundle for a freshly seen transaction. Provably unspendable outputs
    /// are recorded as already spent so they never enter the UTXO set.
    pub fn from_tx(tx: &Transaction, height: u32) -> Self {
        let slots = tx
            .output
            .iter()
            .map(|output| {
                if output.script_pubkey.is_op_return() {
                    CoinSlot::Spent
                } else {
                    CoinSlot::Cached(output.clone())
                }
            })
            .collect();

        Self {
            version: tx.version.0,
            hash: tx.compute_txid(),
            height,
            coinbase: tx.is_coinbase(),
            slots,
            raw: None,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots
            .iter()
            .all(|slot| matches!(slot, CoinSlot::Spent))
    }

    /// Count of outputs still unspent.
    pub fn unspent(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| !matches!(slot, CoinSlot::Spent))
            .count()
    }

    pub fn has(&self, index: u32) -> bool {
        !matches!(
            self.slots.get(index as usize),
            None | Some(CoinSlot::Spent)
        )
    }

    /// Resolve one output, decoding its entry on demand.
    pub fn get(&self, index: u32) -> Result<Option<Coin>, StorageError> {
        match self.slots.get(index as usize) {
            None | Some(CoinSlot::Spent) => Ok(None),
            Some(CoinSlot::Cached(output)) => Ok(Some(self.make_coin(output.clone()))),
            Some(CoinSlot::Deferred { offset, .. }) => {
                let raw = self
                    .raw
                    .as_ref()
                    .expect("deferred slot without raw buffer");
                let mut off = *offset;
                let output = decode_output_entry(raw, &mut off)?;
                Ok(Some(self.make_coin(output)))
            }
        }
    }

    /// Remove and return one output.
    pub fn spend(&mut self, index: u32) -> Result<Option<Coin>, StorageError> {
        let coin = self.get(index)?;
        if coin.is_some() {
            self.slots[index as usize] = CoinSlot::Spent;
        }
        Ok(coin)
    }

    /// Re-insert an output, growing the bundle with spent slots as needed.
    /// Used when undo records are pushed back during disconnect.
    pub fn add(&mut self, index: u32, output: TxOut) {
        let index = index as usize;
        while self.slots.len() <= index {
            self.slots.push(CoinSlot::Spent);
        }
        self.slots[index] = CoinSlot::Cached(output);
    }

    fn make_coin(&self, output: TxOut) -> Coin {
        Coin {
            version: self.version,
            height: self.height,
            coinbase: self.coinbase,
            output,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + self.slots.len() * 32);
        buf.extend_from_slice(&serialize(&VarInt(self.version as u32 as u64)));
        let code = (self.height << 1) | u32::from(self.coinbase);
        buf.extend_from_slice(&code.to_le_bytes());

        for slot in &self.slots {
            match slot {
                CoinSlot::Spent => buf.push(SLOT_SPENT),
                CoinSlot::Cached(output) => encode_output_entry(&mut buf, output),
                CoinSlot::Deferred { offset, len } => {
                    let raw = self
                        .raw
                        .as_ref()
                        .expect("deferred slot without raw buffer");
                    buf.extend_from_slice(&raw[*offset..*offset + *len]);
                }
            }
        }
        buf
    }

    /// Decode a bundle, capturing entry offsets without building scripts.
    pub fn decode(hash: Txid, data: Arc<[u8]>) -> Result<Self, StorageError> {
        let mut off = 0usize;
        let (version, used) = read_varint(&data, off)?;
        off += used;

        let code_bytes: [u8; 4] = data
            .get(off..off + 4)
            .ok_or_else(|| StorageError::corrupt("truncated coins header"))?
            .try_into()
            .expect("slice length checked");
        off += 4;
        let code = u32::from_le_bytes(code_bytes);
        let height = code >> 1;
        let coinbase = code & 1 == 1;

        let mut slots = Vec::new();
        while off < data.len() {
            if data[off] == SLOT_SPENT {
                slots.push(CoinSlot::Spent);
                off += 1;
                continue;
            }
            let start = off;
            skip_output_entry(&data, &mut off)?;
            slots.push(CoinSlot::Deferred {
                offset: start,
                len: off - start,
            });
        }

        Ok(Self {
            version: version as u32 as i32,
            hash,
            height,
            coinbase,
            slots,
            raw: Some(data),
        })
    }
}

/// Pre-spend coin states for one block, sufficient to reverse its UTXO
/// mutation. Each item carries its outpoint so restoration is
/// order-independent.
#[derive(Debug, Clone, Default)]
pub struct UndoCoins {
    items: Vec<(OutPoint, Coin)>,
}

impl UndoCoins {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, prevout: OutPoint, coin: Coin) {
        self.items.push((prevout, coin));
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn items(&self) -> &[(OutPoint, Coin)] {
        &self.items
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.items.len() * 64);
        buf.extend_from_slice(&serialize(&VarInt(self.items.len() as u64)));
        for (prevout, coin) in &self.items {
            buf.extend_from_slice(prevout.txid.as_ref());
            buf.extend_from_slice(&prevout.vout.to_le_bytes());
            buf.extend_from_slice(&serialize(&VarInt(coin.version as u32 as u64)));
            let code = (coin.height << 1) | u32::from(coin.coinbase);
            buf.extend_from_slice(&code.to_le_bytes());
            encode_output_entry(&mut buf, &coin.output);
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, StorageError> {
        use bitcoin::hashes::Hash;

        let mut off = 0usize;
        let (count, used) = read_varint(data, off)?;
        off += used;

        let mut items = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let txid_bytes: [u8; 32] = data
                .get(off..off + 32)
                .ok_or_else(|| StorageError::corrupt("truncated undo txid"))?
                .try_into()
                .expect("slice length checked");
            off += 32;
            let vout_bytes: [u8; 4] = data
                .get(off..off + 4)
                .ok_or_else(|| StorageError::corrupt("truncated undo vout"))?
                .try_into()
                .expect("slice length checked");
            off += 4;

            let (version, used) = read_varint(data, off)?;
            off += used;
            let code_bytes: [u8; 4] = data
                .get(off..off + 4)
                .ok_or_else(|| StorageError::corrupt("truncated undo code"))?
                .try_into()
                .expect("slice length checked");
            off += 4;
            let code = u32::from_le_bytes(code_bytes);
            let output = decode_output_entry(data, &mut off)?;

            items.push((
                OutPoint {
                    txid: Txid::from_byte_array(txid_bytes),
                    vout: u32::from_le_bytes(vout_bytes),
                },
                Coin {
                    version: version as u32 as i32,
                    height: code >> 1,
                    coinbase: code & 1 == 1,
                    output,
                },
            ));
        }

        Ok(Self { items })
    }
}

fn read_varint(data: &[u8], off: usize) -> Result<(u64, usize), StorageError> {
    let slice = data
        .get(off..)
        .ok_or_else(|| StorageError::corrupt("truncated varint"))?;
    let (vi, used) = deserialize_partial::<VarInt>(slice)
        .map_err(|e| StorageError::corrupt(format!("bad varint: {e}")))?;
    Ok((vi.0, used))
}

fn encode_output_entry(buf: &mut Vec<u8>, output: &TxOut) {
    let script = output.script_pubkey.as_bytes();
    if output.script_pubkey.is_p2pkh() {
        buf.push(PREFIX_PUBKEY_HASH);
        buf.extend_from_slice(&script[3..23]);
    } else if output.script_pubkey.is_p2sh() {
        buf.push(PREFIX_SCRIPT_HASH);
        buf.extend_from_slice(&script[2..22]);
    } else {
        buf.push(PREFIX_RAW);
        buf.extend_from_slice(&serialize(&VarInt(script.len() as u64)));
        buf.extend_from_slice(script);
    }
    buf.extend_from_slice(&serialize(&VarInt(output.value.to_sat())));
}

fn decode_output_entry(data: &[u8], off: &mut usize) -> Result<TxOut, StorageError> {
    let prefix = *data
        .get(*off)
        .ok_or_else(|| StorageError::corrupt("truncated coin entry"))?;
    *off += 1;

    let script_pubkey = match prefix {
        PREFIX_RAW => {
            let (len, used) = read_varint(data, *off)?;
            *off += used;
            let end = *off + len as usize;
            let bytes = data
                .get(*off..end)
                .ok_or_else(|| StorageError::corrupt("truncated coin script"))?
                .to_vec();
            *off = end;
            ScriptBuf::from_bytes(bytes)
        }
        PREFIX_PUBKEY_HASH => {
            let hash = data
                .get(*off..*off + 20)
                .ok_or_else(|| StorageError::corrupt("truncated pubkey hash"))?;
            *off += 20;
            pubkey_hash_script(hash)
        }
        PREFIX_SCRIPT_HASH => {
            let hash = data
                .get(*off..*off + 20)
                .ok_or_else(|| StorageError::corrupt("truncated script hash"))?;
            *off += 20;
            script_hash_script(hash)
        }
        other => {
            return Err(StorageError::corrupt(format!(
                "unknown coin entry prefix {other}"
            )))
        }
    };

    let (value, used) = read_varint(data, *off)?;
    *off += used;

    Ok(TxOut {
        value: Amount::from_sat(value),
        script_pubkey,
    })
}

/// Skip one output entry, validating structure but building no script.
fn skip_output_entry(data: &[u8], off: &mut usize) -> Result<(), StorageError> {
    let prefix = *data
        .get(*off)
        .ok_or_else(|| StorageError::corrupt("truncated coin entry"))?;
    *off += 1;

    match prefix {
        PREFIX_RAW => {
            let (len, used) = read_varint(data, *off)?;
            *off += used;
            let end = *off + len as usize;
            if data.get(*off..end).is_none() {
                return Err(StorageError::corrupt("truncated coin script"));
            }
            *off = end;
        }
        PREFIX_PUBKEY_HASH | PREFIX_SCRIPT_HASH => {
            if data.get(*off..*off + 20).is_none() {
                return Err(StorageError::corrupt("truncated coin hash"));
            }
            *off += 20;
        }
        other => {
            return Err(StorageError::corrupt(format!(
                "unknown coin entry prefix {other}"
            )))
        }
    }

    let (_, used) = read_varint(data, *off)?;
    *off += used;
    Ok(())
}

fn pubkey_hash_script(hash: &[u8]) -> ScriptBuf {
    let mut bytes = Vec::with_capacity(25);
    bytes.extend_from_slice(&[0x76, 0xa9, 0x14]);
    bytes.extend_from_slice(hash);
    bytes.extend_from_slice(&[0x88, 0xac]);
    ScriptBuf::from_bytes(bytes)
}

fn script_hash_script(hash: &[u8]) -> ScriptBuf {
    let mut bytes = Vec::with_capacity(23);
    bytes.extend_from_slice(&[0xa9, 0x14]);
    bytes.extend_from_slice(hash);
    bytes.push(0x87);
    ScriptBuf::from_bytes(bytes)
}
