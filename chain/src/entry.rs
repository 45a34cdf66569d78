use bitcoin::block::{Header as BlockHeader, Version};
use bitcoin::consensus::encode::{deserialize, serialize};
use bitcoin::{BlockHash, CompactTarget, TxMerkleNode};
use storage::StorageError;

use crate::work::ChainWork;

/// Version-bits (BIP9) top bits marking a version field as bit-signalling.
pub const VERSION_TOP_BITS: u32 = 0x2000_0000;
pub const VERSION_TOP_MASK: u32 = 0xe000_0000;

/// Serialized size: 80-byte header + u32 height + 32-byte chainwork.
pub const ENTRY_SIZE: usize = 80 + 4 + 32;

/// One block header in the index, annotated with height and cumulative
/// chainwork. Chainwork is stored rather than recomputed so startup never
/// rescans the header chain. Entries are immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainEntry {
    pub hash: BlockHash,
    pub version: i32,
    pub prev_block: BlockHash,
    pub merkle_root: TxMerkleNode,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    pub height: u32,
    pub chainwork: ChainWork,
}

impl ChainEntry {
    /// Build the entry for `header` on top of `prev` (`None` for genesis).
    pub fn from_block_header(header: &BlockHeader, prev: Option<&ChainEntry>) -> Self {
        let proof = ChainWork::from_compact(header.bits);
        let (height, chainwork) = match prev {
            Some(prev) => (prev.height + 1, prev.chainwork.add(&proof)),
            None => (0, proof),
        };

        Self {
            hash: header.block_hash(),
            version: header.version.to_consensus(),
            prev_block: header.prev_blockhash,
            merkle_root: header.merkle_root,
            time: header.time,
            bits: header.bits.to_consensus(),
            nonce: header.nonce,
            height,
            chainwork,
        }
    }

    pub fn header(&self) -> BlockHeader {
        BlockHeader {
            version: Version::from_consensus(self.version),
            prev_blockhash: self.prev_block,
            merkle_root: self.merkle_root,
            time: self.time,
            bits: CompactTarget::from_consensus(self.bits),
            nonce: self.nonce,
        }
    }

    /// Proof contributed by this block alone.
    pub fn get_proof(&self) -> ChainWork {
        ChainWork::from_compact(CompactTarget::from_consensus(self.bits))
    }

    pub fn is_genesis(&self) -> bool {
        self.height == 0
    }

    /// BIP9 signalling check for a deployment bit.
    pub fn has_bit(&self, bit: u8) -> bool {
        let version = self.version as u32;
        (version & VERSION_TOP_MASK) == VERSION_TOP_BITS && (version & (1 << bit)) != 0
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ENTRY_SIZE);
        buf.extend_from_slice(&serialize(&self.header()));
        buf.extend_from_slice(&self.height.to_le_bytes());
        buf.extend_from_slice(&self.chainwork.to_be_bytes());
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, StorageError> {
        if data.len() != ENTRY_SIZE {
            return Err(StorageError::corrupt(format!(
                "chain entry record has {} bytes, expected {ENTRY_SIZE}",
                data.len()
            )));
        }

        let header: BlockHeader = deserialize(&data[..80])
            .map_err(|e| StorageError::corrupt(format!("bad entry header: {e}")))?;
        let height = u32::from_le_bytes(data[80..84].try_into().expect("slice length checked"));
        let chainwork = ChainWork::from_be_bytes(
            data[84..116].try_into().expect("slice length checked"),
        );

        Ok(Self {
            hash: header.block_hash(),
            version: header.version.to_consensus(),
            prev_block: header.prev_blockhash,
            merkle_root: header.merkle_root,
            time: header.time,
            bits: header.bits.to_consensus(),
            nonce: header.nonce,
            height,
            chainwork,
        })
    }
}
