use bitcoin::{Block, BlockHash};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::entry::ChainEntry;

/// Notifications emitted by the chain. During a reorganization the order is
/// every `Disconnect` from the old tip down to the fork, every `Connect` up
/// to the new tip, then a single `Reorg`.
#[derive(Debug, Clone)]
pub enum ChainEvent {
    /// A block was accepted (main chain or side chain).
    Block {
        entry: Arc<ChainEntry>,
        block: Arc<Block>,
    },
    /// A block became part of the main chain.
    Connect {
        entry: Arc<ChainEntry>,
        block: Arc<Block>,
    },
    /// A block was removed from the main chain.
    Disconnect {
        entry: Arc<ChainEntry>,
        block: Arc<Block>,
    },
    /// The main chain switched branches.
    Reorg {
        old_tip: BlockHash,
        new_tip: BlockHash,
    },
}

/// Broadcast fan-out for chain events. Send never blocks; subscribers that
/// fall behind miss events rather than stalling the chain worker.
pub struct ChainEvents {
    sender: broadcast::Sender<ChainEvent>,
}

impl ChainEvents {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChainEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ChainEvent) {
        // An error only means there are no subscribers right now.
        let _ = self.sender.send(event);
    }
}

impl Default for ChainEvents {
    fn default() -> Self {
        Self::new(1024)
    }
}
