//! Storage layer: pluggable key/value backends, the compressed UTXO coin
//! codec and the block-local coin view used during block connection.

pub mod backend;
pub mod coin_view;
pub mod coins;
pub mod error;

pub use backend::{Backend, BatchOp, MemoryBackend, SledBackend, WriteBatch};
pub use coin_view::CoinView;
pub use coins::{Coin, Coins, UndoCoins, UNCONFIRMED_HEIGHT};
pub use error::StorageError;
