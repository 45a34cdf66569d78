//! Transaction pool.
//!
//! Admission control with the full fail-fast policy pipeline, bounded
//! orphan handling, fee-rate eviction with a rolling minimum, and
//! double-spend-aware synchronization against chain connects and
//! disconnects.

pub mod entry;
pub mod index;
pub mod policy;
pub mod pool;

pub use entry::{MempoolEntry, FREE_THRESHOLD};
pub use index::MempoolIndex;
pub use policy::{
    check_standard, get_min_fee, has_standard_inputs, MempoolOptions, FEE_HALFLIFE,
    MEMPOOL_EXPIRY,
};
pub use pool::{FeeSink, Mempool, MempoolEvent, MempoolInfo, TxStatus};
