//! Blockchain state engine.
//!
//! The chain database ([`ChainDB`]) persists entries, blocks, the UTXO set
//! and undo records behind a pluggable key/value backend; the chain
//! ([`Chain`]) drives block connection, validation gating and
//! reorganization on top of it, emitting [`ChainEvent`]s for observers.

pub mod chain;
pub mod db;
pub mod deployments;
pub mod entry;
pub mod error;
pub mod events;
pub mod params;
pub mod verification;
pub mod work;

pub use chain::{BlockStatus, Chain, ChainConfig, ChainInfo};
pub use db::{ChainDB, ChainDbOptions, SCHEMA_VERSION};
pub use deployments::{standard_verify_flags, mandatory_verify_flags, BlockFlags, ThresholdState, VersionBits};
pub use entry::{ChainEntry, VERSION_TOP_BITS, VERSION_TOP_MASK};
pub use error::{ChainError, ValidationError};
pub use events::{ChainEvent, ChainEvents};
pub use params::{
    Deployment, NetworkParams, DEPLOYMENT_CSV, DEPLOYMENT_SEGWIT, DEPLOYMENT_TESTDUMMY,
    LOCKTIME_THRESHOLD, MAX_MONEY, MEDIAN_TIME_SPAN,
};
pub use work::ChainWork;
