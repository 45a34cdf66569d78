//! BIP9 version-bits deployment tracking and script-flag assembly.
//!
//! Threshold states advance only at miner-window boundaries, so results are
//! cached per `(bit, boundary hash)` and the walk back terminates at the
//! first cached or pre-start boundary.

use bitcoin::BlockHash;
use bitcoinconsensus::{
    VERIFY_CHECKLOCKTIMEVERIFY, VERIFY_CHECKSEQUENCEVERIFY, VERIFY_DERSIG, VERIFY_NONE,
    VERIFY_NULLDUMMY, VERIFY_P2SH, VERIFY_WITNESS,
};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tracing::debug;

use crate::db::ChainDB;
use crate::entry::{ChainEntry, VERSION_TOP_BITS};
use crate::error::ChainError;
use crate::params::{Deployment, DEPLOYMENT_CSV, DEPLOYMENT_SEGWIT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdState {
    Defined,
    Started,
    LockedIn,
    Active,
    Failed,
}

/// Verification context derived from activation heights and deployment
/// states for one block.
#[derive(Debug, Clone, Copy)]
pub struct BlockFlags {
    /// libbitcoinconsensus script verification flags.
    pub script_flags: u32,
    /// Evaluate absolute locktimes against median-time-past (BIP113).
    pub mtp_locktime: bool,
    /// Enforce BIP68 relative locks.
    pub sequence_locks: bool,
    /// Segwit deployment is active.
    pub segwit: bool,
}

/// Script flags a loose transaction must satisfy to be relayed.
pub fn standard_verify_flags() -> u32 {
    VERIFY_P2SH
        | VERIFY_DERSIG
        | VERIFY_NULLDUMMY
        | VERIFY_CHECKLOCKTIMEVERIFY
        | VERIFY_CHECKSEQUENCEVERIFY
        | VERIFY_WITNESS
}

/// Flags whose failure is ban-worthy rather than merely nonstandard.
pub fn mandatory_verify_flags() -> u32 {
    VERIFY_P2SH
}

/// Blocks validated with historical flag exceptions (BIP16 and taproot
/// activation oddities).
fn script_flag_exceptions() -> &'static HashMap<BlockHash, u32> {
    static EXCEPTIONS: OnceLock<HashMap<BlockHash, u32>> = OnceLock::new();
    EXCEPTIONS.get_or_init(|| {
        let mut map = HashMap::new();
        map.insert(
            "00000000000002dc756eebf4f49723ed8d30cc28a5f108eb94b1ba88ac4f9c22"
                .parse()
                .expect("hardcoded block hash"),
            VERIFY_NONE,
        );
        map.insert(
            "0000000000000000000f14c35b2d841e986ab5441de8c585d5ffe55ea1e395ad"
                .parse()
                .expect("hardcoded block hash"),
            VERIFY_P2SH | VERIFY_WITNESS,
        );
        map.insert(
            "00000000dd30457c001f4095d208cc1296b0eed002427aa599874af7a432b105"
                .parse()
                .expect("hardcoded block hash"),
            VERIFY_NONE,
        );
        map
    })
}

/// BIP9 state machine with per-boundary memoization.
#[derive(Default)]
pub struct VersionBits {
    cache: DashMap<(u8, BlockHash), ThresholdState>,
}

impl VersionBits {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deployment state for a block whose parent is `prev`.
    pub async fn state(
        &self,
        db: &ChainDB,
        prev: Option<&Arc<ChainEntry>>,
        deployment: &Deployment,
    ) -> Result<ThresholdState, ChainError> {
        let window = db.params().miner_window;
        let threshold = db.params().activation_threshold;

        // Walk back to the boundary entry ending the previous full window.
        let mut entry: Option<Arc<ChainEntry>> = match prev {
            None => None,
            Some(prev) => {
                let rem = (prev.height + 1) % window;
                if rem > prev.height {
                    None
                } else {
                    Some(db.get_ancestor(prev, prev.height - rem).await?)
                }
            }
        };

        let mut to_compute = Vec::new();
        let mut state = ThresholdState::Defined;

        while let Some(boundary) = entry {
            if let Some(cached) = self.cache.get(&(deployment.bit, boundary.hash)) {
                state = *cached;
                break;
            }

            let mtp = db.median_time_past(&boundary).await?;
            if mtp < deployment.start_time {
                self.cache
                    .insert((deployment.bit, boundary.hash), ThresholdState::Defined);
                break;
            }

            entry = if boundary.height >= window {
                Some(db.get_ancestor(&boundary, boundary.height - window).await?)
            } else {
                None
            };
            to_compute.push(boundary);
        }

        while let Some(boundary) = to_compute.pop() {
            state = match state {
                ThresholdState::Defined => {
                    let mtp = db.median_time_past(&boundary).await?;
                    if mtp >= deployment.timeout {
                        ThresholdState::Failed
                    } else if mtp >= deployment.start_time {
                        ThresholdState::Started
                    } else {
                        ThresholdState::Defined
                    }
                }
                ThresholdState::Started => {
                    let mtp = db.median_time_past(&boundary).await?;
                    if mtp >= deployment.timeout {
                        ThresholdState::Failed
                    } else {
                        let count = self
                            .count_signalling(db, &boundary, deployment, window, threshold)
                            .await?;
                        if count >= threshold {
                            debug!(
                                deployment = deployment.name,
                                height = boundary.height,
                                "deployment locked in"
                            );
                            ThresholdState::LockedIn
                        } else {
                            ThresholdState::Started
                        }
                    }
                }
                ThresholdState::LockedIn => ThresholdState::Active,
                terminal @ (ThresholdState::Active | ThresholdState::Failed) => terminal,
            };
            self.cache.insert((deployment.bit, boundary.hash), state);
        }

        Ok(state)
    }

    async fn count_signalling(
        &self,
        db: &ChainDB,
        boundary: &Arc<ChainEntry>,
        deployment: &Deployment,
        window: u32,
        threshold: u32,
    ) -> Result<u32, ChainError> {
        let mut count = 0u32;
        let mut walk = boundary.clone();
        for _ in 0..window {
            if walk.has_bit(deployment.bit) {
                count += 1;
                if count >= threshold {
                    break;
                }
            }
            if walk.is_genesis() {
                break;
            }
            walk = db
                .get_entry(&walk.prev_block)
                .await?
                .ok_or_else(|| ChainError::Format("broken ancestor chain".into()))?;
        }
        Ok(count)
    }

    pub async fn is_active(
        &self,
        db: &ChainDB,
        prev: Option<&Arc<ChainEntry>>,
        name: &str,
    ) -> Result<bool, ChainError> {
        match db.params().deployment(name) {
            Some(deployment) => {
                let deployment = *deployment;
                Ok(self.state(db, prev, &deployment).await? == ThresholdState::Active)
            }
            None => Ok(false),
        }
    }

    /// Version field a miner building on `prev` should use: top bits plus
    /// every deployment currently signalling.
    pub async fn compute_block_version(
        &self,
        db: &ChainDB,
        prev: &Arc<ChainEntry>,
    ) -> Result<i32, ChainError> {
        let mut version = VERSION_TOP_BITS;
        let deployments = db.params().deployments.clone();
        for deployment in &deployments {
            let state = self.state(db, Some(prev), deployment).await?;
            if matches!(state, ThresholdState::Started | ThresholdState::LockedIn) {
                version |= 1 << deployment.bit;
            }
        }
        Ok(version as i32)
    }

    /// Assemble the verification context for the block at `prev.height + 1`.
    pub async fn block_flags(
        &self,
        db: &ChainDB,
        prev: &Arc<ChainEntry>,
        block_hash: &BlockHash,
    ) -> Result<BlockFlags, ChainError> {
        let params = db.params();
        let height = prev.height + 1;

        let csv = self.is_active(db, Some(prev), DEPLOYMENT_CSV).await?;
        let segwit = self.is_active(db, Some(prev), DEPLOYMENT_SEGWIT).await?;

        let mut script_flags = VERIFY_P2SH | VERIFY_WITNESS;
        if height >= params.bip66_height {
            script_flags |= VERIFY_DERSIG;
        }
        if height >= params.bip65_height {
            script_flags |= VERIFY_CHECKLOCKTIMEVERIFY;
        }
        if csv {
            script_flags |= VERIFY_CHECKSEQUENCEVERIFY;
        }
        if segwit {
            script_flags |= VERIFY_NULLDUMMY;
        }

        if let Some(exception) = script_flag_exceptions().get(block_hash) {
            script_flags = *exception;
        }

        Ok(BlockFlags {
            script_flags,
            mtp_locktime: csv,
            sequence_locks: csv,
            segwit,
        })
    }
}
