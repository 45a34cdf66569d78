use bitcoin::blockdata::constants::genesis_block;
use bitcoin::{Block, BlockHash, CompactTarget, Network, Target};
use std::collections::BTreeMap;

use crate::error::ChainError;

pub const DEPLOYMENT_CSV: &str = "csv";
pub const DEPLOYMENT_SEGWIT: &str = "segwit";
pub const DEPLOYMENT_TESTDUMMY: &str = "testdummy";

/// Total satoshi supply cap.
pub const MAX_MONEY: u64 = 21_000_000 * 100_000_000;

/// Timestamps below this threshold in a locktime are block heights.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// Number of blocks over which median-time-past is computed.
pub const MEDIAN_TIME_SPAN: usize = 11;

/// One BIP9 version-bits deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deployment {
    pub name: &'static str,
    pub bit: u8,
    /// Median-time-past at which signalling may begin.
    pub start_time: u32,
    /// Median-time-past after which the deployment fails if not locked in.
    pub timeout: u32,
}

/// Consensus parameters for one network. The table is data, not code:
/// deployments, checkpoints and thresholds all live here so networks can
/// differ without touching the state machine.
#[derive(Debug, Clone)]
pub struct NetworkParams {
    pub network: Network,
    pub magic: u32,
    pub default_port: u16,
    pub dns_seeds: &'static [&'static str],

    pub pow_limit: Target,
    pub pow_limit_bits: u32,
    pub retarget_interval: u32,
    pub target_timespan: u32,
    pub target_spacing: u32,
    /// Never retarget (regtest).
    pub no_retargeting: bool,
    /// Allow min-difficulty blocks after 2x target spacing (testnet).
    pub allow_min_difficulty: bool,

    pub majority_window: u32,
    pub majority_enforce_upgrade: u32,
    pub majority_reject_outdated: u32,

    pub coinbase_maturity: u32,
    pub max_block_weight: u64,
    pub max_block_sigops_cost: u32,
    pub subsidy_halving_interval: u32,

    pub bip34_height: u32,
    pub bip65_height: u32,
    pub bip66_height: u32,

    /// Blocks that must signal within one miner window to lock a
    /// deployment in.
    pub activation_threshold: u32,
    /// BIP9 evaluation window size.
    pub miner_window: u32,
    pub deployments: Vec<Deployment>,

    pub checkpoints: BTreeMap<u32, BlockHash>,
}

fn hash(s: &str) -> BlockHash {
    s.parse().expect("hardcoded block hash")
}

fn mainnet_checkpoints() -> BTreeMap<u32, BlockHash> {
    let mut map = BTreeMap::new();
    map.insert(
        11111,
        hash("0000000069e244f73d78e8fd29ba2fd2ed618bd6fa2ee92559f542fdb26e7c1d"),
    );
    map.insert(
        33333,
        hash("000000002dd5588a74784eaa7ab0507a18ad16a236e7b1ce69f00d7ddfb5d0a6"),
    );
    map.insert(
        74000,
        hash("0000000000573993a3c9e41ce34471c079dcf5f52a0e824a81e7f953b8661a20"),
    );
    map.insert(
        105000,
        hash("00000000000291ce28027faea320c8d2b054b2e0fe44a773f3eefb151d6bdc97"),
    );
    map.insert(
        134444,
        hash("00000000000005b12ffd4cd315cd34ffd4a594f430ac814c91184a0d42d2b0fe"),
    );
    map.insert(
        168000,
        hash("000000000000099e61ea72015e79632f216fe6cb33d7899acb35b75c8303b763"),
    );
    map.insert(
        193000,
        hash("000000000000059f452a5f7340de6682a977387c17010ff6e6c3bd83ca8b1317"),
    );
    map.insert(
        216116,
        hash("00000000000001b4f4b433e81ee46494af945cf96014816a4e2370f11b23df4e"),
    );
    map.insert(
        250000,
        hash("000000000000003887df1f29024b06fc2200b55f8af8f35453d7be294df2d214"),
    );
    map.insert(
        295000,
        hash("00000000000000004d9b4ef50f0f9d686fd69db2e03af35a100370c64632a983"),
    );
    map
}

fn testnet_checkpoints() -> BTreeMap<u32, BlockHash> {
    let mut map = BTreeMap::new();
    map.insert(
        546,
        hash("000000002a936ca763904c3c35fce2f3556c559c0214345d31b1bcebf76acb70"),
    );
    map
}

impl NetworkParams {
    /// Parameters for a network selector string: `main`, `testnet`,
    /// `regtest` or `signet`.
    pub fn from_str(selector: &str) -> Result<Self, ChainError> {
        let network = match selector {
            "main" | "mainnet" => Network::Bitcoin,
            "testnet" | "test" => Network::Testnet,
            "regtest" => Network::Regtest,
            "signet" => Network::Signet,
            other => return Err(ChainError::UnknownNetwork(other.to_string())),
        };
        Ok(Self::from_network(network))
    }

    pub fn from_network(network: Network) -> Self {
        match network {
            Network::Testnet => Self::testnet(),
            Network::Regtest => Self::regtest(),
            Network::Signet => Self::signet(),
            _ => Self::mainnet(),
        }
    }

    pub fn mainnet() -> Self {
        Self {
            network: Network::Bitcoin,
            magic: 0xd9b4bef9,
            default_port: 8333,
            dns_seeds: &[
                "seed.bitcoin.sipa.be",
                "dnsseed.bluematt.me",
                "dnsseed.bitcoin.dashjr.org",
                "seed.bitcoinstats.com",
            ],
            pow_limit_bits: 0x1d00ffff,
            pow_limit: Target::from_compact(CompactTarget::from_consensus(0x1d00ffff)),
            retarget_interval: 2016,
            target_timespan: 14 * 24 * 60 * 60,
            target_spacing: 10 * 60,
            no_retargeting: false,
            allow_min_difficulty: false,
            majority_window: 1000,
            majority_enforce_upgrade: 750,
            majority_reject_outdated: 950,
            coinbase_maturity: 100,
            max_block_weight: 4_000_000,
            max_block_sigops_cost: 80_000,
            subsidy_halving_interval: 210_000,
            bip34_height: 227_931,
            bip65_height: 388_381,
            bip66_height: 363_725,
            activation_threshold: 1916,
            miner_window: 2016,
            deployments: vec![
                Deployment {
                    name: DEPLOYMENT_CSV,
                    bit: 0,
                    start_time: 1_462_060_800,
                    timeout: 1_493_596_800,
                },
                Deployment {
                    name: DEPLOYMENT_SEGWIT,
                    bit: 1,
                    start_time: 1_479_168_000,
                    timeout: 1_510_704_000,
                },
                Deployment {
                    name: DEPLOYMENT_TESTDUMMY,
                    bit: 28,
                    start_time: 1_199_145_601,
                    timeout: 1_230_767_999,
                },
            ],
            checkpoints: mainnet_checkpoints(),
        }
    }

    pub fn testnet() -> Self {
        Self {
            network: Network::Testnet,
            magic: 0x0709110b,
            default_port: 18333,
            dns_seeds: &[
                "testnet-seed.bitcoin.jonasschnelli.ch",
                "seed.tbtc.petertodd.org",
                "testnet-seed.bluematt.me",
            ],
            pow_limit_bits: 0x1d00ffff,
            pow_limit: Target::from_compact(CompactTarget::from_consensus(0x1d00ffff)),
            retarget_interval: 2016,
            target_timespan: 14 * 24 * 60 * 60,
            target_spacing: 10 * 60,
            no_retargeting: false,
            allow_min_difficulty: true,
            majority_window: 100,
            majority_enforce_upgrade: 51,
            majority_reject_outdated: 75,
            coinbase_maturity: 100,
            max_block_weight: 4_000_000,
            max_block_sigops_cost: 80_000,
            subsidy_halving_interval: 210_000,
            bip34_height: 21_111,
            bip65_height: 581_885,
            bip66_height: 330_776,
            activation_threshold: 1512,
            miner_window: 2016,
            deployments: vec![
                Deployment {
                    name: DEPLOYMENT_CSV,
                    bit: 0,
                    start_time: 1_456_790_400,
                    timeout: 1_493_596_800,
                },
                Deployment {
                    name: DEPLOYMENT_SEGWIT,
                    bit: 1,
                    start_time: 1_462_060_800,
                    timeout: 1_493_596_800,
                },
                Deployment {
                    name: DEPLOYMENT_TESTDUMMY,
                    bit: 28,
                    start_time: 1_199_145_601,
                    timeout: 1_230_767_999,
                },
            ],
            checkpoints: testnet_checkpoints(),
        }
    }

    pub fn regtest() -> Self {
        Self {
            network: Network::Regtest,
            magic: 0xdab5bffa,
            default_port: 18444,
            dns_seeds: &[],
            pow_limit_bits: 0x207fffff,
            pow_limit: Target::from_compact(CompactTarget::from_consensus(0x207fffff)),
            retarget_interval: 2016,
            target_timespan: 14 * 24 * 60 * 60,
            target_spacing: 10 * 60,
            no_retargeting: true,
            allow_min_difficulty: true,
            majority_window: 1000,
            majority_enforce_upgrade: 750,
            majority_reject_outdated: 950,
            coinbase_maturity: 100,
            max_block_weight: 4_000_000,
            max_block_sigops_cost: 80_000,
            subsidy_halving_interval: 150,
            bip34_height: 500,
            bip65_height: 1351,
            bip66_height: 1251,
            activation_threshold: 108,
            miner_window: 144,
            deployments: vec![
                Deployment {
                    name: DEPLOYMENT_CSV,
                    bit: 0,
                    start_time: 0,
                    timeout: u32::MAX,
                },
                Deployment {
                    name: DEPLOYMENT_SEGWIT,
                    bit: 1,
                    start_time: 0,
                    timeout: u32::MAX,
                },
                Deployment {
                    name: DEPLOYMENT_TESTDUMMY,
                    bit: 28,
                    start_time: 0,
                    timeout: u32::MAX,
                },
            ],
            checkpoints: BTreeMap::new(),
        }
    }

    pub fn signet() -> Self {
        Self {
            network: Network::Signet,
            magic: 0x40cf030a,
            default_port: 38333,
            dns_seeds: &["seed.signet.bitcoin.sprovoost.nl"],
            pow_limit_bits: 0x1e0377ae,
            pow_limit: Target::from_compact(CompactTarget::from_consensus(0x1e0377ae)),
            retarget_interval: 2016,
            target_timespan: 14 * 24 * 60 * 60,
            target_spacing: 10 * 60,
            no_retargeting: false,
            allow_min_difficulty: false,
            majority_window: 1000,
            majority_enforce_upgrade: 750,
            majority_reject_outdated: 950,
            coinbase_maturity: 100,
            max_block_weight: 4_000_000,
            max_block_sigops_cost: 80_000,
            subsidy_halving_interval: 210_000,
            bip34_height: 1,
            bip65_height: 1,
            bip66_height: 1,
            activation_threshold: 1916,
            miner_window: 2016,
            deployments: vec![
                Deployment {
                    name: DEPLOYMENT_CSV,
                    bit: 0,
                    start_time: 0,
                    timeout: u32::MAX,
                },
                Deployment {
                    name: DEPLOYMENT_SEGWIT,
                    bit: 1,
                    start_time: 0,
                    timeout: u32::MAX,
                },
            ],
            checkpoints: BTreeMap::new(),
        }
    }

    pub fn genesis(&self) -> Block {
        genesis_block(self.network)
    }

    pub fn deployment(&self, name: &str) -> Option<&Deployment> {
        self.deployments.iter().find(|d| d.name == name)
    }

    /// Height of the highest checkpoint, 0 when the table is empty.
    pub fn last_checkpoint(&self) -> u32 {
        self.checkpoints.keys().next_back().copied().unwrap_or(0)
    }

    pub fn get_block_subsidy(&self, height: u32) -> u64 {
        let halvings = height / self.subsidy_halving_interval;
        if halvings >= 64 {
            return 0;
        }
        (50 * 100_000_000u64) >> halvings
    }
}
