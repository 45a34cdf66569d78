use bitcoin::{CompactTarget, Target};
use num_bigint::BigUint;
use num_traits::{One, Zero};
use std::cmp::Ordering;
use std::fmt;
use std::sync::OnceLock;

/// Cumulative proof-of-work as a 256-bit integer.
///
/// Per-block proof is `2^256 / (target + 1)`; sums saturate at the largest
/// 256-bit value so stored chainwork always fits 32 bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainWork {
    value: BigUint,
}

fn max_work() -> &'static BigUint {
    static MAX: OnceLock<BigUint> = OnceLock::new();
    MAX.get_or_init(|| (BigUint::one() << 256u32) - BigUint::one())
}

impl ChainWork {
    pub fn zero() -> Self {
        Self {
            value: BigUint::zero(),
        }
    }

    /// Proof contributed by one block with the given target.
    pub fn from_target(target: Target) -> Self {
        let target_value = BigUint::from_bytes_be(&target.to_be_bytes());
        let two_256: BigUint = BigUint::one() << 256u32;

        let work = if target_value.is_zero() {
            max_work().clone()
        } else {
            two_256 / (target_value + BigUint::one())
        };

        Self { value: work }
    }

    pub fn from_compact(bits: CompactTarget) -> Self {
        Self::from_target(Target::from_compact(bits))
    }

    /// Saturating sum.
    pub fn add(&self, other: &ChainWork) -> ChainWork {
        let sum = &self.value + &other.value;
        if sum > *max_work() {
            Self {
                value: max_work().clone(),
            }
        } else {
            Self { value: sum }
        }
    }

    pub fn is_zero(&self) -> bool {
        self.value.is_zero()
    }

    pub fn to_be_bytes(&self) -> [u8; 32] {
        let bytes = self.value.to_bytes_be();
        let mut out = [0u8; 32];
        let start = 32usize.saturating_sub(bytes.len());
        out[start..].copy_from_slice(&bytes);
        out
    }

    pub fn from_be_bytes(bytes: [u8; 32]) -> Self {
        Self {
            value: BigUint::from_bytes_be(&bytes),
        }
    }

    pub fn to_hex_string(&self) -> String {
        format!("{:064x}", self.value)
    }
}

impl Default for ChainWork {
    fn default() -> Self {
        Self::zero()
    }
}

impl fmt::Display for ChainWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex_string())
    }
}

impl PartialOrd for ChainWork {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ChainWork {
    fn cmp(&self, other: &Self) -> Ordering {
        self.value.cmp(&other.value)
    }
}
