use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::shared::stable_hash;

/// 2^10 registers, roughly 3% standard error.
const PRECISION: u32 = 10;
const REGISTERS: usize = 1 << PRECISION;

/// HyperLogLog sketch. Merging takes the register-wise maximum, which is associative, commutative
/// and idempotent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HyperLogLog {
    registers: Vec<u8>,
}

impl Default for HyperLogLog {
    fn default() -> Self {
        Self {
            registers: vec![0; REGISTERS],
        }
    }
}

impl HyperLogLog {
    /// Registers are checkpointed, so the hash must not change between builds.
    pub fn insert(&mut self, item: impl AsRef<[u8]>) {
        let hash = stable_hash(item.as_ref());

        let index = (hash >> (64 - PRECISION)) as usize;
        let rest = (hash << PRECISION) | (1 << (PRECISION - 1));
        let rank = (rest.leading_zeros() + 1) as u8;
        if let Some(register) = self.registers.get_mut(index)
            && rank > *register
        {
            *register = rank;
        }
    }

    pub fn merge(&mut self, other: &HyperLogLog) {
        for (mine, theirs) in self.registers.iter_mut().zip(&other.registers) {
            *mine = (*mine).max(*theirs);
        }
    }

    pub fn estimate(&self) -> u64 {
        let m = REGISTERS as f64;
        let alpha = 0.7213 / (1.0 + 1.079 / m);
        let sum: f64 = self
            .registers
            .iter()
            .map(|r| 2f64.powi(-i32::from(*r)))
            .sum();
        let raw = alpha * m * m / sum;
        let zeros = self.registers.iter().filter(|r| **r == 0).count();
        let estimate = if raw <= 2.5 * m && zeros > 0 {
            // linear counting for small cardinalities
            m * (m / zeros as f64).ln()
        } else {
            raw
        };
        estimate.round() as u64
    }
}

impl Serialize for HyperLogLog {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64_STANDARD.encode(&self.registers))
    }
}

impl<'de> Deserialize<'de> for HyperLogLog {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let registers = BASE64_STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)?;
        if registers.len() != REGISTERS {
            return Err(serde::de::Error::custom(format!(
                "expected {REGISTERS} registers, got {}",
                registers.len()
            )));
        }
        Ok(Self { registers })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimates_within_error_bounds() {
        let mut hll = HyperLogLog::default();
        for i in 0..10_000 {
            hll.insert(&format!("user-{i}"));
            // duplicates do not count
            hll.insert(&format!("user-{i}"));
        }
        let estimate = hll.estimate() as f64;
        assert!((estimate - 10_000.0).abs() / 10_000.0 < 0.1, "{estimate}");
    }

    #[test]
    fn small_cardinalities_are_exact_enough() {
        let mut hll = HyperLogLog::default();
        assert_eq!(hll.estimate(), 0);
        for key in ["a", "b", "c"] {
            hll.insert(key);
        }
        assert_eq!(hll.estimate(), 3);
    }

    #[test]
    fn merge_is_union() {
        let mut left = HyperLogLog::default();
        let mut right = HyperLogLog::default();
        for i in 0..500 {
            left.insert(i.to_string());
        }
        for i in 250..750 {
            right.insert(i.to_string());
        }
        let mut union = left.clone();
        union.merge(&right);
        let mut other_way = right.clone();
        other_way.merge(&left);
        assert_eq!(union, other_way);
        let estimate = union.estimate() as f64;
        assert!((estimate - 750.0).abs() / 750.0 < 0.1, "{estimate}");
    }

    #[test]
    fn registers_follow_the_stable_hash() {
        let mut hll = HyperLogLog::default();
        hll.insert("");
        // xxh3 of no bytes is 0x2D06800538D394C2
        let hash: u64 = 0x2D06_8005_38D3_94C2;
        let index = (hash >> (64 - PRECISION)) as usize;
        let rank = (((hash << PRECISION) | (1 << (PRECISION - 1))).leading_zeros() + 1) as u8;
        assert_eq!(hll.registers[index], rank);
        assert_eq!(hll.registers.iter().filter(|r| **r != 0).count(), 1);
    }

    #[test]
    fn serde_keeps_registers() {
        let mut hll = HyperLogLog::default();
        hll.insert("x");
        let json = serde_json::to_string(&hll).unwrap();
        let back: HyperLogLog = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hll);
    }
}
