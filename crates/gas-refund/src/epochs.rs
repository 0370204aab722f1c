//! Epoch-versioned rules
//!
//! Every behavior that changed over the life of the program is keyed by the
//! first epoch it applies to. Lookups are pure: the answer depends on the
//! epoch number and the configured table, never on runtime state.

use anyhow::{bail, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::RefundError;
use crate::types::whole_tokens;

/// Ordered `(from_epoch, value)` rows; lookup picks the latest row at or below the epoch
#[derive(Debug, Clone, PartialEq)]
pub struct EpochTable<T> {
    rows: Vec<(u64, T)>,
}

impl<T> EpochTable<T> {
    pub fn new(rows: Vec<(u64, T)>) -> Result<Self> {
        if rows.is_empty() {
            bail!("epoch table must have at least one row");
        }
        if let Some(pair) = rows.windows(2).find(|w| w[0].0 >= w[1].0) {
            bail!(
                "epoch thresholds must be strictly increasing ({} then {})",
                pair[0].0,
                pair[1].0
            );
        }
        Ok(Self { rows })
    }

    pub fn lookup(&self, epoch: u64) -> Option<&T> {
        let idx = self.rows.partition_point(|(from, _)| *from <= epoch);
        idx.checked_sub(1).map(|i| &self.rows[i].1)
    }

    pub fn first_epoch(&self) -> u64 {
        self.rows[0].0
    }

    pub fn rows(&self) -> &[(u64, T)] {
        &self.rows
    }
}

/// Stake computation in force for an epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StakeAlgorithm {
    /// Staking pool only, looked up at the start of the transaction's day
    LegacySameDay,
    /// Staking pool only, exact timestamp
    ExactTimestamp,
    /// Exact staking balance plus the safety module without lockup (historical arithmetic)
    SafetyModuleUnlocked,
    /// Virtual lockup on both pools, safety module counting only the token side of the BPT
    VirtualLockupPartialBpt,
    /// Virtual lockup on both pools, full BPT value
    VirtualLockup,
    /// Single consolidated balance from the post-migration resolver
    Unified,
}

impl StakeAlgorithm {
    pub fn has_safety_module(self) -> bool {
        matches!(
            self,
            Self::SafetyModuleUnlocked | Self::VirtualLockupPartialBpt | Self::VirtualLockup
        )
    }
}

impl std::fmt::Display for StakeAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::LegacySameDay => "legacy_same_day",
            Self::ExactTimestamp => "exact_timestamp",
            Self::SafetyModuleUnlocked => "safety_module_unlocked",
            Self::VirtualLockupPartialBpt => "virtual_lockup_partial_bpt",
            Self::VirtualLockup => "virtual_lockup",
            Self::Unified => "unified",
        };
        f.write_str(name)
    }
}

/// One step of the refund percentage function
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RefundTier {
    /// Minimum stake in token base units
    pub min_stake: Decimal,
    /// Fraction of the gas fee refunded, in [0, 1]
    pub percent: Decimal,
}

/// Non-decreasing step function from stake to refund percent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundTiers {
    tiers: Vec<RefundTier>,
}

impl RefundTiers {
    pub fn new(tiers: Vec<RefundTier>) -> Result<Self> {
        for tier in &tiers {
            if tier.percent < Decimal::ZERO || tier.percent > Decimal::ONE {
                bail!("refund percent {} outside [0, 1]", tier.percent);
            }
        }
        for pair in tiers.windows(2) {
            if pair[0].min_stake >= pair[1].min_stake {
                bail!("refund tiers must be sorted by strictly increasing min_stake");
            }
            if pair[0].percent > pair[1].percent {
                bail!("refund percent must not decrease as stake grows");
            }
        }
        Ok(Self { tiers })
    }

    /// Percent for the highest tier the stake reaches, `None` below the first tier
    pub fn percent_for(&self, stake: Decimal) -> Option<Decimal> {
        self.tiers
            .iter()
            .rev()
            .find(|tier| stake >= tier.min_stake)
            .map(|tier| tier.percent)
    }
}

/// All epoch-dependent rules of the program
#[derive(Debug, Clone)]
pub struct EpochRules {
    pub algorithms: EpochTable<StakeAlgorithm>,
    pub min_stake: EpochTable<Decimal>,
    pub refund_tiers: EpochTable<RefundTiers>,
    /// Tier table used by the swap accumulator regardless of epoch
    pub unified_tiers: RefundTiers,
}

impl EpochRules {
    pub fn algorithm(&self, epoch: u64) -> Result<StakeAlgorithm, RefundError> {
        self.algorithms
            .lookup(epoch)
            .copied()
            .ok_or(RefundError::UnknownEpoch { epoch })
    }

    pub fn min_stake(&self, epoch: u64) -> Result<Decimal, RefundError> {
        self.min_stake
            .lookup(epoch)
            .copied()
            .ok_or(RefundError::UnknownEpoch { epoch })
    }

    pub fn refund_percent(&self, epoch: u64, stake: Decimal) -> Option<Decimal> {
        self.refund_tiers.lookup(epoch)?.percent_for(stake)
    }

    pub fn unified_refund_percent(&self, stake: Decimal) -> Option<Decimal> {
        self.unified_tiers.percent_for(stake)
    }

    /// Epochs before the unified flip must always resolve a percent
    pub fn requires_refund_percent(&self, epoch: u64) -> bool {
        self.algorithm(epoch)
            .map(|algo| algo != StakeAlgorithm::Unified)
            .unwrap_or(true)
    }
}

fn default_tiers() -> Vec<RefundTier> {
    // (whole tokens, percent mantissa, percent scale)
    [(500, 25, 2), (5_000, 5, 1), (50_000, 75, 2), (500_000, 1, 0)]
        .into_iter()
        .map(|(stake, mantissa, scale)| RefundTier {
            min_stake: whole_tokens(stake),
            percent: Decimal::new(mantissa, scale),
        })
        .collect()
}

impl Default for EpochRules {
    fn default() -> Self {
        use StakeAlgorithm::*;

        let tiers = RefundTiers { tiers: default_tiers() };

        Self {
            algorithms: EpochTable {
                rows: vec![
                    (constants::GENESIS_EPOCH, LegacySameDay),
                    (constants::STAKES_ALGO_FLIP_EPOCH, ExactTimestamp),
                    (constants::SAFETY_MODULE_START_EPOCH, SafetyModuleUnlocked),
                    (constants::VIRTUAL_LOCKUP_START_EPOCH, VirtualLockupPartialBpt),
                    (constants::SAFETY_MODULE_FULL_BPT_FIX_EPOCH, VirtualLockup),
                    (constants::UNIFIED_STAKES_EPOCH, Unified),
                ],
            },
            min_stake: EpochTable {
                rows: vec![(constants::GENESIS_EPOCH, whole_tokens(500))],
            },
            refund_tiers: EpochTable {
                rows: vec![(constants::GENESIS_EPOCH, tiers.clone())],
            },
            unified_tiers: tiers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn test_lookup_picks_latest_threshold_at_or_below() {
        let table = EpochTable::new(vec![(9, "a"), (11, "b"), (20, "c")]).unwrap();
        assert_eq!(table.lookup(8), None);
        assert_eq!(table.lookup(9), Some(&"a"));
        assert_eq!(table.lookup(10), Some(&"a"));
        assert_eq!(table.lookup(11), Some(&"b"));
        assert_eq!(table.lookup(19), Some(&"b"));
        assert_eq!(table.lookup(20), Some(&"c"));
        assert_eq!(table.lookup(1_000), Some(&"c"));
    }

    #[test]
    fn test_default_tiers() {
        let percents: Vec<Decimal> = default_tiers().iter().map(|t| t.percent).collect();
        assert_eq!(percents, vec![dec("0.25"), dec("0.5"), dec("0.75"), dec("1")]);

        let rules = EpochRules::default();
        assert_eq!(rules.unified_refund_percent(whole_tokens(499)), None);
        assert_eq!(rules.unified_refund_percent(whole_tokens(5_000)), Some(dec("0.5")));
        assert_eq!(rules.unified_refund_percent(whole_tokens(1_000_000)), Some(dec("1")));
    }

    #[test]
    fn test_thresholds_must_strictly_increase() {
        assert!(EpochTable::new(vec![(9, 1), (9, 2)]).is_err());
        assert!(EpochTable::new(vec![(12, 1), (9, 2)]).is_err());
        assert!(EpochTable::<u8>::new(vec![]).is_err());
    }

    #[test]
    fn test_default_dispatch_is_a_pure_epoch_mapping() {
        let rules = EpochRules::default();
        assert_eq!(rules.algorithm(9).unwrap(), StakeAlgorithm::LegacySameDay);
        assert_eq!(rules.algorithm(10).unwrap(), StakeAlgorithm::LegacySameDay);
        assert_eq!(rules.algorithm(11).unwrap(), StakeAlgorithm::ExactTimestamp);
        assert_eq!(rules.algorithm(12).unwrap(), StakeAlgorithm::SafetyModuleUnlocked);
        assert_eq!(rules.algorithm(14).unwrap(), StakeAlgorithm::VirtualLockupPartialBpt);
        assert_eq!(rules.algorithm(20).unwrap(), StakeAlgorithm::VirtualLockup);
        assert_eq!(rules.algorithm(32).unwrap(), StakeAlgorithm::Unified);
        assert_eq!(
            rules.algorithm(3),
            Err(RefundError::UnknownEpoch { epoch: 3 })
        );
    }

    #[test]
    fn test_tiers_are_a_non_decreasing_step_function() {
        let tiers = RefundTiers::new(default_tiers()).unwrap();
        assert_eq!(tiers.percent_for(whole_tokens(499)), None);
        assert_eq!(tiers.percent_for(whole_tokens(500)), Some(dec("0.25")));
        assert_eq!(tiers.percent_for(whole_tokens(4_999)), Some(dec("0.25")));
        assert_eq!(tiers.percent_for(whole_tokens(50_000)), Some(dec("0.75")));
        assert_eq!(tiers.percent_for(whole_tokens(10_000_000)), Some(dec("1")));

        let mut previous = Decimal::ZERO;
        for stake in [0u64, 500, 1_000, 5_000, 60_000, 500_000, 900_000] {
            let percent = tiers.percent_for(whole_tokens(stake)).unwrap_or(Decimal::ZERO);
            assert!(percent >= previous);
            previous = percent;
        }
    }

    #[test]
    fn test_invalid_tiers_rejected() {
        let decreasing = vec![
            RefundTier { min_stake: dec("1"), percent: dec("0.5") },
            RefundTier { min_stake: dec("2"), percent: dec("0.25") },
        ];
        assert!(RefundTiers::new(decreasing).is_err());

        let over_one = vec![RefundTier { min_stake: dec("1"), percent: dec("1.5") }];
        assert!(RefundTiers::new(over_one).is_err());
    }

    #[test]
    fn test_safety_module_variants() {
        assert!(!StakeAlgorithm::LegacySameDay.has_safety_module());
        assert!(!StakeAlgorithm::ExactTimestamp.has_safety_module());
        assert!(StakeAlgorithm::SafetyModuleUnlocked.has_safety_module());
        assert!(StakeAlgorithm::VirtualLockupPartialBpt.has_safety_module());
        assert!(StakeAlgorithm::VirtualLockup.has_safety_module());
        assert!(!StakeAlgorithm::Unified.has_safety_module());
    }
}
