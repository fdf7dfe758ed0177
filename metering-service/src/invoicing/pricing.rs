//! Tiered price evaluation for metered components.

use crate::models::{BatchRounding, PriceTier, TierType};
use rust_decimal::{Decimal, RoundingStrategy};

/// Number of billable batches for `units`, rounded per the tier's policy.
pub fn batches(units: Decimal, per_batch: Decimal, rounding: BatchRounding) -> Decimal {
    if per_batch <= Decimal::ZERO {
        return units;
    }
    let raw = units / per_batch;
    match rounding {
        BatchRounding::NoRounding => raw,
        BatchRounding::RoundUp => raw.ceil(),
        BatchRounding::RoundDown => raw.floor(),
        BatchRounding::RoundNearest => {
            raw.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        }
    }
}

fn tier_units(tier: &PriceTier, usage: Decimal) -> Decimal {
    let upper = tier.range_end.map_or(usage, |end| usage.min(end));
    (upper - tier.range_start).max(Decimal::ZERO)
}

/// Revenue of `usage` units across every tier it reaches.
pub fn tier_revenue(tiers: &[PriceTier], usage: Decimal) -> Decimal {
    tiers
        .iter()
        .map(|tier| match tier.tier_type {
            TierType::Free => Decimal::ZERO,
            TierType::Flat if usage > tier.range_start => tier.cost_per_batch,
            TierType::Flat => Decimal::ZERO,
            TierType::PerUnit => {
                batches(
                    tier_units(tier, usage),
                    tier.metric_units_per_batch,
                    tier.batch_rounding,
                ) * tier.cost_per_batch
            }
        })
        .sum()
}

/// Revenue owed for `usage` when `prepaid` units were already billed in advance.
pub fn usage_revenue_beyond_prepaid(tiers: &[PriceTier], usage: Decimal, prepaid: Decimal) -> Decimal {
    tier_revenue(tiers, usage.max(prepaid)) - tier_revenue(tiers, prepaid)
}
