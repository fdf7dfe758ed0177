//! Plan pricing read model. Plans are provisioned elsewhere and read-only here.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Length of one subscription period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanDuration {
    Monthly,
    Quarterly,
    Yearly,
}

impl PlanDuration {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanDuration::Monthly => "monthly",
            PlanDuration::Quarterly => "quarterly",
            PlanDuration::Yearly => "yearly",
        }
    }

    pub fn months(&self) -> u32 {
        match self {
            PlanDuration::Monthly => 1,
            PlanDuration::Quarterly => 3,
            PlanDuration::Yearly => 12,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeTiming {
    InAdvance,
    InArrears,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeBehavior {
    /// Scale the amount by the covered share of the period.
    Prorate,
    ChargeFull,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurringCharge {
    pub id: Uuid,
    pub name: String,
    pub amount: Decimal,
    pub charge_timing: ChargeTiming,
    pub charge_behavior: ChargeBehavior,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierType {
    Free,
    PerUnit,
    Flat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchRounding {
    NoRounding,
    RoundUp,
    RoundDown,
    RoundNearest,
}

/// One band of a tiered price. `range_end = None` means unbounded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceTier {
    pub tier_type: TierType,
    pub range_start: Decimal,
    pub range_end: Option<Decimal>,
    #[serde(default)]
    pub cost_per_batch: Decimal,
    #[serde(default = "one")]
    pub metric_units_per_batch: Decimal,
    #[serde(default = "no_rounding")]
    pub batch_rounding: BatchRounding,
}

fn one() -> Decimal {
    Decimal::ONE
}

fn no_rounding() -> BatchRounding {
    BatchRounding::NoRounding
}

/// A metered component of a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanComponent {
    pub id: Uuid,
    pub metric_id: Uuid,
    pub tiers: Vec<PriceTier>,
    /// Units bought up front per period, billed in advance.
    pub prepaid_units: Option<Decimal>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceAdjustmentKind {
    /// `amount` percent off every affected line item.
    Percentage,
    /// `amount` off the affected subtotal, floored at zero.
    Fixed,
    /// The affected subtotal becomes exactly `amount`.
    PriceOverride,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceAdjustment {
    pub kind: PriceAdjustmentKind,
    pub amount: Decimal,
}

/// One priced version of a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanVersion {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub plan_name: String,
    pub currency: String,
    pub plan_duration: PlanDuration,
    #[serde(default)]
    pub recurring_charges: Vec<RecurringCharge>,
    #[serde(default)]
    pub components: Vec<PlanComponent>,
    pub price_adjustment: Option<PriceAdjustment>,
}

impl PlanVersion {
    pub fn recurring_charge(&self, id: Uuid) -> Option<&RecurringCharge> {
        self.recurring_charges.iter().find(|c| c.id == id)
    }

    pub fn component(&self, id: Uuid) -> Option<&PlanComponent> {
        self.components.iter().find(|c| c.id == id)
    }
}
