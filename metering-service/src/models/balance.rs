//! Customer balance ledger entries.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BalanceStatus {
    Active,
    Inactive,
}

impl BalanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BalanceStatus::Active => "active",
            BalanceStatus::Inactive => "inactive",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "inactive" => BalanceStatus::Inactive,
            _ => BalanceStatus::Active,
        }
    }
}

/// Signed ledger entry. Credits are positive roots; draw-downs and expiry
/// offsets are negative children pointing at their credit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerBalanceAdjustment {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub customer_id: Uuid,
    pub currency: String,
    pub amount: Decimal,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub status: BalanceStatus,
    pub parent_adjustment_id: Option<Uuid>,
    /// Invoice that produced or consumed this entry.
    pub invoice_id: Option<Uuid>,
}
