//! Subscription and billing records: the per-period billing cursors.

use crate::error::MeteringError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Property constraint scoping metric queries to part of a customer's traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionFilter {
    pub property_name: String,
    pub value: String,
}

/// One customer's attachment to a plan version for `[start_date, end_date)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub customer_id: Uuid,
    pub plan_version_id: Uuid,
    pub start_date: DateTime<Utc>,
    /// Usage is counted from here; earlier than `start_date` for backdated records.
    pub usage_start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub quantity: Decimal,
    pub auto_renew: bool,
    pub fully_billed: bool,
    /// One-time add-on: every flat fee is billed `ONE_TIME`.
    #[serde(default)]
    pub is_one_time: bool,
    #[serde(default)]
    pub filters: Vec<SubscriptionFilter>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BillingRecordKind {
    Recurring { charge_id: Uuid },
    Usage { component_id: Uuid },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingRecordState {
    /// `next_invoicing_date` is still in the future.
    Pending,
    Due,
    Billed,
}

/// One chargeable component of a subscription record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingRecord {
    pub id: Uuid,
    pub subscription_record_id: Uuid,
    pub kind: BillingRecordKind,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub next_invoicing_date: DateTime<Utc>,
    /// Length of a full, untruncated period; the denominator of flat-fee proration.
    pub unadjusted_duration_secs: i64,
    pub fully_billed: bool,
}

impl BillingRecord {
    pub fn state(&self, as_of: DateTime<Utc>) -> BillingRecordState {
        if self.fully_billed {
            BillingRecordState::Billed
        } else if self.next_invoicing_date > as_of {
            BillingRecordState::Pending
        } else {
            BillingRecordState::Due
        }
    }

    /// Move the cursor forward. Dates only move later and a billed record stays billed.
    pub fn advance(
        &mut self,
        next_invoicing_date: DateTime<Utc>,
        fully_billed: bool,
    ) -> Result<(), MeteringError> {
        if self.fully_billed && !fully_billed {
            return Err(MeteringError::InvariantViolation(format!(
                "billing record {} cannot leave the billed state",
                self.id
            )));
        }
        self.next_invoicing_date = self.next_invoicing_date.max(next_invoicing_date);
        self.fully_billed = fully_billed;
        Ok(())
    }
}

/// A prepaid block of units under a metered billing record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentChargeRecord {
    pub id: Uuid,
    pub billing_record_id: Uuid,
    pub units: Decimal,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub fully_billed: bool,
}
