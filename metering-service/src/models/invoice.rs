//! Invoices, line items and line-item adjustments.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Draft,
    Unpaid,
    Paid,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Draft => "draft",
            PaymentStatus::Unpaid => "unpaid",
            PaymentStatus::Paid => "paid",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "draft" => PaymentStatus::Draft,
            "paid" => PaymentStatus::Paid,
            _ => PaymentStatus::Unpaid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BillingType {
    InAdvance,
    InArrears,
    /// Covers a period that has not been fully earned yet.
    Intermediate,
    OneTime,
}

impl BillingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingType::InAdvance => "in_advance",
            BillingType::InArrears => "in_arrears",
            BillingType::Intermediate => "intermediate",
            BillingType::OneTime => "one_time",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "in_arrears" => BillingType::InArrears,
            "intermediate" => BillingType::Intermediate,
            "one_time" => BillingType::OneTime,
            _ => BillingType::InAdvance,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChargeableItemType {
    RecurringCharge,
    UsageCharge,
    PrepaidUsageCharge,
    PlanAdjustment,
    CustomerAdjustment,
    OneTimeCharge,
}

impl ChargeableItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChargeableItemType::RecurringCharge => "recurring_charge",
            ChargeableItemType::UsageCharge => "usage_charge",
            ChargeableItemType::PrepaidUsageCharge => "prepaid_usage_charge",
            ChargeableItemType::PlanAdjustment => "plan_adjustment",
            ChargeableItemType::CustomerAdjustment => "customer_adjustment",
            ChargeableItemType::OneTimeCharge => "one_time_charge",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "usage_charge" => ChargeableItemType::UsageCharge,
            "prepaid_usage_charge" => ChargeableItemType::PrepaidUsageCharge,
            "plan_adjustment" => ChargeableItemType::PlanAdjustment,
            "customer_adjustment" => ChargeableItemType::CustomerAdjustment,
            "one_time_charge" => ChargeableItemType::OneTimeCharge,
            _ => ChargeableItemType::RecurringCharge,
        }
    }

    /// Adjustment lines are excluded from discounting and taxation.
    pub fn is_adjustment(&self) -> bool {
        matches!(
            self,
            ChargeableItemType::PlanAdjustment | ChargeableItemType::CustomerAdjustment
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub customer_id: Uuid,
    pub currency: String,
    pub issue_date: DateTime<Utc>,
    pub due_date: DateTime<Utc>,
    pub payment_status: PaymentStatus,
    pub amount: Decimal,
    pub payment_provider: Option<String>,
    pub external_payment_id: Option<String>,
    pub document_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceLineItem {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub name: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub quantity: Option<Decimal>,
    pub base: Decimal,
    pub billing_type: BillingType,
    pub chargeable_item_type: ChargeableItemType,
    pub associated_subscription_record: Option<Uuid>,
    pub associated_billing_record: Option<Uuid>,
    pub associated_plan_version: Option<Uuid>,
    pub associated_charge_record: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdjustmentType {
    SalesTax,
    PlanDiscount,
}

impl AdjustmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdjustmentType::SalesTax => "sales_tax",
            AdjustmentType::PlanDiscount => "plan_discount",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "plan_discount" => AdjustmentType::PlanDiscount,
            _ => AdjustmentType::SalesTax,
        }
    }
}

/// Signed amount attached to a line item; never folded into its `base`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceLineItemAdjustment {
    pub id: Uuid,
    pub line_item_id: Uuid,
    pub adjustment_type: AdjustmentType,
    pub amount: Decimal,
}

/// An invoice together with everything it owns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceDocument {
    pub invoice: Invoice,
    pub line_items: Vec<InvoiceLineItem>,
    pub adjustments: Vec<InvoiceLineItemAdjustment>,
}

impl InvoiceDocument {
    /// Sum of every line item base and every adjustment, unrounded.
    pub fn total(&self) -> Decimal {
        let bases: Decimal = self.line_items.iter().map(|li| li.base).sum();
        let adjustments: Decimal = self.adjustments.iter().map(|a| a.amount).sum();
        bases + adjustments
    }

    pub fn adjustments_for(&self, line_item_id: Uuid) -> impl Iterator<Item = &InvoiceLineItemAdjustment> {
        self.adjustments
            .iter()
            .filter(move |a| a.line_item_id == line_item_id)
    }
}

/// Quantity and revenue already invoiced against one billing record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct InvoicedTotals {
    pub quantity: Decimal,
    pub revenue: Decimal,
}
