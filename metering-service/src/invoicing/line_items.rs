//! Flat-fee and usage-fee line items for one subscription record.
//!
//! These builders are pure: the pipeline reads usage and prior totals from the
//! stores and hands them in, so the arithmetic here can be exercised directly.

use super::pricing::{tier_revenue, usage_revenue_beyond_prepaid};
use crate::error::MeteringError;
use crate::models::{
    BillingRecord, BillingType, ChargeBehavior, ChargeTiming, ChargeableItemType,
    ComponentChargeRecord, InvoiceLineItem, InvoicedTotals, PlanComponent, PlanVersion,
    RecurringCharge, SubscriptionRecord,
};
use crate::services::BillingRecordUpdate;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

/// Amounts closer than this are considered already reconciled.
pub const RECONCILED_TOLERANCE: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

/// What one subscription record is being invoiced against.
#[derive(Debug, Clone, Copy)]
pub struct FeeContext<'a> {
    pub invoice_id: Uuid,
    pub record: &'a SubscriptionRecord,
    pub plan: &'a PlanVersion,
    pub issue_date: DateTime<Utc>,
}

impl FeeContext<'_> {
    #[allow(clippy::too_many_arguments)]
    fn line_item(
        &self,
        name: String,
        range: (DateTime<Utc>, DateTime<Utc>),
        quantity: Option<Decimal>,
        base: Decimal,
        billing_type: BillingType,
        chargeable_item_type: ChargeableItemType,
        billing_record: Option<Uuid>,
    ) -> InvoiceLineItem {
        InvoiceLineItem {
            id: Uuid::new_v4(),
            invoice_id: self.invoice_id,
            name,
            start_date: range.0,
            end_date: range.1,
            quantity,
            base,
            billing_type,
            chargeable_item_type,
            associated_subscription_record: Some(self.record.id),
            associated_billing_record: billing_record,
            associated_plan_version: Some(self.plan.id),
            associated_charge_record: None,
        }
    }
}

/// Line items and cursor movement produced for one billing record.
#[derive(Debug, Clone, Default)]
pub struct Fees {
    pub line_items: Vec<InvoiceLineItem>,
    pub billing_record_update: Option<BillingRecordUpdate>,
    pub charge_records_billed: Vec<Uuid>,
}

/// `amount` scaled by the share of a full period accrued by `accrued_to`.
pub fn prorate(amount: Decimal, billing_record: &BillingRecord, accrued_to: DateTime<Utc>) -> Decimal {
    if billing_record.unadjusted_duration_secs <= 0 {
        return amount;
    }
    let elapsed = (accrued_to - billing_record.start_date)
        .num_seconds()
        .clamp(0, billing_record.unadjusted_duration_secs);
    amount * Decimal::from(elapsed) / Decimal::from(billing_record.unadjusted_duration_secs)
}

/// Flat fee owed on a recurring-charge billing record, net of `already_invoiced`.
///
/// When a prior invoice charged part of this record, an offsetting line for the
/// prior amount precedes the full line so cumulative totals stay exact.
pub fn flat_fee(
    ctx: &FeeContext<'_>,
    billing_record: &BillingRecord,
    charge: &RecurringCharge,
    already_invoiced: Decimal,
) -> Fees {
    let ended = billing_record.end_date <= ctx.issue_date;
    let (accrued_to, billing_type, item_type, fully_billed) = if ctx.record.is_one_time {
        (
            billing_record.end_date,
            BillingType::OneTime,
            ChargeableItemType::OneTimeCharge,
            true,
        )
    } else {
        match charge.charge_timing {
            ChargeTiming::InAdvance => (
                billing_record.end_date,
                BillingType::InAdvance,
                ChargeableItemType::RecurringCharge,
                true,
            ),
            ChargeTiming::InArrears if ended => (
                billing_record.end_date,
                BillingType::InArrears,
                ChargeableItemType::RecurringCharge,
                true,
            ),
            ChargeTiming::InArrears => (
                ctx.issue_date.max(billing_record.start_date),
                BillingType::Intermediate,
                ChargeableItemType::RecurringCharge,
                false,
            ),
        }
    };

    let full = charge.amount * ctx.record.quantity;
    let due = match charge.charge_behavior {
        _ if ctx.record.is_one_time => full,
        ChargeBehavior::ChargeFull => full,
        ChargeBehavior::Prorate => prorate(full, billing_record, accrued_to),
    };
    let name = format!("{} - {}", ctx.plan.plan_name, charge.name);
    let range = (billing_record.start_date, accrued_to);

    let mut line_items = Vec::new();
    if (due - already_invoiced).abs() >= RECONCILED_TOLERANCE {
        if !already_invoiced.is_zero() {
            line_items.push(ctx.line_item(
                format!("{} (Already Invoiced)", name),
                range,
                None,
                -already_invoiced,
                billing_type,
                item_type,
                Some(billing_record.id),
            ));
        }
        line_items.push(ctx.line_item(
            name,
            range,
            Some(ctx.record.quantity),
            due,
            billing_type,
            item_type,
            Some(billing_record.id),
        ));
    }

    Fees {
        line_items,
        billing_record_update: Some(BillingRecordUpdate {
            id: billing_record.id,
            next_invoicing_date: billing_record.end_date,
            fully_billed,
        }),
        charge_records_billed: Vec::new(),
    }
}

/// Inputs for the usage fee of one metered billing record.
#[derive(Debug, Clone)]
pub struct MeteredUsage<'a> {
    pub billing_record: &'a BillingRecord,
    pub component: &'a PlanComponent,
    pub metric_name: &'a str,
    pub charge_records: &'a [ComponentChargeRecord],
    /// Billable usage for the record's window; `None` when the record is not due yet.
    pub usage: Option<Decimal>,
    pub already_invoiced: InvoicedTotals,
}

/// Prepaid blocks not billed yet, then the usage delta since the last invoice.
///
/// A negative delta means billable usage went backwards, which is never clamped.
pub fn usage_fee(ctx: &FeeContext<'_>, metered: &MeteredUsage<'_>) -> Result<Fees, MeteringError> {
    let br = metered.billing_record;
    let tiers = &metered.component.tiers;
    let mut fees = Fees::default();

    let mut blocks: Vec<&ComponentChargeRecord> = metered
        .charge_records
        .iter()
        .filter(|cr| cr.start_date <= ctx.issue_date)
        .collect();
    blocks.sort_by_key(|cr| cr.start_date);

    let mut prepaid = Decimal::ZERO;
    for block in blocks {
        if !block.fully_billed {
            let mut item = ctx.line_item(
                format!("{} - {} (Prepaid)", ctx.plan.plan_name, metered.metric_name),
                (block.start_date, block.end_date),
                Some(block.units),
                tier_revenue(tiers, prepaid + block.units) - tier_revenue(tiers, prepaid),
                BillingType::InAdvance,
                ChargeableItemType::PrepaidUsageCharge,
                Some(br.id),
            );
            item.associated_charge_record = Some(block.id);
            fees.line_items.push(item);
            fees.charge_records_billed.push(block.id);
        }
        prepaid += block.units;
    }

    let Some(usage) = metered.usage else {
        return Ok(fees);
    };

    let revenue = usage_revenue_beyond_prepaid(tiers, usage, prepaid);
    let net_quantity = usage - metered.already_invoiced.quantity;
    let net_revenue = revenue - metered.already_invoiced.revenue;
    if net_quantity < Decimal::ZERO || net_revenue < Decimal::ZERO {
        return Err(MeteringError::InvariantViolation(format!(
            "billing record {}: billable usage went backwards (usage {}, revenue {}, already invoiced quantity {}, revenue {})",
            br.id,
            usage,
            revenue,
            metered.already_invoiced.quantity,
            metered.already_invoiced.revenue
        )));
    }

    let ended = br.end_date <= ctx.issue_date;
    if !net_quantity.is_zero() || !net_revenue.is_zero() {
        fees.line_items.push(ctx.line_item(
            format!("{} - {}", ctx.plan.plan_name, metered.metric_name),
            (br.start_date, br.end_date.min(ctx.issue_date)),
            Some(net_quantity),
            net_revenue,
            if ended {
                BillingType::InArrears
            } else {
                BillingType::Intermediate
            },
            ChargeableItemType::UsageCharge,
            Some(br.id),
        ));
    }
    fees.billing_record_update = Some(BillingRecordUpdate {
        id: br.id,
        next_invoicing_date: br.end_date,
        fully_billed: ended,
    });
    Ok(fees)
}
