//! Plan-level price adjustments, recorded as line-item adjustments.

use crate::models::{
    AdjustmentType, InvoiceDocument, InvoiceLineItemAdjustment, PriceAdjustment,
    PriceAdjustmentKind,
};
use rust_decimal::Decimal;
use std::collections::HashSet;
use uuid::Uuid;

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

/// Apply `adjustment` to the non-adjustment line items of one subscription record.
///
/// Re-applying to the same document adds nothing: percentage discounts skip
/// items already discounted, and fixed or override discounts emit only the
/// correction still missing.
pub fn apply_plan_discount(
    document: &mut InvoiceDocument,
    subscription_record_id: Uuid,
    adjustment: &PriceAdjustment,
) {
    let affected: Vec<(Uuid, Decimal)> = document
        .line_items
        .iter()
        .filter(|li| {
            li.associated_subscription_record == Some(subscription_record_id)
                && !li.chargeable_item_type.is_adjustment()
        })
        .map(|li| (li.id, li.base))
        .collect();
    if affected.is_empty() {
        return;
    }

    let ids: HashSet<Uuid> = affected.iter().map(|(id, _)| *id).collect();
    let discounted: HashSet<Uuid> = document
        .adjustments
        .iter()
        .filter(|a| a.adjustment_type == AdjustmentType::PlanDiscount && ids.contains(&a.line_item_id))
        .map(|a| a.line_item_id)
        .collect();

    let new_adjustments: Vec<InvoiceLineItemAdjustment> = match adjustment.kind {
        PriceAdjustmentKind::Percentage => affected
            .iter()
            .filter(|(id, _)| !discounted.contains(id))
            .map(|(id, base)| discount(*id, -(*base * adjustment.amount / HUNDRED)))
            .filter(|a| !a.amount.is_zero())
            .collect(),
        PriceAdjustmentKind::Fixed | PriceAdjustmentKind::PriceOverride => {
            let old_total: Decimal = affected.iter().map(|(_, base)| *base).sum();
            let new_total = match adjustment.kind {
                PriceAdjustmentKind::Fixed if old_total > Decimal::ZERO => {
                    (old_total - adjustment.amount).max(Decimal::ZERO)
                }
                PriceAdjustmentKind::Fixed => old_total,
                _ => adjustment.amount,
            };
            let already_applied: Decimal = document
                .adjustments
                .iter()
                .filter(|a| {
                    a.adjustment_type == AdjustmentType::PlanDiscount
                        && ids.contains(&a.line_item_id)
                })
                .map(|a| a.amount)
                .sum();
            let correction = new_total - old_total - already_applied;
            if correction.is_zero() {
                Vec::new()
            } else {
                vec![discount(affected[0].0, correction)]
            }
        }
    };
    document.adjustments.extend(new_adjustments);
}

fn discount(line_item_id: Uuid, amount: Decimal) -> InvoiceLineItemAdjustment {
    InvoiceLineItemAdjustment {
        id: Uuid::new_v4(),
        line_item_id,
        adjustment_type: AdjustmentType::PlanDiscount,
        amount,
    }
}
