//! Sales tax as per-line-item adjustments.

use crate::models::{
    AdjustmentType, ChargeableItemType, InvoiceDocument, InvoiceLineItem,
    InvoiceLineItemAdjustment,
};
use rust_decimal::Decimal;
use uuid::Uuid;

fn is_taxable(item: &InvoiceLineItem) -> bool {
    item.chargeable_item_type != ChargeableItemType::CustomerAdjustment
}

/// Line item base plus its plan discounts.
pub fn taxable_amount(document: &InvoiceDocument, item: &InvoiceLineItem) -> Decimal {
    item.base
        + document
            .adjustments_for(item.id)
            .filter(|a| a.adjustment_type == AdjustmentType::PlanDiscount)
            .map(|a| a.amount)
            .sum::<Decimal>()
}

/// What the tax provider is asked to rate.
pub fn taxable_subtotal(document: &InvoiceDocument) -> Decimal {
    document
        .line_items
        .iter()
        .filter(|li| is_taxable(li))
        .map(|li| taxable_amount(document, li))
        .sum()
}

/// Attach `rate_percent` of each taxable line item as a sales-tax adjustment.
/// Items already taxed are left alone.
pub fn apply_tax(document: &mut InvoiceDocument, rate_percent: Decimal) {
    if rate_percent.is_zero() {
        return;
    }
    let taxes: Vec<InvoiceLineItemAdjustment> = document
        .line_items
        .iter()
        .filter(|li| is_taxable(li))
        .filter(|li| {
            !document
                .adjustments_for(li.id)
                .any(|a| a.adjustment_type == AdjustmentType::SalesTax)
        })
        .map(|li| (li.id, taxable_amount(document, li) * rate_percent / Decimal::ONE_HUNDRED))
        .filter(|(_, amount)| !amount.is_zero())
        .map(|(line_item_id, amount)| InvoiceLineItemAdjustment {
            id: Uuid::new_v4(),
            line_item_id,
            adjustment_type: AdjustmentType::SalesTax,
            amount,
        })
        .collect();
    document.adjustments.extend(taxes);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoicing::discounts::apply_plan_discount;
    use crate::models::{
        BillingType, Invoice, PaymentStatus, PriceAdjustment, PriceAdjustmentKind,
    };
    use chrono::Utc;

    fn item(invoice_id: Uuid, record: Uuid, base: i64, kind: ChargeableItemType) -> InvoiceLineItem {
        let now = Utc::now();
        InvoiceLineItem {
            id: Uuid::new_v4(),
            invoice_id,
            name: "Line".into(),
            start_date: now,
            end_date: now,
            quantity: None,
            base: Decimal::from(base),
            billing_type: BillingType::InArrears,
            chargeable_item_type: kind,
            associated_subscription_record: Some(record),
            associated_billing_record: None,
            associated_plan_version: None,
            associated_charge_record: None,
        }
    }

    #[test]
    fn tax_follows_discounted_base_and_skips_balance_lines() {
        let invoice_id = Uuid::new_v4();
        let record = Uuid::new_v4();
        let now = Utc::now();
        let mut doc = InvoiceDocument {
            invoice: Invoice {
                id: invoice_id,
                organization_id: Uuid::new_v4(),
                customer_id: Uuid::new_v4(),
                currency: "USD".into(),
                issue_date: now,
                due_date: now,
                payment_status: PaymentStatus::Draft,
                amount: Decimal::ZERO,
                payment_provider: None,
                external_payment_id: None,
                document_url: None,
            },
            line_items: vec![
                item(invoice_id, record, 100, ChargeableItemType::UsageCharge),
                item(invoice_id, record, -20, ChargeableItemType::CustomerAdjustment),
            ],
            adjustments: vec![],
        };
        apply_plan_discount(
            &mut doc,
            record,
            &PriceAdjustment {
                kind: PriceAdjustmentKind::Percentage,
                amount: Decimal::from(50),
            },
        );
        assert_eq!(taxable_subtotal(&doc), Decimal::from(50));

        apply_tax(&mut doc, Decimal::from(10));
        apply_tax(&mut doc, Decimal::from(10));
        let taxes: Vec<_> = doc
            .adjustments
            .iter()
            .filter(|a| a.adjustment_type == AdjustmentType::SalesTax)
            .collect();
        assert_eq!(taxes.len(), 1);
        assert_eq!(taxes[0].amount, Decimal::from(5));
        assert_eq!(doc.total(), Decimal::from(35));
    }
}
