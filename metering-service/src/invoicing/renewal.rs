//! Materializing the next period of an auto-renewing subscription.

use crate::models::{
    BillingRecord, BillingRecordKind, ChargeTiming, ComponentChargeRecord, PlanVersion,
    SubscriptionRecord,
};
use crate::proration::period_end;
use crate::services::NewSubscriptionPeriod;
use uuid::Uuid;

/// Billing records for `record`'s period: one per recurring charge, one per component.
pub fn billing_records_for(record: &SubscriptionRecord, plan: &PlanVersion) -> Vec<BillingRecord> {
    let duration_secs = (record.end_date - record.start_date).num_seconds();
    let recurring = plan.recurring_charges.iter().map(|charge| BillingRecord {
        id: Uuid::new_v4(),
        subscription_record_id: record.id,
        kind: BillingRecordKind::Recurring {
            charge_id: charge.id,
        },
        start_date: record.start_date,
        end_date: record.end_date,
        next_invoicing_date: match charge.charge_timing {
            ChargeTiming::InAdvance => record.start_date,
            ChargeTiming::InArrears => record.end_date,
        },
        unadjusted_duration_secs: duration_secs,
        fully_billed: false,
    });
    let usage = plan.components.iter().map(|component| BillingRecord {
        id: Uuid::new_v4(),
        subscription_record_id: record.id,
        kind: BillingRecordKind::Usage {
            component_id: component.id,
        },
        start_date: record.start_date,
        end_date: record.end_date,
        next_invoicing_date: record.end_date,
        unadjusted_duration_secs: duration_secs,
        fully_billed: false,
    });
    recurring.chain(usage).collect()
}

/// The period following `record`: same plan, quantity and filters, fresh cursors.
pub fn next_period(record: &SubscriptionRecord, plan: &PlanVersion) -> NewSubscriptionPeriod {
    let start = record.end_date;
    let next = SubscriptionRecord {
        id: Uuid::new_v4(),
        start_date: start,
        usage_start_date: start,
        end_date: period_end(start, plan.plan_duration),
        fully_billed: false,
        ..record.clone()
    };
    let billing_records = billing_records_for(&next, plan);
    let charge_records = billing_records
        .iter()
        .filter_map(|br| match br.kind {
            BillingRecordKind::Usage { component_id } => plan
                .component(component_id)
                .and_then(|c| c.prepaid_units)
                .map(|units| ComponentChargeRecord {
                    id: Uuid::new_v4(),
                    billing_record_id: br.id,
                    units,
                    start_date: br.start_date,
                    end_date: br.end_date,
                    fully_billed: false,
                }),
            BillingRecordKind::Recurring { .. } => None,
        })
        .collect();
    NewSubscriptionPeriod {
        record: next,
        billing_records,
        charge_records,
    }
}
