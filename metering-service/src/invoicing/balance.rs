//! Customer balance ledger planning.
//!
//! A credit is a positive entry without a parent. Draw-downs and expiries
//! are negative child entries pointing at the credit they consume. A credit
//! that is used up is deactivated together with its children, so the sum of
//! ACTIVE entries is always the spendable balance.

use crate::models::{BalanceStatus, CustomerBalanceAdjustment};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::cmp::Ordering;
use uuid::Uuid;

pub const APPLIED_CREDIT: &str = "Applied Credit";
pub const CREDIT_GRANTED: &str = "Credit Granted";
pub const EXPIRED_CREDIT: &str = "Expired Credit";

/// An active credit and what is left of it.
#[derive(Debug, Clone)]
pub struct CreditState {
    pub credit: CustomerBalanceAdjustment,
    pub remaining: Decimal,
    pub children: Vec<Uuid>,
}

impl CreditState {
    fn expired(&self, now: DateTime<Utc>) -> bool {
        self.credit.expires_at.is_some_and(|at| at <= now)
    }
}

/// Balance changes to persist together.
#[derive(Debug, Clone, Default)]
pub struct LedgerPlan {
    pub new_entries: Vec<CustomerBalanceAdjustment>,
    pub deactivate: Vec<Uuid>,
    pub drawn: Decimal,
}

/// Active credits with something left, given every entry they may own.
pub fn credit_states(entries: &[CustomerBalanceAdjustment]) -> Vec<CreditState> {
    entries
        .iter()
        .filter(|e| {
            e.parent_adjustment_id.is_none()
                && e.amount > Decimal::ZERO
                && e.status == BalanceStatus::Active
        })
        .filter_map(|credit| {
            let children: Vec<&CustomerBalanceAdjustment> = entries
                .iter()
                .filter(|e| e.parent_adjustment_id == Some(credit.id))
                .collect();
            let remaining = credit.amount + children.iter().map(|c| c.amount).sum::<Decimal>();
            (remaining > Decimal::ZERO).then(|| CreditState {
                credit: credit.clone(),
                remaining,
                children: children.iter().map(|c| c.id).collect(),
            })
        })
        .collect()
}

/// Sum of active entries, never below zero.
pub fn spendable(entries: &[CustomerBalanceAdjustment], now: DateTime<Utc>) -> Decimal {
    let expired: Decimal = credit_states(entries)
        .iter()
        .filter(|c| c.expired(now))
        .map(|c| c.remaining)
        .sum();
    let active: Decimal = entries
        .iter()
        .filter(|e| e.status == BalanceStatus::Active)
        .map(|e| e.amount)
        .sum();
    (active - expired).max(Decimal::ZERO)
}

fn consumption_order(a: &CreditState, b: &CreditState) -> Ordering {
    match (a.credit.expires_at, b.credit.expires_at) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then(a.credit.created_at.cmp(&b.credit.created_at))
}

fn child_entry(
    credit: &CustomerBalanceAdjustment,
    amount: Decimal,
    description: &str,
    invoice_id: Option<Uuid>,
    status: BalanceStatus,
    now: DateTime<Utc>,
) -> CustomerBalanceAdjustment {
    CustomerBalanceAdjustment {
        id: Uuid::new_v4(),
        organization_id: credit.organization_id,
        customer_id: credit.customer_id,
        currency: credit.currency.clone(),
        amount,
        description: description.to_string(),
        created_at: now,
        expires_at: None,
        status,
        parent_adjustment_id: Some(credit.id),
        invoice_id,
    }
}

/// Consume up to `amount`, soonest-expiring credits first.
pub fn plan_draw_down(
    credits: &[CreditState],
    amount: Decimal,
    invoice_id: Uuid,
    now: DateTime<Utc>,
) -> LedgerPlan {
    let mut plan = LedgerPlan::default();
    if amount <= Decimal::ZERO {
        return plan;
    }
    let mut usable: Vec<&CreditState> = credits.iter().filter(|c| !c.expired(now)).collect();
    usable.sort_by(|a, b| consumption_order(a, b));

    let mut left = amount;
    for state in usable {
        if left <= Decimal::ZERO {
            break;
        }
        let take = left.min(state.remaining);
        let exhausted = take == state.remaining;
        let status = if exhausted {
            plan.deactivate.push(state.credit.id);
            plan.deactivate.extend(state.children.iter().copied());
            BalanceStatus::Inactive
        } else {
            BalanceStatus::Active
        };
        plan.new_entries.push(child_entry(
            &state.credit,
            -take,
            APPLIED_CREDIT,
            Some(invoice_id),
            status,
            now,
        ));
        plan.drawn += take;
        left -= take;
    }
    plan
}

/// Zero out whatever is left of credits past their expiry.
pub fn plan_expiry(credits: &[CreditState], now: DateTime<Utc>) -> LedgerPlan {
    let mut plan = LedgerPlan::default();
    for state in credits.iter().filter(|c| c.expired(now)) {
        plan.deactivate.push(state.credit.id);
        plan.deactivate.extend(state.children.iter().copied());
        plan.new_entries.push(child_entry(
            &state.credit,
            -state.remaining,
            EXPIRED_CREDIT,
            None,
            BalanceStatus::Inactive,
            now,
        ));
        plan.drawn += state.remaining;
    }
    plan
}

/// Apply a plan to an in-memory ledger.
pub fn apply_plan(entries: &mut Vec<CustomerBalanceAdjustment>, plan: LedgerPlan) {
    for entry in entries.iter_mut() {
        if plan.deactivate.contains(&entry.id) {
            entry.status = BalanceStatus::Inactive;
        }
    }
    entries.extend(plan.new_entries);
}

/// Status of a credit and its children after entries were removed.
pub fn restore_statuses(entries: &mut [CustomerBalanceAdjustment], credit_id: Uuid) {
    let Some(credit) = entries.iter().find(|e| e.id == credit_id) else {
        return;
    };
    let children_sum: Decimal = entries
        .iter()
        .filter(|e| e.parent_adjustment_id == Some(credit_id))
        .map(|e| e.amount)
        .sum();
    let status = if credit.amount + children_sum > Decimal::ZERO {
        BalanceStatus::Active
    } else {
        BalanceStatus::Inactive
    };
    for entry in entries
        .iter_mut()
        .filter(|e| e.id == credit_id || e.parent_adjustment_id == Some(credit_id))
    {
        entry.status = status;
    }
}
