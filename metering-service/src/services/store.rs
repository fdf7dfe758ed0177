//! Persistence seams. The engine only talks to storage through these traits;
//! [`Database`](super::Database) and [`MemoryStore`](super::MemoryStore) implement them.

use crate::error::MeteringError;
use crate::models::{
    Aggregation, BillingRecord, CategoricalFilter, ChargeableItemType, ComponentChargeRecord,
    Customer, CustomerBalanceAdjustment, Event, InvoiceDocument, InvoicedTotals, Metric,
    NumericFilter, Organization, PlanVersion, SubscriptionFilter, SubscriptionRecord,
    TimeGranularity,
};
use crate::proration::TimeRange;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Where a usage query reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsageSource {
    /// Raw events, exact to the second.
    Events,
    /// A daily pre-aggregated rollup with the given name.
    Rollup(String),
}

/// A filtered aggregation over one metric's event stream.
#[derive(Debug, Clone)]
pub struct UsageQuery {
    pub organization_id: Uuid,
    pub event_name: String,
    pub property_name: Option<String>,
    pub aggregation: Aggregation,
    pub numeric_filters: Vec<NumericFilter>,
    pub categorical_filters: Vec<CategoricalFilter>,
    pub subscription_filters: Vec<SubscriptionFilter>,
    pub customer_id: Option<Uuid>,
    pub range: TimeRange,
    pub bucket: TimeGranularity,
    pub source: UsageSource,
}

impl UsageQuery {
    pub fn for_metric(metric: &Metric, range: TimeRange, bucket: TimeGranularity) -> Self {
        Self {
            organization_id: metric.organization_id,
            event_name: metric.event_name.clone(),
            property_name: metric.property_name.clone(),
            aggregation: metric.aggregation,
            numeric_filters: metric.numeric_filters.clone(),
            categorical_filters: metric.categorical_filters.clone(),
            subscription_filters: Vec::new(),
            customer_id: None,
            range,
            bucket,
            source: UsageSource::Events,
        }
    }

    pub fn customer(mut self, customer_id: Option<Uuid>) -> Self {
        self.customer_id = customer_id;
        self
    }

    pub fn subscription_filters(mut self, filters: &[SubscriptionFilter]) -> Self {
        self.subscription_filters = filters.to_vec();
        self
    }

    pub fn range(mut self, range: TimeRange) -> Self {
        self.range = range;
        self
    }

    pub fn bucket(mut self, bucket: TimeGranularity) -> Self {
        self.bucket = bucket;
        self
    }

    pub fn source(mut self, source: UsageSource) -> Self {
        self.source = source;
        self
    }

    /// Every predicate except the time range.
    pub fn matches_ignoring_time(&self, event: &Event) -> bool {
        if event.organization_id != self.organization_id || event.event_name != self.event_name {
            return false;
        }
        if let Some(customer_id) = self.customer_id {
            if event.customer_id != customer_id {
                return false;
            }
        }
        let numeric_ok = self.numeric_filters.iter().all(|f| {
            event
                .property_decimal(&f.property_name)
                .map(|v| f.operator.matches(v, f.comparison_value))
                .unwrap_or(false)
        });
        let categorical_ok = self
            .categorical_filters
            .iter()
            .all(|f| f.matches(event.property_string(&f.property_name).as_deref()));
        let subscription_ok = self.subscription_filters.iter().all(|f| {
            event.property_string(&f.property_name).as_deref() == Some(f.value.as_str())
        });
        numeric_ok && categorical_ok && subscription_ok
    }

    pub fn matches(&self, event: &Event) -> bool {
        self.range.contains(event.time_created) && self.matches_ignoring_time(event)
    }

    /// The aggregated property value of one event; `None` excludes the event.
    pub fn event_value(&self, event: &Event) -> Option<Decimal> {
        match (self.aggregation, &self.property_name) {
            (Aggregation::Count, _) | (Aggregation::Unique, _) => Some(Decimal::ONE),
            (_, Some(property)) => event.property_decimal(property),
            (_, None) => None,
        }
    }
}

/// One aggregated bucket. For `AVERAGE`, `value` holds the sum so buckets
/// can be merged before dividing by `count`.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageRow {
    pub customer_id: Uuid,
    pub bucket: DateTime<Utc>,
    pub value: Decimal,
    pub count: i64,
}

/// A single matching event, reduced to what the handlers read.
#[derive(Debug, Clone, PartialEq)]
pub struct UsagePoint {
    pub customer_id: Uuid,
    pub time_created: DateTime<Utc>,
    pub value: Decimal,
    /// Property rendered as text, for `UNIQUE`.
    pub key: Option<String>,
}

/// How prior state is reconstructed for stateful metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CarryMode {
    /// Most recent absolute value.
    Latest,
    /// Sum of every delta so far.
    RunningSum,
}

/// A provisioned continuous aggregate.
#[derive(Debug, Clone)]
pub struct RollupDefinition {
    pub name: String,
    pub metric: Metric,
    pub granularity: TimeGranularity,
}

#[derive(Debug, Clone)]
pub struct BillingRecordUpdate {
    pub id: Uuid,
    pub next_invoicing_date: DateTime<Utc>,
    pub fully_billed: bool,
}

/// A renewed period materialized while invoicing.
#[derive(Debug, Clone)]
pub struct NewSubscriptionPeriod {
    pub record: SubscriptionRecord,
    pub billing_records: Vec<BillingRecord>,
    pub charge_records: Vec<ComponentChargeRecord>,
}

/// Everything one finalized invoice persists, written atomically. `document`
/// is `None` when only billing state moved and no line item was produced.
#[derive(Debug, Clone)]
pub struct InvoiceCommit {
    pub document: Option<InvoiceDocument>,
    pub billing_record_updates: Vec<BillingRecordUpdate>,
    pub charge_records_billed: Vec<Uuid>,
    pub subscription_records_billed: Vec<Uuid>,
    pub new_periods: Vec<NewSubscriptionPeriod>,
}

#[async_trait]
pub trait EventStore: Send + Sync {
    async fn resolve_customer(
        &self,
        organization_id: Uuid,
        external_customer_id: &str,
    ) -> Result<Option<Customer>, MeteringError>;

    /// Ids among `ids` already stored with `time_created >= time_created_since`
    /// or `inserted_at >= inserted_since`.
    async fn existing_idempotency_ids(
        &self,
        organization_id: Uuid,
        ids: &[String],
        time_created_since: DateTime<Utc>,
        inserted_since: DateTime<Utc>,
    ) -> Result<HashSet<String>, MeteringError>;

    async fn insert_events(&self, events: &[Event]) -> Result<u64, MeteringError>;
}

#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn aggregate(&self, query: &UsageQuery) -> Result<Vec<UsageRow>, MeteringError>;

    /// Matching events ordered by `time_created`.
    async fn scan(&self, query: &UsageQuery) -> Result<Vec<UsagePoint>, MeteringError>;

    /// Per-customer state carried in from before `before`.
    async fn last_value_before(
        &self,
        query: &UsageQuery,
        before: DateTime<Utc>,
        mode: CarryMode,
    ) -> Result<HashMap<Uuid, Decimal>, MeteringError>;

    /// Run a validated organization query over `events` restricted to `range`.
    /// Returns `(customer_id, usage_qty)` rows.
    async fn run_custom_query(
        &self,
        organization_id: Uuid,
        sql: &str,
        customer_id: Option<Uuid>,
        range: &TimeRange,
    ) -> Result<Vec<(Uuid, Decimal)>, MeteringError>;
}

#[async_trait]
pub trait RollupStore: Send + Sync {
    async fn create_rollup(&self, definition: &RollupDefinition) -> Result<(), MeteringError>;
    async fn drop_rollup(&self, name: &str) -> Result<(), MeteringError>;
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn health_check(&self) -> Result<(), MeteringError>;

    async fn get_organization(&self, id: Uuid) -> Result<Organization, MeteringError>;
    async fn list_organizations(&self) -> Result<Vec<Organization>, MeteringError>;
    async fn get_customer(&self, id: Uuid) -> Result<Customer, MeteringError>;

    async fn get_metric(&self, id: Uuid) -> Result<Metric, MeteringError>;
    async fn save_metric(&self, metric: &Metric) -> Result<(), MeteringError>;
    async fn get_plan_version(&self, id: Uuid) -> Result<PlanVersion, MeteringError>;

    /// Records not yet fully billed that started on or before `as_of`.
    async fn list_open_subscription_records(
        &self,
        customer_id: Uuid,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<SubscriptionRecord>, MeteringError>;

    /// Customers with a due billing record or an open record whose period has ended.
    async fn customers_with_due_records(
        &self,
        organization_id: Uuid,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, MeteringError>;

    async fn list_billing_records(
        &self,
        subscription_record_id: Uuid,
    ) -> Result<Vec<BillingRecord>, MeteringError>;

    async fn list_charge_records(
        &self,
        billing_record_id: Uuid,
    ) -> Result<Vec<ComponentChargeRecord>, MeteringError>;

    /// Quantity and base already invoiced for a billing record on non-draft invoices.
    async fn invoiced_totals(
        &self,
        billing_record_id: Uuid,
        item_types: &[ChargeableItemType],
    ) -> Result<InvoicedTotals, MeteringError>;

    async fn commit_invoice(&self, commit: &InvoiceCommit) -> Result<(), MeteringError>;
    async fn get_invoice(&self, id: Uuid) -> Result<InvoiceDocument, MeteringError>;
    async fn set_payment_reference(
        &self,
        invoice_id: Uuid,
        provider: &str,
        external_id: &str,
    ) -> Result<(), MeteringError>;
    async fn set_document_url(&self, invoice_id: Uuid, url: &str) -> Result<(), MeteringError>;
    /// Terminal UNPAID -> PAID transition. Returns false when nothing changed.
    async fn mark_invoice_paid(&self, invoice_id: Uuid) -> Result<bool, MeteringError>;

    async fn balance_entries(
        &self,
        customer_id: Uuid,
        currency: &str,
    ) -> Result<Vec<CustomerBalanceAdjustment>, MeteringError>;

    /// Draw up to `amount` from the customer's active credits, atomically per customer.
    /// Returns the amount actually drawn.
    async fn draw_down(
        &self,
        organization_id: Uuid,
        customer_id: Uuid,
        currency: &str,
        amount: Decimal,
        invoice_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Decimal, MeteringError>;

    async fn grant_credit(&self, credit: &CustomerBalanceAdjustment) -> Result<(), MeteringError>;

    /// Undo every balance entry produced by `invoice_id`.
    async fn release_invoice_balance(&self, invoice_id: Uuid) -> Result<(), MeteringError>;

    /// Zero out expired credits. Returns how many credits were expired.
    async fn expire_balances(
        &self,
        organization_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, MeteringError>;
}
