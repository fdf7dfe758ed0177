//! In-process store implementing every storage seam. Backs tests and local
//! runs without Postgres.

use super::store::{
    BillingStore, CarryMode, EventStore, InvoiceCommit, RollupDefinition, RollupStore, UsagePoint,
    UsageQuery, UsageRow, UsageSource, UsageStore,
};
use crate::error::MeteringError;
use crate::invoicing::balance::{
    apply_plan, credit_states, plan_draw_down, plan_expiry, restore_statuses,
};
use crate::models::{
    Aggregation, BillingRecord, ChargeableItemType, ComponentChargeRecord, Customer,
    CustomerBalanceAdjustment, Event, InvoiceDocument, InvoicedTotals, Metric, Organization,
    PaymentStatus, PlanVersion, SubscriptionRecord, TimeGranularity,
};
use crate::proration::TimeRange;
use crate::rating::sql::normalize;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Evaluates a custom query against the events it is scoped to.
pub type CustomQuery = Arc<dyn Fn(&[Event]) -> Vec<(Uuid, Decimal)> + Send + Sync>;

#[derive(Default)]
struct State {
    organizations: HashMap<Uuid, Organization>,
    customers: HashMap<Uuid, Customer>,
    metrics: HashMap<Uuid, Metric>,
    plans: HashMap<Uuid, PlanVersion>,
    subscriptions: Vec<SubscriptionRecord>,
    billing_records: Vec<BillingRecord>,
    charge_records: Vec<ComponentChargeRecord>,
    invoices: Vec<InvoiceDocument>,
    balances: Vec<CustomerBalanceAdjustment>,
    events: Vec<Event>,
    rollups: HashMap<String, RollupDefinition>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
    custom_queries: RwLock<HashMap<String, CustomQuery>>,
    fail_next_commit: AtomicBool,
}

fn not_found(what: &str, id: Uuid) -> MeteringError {
    MeteringError::NotFound(format!("{what} {id} not found"))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_organization(&self, organization: Organization) {
        self.state
            .write()
            .await
            .organizations
            .insert(organization.id, organization);
    }

    pub async fn insert_customer(&self, customer: Customer) {
        self.state.write().await.customers.insert(customer.id, customer);
    }

    pub async fn insert_plan_version(&self, plan: PlanVersion) {
        self.state.write().await.plans.insert(plan.id, plan);
    }

    pub async fn insert_subscription(
        &self,
        record: SubscriptionRecord,
        billing_records: Vec<BillingRecord>,
        charge_records: Vec<ComponentChargeRecord>,
    ) {
        let mut state = self.state.write().await;
        state.subscriptions.push(record);
        state.billing_records.extend(billing_records);
        state.charge_records.extend(charge_records);
    }

    pub async fn insert_balance(&self, entry: CustomerBalanceAdjustment) {
        self.state.write().await.balances.push(entry);
    }

    /// Register the evaluator for a custom metric query.
    pub async fn register_custom_query(&self, sql: &str, query: CustomQuery) {
        self.custom_queries
            .write()
            .await
            .insert(normalize(sql), query);
    }

    /// Make the next `commit_invoice` fail without writing anything.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    pub async fn events(&self) -> Vec<Event> {
        self.state.read().await.events.clone()
    }

    pub async fn invoices_for_customer(&self, customer_id: Uuid) -> Vec<InvoiceDocument> {
        let mut invoices: Vec<InvoiceDocument> = self
            .state
            .read()
            .await
            .invoices
            .iter()
            .filter(|doc| doc.invoice.customer_id == customer_id)
            .cloned()
            .collect();
        invoices.sort_by_key(|doc| doc.invoice.issue_date);
        invoices
    }

    pub async fn subscriptions_for_customer(&self, customer_id: Uuid) -> Vec<SubscriptionRecord> {
        self.state
            .read()
            .await
            .subscriptions
            .iter()
            .filter(|sr| sr.customer_id == customer_id)
            .cloned()
            .collect()
    }

    pub async fn billing_record(&self, id: Uuid) -> Option<BillingRecord> {
        self.state
            .read()
            .await
            .billing_records
            .iter()
            .find(|br| br.id == id)
            .cloned()
    }

    pub async fn rollup_names(&self) -> BTreeSet<String> {
        self.state.read().await.rollups.keys().cloned().collect()
    }
}

/// Aggregate matching events the way the SQL store groups them.
fn aggregate_events<'a>(
    query: &UsageQuery,
    events: impl Iterator<Item = &'a Event>,
    bucket_of: impl Fn(DateTime<Utc>) -> DateTime<Utc>,
) -> Vec<UsageRow> {
    let mut groups: HashMap<(Uuid, DateTime<Utc>), (Decimal, i64)> = HashMap::new();
    for event in events.filter(|e| query.matches(e)) {
        let Some(value) = query.event_value(event) else {
            continue;
        };
        let slot = groups
            .entry((event.customer_id, bucket_of(event.time_created)))
            .or_insert((value, 0));
        if slot.1 > 0 {
            slot.0 = match query.aggregation {
                Aggregation::Max => slot.0.max(value),
                _ => slot.0 + value,
            };
        }
        slot.1 += 1;
    }
    let mut rows: Vec<UsageRow> = groups
        .into_iter()
        .map(|((customer_id, bucket), (value, count))| UsageRow {
            customer_id,
            bucket,
            value,
            count,
        })
        .collect();
    rows.sort_by(|a, b| (a.customer_id, a.bucket).cmp(&(b.customer_id, b.bucket)));
    rows
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn resolve_customer(
        &self,
        organization_id: Uuid,
        external_customer_id: &str,
    ) -> Result<Option<Customer>, MeteringError> {
        Ok(self
            .state
            .read()
            .await
            .customers
            .values()
            .find(|c| c.organization_id == organization_id && c.external_id == external_customer_id)
            .cloned())
    }

    async fn existing_idempotency_ids(
        &self,
        organization_id: Uuid,
        ids: &[String],
        time_created_since: DateTime<Utc>,
        inserted_since: DateTime<Utc>,
    ) -> Result<HashSet<String>, MeteringError> {
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        Ok(self
            .state
            .read()
            .await
            .events
            .iter()
            .filter(|e| {
                e.organization_id == organization_id
                    && wanted.contains(e.idempotency_id.as_str())
                    && (e.time_created >= time_created_since || e.inserted_at >= inserted_since)
            })
            .map(|e| e.idempotency_id.clone())
            .collect())
    }

    async fn insert_events(&self, events: &[Event]) -> Result<u64, MeteringError> {
        let mut state = self.state.write().await;
        let mut keys: HashSet<(Uuid, String, DateTime<Utc>)> = state
            .events
            .iter()
            .map(|e| (e.organization_id, e.idempotency_id.clone(), e.time_created))
            .collect();
        let mut inserted = 0;
        for event in events {
            if keys.insert((event.organization_id, event.idempotency_id.clone(), event.time_created)) {
                state.events.push(event.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }
}

#[async_trait]
impl UsageStore for MemoryStore {
    async fn aggregate(&self, query: &UsageQuery) -> Result<Vec<UsageRow>, MeteringError> {
        let state = self.state.read().await;
        match &query.source {
            UsageSource::Events => Ok(aggregate_events(query, state.events.iter(), |t| {
                query.bucket.bucket_key(t, &query.range)
            })),
            UsageSource::Rollup(name) => {
                let rollup = state.rollups.get(name).ok_or_else(|| {
                    MeteringError::NotFound(format!("rollup {name} is not provisioned"))
                })?;
                let granularity = rollup.granularity;
                Ok(aggregate_events(query, state.events.iter(), |t| {
                    granularity.truncate(t)
                }))
            }
        }
    }

    async fn scan(&self, query: &UsageQuery) -> Result<Vec<UsagePoint>, MeteringError> {
        let state = self.state.read().await;
        let mut points: Vec<UsagePoint> = state
            .events
            .iter()
            .filter(|e| query.matches(e))
            .filter_map(|e| {
                query.event_value(e).map(|value| UsagePoint {
                    customer_id: e.customer_id,
                    time_created: e.time_created,
                    value,
                    key: query
                        .property_name
                        .as_deref()
                        .and_then(|p| e.property_string(p)),
                })
            })
            .collect();
        points.sort_by_key(|p| p.time_created);
        Ok(points)
    }

    async fn last_value_before(
        &self,
        query: &UsageQuery,
        before: DateTime<Utc>,
        mode: CarryMode,
    ) -> Result<HashMap<Uuid, Decimal>, MeteringError> {
        let state = self.state.read().await;
        let mut prior: Vec<&Event> = state
            .events
            .iter()
            .filter(|e| e.time_created < before && query.matches_ignoring_time(e))
            .collect();
        prior.sort_by_key(|e| e.time_created);

        let mut carried: HashMap<Uuid, Decimal> = HashMap::new();
        for event in prior {
            let Some(value) = query.event_value(event) else {
                continue;
            };
            match mode {
                CarryMode::Latest => {
                    carried.insert(event.customer_id, value);
                }
                CarryMode::RunningSum => {
                    *carried.entry(event.customer_id).or_default() += value;
                }
            }
        }
        Ok(carried)
    }

    async fn run_custom_query(
        &self,
        organization_id: Uuid,
        sql: &str,
        customer_id: Option<Uuid>,
        range: &TimeRange,
    ) -> Result<Vec<(Uuid, Decimal)>, MeteringError> {
        let evaluator = self
            .custom_queries
            .read()
            .await
            .get(&normalize(sql))
            .cloned()
            .ok_or_else(|| {
                MeteringError::Configuration("custom query is not registered".to_string())
            })?;
        let scoped: Vec<Event> = self
            .state
            .read()
            .await
            .events
            .iter()
            .filter(|e| {
                e.organization_id == organization_id
                    && customer_id.map_or(true, |c| e.customer_id == c)
                    && range.contains(e.time_created)
            })
            .cloned()
            .collect();
        Ok(evaluator(&scoped))
    }
}

#[async_trait]
impl RollupStore for MemoryStore {
    async fn create_rollup(&self, definition: &RollupDefinition) -> Result<(), MeteringError> {
        self.state
            .write()
            .await
            .rollups
            .insert(definition.name.clone(), definition.clone());
        Ok(())
    }

    async fn drop_rollup(&self, name: &str) -> Result<(), MeteringError> {
        self.state.write().await.rollups.remove(name);
        Ok(())
    }
}

#[async_trait]
impl BillingStore for MemoryStore {
    async fn health_check(&self) -> Result<(), MeteringError> {
        Ok(())
    }

    async fn get_organization(&self, id: Uuid) -> Result<Organization, MeteringError> {
        self.state
            .read()
            .await
            .organizations
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("organization", id))
    }

    async fn list_organizations(&self) -> Result<Vec<Organization>, MeteringError> {
        let mut organizations: Vec<Organization> =
            self.state.read().await.organizations.values().cloned().collect();
        organizations.sort_by_key(|o| o.id);
        Ok(organizations)
    }

    async fn get_customer(&self, id: Uuid) -> Result<Customer, MeteringError> {
        self.state
            .read()
            .await
            .customers
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("customer", id))
    }

    async fn get_metric(&self, id: Uuid) -> Result<Metric, MeteringError> {
        self.state
            .read()
            .await
            .metrics
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("metric", id))
    }

    async fn save_metric(&self, metric: &Metric) -> Result<(), MeteringError> {
        self.state
            .write()
            .await
            .metrics
            .insert(metric.id, metric.clone());
        Ok(())
    }

    async fn get_plan_version(&self, id: Uuid) -> Result<PlanVersion, MeteringError> {
        self.state
            .read()
            .await
            .plans
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("plan version", id))
    }

    async fn list_open_subscription_records(
        &self,
        customer_id: Uuid,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<SubscriptionRecord>, MeteringError> {
        let mut records: Vec<SubscriptionRecord> = self
            .state
            .read()
            .await
            .subscriptions
            .iter()
            .filter(|sr| sr.customer_id == customer_id && !sr.fully_billed && sr.start_date <= as_of)
            .cloned()
            .collect();
        records.sort_by_key(|sr| sr.start_date);
        Ok(records)
    }

    async fn customers_with_due_records(
        &self,
        organization_id: Uuid,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, MeteringError> {
        let state = self.state.read().await;
        let customers: BTreeSet<Uuid> = state
            .subscriptions
            .iter()
            .filter(|sr| sr.organization_id == organization_id && !sr.fully_billed)
            .filter(|sr| {
                sr.end_date <= as_of
                    || state.billing_records.iter().any(|br| {
                        br.subscription_record_id == sr.id
                            && !br.fully_billed
                            && br.next_invoicing_date <= as_of
                    })
            })
            .map(|sr| sr.customer_id)
            .collect();
        Ok(customers.into_iter().collect())
    }

    async fn list_billing_records(
        &self,
        subscription_record_id: Uuid,
    ) -> Result<Vec<BillingRecord>, MeteringError> {
        Ok(self
            .state
            .read()
            .await
            .billing_records
            .iter()
            .filter(|br| br.subscription_record_id == subscription_record_id)
            .cloned()
            .collect())
    }

    async fn list_charge_records(
        &self,
        billing_record_id: Uuid,
    ) -> Result<Vec<ComponentChargeRecord>, MeteringError> {
        Ok(self
            .state
            .read()
            .await
            .charge_records
            .iter()
            .filter(|cr| cr.billing_record_id == billing_record_id)
            .cloned()
            .collect())
    }

    async fn invoiced_totals(
        &self,
        billing_record_id: Uuid,
        item_types: &[ChargeableItemType],
    ) -> Result<InvoicedTotals, MeteringError> {
        let state = self.state.read().await;
        let mut totals = InvoicedTotals::default();
        for doc in state
            .invoices
            .iter()
            .filter(|doc| doc.invoice.payment_status != PaymentStatus::Draft)
        {
            for item in doc.line_items.iter().filter(|li| {
                li.associated_billing_record == Some(billing_record_id)
                    && item_types.contains(&li.chargeable_item_type)
            }) {
                totals.quantity += item.quantity.unwrap_or_default();
                totals.revenue += item.base;
            }
        }
        Ok(totals)
    }

    async fn commit_invoice(&self, commit: &InvoiceCommit) -> Result<(), MeteringError> {
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(MeteringError::Database(anyhow::anyhow!(
                "Failed to commit invoice: injected failure"
            )));
        }
        let mut state = self.state.write().await;

        // Validate every billing-record transition before touching anything.
        let mut advanced = Vec::with_capacity(commit.billing_record_updates.len());
        for update in &commit.billing_record_updates {
            let mut record = state
                .billing_records
                .iter()
                .find(|br| br.id == update.id)
                .cloned()
                .ok_or_else(|| not_found("billing record", update.id))?;
            record.advance(update.next_invoicing_date, update.fully_billed)?;
            advanced.push(record);
        }

        for record in advanced {
            if let Some(slot) = state.billing_records.iter_mut().find(|br| br.id == record.id) {
                *slot = record;
            }
        }
        for cr in state
            .charge_records
            .iter_mut()
            .filter(|cr| commit.charge_records_billed.contains(&cr.id))
        {
            cr.fully_billed = true;
        }
        for sr in state
            .subscriptions
            .iter_mut()
            .filter(|sr| commit.subscription_records_billed.contains(&sr.id))
        {
            sr.fully_billed = true;
        }
        for period in &commit.new_periods {
            state.subscriptions.push(period.record.clone());
            state
                .billing_records
                .extend(period.billing_records.iter().cloned());
            state
                .charge_records
                .extend(period.charge_records.iter().cloned());
        }
        if let Some(document) = &commit.document {
            state.invoices.push(document.clone());
        }
        Ok(())
    }

    async fn get_invoice(&self, id: Uuid) -> Result<InvoiceDocument, MeteringError> {
        self.state
            .read()
            .await
            .invoices
            .iter()
            .find(|doc| doc.invoice.id == id)
            .cloned()
            .ok_or_else(|| not_found("invoice", id))
    }

    async fn set_payment_reference(
        &self,
        invoice_id: Uuid,
        provider: &str,
        external_id: &str,
    ) -> Result<(), MeteringError> {
        let mut state = self.state.write().await;
        let doc = state
            .invoices
            .iter_mut()
            .find(|doc| doc.invoice.id == invoice_id)
            .ok_or_else(|| not_found("invoice", invoice_id))?;
        doc.invoice.payment_provider = Some(provider.to_string());
        doc.invoice.external_payment_id = Some(external_id.to_string());
        Ok(())
    }

    async fn set_document_url(&self, invoice_id: Uuid, url: &str) -> Result<(), MeteringError> {
        let mut state = self.state.write().await;
        let doc = state
            .invoices
            .iter_mut()
            .find(|doc| doc.invoice.id == invoice_id)
            .ok_or_else(|| not_found("invoice", invoice_id))?;
        doc.invoice.document_url = Some(url.to_string());
        Ok(())
    }

    async fn mark_invoice_paid(&self, invoice_id: Uuid) -> Result<bool, MeteringError> {
        let mut state = self.state.write().await;
        let doc = state
            .invoices
            .iter_mut()
            .find(|doc| doc.invoice.id == invoice_id)
            .ok_or_else(|| not_found("invoice", invoice_id))?;
        if doc.invoice.payment_status != PaymentStatus::Unpaid {
            return Ok(false);
        }
        doc.invoice.payment_status = PaymentStatus::Paid;
        Ok(true)
    }

    async fn balance_entries(
        &self,
        customer_id: Uuid,
        currency: &str,
    ) -> Result<Vec<CustomerBalanceAdjustment>, MeteringError> {
        Ok(self
            .state
            .read()
            .await
            .balances
            .iter()
            .filter(|e| e.customer_id == customer_id && e.currency == currency)
            .cloned()
            .collect())
    }

    async fn draw_down(
        &self,
        _organization_id: Uuid,
        customer_id: Uuid,
        currency: &str,
        amount: Decimal,
        invoice_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Decimal, MeteringError> {
        let mut state = self.state.write().await;
        let entries: Vec<CustomerBalanceAdjustment> = state
            .balances
            .iter()
            .filter(|e| e.customer_id == customer_id && e.currency == currency)
            .cloned()
            .collect();
        let plan = plan_draw_down(&credit_states(&entries), amount, invoice_id, now);
        let drawn = plan.drawn;
        apply_plan(&mut state.balances, plan);
        Ok(drawn)
    }

    async fn grant_credit(&self, credit: &CustomerBalanceAdjustment) -> Result<(), MeteringError> {
        self.state.write().await.balances.push(credit.clone());
        Ok(())
    }

    async fn release_invoice_balance(&self, invoice_id: Uuid) -> Result<(), MeteringError> {
        let mut state = self.state.write().await;
        let parents: BTreeSet<Uuid> = state
            .balances
            .iter()
            .filter(|e| e.invoice_id == Some(invoice_id))
            .filter_map(|e| e.parent_adjustment_id)
            .collect();
        state.balances.retain(|e| e.invoice_id != Some(invoice_id));
        for parent in parents {
            restore_statuses(&mut state.balances, parent);
        }
        Ok(())
    }

    async fn expire_balances(
        &self,
        organization_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, MeteringError> {
        let mut state = self.state.write().await;
        let entries: Vec<CustomerBalanceAdjustment> = state
            .balances
            .iter()
            .filter(|e| e.organization_id == organization_id)
            .cloned()
            .collect();
        let plan = plan_expiry(&credit_states(&entries), now);
        let expired = plan.new_entries.len() as u64;
        apply_plan(&mut state.balances, plan);
        Ok(expired)
    }
}
