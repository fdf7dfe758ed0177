//! PostgreSQL/TimescaleDB implementation of the storage seams.

use super::metrics::DB_QUERY_DURATION;
use super::store::{
    BillingStore, CarryMode, EventStore, InvoiceCommit, RollupDefinition, RollupStore, UsagePoint,
    UsageQuery, UsageRow, UsageSource, UsageStore,
};
use crate::error::MeteringError;
use crate::invoicing::balance::{
    credit_states, plan_draw_down, plan_expiry, restore_statuses, LedgerPlan,
};
use crate::models::{
    AdjustmentType, Aggregation, BalanceStatus, BillingRecord, BillingRecordKind, BillingType,
    CategoricalOperator, ChargeableItemType, ComponentChargeRecord, Customer,
    CustomerBalanceAdjustment, Event, Invoice, InvoiceDocument, InvoiceLineItem,
    InvoiceLineItemAdjustment, InvoicedTotals, Metric, Organization, PaymentStatus, PlanVersion,
    SubscriptionFilter, SubscriptionRecord, TaxProviderKind, TimeGranularity,
};
use crate::proration::TimeRange;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{FromRow, Postgres, QueryBuilder, Transaction};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

static ROLLUP_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^cagg_[0-9a-f]{56}$").expect("valid regex"));

fn db_err(context: &'static str) -> impl Fn(sqlx::Error) -> MeteringError {
    move |e| MeteringError::Database(anyhow::anyhow!("Failed to {}: {}", context, e))
}

fn checked_rollup_name(name: &str) -> Result<&str, MeteringError> {
    if ROLLUP_NAME.is_match(name) {
        Ok(name)
    } else {
        Err(MeteringError::Configuration(format!(
            "invalid rollup name {name}"
        )))
    }
}

/// Single-quoted SQL literal for DDL, where bind parameters are not allowed.
fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn trunc_unit(granularity: TimeGranularity) -> Option<&'static str> {
    match granularity {
        TimeGranularity::Seconds => Some("second"),
        TimeGranularity::Minutes => Some("minute"),
        TimeGranularity::Hours => Some("hour"),
        TimeGranularity::Days => Some("day"),
        TimeGranularity::Months => Some("month"),
        TimeGranularity::Quarters => Some("quarter"),
        TimeGranularity::Years => Some("year"),
        TimeGranularity::Total => None,
    }
}

fn bucket_interval(granularity: TimeGranularity) -> &'static str {
    match granularity {
        TimeGranularity::Seconds => "1 second",
        TimeGranularity::Minutes => "1 minute",
        TimeGranularity::Hours => "1 hour",
        TimeGranularity::Months => "1 month",
        TimeGranularity::Quarters => "3 months",
        TimeGranularity::Years => "1 year",
        TimeGranularity::Days | TimeGranularity::Total => "1 day",
    }
}

/// Push the per-event value expression of a query.
fn push_value(builder: &mut QueryBuilder<'_, Postgres>, query: &UsageQuery) {
    match (query.aggregation, &query.property_name) {
        (Aggregation::Count, _) | (Aggregation::Unique, _) | (_, None) => {
            builder.push("1::numeric");
        }
        (_, Some(property)) => {
            builder.push("(properties->>");
            builder.push_bind(property.clone());
            builder.push(")::numeric");
        }
    }
}

/// Push every predicate of a query after `WHERE`.
fn push_predicates(
    builder: &mut QueryBuilder<'_, Postgres>,
    query: &UsageQuery,
    include_range: bool,
) {
    builder.push("organization_id = ");
    builder.push_bind(query.organization_id);
    builder.push(" AND event_name = ");
    builder.push_bind(query.event_name.clone());
    if include_range {
        builder.push(" AND time_created >= ");
        builder.push_bind(query.range.start);
        builder.push(" AND time_created < ");
        builder.push_bind(query.range.end);
    }
    if let Some(customer_id) = query.customer_id {
        builder.push(" AND customer_id = ");
        builder.push_bind(customer_id);
    }
    if let (Some(property), true) = (&query.property_name, query.aggregation.needs_property()) {
        builder.push(" AND properties->>");
        builder.push_bind(property.clone());
        builder.push(" IS NOT NULL");
    }
    for filter in &query.numeric_filters {
        builder.push(" AND (properties->>");
        builder.push_bind(filter.property_name.clone());
        builder.push(")::numeric ");
        builder.push(filter.operator.sql());
        builder.push(" ");
        builder.push_bind(filter.comparison_value);
    }
    for filter in &query.categorical_filters {
        match filter.operator {
            CategoricalOperator::IsIn => {
                builder.push(" AND properties->>");
                builder.push_bind(filter.property_name.clone());
                builder.push(" = ANY(");
                builder.push_bind(filter.values.clone());
                builder.push(")");
            }
            CategoricalOperator::IsNotIn => {
                builder.push(" AND COALESCE(NOT (properties->>");
                builder.push_bind(filter.property_name.clone());
                builder.push(" = ANY(");
                builder.push_bind(filter.values.clone());
                builder.push(")), TRUE)");
            }
        }
    }
    push_subscription_filters(builder, &query.subscription_filters);
}

fn push_subscription_filters(
    builder: &mut QueryBuilder<'_, Postgres>,
    filters: &[SubscriptionFilter],
) {
    for filter in filters {
        builder.push(" AND properties->>");
        builder.push_bind(filter.property_name.clone());
        builder.push(" = ");
        builder.push_bind(filter.value.clone());
    }
}

/// Literal predicates for a continuous aggregate definition.
fn rollup_predicates(definition: &RollupDefinition) -> String {
    let metric = &definition.metric;
    let mut clauses = vec![
        format!("organization_id = {}", quote_literal(&metric.organization_id.to_string())),
        format!("event_name = {}", quote_literal(&metric.event_name)),
    ];
    if let (Some(property), true) = (&metric.property_name, metric.aggregation.needs_property()) {
        clauses.push(format!("properties->>{} IS NOT NULL", quote_literal(property)));
    }
    for filter in &metric.numeric_filters {
        clauses.push(format!(
            "(properties->>{})::numeric {} {}",
            quote_literal(&filter.property_name),
            filter.operator.sql(),
            filter.comparison_value
        ));
    }
    for filter in &metric.categorical_filters {
        let values = filter
            .values
            .iter()
            .map(|v| quote_literal(v))
            .collect::<Vec<_>>()
            .join(", ");
        let property = quote_literal(&filter.property_name);
        clauses.push(match (filter.operator, values.is_empty()) {
            (CategoricalOperator::IsIn, true) => "FALSE".to_string(),
            (CategoricalOperator::IsNotIn, true) => "TRUE".to_string(),
            (CategoricalOperator::IsIn, false) => format!("properties->>{property} IN ({values})"),
            (CategoricalOperator::IsNotIn, false) => {
                format!("COALESCE(properties->>{property} NOT IN ({values}), TRUE)")
            }
        });
    }
    clauses.join(" AND ")
}

fn rollup_value(metric: &Metric) -> String {
    match (metric.aggregation, &metric.property_name) {
        (Aggregation::Count, _) | (Aggregation::Unique, _) | (_, None) => "1::numeric".to_string(),
        (_, Some(property)) => format!("(properties->>{})::numeric", quote_literal(property)),
    }
}

#[derive(FromRow)]
struct OrganizationRow {
    id: Uuid,
    name: String,
    tax_rate: Option<Decimal>,
    tax_providers: Json<Vec<TaxProviderKind>>,
    net_terms_days: Option<i64>,
}

impl From<OrganizationRow> for Organization {
    fn from(row: OrganizationRow) -> Self {
        Organization {
            id: row.id,
            name: row.name,
            tax_rate: row.tax_rate,
            tax_providers: row.tax_providers.0,
            net_terms_days: row.net_terms_days,
        }
    }
}

#[derive(FromRow)]
struct CustomerRow {
    id: Uuid,
    organization_id: Uuid,
    external_id: String,
    name: String,
    tax_rate: Option<Decimal>,
    tax_providers: Json<Vec<TaxProviderKind>>,
    payment_provider: Option<String>,
    net_terms_days: Option<i64>,
}

impl From<CustomerRow> for Customer {
    fn from(row: CustomerRow) -> Self {
        Customer {
            id: row.id,
            organization_id: row.organization_id,
            external_id: row.external_id,
            name: row.name,
            tax_rate: row.tax_rate,
            tax_providers: row.tax_providers.0,
            payment_provider: row.payment_provider,
            net_terms_days: row.net_terms_days,
        }
    }
}

#[derive(FromRow)]
struct SubscriptionRow {
    id: Uuid,
    organization_id: Uuid,
    customer_id: Uuid,
    plan_version_id: Uuid,
    start_date: DateTime<Utc>,
    usage_start_date: DateTime<Utc>,
    end_date: DateTime<Utc>,
    quantity: Decimal,
    auto_renew: bool,
    fully_billed: bool,
    is_one_time: bool,
    filters: Json<Vec<SubscriptionFilter>>,
}

impl From<SubscriptionRow> for SubscriptionRecord {
    fn from(row: SubscriptionRow) -> Self {
        SubscriptionRecord {
            id: row.id,
            organization_id: row.organization_id,
            customer_id: row.customer_id,
            plan_version_id: row.plan_version_id,
            start_date: row.start_date,
            usage_start_date: row.usage_start_date,
            end_date: row.end_date,
            quantity: row.quantity,
            auto_renew: row.auto_renew,
            fully_billed: row.fully_billed,
            is_one_time: row.is_one_time,
            filters: row.filters.0,
        }
    }
}

#[derive(FromRow)]
struct BillingRecordRow {
    id: Uuid,
    subscription_record_id: Uuid,
    kind: Json<BillingRecordKind>,
    start_date: DateTime<Utc>,
    end_date: DateTime<Utc>,
    next_invoicing_date: DateTime<Utc>,
    unadjusted_duration_secs: i64,
    fully_billed: bool,
}

impl From<BillingRecordRow> for BillingRecord {
    fn from(row: BillingRecordRow) -> Self {
        BillingRecord {
            id: row.id,
            subscription_record_id: row.subscription_record_id,
            kind: row.kind.0,
            start_date: row.start_date,
            end_date: row.end_date,
            next_invoicing_date: row.next_invoicing_date,
            unadjusted_duration_secs: row.unadjusted_duration_secs,
            fully_billed: row.fully_billed,
        }
    }
}

#[derive(FromRow)]
struct ChargeRecordRow {
    id: Uuid,
    billing_record_id: Uuid,
    units: Decimal,
    start_date: DateTime<Utc>,
    end_date: DateTime<Utc>,
    fully_billed: bool,
}

impl From<ChargeRecordRow> for ComponentChargeRecord {
    fn from(row: ChargeRecordRow) -> Self {
        ComponentChargeRecord {
            id: row.id,
            billing_record_id: row.billing_record_id,
            units: row.units,
            start_date: row.start_date,
            end_date: row.end_date,
            fully_billed: row.fully_billed,
        }
    }
}

#[derive(FromRow)]
struct InvoiceRow {
    id: Uuid,
    organization_id: Uuid,
    customer_id: Uuid,
    currency: String,
    issue_date: DateTime<Utc>,
    due_date: DateTime<Utc>,
    payment_status: String,
    amount: Decimal,
    payment_provider: Option<String>,
    external_payment_id: Option<String>,
    document_url: Option<String>,
}

impl From<InvoiceRow> for Invoice {
    fn from(row: InvoiceRow) -> Self {
        Invoice {
            id: row.id,
            organization_id: row.organization_id,
            customer_id: row.customer_id,
            currency: row.currency,
            issue_date: row.issue_date,
            due_date: row.due_date,
            payment_status: PaymentStatus::from_string(&row.payment_status),
            amount: row.amount,
            payment_provider: row.payment_provider,
            external_payment_id: row.external_payment_id,
            document_url: row.document_url,
        }
    }
}

#[derive(FromRow)]
struct LineItemRow {
    id: Uuid,
    invoice_id: Uuid,
    name: String,
    start_date: DateTime<Utc>,
    end_date: DateTime<Utc>,
    quantity: Option<Decimal>,
    base: Decimal,
    billing_type: String,
    chargeable_item_type: String,
    associated_subscription_record: Option<Uuid>,
    associated_billing_record: Option<Uuid>,
    associated_plan_version: Option<Uuid>,
    associated_charge_record: Option<Uuid>,
}

impl From<LineItemRow> for InvoiceLineItem {
    fn from(row: LineItemRow) -> Self {
        InvoiceLineItem {
            id: row.id,
            invoice_id: row.invoice_id,
            name: row.name,
            start_date: row.start_date,
            end_date: row.end_date,
            quantity: row.quantity,
            base: row.base,
            billing_type: BillingType::from_string(&row.billing_type),
            chargeable_item_type: ChargeableItemType::from_string(&row.chargeable_item_type),
            associated_subscription_record: row.associated_subscription_record,
            associated_billing_record: row.associated_billing_record,
            associated_plan_version: row.associated_plan_version,
            associated_charge_record: row.associated_charge_record,
        }
    }
}

#[derive(FromRow)]
struct AdjustmentRow {
    id: Uuid,
    line_item_id: Uuid,
    adjustment_type: String,
    amount: Decimal,
}

impl From<AdjustmentRow> for InvoiceLineItemAdjustment {
    fn from(row: AdjustmentRow) -> Self {
        InvoiceLineItemAdjustment {
            id: row.id,
            line_item_id: row.line_item_id,
            adjustment_type: AdjustmentType::from_string(&row.adjustment_type),
            amount: row.amount,
        }
    }
}

#[derive(FromRow)]
struct BalanceRow {
    id: Uuid,
    organization_id: Uuid,
    customer_id: Uuid,
    currency: String,
    amount: Decimal,
    description: String,
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    status: String,
    parent_adjustment_id: Option<Uuid>,
    invoice_id: Option<Uuid>,
}

impl From<BalanceRow> for CustomerBalanceAdjustment {
    fn from(row: BalanceRow) -> Self {
        CustomerBalanceAdjustment {
            id: row.id,
            organization_id: row.organization_id,
            customer_id: row.customer_id,
            currency: row.currency,
            amount: row.amount,
            description: row.description,
            created_at: row.created_at,
            expires_at: row.expires_at,
            status: BalanceStatus::from_string(&row.status),
            parent_adjustment_id: row.parent_adjustment_id,
            invoice_id: row.invoice_id,
        }
    }
}

const BALANCE_COLUMNS: &str = "id, organization_id, customer_id, currency, amount, description, created_at, expires_at, status, parent_adjustment_id, invoice_id";
const SUBSCRIPTION_COLUMNS: &str = "id, organization_id, customer_id, plan_version_id, start_date, usage_start_date, end_date, quantity, auto_renew, fully_billed, is_one_time, filters";
const BILLING_RECORD_COLUMNS: &str = "id, subscription_record_id, kind, start_date, end_date, next_invoicing_date, unadjusted_duration_secs, fully_billed";

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "metering-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, MeteringError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(db_err("connect"))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), MeteringError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| MeteringError::Database(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    async fn balance_rows_for_update(
        tx: &mut Transaction<'_, Postgres>,
        customer_id: Option<Uuid>,
        organization_id: Option<Uuid>,
        currency: Option<&str>,
    ) -> Result<Vec<CustomerBalanceAdjustment>, MeteringError> {
        let mut builder = QueryBuilder::<Postgres>::new(format!(
            "SELECT {BALANCE_COLUMNS} FROM customer_balance_adjustments WHERE TRUE"
        ));
        if let Some(customer_id) = customer_id {
            builder.push(" AND customer_id = ").push_bind(customer_id);
        }
        if let Some(organization_id) = organization_id {
            builder.push(" AND organization_id = ").push_bind(organization_id);
        }
        if let Some(currency) = currency {
            builder.push(" AND currency = ").push_bind(currency.to_string());
        }
        builder.push(" ORDER BY created_at FOR UPDATE");
        let rows = builder
            .build_query_as::<BalanceRow>()
            .fetch_all(&mut **tx)
            .await
            .map_err(db_err("lock balance entries"))?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn insert_balance_entry(
        tx: &mut Transaction<'_, Postgres>,
        entry: &CustomerBalanceAdjustment,
    ) -> Result<(), MeteringError> {
        sqlx::query(
            r#"
            INSERT INTO customer_balance_adjustments (id, organization_id, customer_id, currency, amount, description, created_at, expires_at, status, parent_adjustment_id, invoice_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(entry.id)
        .bind(entry.organization_id)
        .bind(entry.customer_id)
        .bind(&entry.currency)
        .bind(entry.amount)
        .bind(&entry.description)
        .bind(entry.created_at)
        .bind(entry.expires_at)
        .bind(entry.status.as_str())
        .bind(entry.parent_adjustment_id)
        .bind(entry.invoice_id)
        .execute(&mut **tx)
        .await
        .map_err(db_err("insert balance entry"))?;
        Ok(())
    }

    async fn apply_ledger_plan(
        tx: &mut Transaction<'_, Postgres>,
        plan: &LedgerPlan,
    ) -> Result<(), MeteringError> {
        if !plan.deactivate.is_empty() {
            sqlx::query(
                "UPDATE customer_balance_adjustments SET status = 'inactive' WHERE id = ANY($1)",
            )
            .bind(&plan.deactivate)
            .execute(&mut **tx)
            .await
            .map_err(db_err("deactivate balance entries"))?;
        }
        for entry in &plan.new_entries {
            Self::insert_balance_entry(tx, entry).await?;
        }
        Ok(())
    }

    async fn insert_subscription_record(
        tx: &mut Transaction<'_, Postgres>,
        record: &SubscriptionRecord,
    ) -> Result<(), MeteringError> {
        sqlx::query(
            r#"
            INSERT INTO subscription_records (id, organization_id, customer_id, plan_version_id, start_date, usage_start_date, end_date, quantity, auto_renew, fully_billed, is_one_time, filters)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(record.id)
        .bind(record.organization_id)
        .bind(record.customer_id)
        .bind(record.plan_version_id)
        .bind(record.start_date)
        .bind(record.usage_start_date)
        .bind(record.end_date)
        .bind(record.quantity)
        .bind(record.auto_renew)
        .bind(record.fully_billed)
        .bind(record.is_one_time)
        .bind(Json(&record.filters))
        .execute(&mut **tx)
        .await
        .map_err(db_err("insert subscription record"))?;
        Ok(())
    }

    async fn insert_billing_record(
        tx: &mut Transaction<'_, Postgres>,
        record: &BillingRecord,
    ) -> Result<(), MeteringError> {
        sqlx::query(
            r#"
            INSERT INTO billing_records (id, subscription_record_id, kind, start_date, end_date, next_invoicing_date, unadjusted_duration_secs, fully_billed)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(record.id)
        .bind(record.subscription_record_id)
        .bind(Json(record.kind))
        .bind(record.start_date)
        .bind(record.end_date)
        .bind(record.next_invoicing_date)
        .bind(record.unadjusted_duration_secs)
        .bind(record.fully_billed)
        .execute(&mut **tx)
        .await
        .map_err(db_err("insert billing record"))?;
        Ok(())
    }

    async fn insert_charge_record(
        tx: &mut Transaction<'_, Postgres>,
        charge: &ComponentChargeRecord,
    ) -> Result<(), MeteringError> {
        sqlx::query(
            r#"
            INSERT INTO component_charge_records (id, billing_record_id, units, start_date, end_date, fully_billed)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(charge.id)
        .bind(charge.billing_record_id)
        .bind(charge.units)
        .bind(charge.start_date)
        .bind(charge.end_date)
        .bind(charge.fully_billed)
        .execute(&mut **tx)
        .await
        .map_err(db_err("insert charge record"))?;
        Ok(())
    }

    async fn insert_document(
        tx: &mut Transaction<'_, Postgres>,
        document: &InvoiceDocument,
    ) -> Result<(), MeteringError> {
        let invoice = &document.invoice;
        sqlx::query(
            r#"
            INSERT INTO invoices (id, organization_id, customer_id, currency, issue_date, due_date, payment_status, amount, payment_provider, external_payment_id, document_url)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(invoice.id)
        .bind(invoice.organization_id)
        .bind(invoice.customer_id)
        .bind(&invoice.currency)
        .bind(invoice.issue_date)
        .bind(invoice.due_date)
        .bind(invoice.payment_status.as_str())
        .bind(invoice.amount)
        .bind(&invoice.payment_provider)
        .bind(&invoice.external_payment_id)
        .bind(&invoice.document_url)
        .execute(&mut **tx)
        .await
        .map_err(db_err("insert invoice"))?;

        for (position, item) in document.line_items.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO invoice_line_items (id, invoice_id, position, name, start_date, end_date, quantity, base, billing_type, chargeable_item_type, associated_subscription_record, associated_billing_record, associated_plan_version, associated_charge_record)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                "#,
            )
            .bind(item.id)
            .bind(item.invoice_id)
            .bind(position as i32)
            .bind(&item.name)
            .bind(item.start_date)
            .bind(item.end_date)
            .bind(item.quantity)
            .bind(item.base)
            .bind(item.billing_type.as_str())
            .bind(item.chargeable_item_type.as_str())
            .bind(item.associated_subscription_record)
            .bind(item.associated_billing_record)
            .bind(item.associated_plan_version)
            .bind(item.associated_charge_record)
            .execute(&mut **tx)
            .await
            .map_err(db_err("insert invoice line item"))?;
        }

        for adjustment in &document.adjustments {
            sqlx::query(
                r#"
                INSERT INTO invoice_line_item_adjustments (id, line_item_id, adjustment_type, amount)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(adjustment.id)
            .bind(adjustment.line_item_id)
            .bind(adjustment.adjustment_type.as_str())
            .bind(adjustment.amount)
            .execute(&mut **tx)
            .await
            .map_err(db_err("insert line item adjustment"))?;
        }
        Ok(())
    }
}

#[async_trait]
impl EventStore for Database {
    #[instrument(skip(self), fields(organization_id = %organization_id))]
    async fn resolve_customer(
        &self,
        organization_id: Uuid,
        external_customer_id: &str,
    ) -> Result<Option<Customer>, MeteringError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["resolve_customer"])
            .start_timer();

        let row = sqlx::query_as::<_, CustomerRow>(
            r#"
            SELECT id, organization_id, external_id, name, tax_rate, tax_providers, payment_provider, net_terms_days
            FROM customers
            WHERE organization_id = $1 AND external_id = $2
            "#,
        )
        .bind(organization_id)
        .bind(external_customer_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("resolve customer"))?;

        timer.observe_duration();
        Ok(row.map(Into::into))
    }

    #[instrument(skip(self, ids), fields(organization_id = %organization_id, ids = ids.len()))]
    async fn existing_idempotency_ids(
        &self,
        organization_id: Uuid,
        ids: &[String],
        time_created_since: DateTime<Utc>,
        inserted_since: DateTime<Utc>,
    ) -> Result<HashSet<String>, MeteringError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["existing_idempotency_ids"])
            .start_timer();

        let existing = sqlx::query_scalar::<_, String>(
            r#"
            SELECT DISTINCT idempotency_id
            FROM events
            WHERE organization_id = $1
              AND idempotency_id = ANY($2)
              AND (time_created >= $3 OR inserted_at >= $4)
            "#,
        )
        .bind(organization_id)
        .bind(ids)
        .bind(time_created_since)
        .bind(inserted_since)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("check idempotency ids"))?;

        timer.observe_duration();
        Ok(existing.into_iter().collect())
    }

    #[instrument(skip(self, events), fields(count = events.len()))]
    async fn insert_events(&self, events: &[Event]) -> Result<u64, MeteringError> {
        if events.is_empty() {
            return Ok(0);
        }
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_events"])
            .start_timer();

        let mut builder = QueryBuilder::<Postgres>::new(
            "INSERT INTO events (organization_id, customer_id, event_name, properties, time_created, idempotency_id, inserted_at) ",
        );
        builder.push_values(events, |mut row, event| {
            row.push_bind(event.organization_id)
                .push_bind(event.customer_id)
                .push_bind(event.event_name.clone())
                .push_bind(Json(event.properties.clone()))
                .push_bind(event.time_created)
                .push_bind(event.idempotency_id.clone())
                .push_bind(event.inserted_at);
        });
        builder.push(" ON CONFLICT (organization_id, idempotency_id, time_created) DO NOTHING");

        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(db_err("insert events"))?;

        timer.observe_duration();
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl UsageStore for Database {
    #[instrument(skip(self, query), fields(event_name = %query.event_name))]
    async fn aggregate(&self, query: &UsageQuery) -> Result<Vec<UsageRow>, MeteringError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["aggregate_usage"])
            .start_timer();

        let fold = if query.aggregation == Aggregation::Max { "MAX" } else { "SUM" };
        let mut builder = QueryBuilder::<Postgres>::new("SELECT customer_id, ");

        match &query.source {
            UsageSource::Events => {
                match trunc_unit(query.bucket) {
                    Some(unit) => {
                        builder.push(format!("GREATEST(date_trunc('{unit}', time_created, 'UTC'), date_trunc('{unit}', "));
                        builder.push_bind(query.range.start);
                        builder.push("::timestamptz, 'UTC'))");
                    }
                    None => {
                        builder.push_bind(query.range.start);
                        builder.push("::timestamptz");
                    }
                }
                builder.push(format!(" AS bucket, {fold}("));
                push_value(&mut builder, query);
                builder.push(") AS value, COUNT(*) AS count FROM events WHERE ");
                push_predicates(&mut builder, query, true);
            }
            UsageSource::Rollup(name) => {
                let name = checked_rollup_name(name)?;
                let column = if query.aggregation == Aggregation::Max {
                    "max_value"
                } else {
                    "sum_value"
                };
                builder.push(format!(
                    "bucket, {fold}({column}) AS value, SUM(num_events)::bigint AS count FROM {name} WHERE bucket >= "
                ));
                builder.push_bind(query.range.start);
                builder.push(" AND bucket < ");
                builder.push_bind(query.range.end);
                if let Some(customer_id) = query.customer_id {
                    builder.push(" AND customer_id = ");
                    builder.push_bind(customer_id);
                }
            }
        }
        builder.push(" GROUP BY customer_id, bucket ORDER BY customer_id, bucket");

        let rows = builder
            .build_query_as::<(Uuid, DateTime<Utc>, Option<Decimal>, i64)>()
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("aggregate usage"))?;

        timer.observe_duration();
        Ok(rows
            .into_iter()
            .map(|(customer_id, bucket, value, count)| UsageRow {
                customer_id,
                bucket,
                value: value.unwrap_or_default(),
                count,
            })
            .collect())
    }

    #[instrument(skip(self, query), fields(event_name = %query.event_name))]
    async fn scan(&self, query: &UsageQuery) -> Result<Vec<UsagePoint>, MeteringError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["scan_usage"])
            .start_timer();

        let mut builder = QueryBuilder::<Postgres>::new("SELECT customer_id, time_created, ");
        push_value(&mut builder, query);
        builder.push(" AS value, ");
        match &query.property_name {
            Some(property) => {
                builder.push("properties->>");
                builder.push_bind(property.clone());
            }
            None => {
                builder.push("NULL::text");
            }
        }
        builder.push(" AS key FROM events WHERE ");
        push_predicates(&mut builder, query, true);
        builder.push(" ORDER BY time_created");

        let rows = builder
            .build_query_as::<(Uuid, DateTime<Utc>, Decimal, Option<String>)>()
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("scan usage"))?;

        timer.observe_duration();
        Ok(rows
            .into_iter()
            .map(|(customer_id, time_created, value, key)| UsagePoint {
                customer_id,
                time_created,
                value,
                key,
            })
            .collect())
    }

    #[instrument(skip(self, query), fields(event_name = %query.event_name))]
    async fn last_value_before(
        &self,
        query: &UsageQuery,
        before: DateTime<Utc>,
        mode: CarryMode,
    ) -> Result<HashMap<Uuid, Decimal>, MeteringError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["last_value_before"])
            .start_timer();

        let mut builder = match mode {
            CarryMode::Latest => QueryBuilder::<Postgres>::new("SELECT DISTINCT ON (customer_id) customer_id, "),
            CarryMode::RunningSum => QueryBuilder::<Postgres>::new("SELECT customer_id, SUM("),
        };
        push_value(&mut builder, query);
        if mode == CarryMode::RunningSum {
            builder.push(")");
        }
        builder.push(" AS value FROM events WHERE ");
        push_predicates(&mut builder, query, false);
        builder.push(" AND time_created < ");
        builder.push_bind(before);
        match mode {
            CarryMode::Latest => builder.push(" ORDER BY customer_id, time_created DESC"),
            CarryMode::RunningSum => builder.push(" GROUP BY customer_id"),
        };

        let rows = builder
            .build_query_as::<(Uuid, Option<Decimal>)>()
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("load prior state"))?;

        timer.observe_duration();
        Ok(rows
            .into_iter()
            .filter_map(|(customer, value)| value.map(|v| (customer, v)))
            .collect())
    }

    #[instrument(skip(self, sql), fields(organization_id = %organization_id))]
    async fn run_custom_query(
        &self,
        organization_id: Uuid,
        sql: &str,
        customer_id: Option<Uuid>,
        range: &TimeRange,
    ) -> Result<Vec<(Uuid, Decimal)>, MeteringError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["run_custom_query"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(db_err("begin transaction"))?;
        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(db_err("enter read-only transaction"))?;

        let mut builder = QueryBuilder::<Postgres>::new(
            "WITH events AS (SELECT * FROM events WHERE organization_id = ",
        );
        builder.push_bind(organization_id);
        builder.push(" AND time_created >= ");
        builder.push_bind(range.start);
        builder.push(" AND time_created < ");
        builder.push_bind(range.end);
        if let Some(customer_id) = customer_id {
            builder.push(" AND customer_id = ");
            builder.push_bind(customer_id);
        }
        builder.push(") SELECT customer_id, SUM(usage_qty)::numeric AS usage_qty FROM (");
        builder.push(sql);
        builder.push(") AS custom_usage GROUP BY customer_id");

        let rows = builder
            .build_query_as::<(Uuid, Option<Decimal>)>()
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| {
                MeteringError::Configuration(format!("custom query failed: {}", e))
            })?;
        tx.rollback().await.map_err(db_err("end read-only transaction"))?;

        timer.observe_duration();
        Ok(rows
            .into_iter()
            .map(|(customer, value)| (customer, value.unwrap_or_default()))
            .collect())
    }
}

#[async_trait]
impl RollupStore for Database {
    #[instrument(skip(self, definition), fields(rollup = %definition.name))]
    async fn create_rollup(&self, definition: &RollupDefinition) -> Result<(), MeteringError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_rollup"])
            .start_timer();

        let name = checked_rollup_name(&definition.name)?;
        let value = rollup_value(&definition.metric);
        let ddl = format!(
            r#"
            CREATE MATERIALIZED VIEW IF NOT EXISTS {name}
            WITH (timescaledb.continuous, timescaledb.materialized_only = false) AS
            SELECT customer_id,
                   time_bucket(INTERVAL '{interval}', time_created) AS bucket,
                   SUM({value}) AS sum_value,
                   MAX({value}) AS max_value,
                   COUNT(*) AS num_events
            FROM events
            WHERE {predicates}
            GROUP BY customer_id, bucket
            WITH NO DATA
            "#,
            interval = bucket_interval(definition.granularity),
            predicates = rollup_predicates(definition),
        );
        sqlx::query(&ddl)
            .execute(&self.pool)
            .await
            .map_err(db_err("create rollup"))?;

        sqlx::query(
            "SELECT add_continuous_aggregate_policy($1::regclass, start_offset => NULL, end_offset => INTERVAL '1 hour', schedule_interval => INTERVAL '1 hour', if_not_exists => TRUE)",
        )
        .bind(name)
        .execute(&self.pool)
        .await
        .map_err(db_err("schedule rollup refresh"))?;

        timer.observe_duration();
        info!(rollup = %name, granularity = definition.granularity.as_str(), "Rollup provisioned");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn drop_rollup(&self, name: &str) -> Result<(), MeteringError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["drop_rollup"])
            .start_timer();

        let name = checked_rollup_name(name)?;
        sqlx::query(&format!("DROP MATERIALIZED VIEW IF EXISTS {name}"))
            .execute(&self.pool)
            .await
            .map_err(db_err("drop rollup"))?;

        timer.observe_duration();
        info!(rollup = %name, "Rollup dropped");
        Ok(())
    }
}

#[async_trait]
impl BillingStore for Database {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), MeteringError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(db_err("run health check"))?;

        timer.observe_duration();
        Ok(())
    }

    async fn get_organization(&self, id: Uuid) -> Result<Organization, MeteringError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_organization"])
            .start_timer();

        let row = sqlx::query_as::<_, OrganizationRow>(
            "SELECT id, name, tax_rate, tax_providers, net_terms_days FROM organizations WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("get organization"))?;

        timer.observe_duration();
        row.map(Into::into)
            .ok_or_else(|| MeteringError::NotFound(format!("organization {id} not found")))
    }

    async fn list_organizations(&self) -> Result<Vec<Organization>, MeteringError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_organizations"])
            .start_timer();

        let rows = sqlx::query_as::<_, OrganizationRow>(
            "SELECT id, name, tax_rate, tax_providers, net_terms_days FROM organizations ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list organizations"))?;

        timer.observe_duration();
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn get_customer(&self, id: Uuid) -> Result<Customer, MeteringError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_customer"])
            .start_timer();

        let row = sqlx::query_as::<_, CustomerRow>(
            r#"
            SELECT id, organization_id, external_id, name, tax_rate, tax_providers, payment_provider, net_terms_days
            FROM customers
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("get customer"))?;

        timer.observe_duration();
        row.map(Into::into)
            .ok_or_else(|| MeteringError::NotFound(format!("customer {id} not found")))
    }

    async fn get_metric(&self, id: Uuid) -> Result<Metric, MeteringError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_metric"])
            .start_timer();

        let definition = sqlx::query_scalar::<_, Json<Metric>>(
            "SELECT definition FROM metrics WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("get metric"))?;

        timer.observe_duration();
        definition
            .map(|d| d.0)
            .ok_or_else(|| MeteringError::NotFound(format!("metric {id} not found")))
    }

    #[instrument(skip(self, metric), fields(metric_id = %metric.id))]
    async fn save_metric(&self, metric: &Metric) -> Result<(), MeteringError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["save_metric"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO metrics (id, organization_id, definition, status)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE
            SET definition = EXCLUDED.definition, status = EXCLUDED.status, updated_utc = NOW()
            "#,
        )
        .bind(metric.id)
        .bind(metric.organization_id)
        .bind(Json(metric))
        .bind(metric.status.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_err("save metric"))?;

        timer.observe_duration();
        Ok(())
    }

    async fn get_plan_version(&self, id: Uuid) -> Result<PlanVersion, MeteringError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_plan_version"])
            .start_timer();

        let definition = sqlx::query_scalar::<_, Json<PlanVersion>>(
            "SELECT definition FROM plan_versions WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("get plan version"))?;

        timer.observe_duration();
        definition
            .map(|d| d.0)
            .ok_or_else(|| MeteringError::NotFound(format!("plan version {id} not found")))
    }

    #[instrument(skip(self), fields(customer_id = %customer_id))]
    async fn list_open_subscription_records(
        &self,
        customer_id: Uuid,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<SubscriptionRecord>, MeteringError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_open_subscription_records"])
            .start_timer();

        let rows = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscription_records WHERE customer_id = $1 AND fully_billed = FALSE AND start_date <= $2 ORDER BY start_date, id"
        ))
        .bind(customer_id)
        .bind(as_of)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list subscription records"))?;

        timer.observe_duration();
        Ok(rows.into_iter().map(Into::into).collect())
    }

    #[instrument(skip(self), fields(organization_id = %organization_id))]
    async fn customers_with_due_records(
        &self,
        organization_id: Uuid,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, MeteringError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["customers_with_due_records"])
            .start_timer();

        let customers = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT DISTINCT sr.customer_id
            FROM subscription_records sr
            WHERE sr.organization_id = $1
              AND sr.fully_billed = FALSE
              AND (
                sr.end_date <= $2
                OR EXISTS (
                    SELECT 1 FROM billing_records br
                    WHERE br.subscription_record_id = sr.id
                      AND br.fully_billed = FALSE
                      AND br.next_invoicing_date <= $2
                )
              )
            ORDER BY sr.customer_id
            "#,
        )
        .bind(organization_id)
        .bind(as_of)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list customers with due records"))?;

        timer.observe_duration();
        Ok(customers)
    }

    async fn list_billing_records(
        &self,
        subscription_record_id: Uuid,
    ) -> Result<Vec<BillingRecord>, MeteringError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_billing_records"])
            .start_timer();

        let rows = sqlx::query_as::<_, BillingRecordRow>(&format!(
            "SELECT {BILLING_RECORD_COLUMNS} FROM billing_records WHERE subscription_record_id = $1 ORDER BY seq"
        ))
        .bind(subscription_record_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list billing records"))?;

        timer.observe_duration();
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn list_charge_records(
        &self,
        billing_record_id: Uuid,
    ) -> Result<Vec<ComponentChargeRecord>, MeteringError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_charge_records"])
            .start_timer();

        let rows = sqlx::query_as::<_, ChargeRecordRow>(
            r#"
            SELECT id, billing_record_id, units, start_date, end_date, fully_billed
            FROM component_charge_records
            WHERE billing_record_id = $1
            ORDER BY seq
            "#,
        )
        .bind(billing_record_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list charge records"))?;

        timer.observe_duration();
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn invoiced_totals(
        &self,
        billing_record_id: Uuid,
        item_types: &[ChargeableItemType],
    ) -> Result<InvoicedTotals, MeteringError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["invoiced_totals"])
            .start_timer();

        let types: Vec<&str> = item_types.iter().map(|t| t.as_str()).collect();
        let (quantity, revenue) = sqlx::query_as::<_, (Option<Decimal>, Option<Decimal>)>(
            r#"
            SELECT SUM(li.quantity), SUM(li.base)
            FROM invoice_line_items li
            JOIN invoices i ON i.id = li.invoice_id
            WHERE li.associated_billing_record = $1
              AND i.payment_status <> 'draft'
              AND li.chargeable_item_type = ANY($2)
            "#,
        )
        .bind(billing_record_id)
        .bind(&types)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err("sum invoiced totals"))?;

        timer.observe_duration();
        Ok(InvoicedTotals {
            quantity: quantity.unwrap_or_default(),
            revenue: revenue.unwrap_or_default(),
        })
    }

    #[instrument(skip(self, commit), fields(invoice_id = ?commit.document.as_ref().map(|d| d.invoice.id)))]
    async fn commit_invoice(&self, commit: &InvoiceCommit) -> Result<(), MeteringError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["commit_invoice"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(db_err("begin transaction"))?;

        for update in &commit.billing_record_updates {
            let row = sqlx::query_as::<_, BillingRecordRow>(&format!(
                "SELECT {BILLING_RECORD_COLUMNS} FROM billing_records WHERE id = $1 FOR UPDATE"
            ))
            .bind(update.id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err("lock billing record"))?
            .ok_or_else(|| {
                MeteringError::NotFound(format!("billing record {} not found", update.id))
            })?;
            let mut record = BillingRecord::from(row);
            record.advance(update.next_invoicing_date, update.fully_billed)?;

            sqlx::query(
                "UPDATE billing_records SET next_invoicing_date = $2, fully_billed = $3 WHERE id = $1",
            )
            .bind(record.id)
            .bind(record.next_invoicing_date)
            .bind(record.fully_billed)
            .execute(&mut *tx)
            .await
            .map_err(db_err("advance billing record"))?;
        }

        if !commit.charge_records_billed.is_empty() {
            sqlx::query("UPDATE component_charge_records SET fully_billed = TRUE WHERE id = ANY($1)")
                .bind(&commit.charge_records_billed)
                .execute(&mut *tx)
                .await
                .map_err(db_err("mark charge records billed"))?;
        }
        if !commit.subscription_records_billed.is_empty() {
            sqlx::query("UPDATE subscription_records SET fully_billed = TRUE WHERE id = ANY($1)")
                .bind(&commit.subscription_records_billed)
                .execute(&mut *tx)
                .await
                .map_err(db_err("mark subscription records billed"))?;
        }
        for period in &commit.new_periods {
            Self::insert_subscription_record(&mut tx, &period.record).await?;
            for record in &period.billing_records {
                Self::insert_billing_record(&mut tx, record).await?;
            }
            for charge in &period.charge_records {
                Self::insert_charge_record(&mut tx, charge).await?;
            }
        }
        if let Some(document) = &commit.document {
            Self::insert_document(&mut tx, document).await?;
        }

        tx.commit().await.map_err(db_err("commit invoice"))?;

        timer.observe_duration();
        match &commit.document {
            Some(document) => info!(
                invoice_id = %document.invoice.id,
                line_items = document.line_items.len(),
                amount = %document.invoice.amount,
                "Invoice committed"
            ),
            None => info!(
                billing_records = commit.billing_record_updates.len(),
                new_periods = commit.new_periods.len(),
                "Billing state committed without an invoice"
            ),
        }
        Ok(())
    }

    async fn get_invoice(&self, id: Uuid) -> Result<InvoiceDocument, MeteringError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice"])
            .start_timer();

        let invoice = sqlx::query_as::<_, InvoiceRow>(
            r#"
            SELECT id, organization_id, customer_id, currency, issue_date, due_date, payment_status, amount, payment_provider, external_payment_id, document_url
            FROM invoices
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("get invoice"))?
        .ok_or_else(|| MeteringError::NotFound(format!("invoice {id} not found")))?;

        let line_items = sqlx::query_as::<_, LineItemRow>(
            r#"
            SELECT id, invoice_id, name, start_date, end_date, quantity, base, billing_type, chargeable_item_type, associated_subscription_record, associated_billing_record, associated_plan_version, associated_charge_record
            FROM invoice_line_items
            WHERE invoice_id = $1
            ORDER BY position
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("get invoice line items"))?;

        let adjustments = sqlx::query_as::<_, AdjustmentRow>(
            r#"
            SELECT a.id, a.line_item_id, a.adjustment_type, a.amount
            FROM invoice_line_item_adjustments a
            JOIN invoice_line_items li ON li.id = a.line_item_id
            WHERE li.invoice_id = $1
            ORDER BY li.position
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("get invoice adjustments"))?;

        timer.observe_duration();
        Ok(InvoiceDocument {
            invoice: invoice.into(),
            line_items: line_items.into_iter().map(Into::into).collect(),
            adjustments: adjustments.into_iter().map(Into::into).collect(),
        })
    }

    async fn set_payment_reference(
        &self,
        invoice_id: Uuid,
        provider: &str,
        external_id: &str,
    ) -> Result<(), MeteringError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["set_payment_reference"])
            .start_timer();

        sqlx::query("UPDATE invoices SET payment_provider = $2, external_payment_id = $3 WHERE id = $1")
            .bind(invoice_id)
            .bind(provider)
            .bind(external_id)
            .execute(&self.pool)
            .await
            .map_err(db_err("set payment reference"))?;

        timer.observe_duration();
        Ok(())
    }

    async fn set_document_url(&self, invoice_id: Uuid, url: &str) -> Result<(), MeteringError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["set_document_url"])
            .start_timer();

        sqlx::query("UPDATE invoices SET document_url = $2 WHERE id = $1")
            .bind(invoice_id)
            .bind(url)
            .execute(&self.pool)
            .await
            .map_err(db_err("set document url"))?;

        timer.observe_duration();
        Ok(())
    }

    async fn mark_invoice_paid(&self, invoice_id: Uuid) -> Result<bool, MeteringError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["mark_invoice_paid"])
            .start_timer();

        let result = sqlx::query(
            "UPDATE invoices SET payment_status = 'paid' WHERE id = $1 AND payment_status = 'unpaid'",
        )
        .bind(invoice_id)
        .execute(&self.pool)
        .await
        .map_err(db_err("mark invoice paid"))?;

        timer.observe_duration();
        Ok(result.rows_affected() > 0)
    }

    async fn balance_entries(
        &self,
        customer_id: Uuid,
        currency: &str,
    ) -> Result<Vec<CustomerBalanceAdjustment>, MeteringError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["balance_entries"])
            .start_timer();

        let rows = sqlx::query_as::<_, BalanceRow>(&format!(
            "SELECT {BALANCE_COLUMNS} FROM customer_balance_adjustments WHERE customer_id = $1 AND currency = $2 ORDER BY created_at"
        ))
        .bind(customer_id)
        .bind(currency)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list balance entries"))?;

        timer.observe_duration();
        Ok(rows.into_iter().map(Into::into).collect())
    }

    #[instrument(skip(self), fields(customer_id = %customer_id, invoice_id = %invoice_id))]
    async fn draw_down(
        &self,
        _organization_id: Uuid,
        customer_id: Uuid,
        currency: &str,
        amount: Decimal,
        invoice_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Decimal, MeteringError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["draw_down"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(db_err("begin transaction"))?;
        let entries =
            Self::balance_rows_for_update(&mut tx, Some(customer_id), None, Some(currency)).await?;
        let plan = plan_draw_down(&credit_states(&entries), amount, invoice_id, now);
        Self::apply_ledger_plan(&mut tx, &plan).await?;
        tx.commit().await.map_err(db_err("commit draw-down"))?;

        timer.observe_duration();
        Ok(plan.drawn)
    }

    async fn grant_credit(&self, credit: &CustomerBalanceAdjustment) -> Result<(), MeteringError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["grant_credit"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(db_err("begin transaction"))?;
        Self::insert_balance_entry(&mut tx, credit).await?;
        tx.commit().await.map_err(db_err("commit credit"))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    async fn release_invoice_balance(&self, invoice_id: Uuid) -> Result<(), MeteringError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["release_invoice_balance"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(db_err("begin transaction"))?;
        let parents: Vec<Uuid> = sqlx::query_scalar::<_, Option<Uuid>>(
            r#"
            DELETE FROM customer_balance_adjustments
            WHERE invoice_id = $1
            RETURNING parent_adjustment_id
            "#,
        )
        .bind(invoice_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err("release invoice balance"))?
        .into_iter()
        .flatten()
        .collect::<BTreeSet<Uuid>>()
        .into_iter()
        .collect();

        if !parents.is_empty() {
            let mut entries: Vec<CustomerBalanceAdjustment> = sqlx::query_as::<_, BalanceRow>(&format!(
                "SELECT {BALANCE_COLUMNS} FROM customer_balance_adjustments WHERE id = ANY($1) OR parent_adjustment_id = ANY($1) FOR UPDATE"
            ))
            .bind(&parents)
            .fetch_all(&mut *tx)
            .await
            .map_err(db_err("reload released credits"))?
            .into_iter()
            .map(Into::into)
            .collect();
            for parent in &parents {
                restore_statuses(&mut entries, *parent);
            }
            for entry in &entries {
                sqlx::query("UPDATE customer_balance_adjustments SET status = $2 WHERE id = $1")
                    .bind(entry.id)
                    .bind(entry.status.as_str())
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err("restore balance status"))?;
            }
        }
        tx.commit().await.map_err(db_err("commit balance release"))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self), fields(organization_id = %organization_id))]
    async fn expire_balances(
        &self,
        organization_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, MeteringError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["expire_balances"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(db_err("begin transaction"))?;
        let entries =
            Self::balance_rows_for_update(&mut tx, None, Some(organization_id), None).await?;
        let plan = plan_expiry(&credit_states(&entries), now);
        Self::apply_ledger_plan(&mut tx, &plan).await?;
        tx.commit().await.map_err(db_err("commit balance expiry"))?;

        timer.observe_duration();
        Ok(plan.new_entries.len() as u64)
    }
}
