//! Custom metrics: usage computed by an organization-supplied read-only query.
//!
//! The query sees an `events` relation already scoped to the organization,
//! the customer and the time window, and must return `customer_id` and
//! `usage_qty` columns.

use super::sql::validate_custom_sql;
use super::{ensure_type, MetricHandler, UsageSeries, UsageWindow};
use crate::error::MeteringError;
use crate::models::{Aggregation, Metric, MetricType, SubscriptionFilter, TimeGranularity};
use crate::proration::TimeRange;
use crate::services::UsageStore;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

pub fn validate(mut metric: Metric) -> Result<Metric, MeteringError> {
    let sql = metric
        .custom_sql
        .as_deref()
        .ok_or_else(|| MeteringError::Validation("custom_sql is required".to_string()))?;
    metric.custom_sql = Some(validate_custom_sql(sql)?);
    metric.aggregation = Aggregation::Sum;
    metric.granularity = TimeGranularity::Total;
    metric.proration_granularity = TimeGranularity::Total;
    metric.event_type = None;
    Ok(metric)
}

pub(crate) fn construct(
    metric: Metric,
    store: Arc<dyn UsageStore>,
) -> Result<Arc<dyn MetricHandler>, MeteringError> {
    Ok(Arc::new(CustomHandler::new(metric, store)?))
}

pub struct CustomHandler {
    metric: Metric,
    sql: String,
    store: Arc<dyn UsageStore>,
}

impl CustomHandler {
    pub fn new(metric: Metric, store: Arc<dyn UsageStore>) -> Result<Self, MeteringError> {
        ensure_type(&metric, MetricType::Custom)?;
        let sql = validate_custom_sql(metric.custom_sql.as_deref().unwrap_or_default())?;
        Ok(Self { metric, sql, store })
    }

    async fn usage_in(
        &self,
        customer_id: Uuid,
        range: TimeRange,
    ) -> Result<Decimal, MeteringError> {
        if range.is_empty() {
            return Ok(Decimal::ZERO);
        }
        let rows = self
            .store
            .run_custom_query(self.metric.organization_id, &self.sql, Some(customer_id), &range)
            .await?;
        Ok(rows
            .into_iter()
            .filter(|(customer, _)| *customer == customer_id)
            .map(|(_, value)| value)
            .sum())
    }
}

#[async_trait]
impl MetricHandler for CustomHandler {
    fn metric(&self) -> &Metric {
        &self.metric
    }

    /// Subscription filters do not apply; the query owns its own predicates.
    #[instrument(skip(self, _filters), fields(metric_id = %self.metric.id))]
    async fn usage_over_time(
        &self,
        granularity: TimeGranularity,
        range: TimeRange,
        customer_id: Option<Uuid>,
        _filters: &[SubscriptionFilter],
    ) -> Result<UsageSeries, MeteringError> {
        let mut series = UsageSeries::new();
        for bucket in granularity.buckets(range) {
            let rows = self
                .store
                .run_custom_query(self.metric.organization_id, &self.sql, customer_id, &bucket)
                .await?;
            for (customer, value) in rows {
                *series
                    .entry(customer)
                    .or_default()
                    .entry(bucket.start)
                    .or_default() += value;
            }
        }
        Ok(series)
    }

    async fn current_usage(
        &self,
        window: &UsageWindow,
        now: DateTime<Utc>,
    ) -> Result<Decimal, MeteringError> {
        let so_far = window.clipped(TimeRange::new(window.range.start, now));
        self.usage_in(window.customer_id, so_far.range).await
    }

    #[instrument(skip(self, window), fields(metric_id = %self.metric.id, customer_id = %window.customer_id))]
    async fn total_billable_usage(&self, window: &UsageWindow) -> Result<Decimal, MeteringError> {
        self.usage_in(window.customer_id, window.range).await
    }

    /// Each day earns the growth of the cumulative figure up to its end.
    #[instrument(skip(self, window), fields(metric_id = %self.metric.id, customer_id = %window.customer_id))]
    async fn daily_billable_usage(
        &self,
        window: &UsageWindow,
    ) -> Result<BTreeMap<NaiveDate, Decimal>, MeteringError> {
        let mut days = BTreeMap::new();
        let mut previous = Decimal::ZERO;
        for day in window.range.days() {
            let next_midnight = Utc.from_utc_datetime(&day.and_time(NaiveTime::MIN)) + Duration::days(1);
            let end = next_midnight.min(window.range.end);
            let cumulative = self
                .usage_in(window.customer_id, TimeRange::new(window.range.start, end))
                .await?;
            days.insert(day, cumulative - previous);
            previous = cumulative;
        }
        Ok(days)
    }
}
