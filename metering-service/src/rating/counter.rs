//! Counter metrics: plain aggregations over the events of a period.

use super::rollup::rollup_name;
use super::{
    ensure_aggregation, ensure_type, incremental_by_day, rows_to_series, Accumulator,
    MetricHandler, UsageSeries, UsageWindow,
};
use crate::error::MeteringError;
use crate::models::{Aggregation, Metric, MetricType, SubscriptionFilter, TimeGranularity};
use crate::proration::{split_period, TimeRange};
use crate::services::{UsageQuery, UsageRow, UsageSource, UsageStore};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

const ALLOWED: &[Aggregation] = &[
    Aggregation::Count,
    Aggregation::Sum,
    Aggregation::Average,
    Aggregation::Max,
    Aggregation::Unique,
];

pub fn validate(mut metric: Metric) -> Result<Metric, MeteringError> {
    ensure_aggregation(&metric, ALLOWED)?;
    metric.event_type = None;
    metric.custom_sql = None;
    metric.proration_granularity = metric.granularity;
    Ok(metric)
}

pub(crate) fn construct(
    metric: Metric,
    store: Arc<dyn UsageStore>,
) -> Result<Arc<dyn MetricHandler>, MeteringError> {
    Ok(Arc::new(CounterHandler::new(metric, store)?))
}

pub struct CounterHandler {
    metric: Metric,
    store: Arc<dyn UsageStore>,
}

impl CounterHandler {
    pub fn new(metric: Metric, store: Arc<dyn UsageStore>) -> Result<Self, MeteringError> {
        ensure_type(&metric, MetricType::Counter)?;
        Ok(Self { metric, store })
    }

    fn query(&self, window: &UsageWindow, range: TimeRange, bucket: TimeGranularity) -> UsageQuery {
        UsageQuery::for_metric(&self.metric, range, bucket)
            .customer(Some(window.customer_id))
            .subscription_filters(&window.filters)
    }

    /// Rows covering the window, bucketed by day or as one total.
    ///
    /// Partial head/tail days are read from raw events and whole days from
    /// the daily rollup. Rollups carry no subscription filters, so filtered
    /// windows always read raw events.
    async fn window_rows(
        &self,
        window: &UsageWindow,
        bucket: TimeGranularity,
    ) -> Result<Vec<UsageRow>, MeteringError> {
        let mut rows = Vec::new();
        if !window.filters.is_empty() {
            rows = self
                .store
                .aggregate(&self.query(window, window.range, bucket))
                .await?;
        } else {
            let split = split_period(window.range);
            for segment in split.partial_segments() {
                rows.extend(self.store.aggregate(&self.query(window, segment, bucket)).await?);
            }
            if let Some(full_days) = split.full_days {
                let rollup = rollup_name(
                    self.metric.organization_id,
                    self.metric.id,
                    TimeGranularity::Days,
                );
                let query = self
                    .query(window, full_days, TimeGranularity::Days)
                    .source(UsageSource::Rollup(rollup));
                rows.extend(self.store.aggregate(&query).await?);
            }
        }

        if bucket == TimeGranularity::Total {
            for row in &mut rows {
                row.bucket = window.range.start;
            }
        }
        Ok(rows)
    }

    async fn daily_accumulators(
        &self,
        window: &UsageWindow,
    ) -> Result<BTreeMap<NaiveDate, Accumulator>, MeteringError> {
        let mut days: BTreeMap<NaiveDate, Accumulator> = BTreeMap::new();
        for row in self.window_rows(window, TimeGranularity::Days).await? {
            days.entry(row.bucket.date_naive())
                .or_default()
                .merge(self.metric.aggregation, row.value, row.count);
        }
        Ok(days)
    }

    /// Distinct values counted on the day each was first seen.
    async fn first_seen_by_day(
        &self,
        window: &UsageWindow,
    ) -> Result<BTreeMap<NaiveDate, Decimal>, MeteringError> {
        let points = self
            .store
            .scan(&self.query(window, window.range, TimeGranularity::Total))
            .await?;
        let mut seen = HashSet::new();
        let mut days: BTreeMap<NaiveDate, Decimal> = BTreeMap::new();
        for point in points {
            let Some(key) = point.key else { continue };
            if seen.insert(key) {
                *days.entry(point.time_created.date_naive()).or_default() += Decimal::ONE;
            }
        }
        Ok(days)
    }

    async fn unique_over_time(
        &self,
        granularity: TimeGranularity,
        range: TimeRange,
        customer_id: Option<Uuid>,
        filters: &[SubscriptionFilter],
    ) -> Result<UsageSeries, MeteringError> {
        let query = UsageQuery::for_metric(&self.metric, range, granularity)
            .customer(customer_id)
            .subscription_filters(filters);
        let mut distinct: HashMap<(Uuid, DateTime<Utc>), HashSet<String>> = HashMap::new();
        for point in self.store.scan(&query).await? {
            if let Some(key) = point.key {
                distinct
                    .entry((point.customer_id, granularity.bucket_key(point.time_created, &range)))
                    .or_default()
                    .insert(key);
            }
        }
        let mut series = UsageSeries::new();
        for ((customer, bucket), keys) in distinct {
            series
                .entry(customer)
                .or_default()
                .insert(bucket, Decimal::from(keys.len()));
        }
        Ok(series)
    }
}

#[async_trait]
impl MetricHandler for CounterHandler {
    fn metric(&self) -> &Metric {
        &self.metric
    }

    #[instrument(skip(self, filters), fields(metric_id = %self.metric.id))]
    async fn usage_over_time(
        &self,
        granularity: TimeGranularity,
        range: TimeRange,
        customer_id: Option<Uuid>,
        filters: &[SubscriptionFilter],
    ) -> Result<UsageSeries, MeteringError> {
        if self.metric.aggregation == Aggregation::Unique {
            return self
                .unique_over_time(granularity, range, customer_id, filters)
                .await;
        }
        let query = UsageQuery::for_metric(&self.metric, range, granularity)
            .customer(customer_id)
            .subscription_filters(filters);
        let rows = self.store.aggregate(&query).await?;
        Ok(rows_to_series(rows, self.metric.aggregation))
    }

    async fn current_usage(
        &self,
        window: &UsageWindow,
        now: DateTime<Utc>,
    ) -> Result<Decimal, MeteringError> {
        let so_far = window.clipped(TimeRange::new(window.range.start, now));
        self.total_billable_usage(&so_far).await
    }

    #[instrument(skip(self, window), fields(metric_id = %self.metric.id, customer_id = %window.customer_id))]
    async fn total_billable_usage(&self, window: &UsageWindow) -> Result<Decimal, MeteringError> {
        if window.range.is_empty() {
            return Ok(Decimal::ZERO);
        }
        if self.metric.aggregation == Aggregation::Unique {
            return Ok(self.first_seen_by_day(window).await?.values().copied().sum());
        }
        let mut total = Accumulator::default();
        for row in self.window_rows(window, TimeGranularity::Total).await? {
            total.merge(self.metric.aggregation, row.value, row.count);
        }
        Ok(total.finish(self.metric.aggregation))
    }

    #[instrument(skip(self, window), fields(metric_id = %self.metric.id, customer_id = %window.customer_id))]
    async fn daily_billable_usage(
        &self,
        window: &UsageWindow,
    ) -> Result<BTreeMap<NaiveDate, Decimal>, MeteringError> {
        if window.range.is_empty() {
            return Ok(BTreeMap::new());
        }
        let aggregation = self.metric.aggregation;
        match aggregation {
            Aggregation::Unique => self.first_seen_by_day(window).await,
            Aggregation::Count | Aggregation::Sum => Ok(self
                .daily_accumulators(window)
                .await?
                .into_iter()
                .map(|(day, acc)| (day, acc.finish(aggregation)))
                .collect()),
            Aggregation::Max => {
                let peaks = self
                    .daily_accumulators(window)
                    .await?
                    .into_iter()
                    .map(|(day, acc)| (day, acc.finish(aggregation)))
                    .collect();
                Ok(incremental_by_day(&peaks))
            }
            Aggregation::Average => {
                // Each day carries the period average weighted by its share of events.
                let days = self.daily_accumulators(window).await?;
                let sum: Decimal = days.values().filter_map(|a| a.value).sum();
                let count: i64 = days.values().map(|a| a.count).sum();
                if count == 0 {
                    return Ok(BTreeMap::new());
                }
                let count = Decimal::from(count);
                let average = sum / count;
                Ok(days
                    .into_iter()
                    .map(|(day, acc)| (day, average * Decimal::from(acc.count) / count))
                    .collect())
            }
        }
    }
}
