//! Rate metrics: usage measured over a sliding lookback window one
//! granularity long, billed on the highest window seen in the period.

use super::{
    ensure_aggregation, ensure_type, incremental_by_day, Accumulator, MetricHandler, UsageSeries,
    UsageWindow,
};
use crate::error::MeteringError;
use crate::models::{Aggregation, Metric, MetricType, SubscriptionFilter, TimeGranularity};
use crate::proration::TimeRange;
use crate::services::{UsagePoint, UsageQuery, UsageStore};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

const ALLOWED: &[Aggregation] = &[Aggregation::Count, Aggregation::Sum, Aggregation::Max];

pub fn validate(mut metric: Metric) -> Result<Metric, MeteringError> {
    ensure_aggregation(&metric, ALLOWED)?;
    if metric.granularity == TimeGranularity::Total {
        return Err(MeteringError::Validation(
            "granularity is required for rate metrics".to_string(),
        ));
    }
    metric.proration_granularity = metric.granularity;
    metric.event_type = None;
    metric.custom_sql = None;
    Ok(metric)
}

pub(crate) fn construct(
    metric: Metric,
    store: Arc<dyn UsageStore>,
) -> Result<Arc<dyn MetricHandler>, MeteringError> {
    Ok(Arc::new(RateHandler::new(metric, store)?))
}

pub struct RateHandler {
    metric: Metric,
    store: Arc<dyn UsageStore>,
}

impl RateHandler {
    pub fn new(metric: Metric, store: Arc<dyn UsageStore>) -> Result<Self, MeteringError> {
        ensure_type(&metric, MetricType::Rate)?;
        Ok(Self { metric, store })
    }

    fn window_value(&self, window: &VecDeque<&UsagePoint>) -> Decimal {
        let mut acc = Accumulator::default();
        for point in window {
            acc.merge(self.metric.aggregation, point.value, 1);
        }
        acc.finish(self.metric.aggregation)
    }

    /// Rate value at every event time inside `range`, per customer.
    ///
    /// The window ending at `t` covers `(t - granularity, t]`, so events
    /// before `range` still count toward the first windows.
    async fn rates(
        &self,
        range: TimeRange,
        customer_id: Option<Uuid>,
        filters: &[SubscriptionFilter],
    ) -> Result<HashMap<Uuid, Vec<(DateTime<Utc>, Decimal)>>, MeteringError> {
        let lookback = TimeRange::new(self.metric.granularity.retreat(range.start), range.end);
        let query = UsageQuery::for_metric(&self.metric, lookback, TimeGranularity::Total)
            .customer(customer_id)
            .subscription_filters(filters);
        let points = self.store.scan(&query).await?;

        let mut by_customer: HashMap<Uuid, Vec<&UsagePoint>> = HashMap::new();
        for point in &points {
            by_customer.entry(point.customer_id).or_default().push(point);
        }

        let mut rates = HashMap::new();
        for (customer, points) in by_customer {
            let mut window: VecDeque<&UsagePoint> = VecDeque::new();
            let mut values = Vec::new();
            for point in points {
                let floor = self.metric.granularity.retreat(point.time_created);
                while window.front().is_some_and(|p| p.time_created <= floor) {
                    window.pop_front();
                }
                window.push_back(point);
                if range.contains(point.time_created) {
                    values.push((point.time_created, self.window_value(&window)));
                }
            }
            rates.insert(customer, values);
        }
        Ok(rates)
    }
}

#[async_trait]
impl MetricHandler for RateHandler {
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
        let mut series = UsageSeries::new();
        for (customer, values) in self.rates(range, customer_id, filters).await? {
            let buckets = series.entry(customer).or_default();
            for (t, value) in values {
                let slot = buckets
                    .entry(granularity.bucket_key(t, &range))
                    .or_insert(value);
                *slot = (*slot).max(value);
            }
        }
        Ok(series)
    }

    /// The rate over the lookback window ending now.
    async fn current_usage(
        &self,
        window: &UsageWindow,
        now: DateTime<Utc>,
    ) -> Result<Decimal, MeteringError> {
        let epsilon = Duration::nanoseconds(1);
        let lookback = TimeRange::new(
            self.metric.granularity.retreat(now) + epsilon,
            now + epsilon,
        );
        let query = UsageQuery::for_metric(&self.metric, lookback, TimeGranularity::Total)
            .customer(Some(window.customer_id))
            .subscription_filters(&window.filters);
        let points = self.store.scan(&query).await?;
        Ok(self.window_value(&points.iter().collect()))
    }

    #[instrument(skip(self, window), fields(metric_id = %self.metric.id, customer_id = %window.customer_id))]
    async fn total_billable_usage(&self, window: &UsageWindow) -> Result<Decimal, MeteringError> {
        Ok(self.daily_billable_usage(window).await?.values().copied().sum())
    }

    #[instrument(skip(self, window), fields(metric_id = %self.metric.id, customer_id = %window.customer_id))]
    async fn daily_billable_usage(
        &self,
        window: &UsageWindow,
    ) -> Result<BTreeMap<NaiveDate, Decimal>, MeteringError> {
        if window.range.is_empty() {
            return Ok(BTreeMap::new());
        }
        let values = self
            .rates(window.range, Some(window.customer_id), &window.filters)
            .await?
            .remove(&window.customer_id)
            .unwrap_or_default();

        let mut peaks: BTreeMap<NaiveDate, Decimal> = BTreeMap::new();
        for (t, value) in values {
            let slot = peaks.entry(t.date_naive()).or_insert(value);
            *slot = (*slot).max(value);
        }
        Ok(incremental_by_day(&peaks))
    }
}
