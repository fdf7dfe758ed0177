//! Stateful metrics: gauges whose value persists across periods, billed on
//! the peak held in each proration bucket.

use super::{
    ensure_aggregation, ensure_type, incremental_by_day, MetricHandler, UsageSeries, UsageWindow,
};
use crate::error::MeteringError;
use crate::models::{Aggregation, EventType, Metric, MetricType, SubscriptionFilter, TimeGranularity};
use crate::proration::{granularity_ratio, TimeRange};
use crate::services::{CarryMode, UsageQuery, UsageStore};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

/// Proration granularity must be finer than or equal to the metric granularity:
/// a metric billed monthly may prorate by day, but not the reverse.
pub fn validate(mut metric: Metric) -> Result<Metric, MeteringError> {
    ensure_aggregation(&metric, &[Aggregation::Max])?;
    if metric.granularity == TimeGranularity::Total {
        return Err(MeteringError::Validation(
            "granularity is required for stateful metrics".to_string(),
        ));
    }
    if !metric
        .proration_granularity
        .is_finer_or_equal(&metric.granularity)
    {
        return Err(MeteringError::Validation(format!(
            "proration granularity {} cannot be coarser than granularity {}",
            metric.proration_granularity.as_str(),
            metric.granularity.as_str()
        )));
    }
    metric.event_type = Some(metric.event_type.unwrap_or(EventType::Total));
    metric.custom_sql = None;
    Ok(metric)
}

pub(crate) fn construct(
    metric: Metric,
    store: Arc<dyn UsageStore>,
) -> Result<Arc<dyn MetricHandler>, MeteringError> {
    Ok(Arc::new(StatefulHandler::new(metric, store)?))
}

/// State of one customer across a range: what was carried in and every change inside it.
#[derive(Debug, Clone, Default)]
struct Timeline {
    initial: Option<Decimal>,
    changes: Vec<(DateTime<Utc>, Decimal)>,
}

impl Timeline {
    /// Highest state held at any point of `bucket`, including the state entering it.
    fn peak(&self, bucket: &TimeRange) -> Decimal {
        let entering = self
            .changes
            .iter()
            .take_while(|(t, _)| *t < bucket.start)
            .last()
            .map(|(_, v)| *v)
            .or(self.initial);
        self.changes
            .iter()
            .filter(|(t, _)| bucket.contains(*t))
            .map(|(_, v)| *v)
            .chain(entering)
            .max()
            .unwrap_or(Decimal::ZERO)
    }
}

fn single_day(bucket: &TimeRange) -> bool {
    bucket.start.date_naive() == (bucket.end - Duration::nanoseconds(1)).date_naive()
}

fn day_range(day: NaiveDate) -> TimeRange {
    let start = Utc.from_utc_datetime(&day.and_time(chrono::NaiveTime::MIN));
    TimeRange::new(start, start + Duration::days(1))
}

pub struct StatefulHandler {
    metric: Metric,
    store: Arc<dyn UsageStore>,
}

impl StatefulHandler {
    pub fn new(metric: Metric, store: Arc<dyn UsageStore>) -> Result<Self, MeteringError> {
        ensure_type(&metric, MetricType::Stateful)?;
        Ok(Self { metric, store })
    }

    fn carry_mode(&self) -> CarryMode {
        match self.metric.event_type {
            Some(EventType::Delta) => CarryMode::RunningSum,
            _ => CarryMode::Latest,
        }
    }

    fn query(
        &self,
        range: TimeRange,
        customer_id: Option<Uuid>,
        filters: &[SubscriptionFilter],
    ) -> UsageQuery {
        UsageQuery::for_metric(&self.metric, range, TimeGranularity::Total)
            .customer(customer_id)
            .subscription_filters(filters)
    }

    async fn timelines(
        &self,
        range: TimeRange,
        customer_id: Option<Uuid>,
        filters: &[SubscriptionFilter],
    ) -> Result<HashMap<Uuid, Timeline>, MeteringError> {
        let query = self.query(range, customer_id, filters);
        let mode = self.carry_mode();
        let carried = self
            .store
            .last_value_before(&query, range.start, mode)
            .await?;

        let mut timelines: HashMap<Uuid, Timeline> = carried
            .into_iter()
            .map(|(customer, value)| {
                (
                    customer,
                    Timeline {
                        initial: Some(value),
                        changes: Vec::new(),
                    },
                )
            })
            .collect();

        for point in self.store.scan(&query).await? {
            let timeline = timelines.entry(point.customer_id).or_default();
            let state = match mode {
                CarryMode::Latest => point.value,
                CarryMode::RunningSum => {
                    let previous = timeline
                        .changes
                        .last()
                        .map(|(_, v)| *v)
                        .or(timeline.initial)
                        .unwrap_or(Decimal::ZERO);
                    previous + point.value
                }
            };
            timeline.changes.push((point.time_created, state));
        }
        Ok(timelines)
    }

    fn ratio_at(&self, anchor: DateTime<Utc>) -> Decimal {
        granularity_ratio(
            self.metric.granularity,
            self.metric.proration_granularity,
            anchor,
        )
    }
}

#[async_trait]
impl MetricHandler for StatefulHandler {
    fn metric(&self) -> &Metric {
        &self.metric
    }

    async fn usage_over_time(
        &self,
        granularity: TimeGranularity,
        range: TimeRange,
        customer_id: Option<Uuid>,
        filters: &[SubscriptionFilter],
    ) -> Result<UsageSeries, MeteringError> {
        let timelines = self.timelines(range, customer_id, filters).await?;
        let buckets = granularity.buckets(range);
        Ok(timelines
            .into_iter()
            .map(|(customer, timeline)| {
                let peaks = buckets
                    .iter()
                    .map(|bucket| (bucket.start, timeline.peak(bucket)))
                    .collect();
                (customer, peaks)
            })
            .collect())
    }

    /// The latest raw state, which differs from the normalized billable peak.
    async fn current_usage(
        &self,
        window: &UsageWindow,
        now: DateTime<Utc>,
    ) -> Result<Decimal, MeteringError> {
        let query = self.query(window.range, Some(window.customer_id), &window.filters);
        let state = self
            .store
            .last_value_before(&query, now + Duration::nanoseconds(1), self.carry_mode())
            .await?;
        Ok(state
            .get(&window.customer_id)
            .copied()
            .unwrap_or(Decimal::ZERO))
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
        let mut days: BTreeMap<NaiveDate, Decimal> = BTreeMap::new();
        if window.range.is_empty() {
            return Ok(days);
        }
        let timeline = self
            .timelines(window.range, Some(window.customer_id), &window.filters)
            .await?
            .remove(&window.customer_id)
            .unwrap_or_default();

        for bucket in self.metric.proration_granularity.buckets(window.range) {
            let ratio = self.ratio_at(bucket.start);
            if single_day(&bucket) {
                *days.entry(bucket.start.date_naive()).or_default() += timeline.peak(&bucket) * ratio;
                continue;
            }
            // A multi-day bucket bills its peak once; each day earns the rise it caused.
            let peaks: BTreeMap<NaiveDate, Decimal> = bucket
                .days()
                .into_iter()
                .filter_map(|day| {
                    let slice = day_range(day).intersect(&bucket)?;
                    Some((day, timeline.peak(&slice)))
                })
                .collect();
            for (day, increment) in incremental_by_day(&peaks) {
                *days.entry(day).or_default() += increment * ratio;
            }
        }
        Ok(days)
    }
}
