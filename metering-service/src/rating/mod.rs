//! Metric handlers: one implementation per metric type behind a common contract.
//!
//! A handler answers four questions about a metric: usage over time for
//! dashboards, the instantaneous usage right now, and the billable quantity of
//! a subscription period both in total and attributed to days. The daily
//! attribution always sums to the total.

pub mod counter;
pub mod custom;
pub mod rate;
pub mod rollup;
pub mod sql;
pub mod stateful;

use crate::error::MeteringError;
use crate::models::{
    Aggregation, Metric, MetricDefinition, MetricStatus, MetricType, SubscriptionFilter,
    SubscriptionRecord, TimeGranularity,
};
use crate::proration::TimeRange;
use crate::services::cache::CUSTOM_STREAM;
use crate::services::{UsageCache, UsageRow, UsageStore};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use uuid::Uuid;

pub use counter::CounterHandler;
pub use custom::CustomHandler;
pub use rate::RateHandler;
pub use rollup::{rollup_name, MetricProvisioner, RollupManager};
pub use stateful::StatefulHandler;

/// Usage per customer per bucket start.
pub type UsageSeries = BTreeMap<Uuid, BTreeMap<DateTime<Utc>, Decimal>>;

/// The slice of a subscription period being rated.
#[derive(Debug, Clone)]
pub struct UsageWindow {
    pub organization_id: Uuid,
    pub customer_id: Uuid,
    pub subscription_record_id: Uuid,
    pub filters: Vec<SubscriptionFilter>,
    pub range: TimeRange,
}

impl UsageWindow {
    /// `[usage_start_date, min(end_date, as_of))`; empty when `as_of` precedes the start.
    pub fn for_record(record: &SubscriptionRecord, as_of: DateTime<Utc>) -> Self {
        let start = record.usage_start_date;
        let end = record.end_date.min(as_of).max(start);
        Self {
            organization_id: record.organization_id,
            customer_id: record.customer_id,
            subscription_record_id: record.id,
            filters: record.filters.clone(),
            range: TimeRange::new(start, end),
        }
    }

    /// Same window restricted to `range`.
    pub fn clipped(&self, range: TimeRange) -> Self {
        let range = self
            .range
            .intersect(&range)
            .unwrap_or(TimeRange::new(self.range.start, self.range.start));
        Self {
            range,
            ..self.clone()
        }
    }
}

#[async_trait]
pub trait MetricHandler: Send + Sync {
    fn metric(&self) -> &Metric;

    /// Dashboard usage per bucket. Without a customer, every customer is broken out.
    async fn usage_over_time(
        &self,
        granularity: TimeGranularity,
        range: TimeRange,
        customer_id: Option<Uuid>,
        filters: &[SubscriptionFilter],
    ) -> Result<UsageSeries, MeteringError>;

    /// Instantaneous usage at `now`, not necessarily what is billed.
    async fn current_usage(
        &self,
        window: &UsageWindow,
        now: DateTime<Utc>,
    ) -> Result<Decimal, MeteringError>;

    async fn total_billable_usage(&self, window: &UsageWindow) -> Result<Decimal, MeteringError>;

    /// Billable usage attributed to the day it was earned.
    async fn daily_billable_usage(
        &self,
        window: &UsageWindow,
    ) -> Result<BTreeMap<NaiveDate, Decimal>, MeteringError>;
}

type Validator = fn(Metric) -> Result<Metric, MeteringError>;
type Constructor = fn(Metric, Arc<dyn UsageStore>) -> Result<Arc<dyn MetricHandler>, MeteringError>;

struct HandlerEntry {
    metric_type: MetricType,
    validate: Validator,
    construct: Constructor,
}

const HANDLERS: &[HandlerEntry] = &[
    HandlerEntry {
        metric_type: MetricType::Counter,
        validate: counter::validate,
        construct: counter::construct,
    },
    HandlerEntry {
        metric_type: MetricType::Stateful,
        validate: stateful::validate,
        construct: stateful::construct,
    },
    HandlerEntry {
        metric_type: MetricType::Rate,
        validate: rate::validate,
        construct: rate::construct,
    },
    HandlerEntry {
        metric_type: MetricType::Custom,
        validate: custom::validate,
        construct: custom::construct,
    },
];

fn entry(metric_type: MetricType) -> &'static HandlerEntry {
    HANDLERS
        .iter()
        .find(|h| h.metric_type == metric_type)
        .unwrap_or(&HANDLERS[0])
}

/// Apply type-specific requirements and defaults to a raw definition.
pub fn validate_definition(definition: MetricDefinition) -> Result<Metric, MeteringError> {
    let metric_type = definition
        .metric_type
        .ok_or_else(|| MeteringError::Validation("metric_type is required".to_string()))?;
    let event_name = definition
        .event_name
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty());
    if event_name.is_none() && metric_type != MetricType::Custom {
        return Err(MeteringError::Validation("event_name is required".to_string()));
    }

    let draft = Metric {
        id: definition.id.unwrap_or_else(Uuid::new_v4),
        organization_id: definition.organization_id,
        metric_type,
        event_name: event_name.unwrap_or_default(),
        property_name: definition
            .property_name
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty()),
        aggregation: definition.aggregation.unwrap_or(match metric_type {
            MetricType::Stateful => Aggregation::Max,
            MetricType::Custom => Aggregation::Sum,
            _ => Aggregation::Count,
        }),
        event_type: definition.event_type,
        numeric_filters: definition.numeric_filters,
        categorical_filters: definition.categorical_filters,
        granularity: definition.granularity.unwrap_or(TimeGranularity::Total),
        proration_granularity: definition
            .proration_granularity
            .or(definition.granularity)
            .unwrap_or(TimeGranularity::Total),
        custom_sql: definition.custom_sql,
        status: MetricStatus::Active,
    };

    (entry(metric_type).validate)(draft)
}

/// Build the handler registered for the metric's type.
pub fn handler_for(
    metric: Metric,
    store: Arc<dyn UsageStore>,
) -> Result<Arc<dyn MetricHandler>, MeteringError> {
    (entry(metric.metric_type).construct)(metric, store)
}

pub(crate) fn ensure_type(metric: &Metric, expected: MetricType) -> Result<(), MeteringError> {
    if metric.metric_type != expected {
        return Err(MeteringError::Configuration(format!(
            "metric {} is {} but the {} handler was requested",
            metric.id,
            metric.metric_type.as_str(),
            expected.as_str()
        )));
    }
    Ok(())
}

pub(crate) fn ensure_aggregation(
    metric: &Metric,
    allowed: &[Aggregation],
) -> Result<(), MeteringError> {
    if !allowed.contains(&metric.aggregation) {
        return Err(MeteringError::Validation(format!(
            "{} aggregation is not supported for {} metrics",
            metric.aggregation.as_str(),
            metric.metric_type.as_str()
        )));
    }
    if metric.aggregation.needs_property() && metric.property_name.is_none() {
        return Err(MeteringError::Validation(format!(
            "{} aggregation requires property_name",
            metric.aggregation.as_str()
        )));
    }
    Ok(())
}

/// Aggregated value with the event count behind it.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) struct Accumulator {
    pub value: Option<Decimal>,
    pub count: i64,
}

impl Accumulator {
    pub fn merge(&mut self, aggregation: Aggregation, value: Decimal, count: i64) {
        self.value = Some(match (aggregation, self.value) {
            (Aggregation::Max, Some(current)) => current.max(value),
            (_, Some(current)) => current + value,
            (_, None) => value,
        });
        self.count += count;
    }

    pub fn finish(&self, aggregation: Aggregation) -> Decimal {
        match (aggregation, self.value) {
            (_, None) => Decimal::ZERO,
            (Aggregation::Average, Some(_)) if self.count == 0 => Decimal::ZERO,
            (Aggregation::Average, Some(sum)) => sum / Decimal::from(self.count),
            (_, Some(value)) => value,
        }
    }
}

/// Merge rows sharing a customer and bucket, then finish the aggregation.
pub(crate) fn rows_to_series(rows: Vec<UsageRow>, aggregation: Aggregation) -> UsageSeries {
    let mut merged: HashMap<(Uuid, DateTime<Utc>), Accumulator> = HashMap::new();
    for row in rows {
        merged
            .entry((row.customer_id, row.bucket))
            .or_default()
            .merge(aggregation, row.value, row.count);
    }
    let mut series = UsageSeries::new();
    for ((customer_id, bucket), acc) in merged {
        series
            .entry(customer_id)
            .or_default()
            .insert(bucket, acc.finish(aggregation));
    }
    series
}

/// Attribute only the part of each day's peak that raises the running maximum.
pub(crate) fn incremental_by_day(
    peaks: &BTreeMap<NaiveDate, Decimal>,
) -> BTreeMap<NaiveDate, Decimal> {
    let mut running: Option<Decimal> = None;
    peaks
        .iter()
        .map(|(day, peak)| {
            // The first day carries its full peak.
            let increment = match running {
                None => *peak,
                Some(high) => (*peak - high).max(Decimal::ZERO),
            };
            running = Some(running.map_or(*peak, |high| high.max(*peak)));
            (*day, increment)
        })
        .collect()
}

fn cache_stream(metric: &Metric) -> &str {
    match metric.metric_type {
        MetricType::Custom => CUSTOM_STREAM,
        _ => metric.event_name.as_str(),
    }
}

/// Caches `current_usage` per subscription record and resolves handlers.
pub struct RatingEngine {
    store: Arc<dyn UsageStore>,
    cache: Arc<UsageCache>,
}

impl RatingEngine {
    pub fn new(store: Arc<dyn UsageStore>, cache: Arc<UsageCache>) -> Self {
        Self { store, cache }
    }

    pub fn handler(&self, metric: &Metric) -> Result<Arc<dyn MetricHandler>, MeteringError> {
        handler_for(metric.clone(), self.store.clone())
    }

    pub async fn current_usage(
        &self,
        metric: &Metric,
        window: &UsageWindow,
        now: DateTime<Utc>,
    ) -> Result<Decimal, MeteringError> {
        let stream = cache_stream(metric);
        if let Some(cached) = self.cache.get(
            window.customer_id,
            stream,
            metric.id,
            window.subscription_record_id,
        ) {
            return Ok(cached);
        }
        let usage = self.handler(metric)?.current_usage(window, now).await?;
        self.cache.insert(
            window.customer_id,
            stream,
            metric.id,
            window.subscription_record_id,
            usage,
        );
        Ok(usage)
    }
}
