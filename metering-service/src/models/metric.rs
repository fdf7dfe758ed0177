//! Metric definitions: how raw events become usage.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Metric type, selecting the handler that rates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Counter,
    Stateful,
    Rate,
    Custom,
}

impl MetricType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Stateful => "stateful",
            MetricType::Rate => "rate",
            MetricType::Custom => "custom",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "stateful" => MetricType::Stateful,
            "rate" => MetricType::Rate,
            "custom" => MetricType::Custom,
            _ => MetricType::Counter,
        }
    }
}

/// Aggregation function applied to the metric's property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    Count,
    Sum,
    Average,
    Max,
    Unique,
}

impl Aggregation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Aggregation::Count => "count",
            Aggregation::Sum => "sum",
            Aggregation::Average => "average",
            Aggregation::Max => "max",
            Aggregation::Unique => "unique",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "sum" => Aggregation::Sum,
            "average" => Aggregation::Average,
            "max" => Aggregation::Max,
            "unique" => Aggregation::Unique,
            _ => Aggregation::Count,
        }
    }

    /// Whether the aggregation reads a numeric or keyed property.
    pub fn needs_property(&self) -> bool {
        !matches!(self, Aggregation::Count)
    }
}

/// How Stateful events report state upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Each event carries the absolute quantity.
    Total,
    /// Each event carries a signed change to the running quantity.
    Delta,
}

/// Time bucket units used by metrics, proration and dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeGranularity {
    Seconds,
    Minutes,
    Hours,
    Days,
    Months,
    Quarters,
    Years,
    /// The whole requested range is a single bucket.
    Total,
}

impl TimeGranularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeGranularity::Seconds => "seconds",
            TimeGranularity::Minutes => "minutes",
            TimeGranularity::Hours => "hours",
            TimeGranularity::Days => "days",
            TimeGranularity::Months => "months",
            TimeGranularity::Quarters => "quarters",
            TimeGranularity::Years => "years",
            TimeGranularity::Total => "total",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "seconds" => TimeGranularity::Seconds,
            "minutes" => TimeGranularity::Minutes,
            "hours" => TimeGranularity::Hours,
            "days" => TimeGranularity::Days,
            "months" => TimeGranularity::Months,
            "quarters" => TimeGranularity::Quarters,
            "years" => TimeGranularity::Years,
            _ => TimeGranularity::Total,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumericOperator {
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl NumericOperator {
    pub fn sql(&self) -> &'static str {
        match self {
            NumericOperator::Eq => "=",
            NumericOperator::Gt => ">",
            NumericOperator::Gte => ">=",
            NumericOperator::Lt => "<",
            NumericOperator::Lte => "<=",
        }
    }

    pub fn matches(&self, value: Decimal, comparison: Decimal) -> bool {
        match self {
            NumericOperator::Eq => value == comparison,
            NumericOperator::Gt => value > comparison,
            NumericOperator::Gte => value >= comparison,
            NumericOperator::Lt => value < comparison,
            NumericOperator::Lte => value <= comparison,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericFilter {
    pub property_name: String,
    pub operator: NumericOperator,
    pub comparison_value: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategoricalOperator {
    IsIn,
    IsNotIn,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoricalFilter {
    pub property_name: String,
    pub operator: CategoricalOperator,
    pub values: Vec<String>,
}

impl CategoricalFilter {
    pub fn matches(&self, value: Option<&str>) -> bool {
        let contained = value.map(|v| self.values.iter().any(|c| c == v)).unwrap_or(false);
        match self.operator {
            CategoricalOperator::IsIn => contained,
            CategoricalOperator::IsNotIn => !contained,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricStatus {
    Active,
    Archived,
}

impl MetricStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricStatus::Active => "active",
            MetricStatus::Archived => "archived",
        }
    }
}

/// A validated, organization-scoped metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub metric_type: MetricType,
    pub event_name: String,
    pub property_name: Option<String>,
    pub aggregation: Aggregation,
    pub event_type: Option<EventType>,
    pub numeric_filters: Vec<NumericFilter>,
    pub categorical_filters: Vec<CategoricalFilter>,
    pub granularity: TimeGranularity,
    pub proration_granularity: TimeGranularity,
    pub custom_sql: Option<String>,
    pub status: MetricStatus,
}

/// Unvalidated metric input as submitted by an operator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricDefinition {
    pub id: Option<Uuid>,
    /// Taken from the request path when submitted over HTTP.
    #[serde(default)]
    pub organization_id: Uuid,
    pub metric_type: Option<MetricType>,
    pub event_name: Option<String>,
    pub property_name: Option<String>,
    pub aggregation: Option<Aggregation>,
    pub event_type: Option<EventType>,
    #[serde(default)]
    pub numeric_filters: Vec<NumericFilter>,
    #[serde(default)]
    pub categorical_filters: Vec<CategoricalFilter>,
    pub granularity: Option<TimeGranularity>,
    pub proration_granularity: Option<TimeGranularity>,
    pub custom_sql: Option<String>,
}
