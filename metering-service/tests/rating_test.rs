//! Metric handler integration tests for metering-service.

mod common;

use chrono::{DateTime, NaiveDate, Utc};
use common::{dec, provision, ts, Fixture};
use metering_service::models::{
    Aggregation, Event, EventType, Metric, MetricDefinition, MetricType, TimeGranularity,
};
use metering_service::proration::TimeRange;
use metering_service::rating::{handler_for, MetricHandler, UsageWindow};
use metering_service::services::{EventStore, MemoryStore};
use metering_service::MeteringError;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

async fn insert(fixture: &Fixture, event_name: &str, events: &[(DateTime<Utc>, Value)]) {
    insert_for(fixture, fixture.customer.id, event_name, events).await;
}

async fn insert_for(
    fixture: &Fixture,
    customer_id: Uuid,
    event_name: &str,
    events: &[(DateTime<Utc>, Value)],
) {
    let rows: Vec<Event> = events
        .iter()
        .map(|(t, properties)| Event {
            organization_id: fixture.organization.id,
            customer_id,
            event_name: event_name.to_string(),
            properties: properties.as_object().cloned().unwrap_or_default(),
            time_created: *t,
            idempotency_id: Uuid::new_v4().to_string(),
            inserted_at: *t,
        })
        .collect();
    fixture.store.insert_events(&rows).await.unwrap();
}

fn window(fixture: &Fixture, start: DateTime<Utc>, end: DateTime<Utc>) -> UsageWindow {
    UsageWindow {
        organization_id: fixture.organization.id,
        customer_id: fixture.customer.id,
        subscription_record_id: Uuid::new_v4(),
        filters: Vec::new(),
        range: TimeRange::new(start, end),
    }
}

fn handler(fixture: &Fixture, metric: &Metric) -> Arc<dyn MetricHandler> {
    let store: Arc<MemoryStore> = fixture.store.clone();
    handler_for(metric.clone(), store).unwrap()
}

fn values(days: &BTreeMap<NaiveDate, Decimal>) -> Vec<Decimal> {
    days.values().copied().collect()
}

fn ints(values: &[i64]) -> Vec<Decimal> {
    values.iter().map(|v| Decimal::from(*v)).collect()
}

#[tokio::test]
async fn counter_split_read_matches_raw_events() {
    let fixture = Fixture::new().await;
    insert(
        &fixture,
        "api_tokens",
        &[
            (ts(2024, 3, 1, 9, 0), json!({"tokens": 100})),
            (ts(2024, 3, 1, 11, 0), json!({"tokens": 7})),
            (ts(2024, 3, 2, 0, 0), json!({"tokens": 11})),
            (ts(2024, 3, 3, 23, 59), json!({"tokens": 13})),
            (ts(2024, 3, 4, 5, 0), json!({"tokens": 17})),
            (ts(2024, 3, 4, 6, 0), json!({"tokens": 100})),
        ],
    )
    .await;

    let counter = handler(&fixture, &fixture.metric);
    let w = window(&fixture, ts(2024, 3, 1, 10, 30), ts(2024, 3, 4, 6, 0));

    let total = counter.total_billable_usage(&w).await.unwrap();
    assert_eq!(total, Decimal::from(48));

    let fine = counter
        .usage_over_time(
            TimeGranularity::Total,
            w.range,
            Some(fixture.customer.id),
            &[],
        )
        .await
        .unwrap();
    let fine_total: Decimal = fine[&fixture.customer.id].values().copied().sum();
    assert_eq!(total, fine_total);

    let daily = counter.daily_billable_usage(&w).await.unwrap();
    assert_eq!(values(&daily), ints(&[7, 11, 13, 17]));
    assert_eq!(daily.values().copied().sum::<Decimal>(), total);
}

#[tokio::test]
async fn counter_count_split_read_matches_raw_events() {
    let fixture = Fixture::new().await;
    let metric = provision(
        &fixture.store,
        MetricDefinition {
            organization_id: fixture.organization.id,
            metric_type: Some(MetricType::Counter),
            event_name: Some("api_call".to_string()),
            aggregation: Some(Aggregation::Count),
            ..Default::default()
        },
    )
    .await;
    let calls: Vec<(DateTime<Utc>, Value)> = (0..48)
        .map(|h| (ts(2024, 5, 1, 0, 0) + chrono::Duration::minutes(h * 90), json!({})))
        .collect();
    insert(&fixture, "api_call", &calls).await;

    let counter = handler(&fixture, &metric);
    let w = window(&fixture, ts(2024, 5, 1, 7, 15), ts(2024, 5, 3, 20, 0));
    let total = counter.total_billable_usage(&w).await.unwrap();
    let fine = counter
        .usage_over_time(TimeGranularity::Total, w.range, Some(fixture.customer.id), &[])
        .await
        .unwrap();
    assert_eq!(total, fine[&fixture.customer.id].values().copied().sum::<Decimal>());
    assert_eq!(
        counter
            .daily_billable_usage(&w)
            .await
            .unwrap()
            .values()
            .copied()
            .sum::<Decimal>(),
        total
    );
}

#[tokio::test]
async fn unique_usage_is_earned_on_first_seen_day() {
    let fixture = Fixture::new().await;
    let metric = provision(
        &fixture.store,
        MetricDefinition {
            organization_id: fixture.organization.id,
            metric_type: Some(MetricType::Counter),
            event_name: Some("login".to_string()),
            property_name: Some("user".to_string()),
            aggregation: Some(Aggregation::Unique),
            ..Default::default()
        },
    )
    .await;
    insert(
        &fixture,
        "login",
        &[
            (ts(2024, 1, 1, 9, 0), json!({"user": "a"})),
            (ts(2024, 1, 1, 10, 0), json!({"user": "b"})),
            (ts(2024, 1, 1, 11, 0), json!({"user": "a"})),
            (ts(2024, 1, 2, 9, 0), json!({"user": "a"})),
            (ts(2024, 1, 2, 10, 0), json!({"user": "c"})),
            (ts(2024, 1, 3, 9, 0), json!({"user": "b"})),
            (ts(2024, 1, 3, 10, 0), json!({"user": "d"})),
        ],
    )
    .await;

    let counter = handler(&fixture, &metric);
    let w = window(&fixture, ts(2024, 1, 1, 0, 0), ts(2024, 1, 4, 0, 0));
    let daily = counter.daily_billable_usage(&w).await.unwrap();
    assert_eq!(values(&daily), ints(&[2, 1, 1]));
    assert_eq!(counter.total_billable_usage(&w).await.unwrap(), Decimal::from(4));
}

async fn counter(fixture: &Fixture, event_name: &str, property: &str, aggregation: Aggregation) -> Metric {
    provision(
        &fixture.store,
        MetricDefinition {
            organization_id: fixture.organization.id,
            metric_type: Some(MetricType::Counter),
            event_name: Some(event_name.to_string()),
            property_name: Some(property.to_string()),
            aggregation: Some(aggregation),
            ..Default::default()
        },
    )
    .await
}

#[tokio::test]
async fn counter_max_days_earn_only_new_highs() {
    let fixture = Fixture::new().await;
    let metric = counter(&fixture, "queue_depth", "v", Aggregation::Max).await;
    insert(
        &fixture,
        "queue_depth",
        &[
            (ts(2024, 1, 1, 9, 0), json!({"v": 5})),
            (ts(2024, 1, 2, 9, 0), json!({"v": 3})),
            (ts(2024, 1, 3, 9, 0), json!({"v": 8})),
            (ts(2024, 1, 3, 18, 0), json!({"v": 6})),
        ],
    )
    .await;

    let max = handler(&fixture, &metric);
    let w = window(&fixture, ts(2024, 1, 1, 0, 0), ts(2024, 1, 4, 0, 0));
    let daily = max.daily_billable_usage(&w).await.unwrap();
    assert_eq!(values(&daily), ints(&[5, 0, 3]));
    assert_eq!(max.total_billable_usage(&w).await.unwrap(), Decimal::from(8));
}

#[tokio::test]
async fn counter_max_of_negative_values_sums_to_the_total() {
    let fixture = Fixture::new().await;
    let metric = counter(&fixture, "balance", "v", Aggregation::Max).await;
    insert(
        &fixture,
        "balance",
        &[
            (ts(2024, 1, 1, 9, 0), json!({"v": -5})),
            (ts(2024, 1, 2, 9, 0), json!({"v": -3})),
        ],
    )
    .await;

    let max = handler(&fixture, &metric);
    let w = window(&fixture, ts(2024, 1, 1, 0, 0), ts(2024, 1, 3, 0, 0));
    let total = max.total_billable_usage(&w).await.unwrap();
    assert_eq!(total, Decimal::from(-3));
    let daily = max.daily_billable_usage(&w).await.unwrap();
    assert_eq!(values(&daily), ints(&[-5, 2]));
    assert_eq!(daily.values().copied().sum::<Decimal>(), total);
}

#[tokio::test]
async fn counter_average_days_share_the_period_average() {
    let fixture = Fixture::new().await;
    let metric = counter(&fixture, "latency", "ms", Aggregation::Average).await;
    insert(
        &fixture,
        "latency",
        &[
            (ts(2024, 1, 1, 9, 0), json!({"ms": 2})),
            (ts(2024, 1, 1, 10, 0), json!({"ms": 4})),
            (ts(2024, 1, 2, 9, 0), json!({"ms": 9})),
            (ts(2024, 1, 2, 10, 0), json!({"ms": 5})),
            // Events without the property do not dilute the average.
            (ts(2024, 1, 2, 11, 0), json!({})),
        ],
    )
    .await;

    let average = handler(&fixture, &metric);
    // Whole days come from the rollup, the partial tail from raw events.
    let w = window(&fixture, ts(2024, 1, 1, 0, 0), ts(2024, 1, 2, 12, 0));
    let total = average.total_billable_usage(&w).await.unwrap();
    assert_eq!(total, Decimal::from(5));
    let daily = average.daily_billable_usage(&w).await.unwrap();
    assert_eq!(values(&daily), vec![dec("2.5"), dec("2.5")]);
    assert_eq!(daily.values().copied().sum::<Decimal>(), total);
}

#[tokio::test]
async fn usage_over_time_without_customer_breaks_down_per_customer() {
    let fixture = Fixture::new().await;
    let other = fixture.add_customer("cust_ext_2").await;
    insert(
        &fixture,
        "api_tokens",
        &[
            (ts(2024, 2, 1, 9, 0), json!({"tokens": 10})),
            (ts(2024, 2, 2, 9, 0), json!({"tokens": 5})),
        ],
    )
    .await;
    insert_for(
        &fixture,
        other.id,
        "api_tokens",
        &[(ts(2024, 2, 1, 12, 0), json!({"tokens": 7}))],
    )
    .await;

    let counter = handler(&fixture, &fixture.metric);
    let range = TimeRange::new(ts(2024, 2, 1, 0, 0), ts(2024, 2, 3, 0, 0));
    let series = counter
        .usage_over_time(TimeGranularity::Days, range, None, &[])
        .await
        .unwrap();
    assert_eq!(series.len(), 2);
    assert_eq!(values_of(&series[&fixture.customer.id]), ints(&[10, 5]));
    assert_eq!(values_of(&series[&other.id]), ints(&[7]));

    let one = counter
        .usage_over_time(TimeGranularity::Days, range, Some(other.id), &[])
        .await
        .unwrap();
    assert_eq!(one.keys().copied().collect::<Vec<_>>(), vec![other.id]);
}

fn values_of(buckets: &BTreeMap<DateTime<Utc>, Decimal>) -> Vec<Decimal> {
    buckets.values().copied().collect()
}

async fn gauge(fixture: &Fixture, event_type: EventType) -> Metric {
    provision(
        &fixture.store,
        MetricDefinition {
            organization_id: fixture.organization.id,
            metric_type: Some(MetricType::Stateful),
            event_name: Some("seats".to_string()),
            property_name: Some("seats".to_string()),
            aggregation: Some(Aggregation::Max),
            event_type: Some(event_type),
            granularity: Some(TimeGranularity::Months),
            proration_granularity: Some(TimeGranularity::Months),
            ..Default::default()
        },
    )
    .await
}

#[tokio::test]
async fn stateful_days_earn_only_new_highs() {
    let fixture = Fixture::new().await;
    let metric = gauge(&fixture, EventType::Total).await;
    let series = [5, 3, 8, 8, 2, 10];
    let events: Vec<(DateTime<Utc>, Value)> = series
        .iter()
        .enumerate()
        .map(|(i, v)| (ts(2024, 1, i as u32 + 1, 12, 0), json!({"seats": v})))
        .collect();
    insert(&fixture, "seats", &events).await;

    let stateful = handler(&fixture, &metric);
    let w = window(&fixture, ts(2024, 1, 1, 0, 0), ts(2024, 1, 7, 0, 0));
    let daily = stateful.daily_billable_usage(&w).await.unwrap();
    assert_eq!(values(&daily), ints(&[5, 0, 3, 0, 0, 2]));
    assert_eq!(stateful.total_billable_usage(&w).await.unwrap(), Decimal::from(10));

    // Current usage is the latest raw state, not the billable peak.
    let current = stateful
        .current_usage(&w, ts(2024, 1, 5, 18, 0))
        .await
        .unwrap();
    assert_eq!(current, Decimal::from(2));
}

#[tokio::test]
async fn stateful_state_carries_into_the_next_window() {
    let fixture = Fixture::new().await;
    let metric = gauge(&fixture, EventType::Delta).await;
    insert(
        &fixture,
        "seats",
        &[
            (ts(2024, 1, 10, 12, 0), json!({"seats": 4})),
            (ts(2024, 1, 20, 12, 0), json!({"seats": 3})),
            (ts(2024, 1, 25, 12, 0), json!({"seats": -2})),
        ],
    )
    .await;

    let stateful = handler(&fixture, &metric);
    let february = window(&fixture, ts(2024, 2, 1, 0, 0), ts(2024, 3, 1, 0, 0));
    assert_eq!(
        stateful.total_billable_usage(&february).await.unwrap(),
        Decimal::from(5)
    );
    assert_eq!(
        stateful
            .current_usage(&february, ts(2024, 2, 15, 0, 0))
            .await
            .unwrap(),
        Decimal::from(5)
    );
}

#[tokio::test]
async fn stateful_rejects_coarser_proration() {
    let fixture = Fixture::new().await;
    let err = metering_service::rating::MetricProvisioner::new(
        fixture.store.clone(),
        fixture.store.clone(),
    )
    .provision(MetricDefinition {
        organization_id: fixture.organization.id,
        metric_type: Some(MetricType::Stateful),
        event_name: Some("seats".to_string()),
        property_name: Some("seats".to_string()),
        aggregation: Some(Aggregation::Max),
        granularity: Some(TimeGranularity::Days),
        proration_granularity: Some(TimeGranularity::Months),
        ..Default::default()
    })
    .await
    .unwrap_err();
    assert!(matches!(err, MeteringError::Validation(_)));
}

#[tokio::test]
async fn rate_bills_the_highest_window_and_reports_the_current_one() {
    let fixture = Fixture::new().await;
    let metric = provision(
        &fixture.store,
        MetricDefinition {
            organization_id: fixture.organization.id,
            metric_type: Some(MetricType::Rate),
            event_name: Some("request".to_string()),
            aggregation: Some(Aggregation::Count),
            granularity: Some(TimeGranularity::Hours),
            ..Default::default()
        },
    )
    .await;
    insert(
        &fixture,
        "request",
        &[
            (ts(2024, 1, 1, 10, 0), json!({})),
            (ts(2024, 1, 1, 10, 10), json!({})),
            (ts(2024, 1, 1, 10, 20), json!({})),
            (ts(2024, 1, 2, 9, 0), json!({})),
            (ts(2024, 1, 2, 9, 20), json!({})),
        ],
    )
    .await;

    let rate = handler(&fixture, &metric);
    let w = window(&fixture, ts(2024, 1, 1, 0, 0), ts(2024, 1, 3, 0, 0));
    let daily = rate.daily_billable_usage(&w).await.unwrap();
    assert_eq!(values(&daily), ints(&[3, 0]));
    assert_eq!(rate.total_billable_usage(&w).await.unwrap(), Decimal::from(3));
    assert_eq!(
        rate.current_usage(&w, ts(2024, 1, 2, 9, 30)).await.unwrap(),
        Decimal::from(2)
    );
}

const STORAGE_SQL: &str =
    "SELECT customer_id, SUM((properties->>'gb')::numeric) AS usage_qty FROM events GROUP BY customer_id";

#[tokio::test]
async fn custom_query_usage_and_daily_growth() {
    let fixture = Fixture::new().await;
    fixture
        .store
        .register_custom_query(
            STORAGE_SQL,
            Arc::new(|events: &[Event]| {
                let mut totals: BTreeMap<Uuid, Decimal> = BTreeMap::new();
                for event in events {
                    *totals.entry(event.customer_id).or_default() +=
                        event.property_decimal("gb").unwrap_or_default();
                }
                totals.into_iter().collect()
            }),
        )
        .await;
    let metric = provision(
        &fixture.store,
        MetricDefinition {
            organization_id: fixture.organization.id,
            metric_type: Some(MetricType::Custom),
            custom_sql: Some(STORAGE_SQL.to_string()),
            ..Default::default()
        },
    )
    .await;
    insert(
        &fixture,
        "storage",
        &[
            (ts(2024, 1, 1, 8, 0), json!({"gb": "1.5"})),
            (ts(2024, 1, 2, 8, 0), json!({"gb": 2})),
            (ts(2024, 1, 2, 20, 0), json!({"gb": 1})),
        ],
    )
    .await;

    let custom = handler(&fixture, &metric);
    let w = window(&fixture, ts(2024, 1, 1, 0, 0), ts(2024, 1, 3, 0, 0));
    assert_eq!(custom.total_billable_usage(&w).await.unwrap(), dec("4.5"));
    let daily = custom.daily_billable_usage(&w).await.unwrap();
    assert_eq!(values(&daily), vec![dec("1.5"), dec("3")]);
}

#[tokio::test]
async fn custom_query_with_mutation_is_rejected_at_definition_time() {
    let fixture = Fixture::new().await;
    let err = metering_service::rating::MetricProvisioner::new(
        fixture.store.clone(),
        fixture.store.clone(),
    )
    .provision(MetricDefinition {
        organization_id: fixture.organization.id,
        metric_type: Some(MetricType::Custom),
        custom_sql: Some("DELETE FROM events".to_string()),
        ..Default::default()
    })
    .await
    .unwrap_err();
    assert!(matches!(err, MeteringError::Configuration(_)));
}

#[tokio::test]
async fn provisioning_creates_and_archiving_drops_rollups() {
    let fixture = Fixture::new().await;
    let provisioner = metering_service::rating::MetricProvisioner::new(
        fixture.store.clone(),
        fixture.store.clone(),
    );
    let expected = metering_service::rating::rollup_name(
        fixture.organization.id,
        fixture.metric.id,
        TimeGranularity::Days,
    );
    assert!(fixture.store.rollup_names().await.contains(&expected));

    let archived = provisioner.archive(fixture.metric.id).await.unwrap();
    assert_eq!(archived.status, metering_service::models::MetricStatus::Archived);
    assert!(!fixture.store.rollup_names().await.contains(&expected));
}
