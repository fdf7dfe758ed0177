//! Event ingestion integration tests for metering-service.

mod common;

use chrono::{Duration, Utc};
use common::{provision, ts, Fixture};
use metering_service::models::{Event, MetricDefinition, MetricType, RawEvent};
use metering_service::proration::TimeRange;
use metering_service::rating::UsageWindow;
use metering_service::MeteringError;
use rust_decimal::Decimal;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

fn raw(customer: &str, idempotency_id: &str, minutes: i64) -> RawEvent {
    RawEvent {
        customer_id: customer.to_string(),
        event_name: "api_tokens".to_string(),
        properties: json!({"tokens": 10}).as_object().cloned().unwrap_or_default(),
        time_created: ts(2024, 6, 1, 12, 0) + Duration::minutes(minutes),
        idempotency_id: idempotency_id.to_string(),
    }
}

#[tokio::test]
async fn resubmitted_batch_is_inserted_once() {
    let fixture = Fixture::new().await;
    let state = fixture.state();
    let now = ts(2024, 6, 1, 13, 0);
    let batch = vec![
        raw("cust_ext_1", "evt_1", 0),
        raw("cust_ext_1", "evt_2", 1),
        raw("cust_ext_1", "evt_3", 2),
    ];

    let first = state
        .ingestor
        .ingest_batch(fixture.organization.id, batch.clone(), now)
        .await
        .unwrap();
    assert_eq!(first, 3);

    let second = state
        .ingestor
        .ingest_batch(fixture.organization.id, batch.clone(), now + Duration::minutes(5))
        .await
        .unwrap();
    assert!(second < batch.len() as u64);
    assert_eq!(second, 0);
    assert_eq!(fixture.store.events().await.len(), 3);
}

#[tokio::test]
async fn repeated_ids_inside_one_batch_collapse() {
    let fixture = Fixture::new().await;
    let state = fixture.state();
    let batch = vec![
        raw("cust_ext_1", "evt_1", 0),
        raw("cust_ext_1", "evt_1", 0),
        raw("cust_ext_1", "evt_2", 1),
    ];

    let inserted = state
        .ingestor
        .ingest_batch(fixture.organization.id, batch, Utc::now())
        .await
        .unwrap();
    assert_eq!(inserted, 2);
}

#[tokio::test]
async fn ids_outside_both_windows_are_accepted_again() {
    let fixture = Fixture::new().await;
    let state = fixture.state();
    let long_ago = ts(2024, 1, 1, 0, 0);
    let mut old = raw("cust_ext_1", "evt_reused", 0);
    old.time_created = long_ago;
    state
        .ingestor
        .ingest_batch(fixture.organization.id, vec![old], long_ago)
        .await
        .unwrap();

    // Sixty days later the id is outside the 45-day and 7-day windows.
    let now = long_ago + Duration::days(60);
    let mut reused = raw("cust_ext_1", "evt_reused", 0);
    reused.time_created = now;
    let inserted = state
        .ingestor
        .ingest_batch(fixture.organization.id, vec![reused], now)
        .await
        .unwrap();
    assert_eq!(inserted, 1);

    // A recently inserted id is still a duplicate even with an old timestamp.
    let mut backdated = raw("cust_ext_1", "evt_reused", 0);
    backdated.time_created = long_ago - Duration::days(30);
    let inserted = state
        .ingestor
        .ingest_batch(fixture.organization.id, vec![backdated], now + Duration::days(1))
        .await
        .unwrap();
    assert_eq!(inserted, 0);
}

#[tokio::test]
async fn unknown_customer_drops_the_batch() {
    let fixture = Fixture::new().await;
    let state = fixture.state();

    let err = state
        .ingestor
        .ingest_batch(
            fixture.organization.id,
            vec![raw("nobody", "evt_1", 0)],
            Utc::now(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MeteringError::CustomerNotResolved(_)));
    assert!(fixture.store.events().await.is_empty());
}

#[tokio::test]
async fn batch_must_reference_one_customer() {
    let fixture = Fixture::new().await;
    fixture.add_customer("cust_ext_2").await;
    let state = fixture.state();

    let err = state
        .ingestor
        .ingest_batch(
            fixture.organization.id,
            vec![raw("cust_ext_1", "evt_1", 0), raw("cust_ext_2", "evt_2", 0)],
            Utc::now(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MeteringError::Validation(_)));
}

const TOKENS_SQL: &str =
    "SELECT customer_id, SUM((properties->>'tokens')::numeric) AS usage_qty FROM events GROUP BY customer_id";

#[tokio::test]
async fn ingestion_refreshes_cached_custom_usage() {
    let fixture = Fixture::new().await;
    fixture
        .store
        .register_custom_query(
            TOKENS_SQL,
            Arc::new(|events: &[Event]| {
                let mut totals: BTreeMap<Uuid, Decimal> = BTreeMap::new();
                for event in events {
                    *totals.entry(event.customer_id).or_default() +=
                        event.property_decimal("tokens").unwrap_or_default();
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
            custom_sql: Some(TOKENS_SQL.to_string()),
            ..Default::default()
        },
    )
    .await;
    let state = fixture.state();
    let now = ts(2024, 6, 1, 13, 0);
    let window = UsageWindow {
        organization_id: fixture.organization.id,
        customer_id: fixture.customer.id,
        subscription_record_id: Uuid::new_v4(),
        filters: Vec::new(),
        range: TimeRange::new(ts(2024, 6, 1, 0, 0), ts(2024, 7, 1, 0, 0)),
    };

    state
        .ingestor
        .ingest_batch(fixture.organization.id, vec![raw("cust_ext_1", "evt_1", 0)], now)
        .await
        .unwrap();
    let before = state.rating.current_usage(&metric, &window, now).await.unwrap();
    assert_eq!(before, Decimal::from(10));

    state
        .ingestor
        .ingest_batch(fixture.organization.id, vec![raw("cust_ext_1", "evt_2", 1)], now)
        .await
        .unwrap();
    let after = state.rating.current_usage(&metric, &window, now).await.unwrap();
    assert_eq!(after, Decimal::from(20));
}
