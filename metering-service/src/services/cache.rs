//! Short-lived cache of current usage, invalidated by ingestion.

use dashmap::DashMap;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Stream key for metrics defined by custom SQL, which may read any event.
pub const CUSTOM_STREAM: &str = "*custom";

/// Entries are grouped under `(customer_id, event_name)` so one ingested
/// batch can drop every cached figure derived from that stream.
#[derive(Debug)]
pub struct UsageCache {
    ttl: Duration,
    entries: DashMap<(Uuid, String), HashMap<(Uuid, Uuid), (Decimal, Instant)>>,
}

impl UsageCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    pub fn get(
        &self,
        customer_id: Uuid,
        event_name: &str,
        metric_id: Uuid,
        subscription_record_id: Uuid,
    ) -> Option<Decimal> {
        let group = self.entries.get(&(customer_id, event_name.to_string()))?;
        let (value, stored_at) = group.get(&(metric_id, subscription_record_id))?;
        (stored_at.elapsed() < self.ttl).then_some(*value)
    }

    pub fn insert(
        &self,
        customer_id: Uuid,
        event_name: &str,
        metric_id: Uuid,
        subscription_record_id: Uuid,
        value: Decimal,
    ) {
        self.entries
            .entry((customer_id, event_name.to_string()))
            .or_default()
            .insert((metric_id, subscription_record_id), (value, Instant::now()));
    }

    pub fn invalidate(&self, customer_id: Uuid, event_name: &str) {
        self.entries.remove(&(customer_id, event_name.to_string()));
    }

    /// Drops every cached figure derived from the given streams, plus the
    /// customer's custom-SQL figures.
    pub fn invalidate_ingested<'a>(
        &self,
        customer_id: Uuid,
        event_names: impl IntoIterator<Item = &'a str>,
    ) {
        let mut touched = false;
        for event_name in event_names {
            self.invalidate(customer_id, event_name);
            touched = true;
        }
        if touched {
            self.invalidate(customer_id, CUSTOM_STREAM);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalidation_drops_the_whole_stream() {
        let cache = UsageCache::new(Duration::from_secs(60));
        let (customer, metric_a, metric_b, record) =
            (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        cache.insert(customer, "api_call", metric_a, record, Decimal::from(3));
        cache.insert(customer, "api_call", metric_b, record, Decimal::from(4));
        cache.insert(customer, "storage", metric_a, record, Decimal::from(5));

        cache.invalidate(customer, "api_call");

        assert_eq!(cache.get(customer, "api_call", metric_a, record), None);
        assert_eq!(cache.get(customer, "api_call", metric_b, record), None);
        assert_eq!(cache.get(customer, "storage", metric_a, record), Some(Decimal::from(5)));
    }

    #[test]
    fn ingesting_any_stream_drops_custom_figures() {
        let cache = UsageCache::new(Duration::from_secs(60));
        let (customer, other, metric, record) =
            (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        cache.insert(customer, CUSTOM_STREAM, metric, record, Decimal::from(3));
        cache.insert(other, CUSTOM_STREAM, metric, record, Decimal::from(4));

        cache.invalidate_ingested(customer, Vec::<&str>::new());
        assert_eq!(cache.get(customer, CUSTOM_STREAM, metric, record), Some(Decimal::from(3)));

        cache.invalidate_ingested(customer, ["storage"]);
        assert_eq!(cache.get(customer, CUSTOM_STREAM, metric, record), None);
        assert_eq!(cache.get(other, CUSTOM_STREAM, metric, record), Some(Decimal::from(4)));
    }

    #[test]
    fn expired_entries_are_ignored() {
        let cache = UsageCache::new(Duration::ZERO);
        let ids = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        cache.insert(ids.0, "api_call", ids.1, ids.2, Decimal::ONE);
        assert_eq!(cache.get(ids.0, "api_call", ids.1, ids.2), None);
    }
}
