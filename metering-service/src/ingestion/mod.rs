//! Idempotent event ingestion with a dual-window duplicate check.

use crate::config::BillingSettings;
use crate::error::MeteringError;
use crate::models::{Event, RawEvent};
use crate::services::metrics::{record_events_deduplicated, record_events_ingested};
use crate::services::{record_error, CustomerLocks, EventStore, UsageCache};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

pub struct EventIngestor {
    store: Arc<dyn EventStore>,
    cache: Arc<UsageCache>,
    locks: Arc<CustomerLocks>,
    settings: BillingSettings,
}

impl EventIngestor {
    pub fn new(
        store: Arc<dyn EventStore>,
        cache: Arc<UsageCache>,
        locks: Arc<CustomerLocks>,
        settings: BillingSettings,
    ) -> Self {
        Self {
            store,
            cache,
            locks,
            settings,
        }
    }

    /// Insert a batch for one customer and return how many events were new.
    ///
    /// Ids seen with `time_created` inside the long window or `inserted_at`
    /// inside the short window are duplicates. A batch whose customer cannot
    /// be resolved is dropped whole.
    #[instrument(skip(self, batch), fields(organization_id = %organization_id, batch_size = batch.len()))]
    pub async fn ingest_batch(
        &self,
        organization_id: Uuid,
        batch: Vec<RawEvent>,
        now: DateTime<Utc>,
    ) -> Result<u64, MeteringError> {
        let Some(first) = batch.first() else {
            return Ok(0);
        };
        let external_id = first.customer_id.clone();
        if batch.iter().any(|e| e.customer_id != external_id) {
            return Err(MeteringError::Validation(
                "an ingestion batch must reference a single customer".to_string(),
            ));
        }

        let customer = match self
            .store
            .resolve_customer(organization_id, &external_id)
            .await?
        {
            Some(customer) => customer,
            None => {
                warn!(
                    organization_id = %organization_id,
                    external_customer_id = %external_id,
                    dropped = batch.len(),
                    "Dropping event batch for unknown customer"
                );
                record_error("customer_not_resolved", "ingest_batch");
                return Err(MeteringError::CustomerNotResolved(external_id));
            }
        };

        // Batches for one customer must not interleave or the window check is unsound.
        let _guard = self.locks.lock(customer.id).await;

        let mut seen = HashSet::new();
        let candidates: Vec<Event> = batch
            .into_iter()
            .filter(|raw| seen.insert(raw.idempotency_id.clone()))
            .map(|raw| Event {
                organization_id,
                customer_id: customer.id,
                event_name: raw.event_name,
                properties: raw.properties,
                time_created: raw.time_created,
                idempotency_id: raw.idempotency_id,
                inserted_at: now,
            })
            .collect();
        let submitted = seen.len() as u64;

        let ids: Vec<String> = candidates.iter().map(|e| e.idempotency_id.clone()).collect();
        let existing = self
            .store
            .existing_idempotency_ids(
                organization_id,
                &ids,
                now - Duration::days(self.settings.dedup_time_created_window_days),
                now - Duration::days(self.settings.dedup_inserted_at_window_days),
            )
            .await?;

        let fresh: Vec<Event> = if existing.is_empty() {
            candidates
        } else {
            candidates
                .into_iter()
                .filter(|e| !existing.contains(&e.idempotency_id))
                .collect()
        };

        let inserted = self.store.insert_events(&fresh).await?;
        let org_label = organization_id.to_string();
        record_events_ingested(&org_label, inserted);
        record_events_deduplicated(&org_label, submitted.saturating_sub(inserted));

        let touched: BTreeSet<&str> = fresh.iter().map(|e| e.event_name.as_str()).collect();
        self.cache.invalidate_ingested(customer.id, touched);

        info!(
            customer_id = %customer.id,
            submitted = submitted,
            inserted = inserted,
            "Event batch ingested"
        );
        Ok(inserted)
    }
}
