//! Continuous pre-aggregations ("rollups") that back metric queries, and the
//! provisioning flow that keeps them in step with metric definitions.

use super::validate_definition;
use crate::error::MeteringError;
use crate::models::{Metric, MetricDefinition, MetricStatus, MetricType, TimeGranularity};
use crate::services::{BillingStore, RollupDefinition, RollupStore};
use sha2::{Digest, Sha224};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// Deterministic, fixed-length rollup identifier.
pub fn rollup_name(organization_id: Uuid, metric_id: Uuid, granularity: TimeGranularity) -> String {
    let digest = Sha224::digest(format!(
        "{}:{}:{}",
        organization_id,
        metric_id,
        granularity.as_str()
    ));
    format!("cagg_{}", hex::encode(digest))
}

/// Granularities a metric's handler reads pre-aggregated.
pub fn natural_granularities(metric: &Metric) -> Vec<TimeGranularity> {
    match metric.metric_type {
        MetricType::Counter => vec![TimeGranularity::Days],
        MetricType::Stateful | MetricType::Rate => vec![metric.granularity],
        MetricType::Custom => Vec::new(),
    }
}

fn definitions(metric: &Metric) -> Vec<RollupDefinition> {
    natural_granularities(metric)
        .into_iter()
        .map(|granularity| RollupDefinition {
            name: rollup_name(metric.organization_id, metric.id, granularity),
            metric: metric.clone(),
            granularity,
        })
        .collect()
}

#[derive(Clone)]
pub struct RollupManager {
    store: Arc<dyn RollupStore>,
}

impl RollupManager {
    pub fn new(store: Arc<dyn RollupStore>) -> Self {
        Self { store }
    }

    #[instrument(skip(self, metric), fields(metric_id = %metric.id))]
    pub async fn provision(&self, metric: &Metric) -> Result<Vec<String>, MeteringError> {
        let mut names = Vec::new();
        for definition in definitions(metric) {
            self.store.create_rollup(&definition).await?;
            names.push(definition.name);
        }
        Ok(names)
    }

    #[instrument(skip(self, metric), fields(metric_id = %metric.id))]
    pub async fn archive(&self, metric: &Metric) -> Result<(), MeteringError> {
        for definition in definitions(metric) {
            self.store.drop_rollup(&definition.name).await?;
        }
        Ok(())
    }

    /// Tear down and recreate under the same names.
    pub async fn refresh(&self, metric: &Metric) -> Result<Vec<String>, MeteringError> {
        self.archive(metric).await?;
        self.provision(metric).await
    }
}

/// Validates, persists and provisions metric definitions.
#[derive(Clone)]
pub struct MetricProvisioner {
    billing: Arc<dyn BillingStore>,
    rollups: RollupManager,
}

impl MetricProvisioner {
    pub fn new(billing: Arc<dyn BillingStore>, rollups: Arc<dyn RollupStore>) -> Self {
        Self {
            billing,
            rollups: RollupManager::new(rollups),
        }
    }

    /// Nothing is persisted unless the definition validates.
    pub async fn provision(&self, definition: MetricDefinition) -> Result<Metric, MeteringError> {
        let metric = validate_definition(definition)?;
        self.billing.save_metric(&metric).await?;
        let rollups = self.rollups.provision(&metric).await?;
        info!(
            metric_id = %metric.id,
            metric_type = metric.metric_type.as_str(),
            rollups = rollups.len(),
            "Metric provisioned"
        );
        Ok(metric)
    }

    pub async fn archive(&self, metric_id: Uuid) -> Result<Metric, MeteringError> {
        let mut metric = self.billing.get_metric(metric_id).await?;
        metric.status = MetricStatus::Archived;
        self.billing.save_metric(&metric).await?;
        self.rollups.archive(&metric).await?;
        info!(metric_id = %metric.id, "Metric archived");
        Ok(metric)
    }

    pub async fn refresh(&self, metric_id: Uuid) -> Result<Vec<String>, MeteringError> {
        let metric = self.billing.get_metric(metric_id).await?;
        self.rollups.refresh(&metric).await
    }
}
