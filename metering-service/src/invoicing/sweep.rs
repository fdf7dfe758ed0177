//! Periodic billing sweep: expire credits, then invoice every due customer.

use super::pipeline::{GenerateInvoiceOptions, InvoiceGenerator};
use crate::error::MeteringError;
use crate::services::metrics::record_sweep_run;
use crate::services::BillingStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{error, info, instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub invoices: usize,
    pub expired_credits: u64,
}

impl SweepSummary {
    fn merge(&mut self, other: SweepSummary) {
        self.processed += other.processed;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.invoices += other.invoices;
        self.expired_credits += other.expired_credits;
    }

    fn status(&self) -> &'static str {
        match (self.failed, self.succeeded) {
            (0, _) => "success",
            (_, 0) => "failed",
            _ => "partial",
        }
    }
}

pub struct BillingSweep {
    store: Arc<dyn BillingStore>,
    generator: Arc<InvoiceGenerator>,
}

impl BillingSweep {
    pub fn new(store: Arc<dyn BillingStore>, generator: Arc<InvoiceGenerator>) -> Self {
        Self { store, generator }
    }

    /// Invoice one organization's due customers. A failing customer is logged
    /// and counted; the others are still invoiced.
    #[instrument(skip(self), fields(organization_id = %organization_id))]
    pub async fn run(
        &self,
        organization_id: Uuid,
        issue_date: DateTime<Utc>,
    ) -> Result<SweepSummary, MeteringError> {
        let mut summary = SweepSummary::default();
        match self.store.expire_balances(organization_id, issue_date).await {
            Ok(expired) => summary.expired_credits = expired,
            Err(e) => error!(error = %e, "Failed to expire customer balances"),
        }

        let customers = self
            .store
            .customers_with_due_records(organization_id, issue_date)
            .await?;
        for customer_id in customers {
            summary.processed += 1;
            match self
                .generator
                .generate_for_customer(customer_id, GenerateInvoiceOptions::finalize(issue_date))
                .await
            {
                Ok(documents) => {
                    summary.succeeded += 1;
                    summary.invoices += documents.len();
                }
                Err(e) => {
                    summary.failed += 1;
                    error!(customer_id = %customer_id, error = %e, "Customer skipped by billing sweep");
                }
            }
        }

        record_sweep_run(summary.status());
        info!(
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            invoices = summary.invoices,
            "Billing sweep complete"
        );
        Ok(summary)
    }

    /// Sweep every organization.
    pub async fn run_all(&self, issue_date: DateTime<Utc>) -> Result<SweepSummary, MeteringError> {
        let mut summary = SweepSummary::default();
        for organization in self.store.list_organizations().await? {
            match self.run(organization.id, issue_date).await {
                Ok(org_summary) => summary.merge(org_summary),
                Err(e) => {
                    error!(organization_id = %organization.id, error = %e, "Billing sweep failed for organization");
                    record_sweep_run("failed");
                }
            }
        }
        Ok(summary)
    }

    /// Sweep on a fixed period until `shutdown` flips to true.
    pub async fn run_every(&self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(period);
        info!(interval_secs = period.as_secs(), "Starting billing sweep loop");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_all(Utc::now()).await {
                        error!(error = %e, "Billing sweep failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Billing sweep loop shutting down");
                        break;
                    }
                }
            }
        }
    }
}
