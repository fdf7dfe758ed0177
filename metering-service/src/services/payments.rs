//! Payment processor collaborators.

use crate::error::MeteringError;
use crate::models::{Invoice, PaymentStatus};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    /// Create the processor-side invoice; `None` when the processor declines to track it.
    async fn create_payment_object(&self, invoice: &Invoice) -> Result<Option<String>, MeteringError>;
    async fn update_status(&self, external_id: &str) -> Result<PaymentStatus, MeteringError>;
}

/// Processors keyed by the name stored on customers and invoices.
pub struct PaymentRegistry {
    processors: HashMap<String, Arc<dyn PaymentProcessor>>,
    timeout: Duration,
}

impl PaymentRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            processors: HashMap::new(),
            timeout,
        }
    }

    pub fn register(mut self, name: impl Into<String>, processor: Arc<dyn PaymentProcessor>) -> Self {
        self.processors.insert(name.into(), processor);
        self
    }

    fn processor(&self, name: &str) -> Result<&Arc<dyn PaymentProcessor>, MeteringError> {
        self.processors.get(name).ok_or_else(|| {
            MeteringError::ExternalUnavailable(format!("payment processor {} not configured", name))
        })
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, MeteringError>>,
    ) -> Result<T, MeteringError> {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| {
                MeteringError::ExternalUnavailable(format!(
                    "payment processor timed out after {:?}",
                    self.timeout
                ))
            })?
    }

    pub async fn create_payment_object(
        &self,
        provider: &str,
        invoice: &Invoice,
    ) -> Result<Option<String>, MeteringError> {
        let processor = self.processor(provider)?;
        self.bounded(processor.create_payment_object(invoice)).await
    }

    pub async fn update_status(
        &self,
        provider: &str,
        external_id: &str,
    ) -> Result<PaymentStatus, MeteringError> {
        let processor = self.processor(provider)?;
        self.bounded(processor.update_status(external_id)).await
    }
}
