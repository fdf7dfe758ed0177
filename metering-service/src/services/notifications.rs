//! Invoice notification and rendering collaborators.

use crate::error::MeteringError;
use crate::models::InvoiceDocument;
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};

#[async_trait]
pub trait InvoiceNotifier: Send + Sync {
    /// Fire-and-forget; implementations log their own failures.
    async fn invoice_created(&self, document: &InvoiceDocument);
}

#[async_trait]
pub trait InvoiceRenderer: Send + Sync {
    /// Render the invoice and return where the document lives.
    async fn render(&self, document: &InvoiceDocument) -> Result<String, MeteringError>;
}

pub struct LogNotifier;

#[async_trait]
impl InvoiceNotifier for LogNotifier {
    async fn invoice_created(&self, document: &InvoiceDocument) {
        let invoice = &document.invoice;
        info!(
            invoice_id = %invoice.id,
            customer_id = %invoice.customer_id,
            currency = %invoice.currency,
            amount = %invoice.amount,
            status = invoice.payment_status.as_str(),
            line_items = document.line_items.len(),
            "Invoice created"
        );
    }
}

/// Posts `{"event": "invoice.created", "invoice": ...}` to a webhook endpoint.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl InvoiceNotifier for WebhookNotifier {
    async fn invoice_created(&self, document: &InvoiceDocument) {
        let result = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&json!({ "event": "invoice.created", "invoice": document }))
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => warn!(
                invoice_id = %document.invoice.id,
                status = %response.status(),
                "Invoice webhook rejected"
            ),
            Err(e) => warn!(
                invoice_id = %document.invoice.id,
                error = %e,
                "Invoice webhook delivery failed"
            ),
        }
    }
}
