//! Tax providers and the ordered fallback chain over them.

use crate::error::MeteringError;
use crate::models::{Customer, Organization, TaxProviderKind};
use crate::services::metrics::record_tax_attempt;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{instrument, warn};

/// Inputs a provider may price tax from.
#[derive(Debug, Clone)]
pub struct TaxRequest {
    pub customer: Customer,
    pub organization: Organization,
    pub amount: Decimal,
    pub draft: bool,
}

/// Outcome of asking one provider.
#[derive(Debug, Clone, PartialEq)]
pub enum TaxAttempt {
    /// Percentage rate to apply locally.
    Rate(Decimal),
    /// Tax is handled outside this system; apply nothing.
    ExternallyDecided,
    Failed(String),
}

impl TaxAttempt {
    fn outcome(&self) -> &'static str {
        match self {
            TaxAttempt::Rate(_) => "rate",
            TaxAttempt::ExternallyDecided => "external",
            TaxAttempt::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TaxResolution {
    pub provider: TaxProviderKind,
    /// Percentage; zero when the provider decides tax externally.
    pub rate: Decimal,
}

/// First successful attempt wins. `None` means no provider succeeded and no tax applies.
pub fn resolve_tax_rate(attempts: &[(TaxProviderKind, TaxAttempt)]) -> Option<TaxResolution> {
    attempts.iter().find_map(|(provider, attempt)| match attempt {
        TaxAttempt::Rate(rate) => Some(TaxResolution {
            provider: *provider,
            rate: *rate,
        }),
        TaxAttempt::ExternallyDecided => Some(TaxResolution {
            provider: *provider,
            rate: Decimal::ZERO,
        }),
        TaxAttempt::Failed(_) => None,
    })
}

/// Customer preferences first, then the organization's, without repeats.
/// Falls back to the local provider when neither configures an order.
pub fn preference_order(customer: &Customer, organization: &Organization) -> Vec<TaxProviderKind> {
    let mut order: Vec<TaxProviderKind> = Vec::new();
    for kind in customer
        .tax_providers
        .iter()
        .chain(organization.tax_providers.iter())
    {
        if !order.contains(kind) {
            order.push(*kind);
        }
    }
    if order.is_empty() {
        order.push(TaxProviderKind::Local);
    }
    order
}

#[async_trait]
pub trait TaxProvider: Send + Sync {
    fn kind(&self) -> TaxProviderKind;
    async fn get_rate(&self, request: &TaxRequest) -> Result<TaxAttempt, MeteringError>;
}

/// Rate configured on the customer, else on the organization.
pub struct LocalTaxProvider;

#[async_trait]
impl TaxProvider for LocalTaxProvider {
    fn kind(&self) -> TaxProviderKind {
        TaxProviderKind::Local
    }

    async fn get_rate(&self, request: &TaxRequest) -> Result<TaxAttempt, MeteringError> {
        Ok(match request.customer.tax_rate.or(request.organization.tax_rate) {
            Some(rate) => TaxAttempt::Rate(rate),
            None => TaxAttempt::Failed("no tax rate configured".to_string()),
        })
    }
}

/// Always succeeds; tax is computed by the system collecting payment.
pub struct ExternalTaxProvider;

#[async_trait]
impl TaxProvider for ExternalTaxProvider {
    fn kind(&self) -> TaxProviderKind {
        TaxProviderKind::External
    }

    async fn get_rate(&self, _request: &TaxRequest) -> Result<TaxAttempt, MeteringError> {
        Ok(TaxAttempt::ExternallyDecided)
    }
}

#[derive(Debug, Serialize)]
struct HttpTaxRequest<'a> {
    customer_id: String,
    organization_id: String,
    amount: &'a Decimal,
    draft: bool,
}

#[derive(Debug, Deserialize)]
struct HttpTaxResponse {
    rate: Decimal,
}

/// Tax service reached over HTTP: `POST {base_url}/rates` returning `{"rate": ...}`.
pub struct HttpTaxProvider {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTaxProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl TaxProvider for HttpTaxProvider {
    fn kind(&self) -> TaxProviderKind {
        TaxProviderKind::Http
    }

    async fn get_rate(&self, request: &TaxRequest) -> Result<TaxAttempt, MeteringError> {
        let url = format!("{}/rates", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(&HttpTaxRequest {
                customer_id: request.customer.id.to_string(),
                organization_id: request.organization.id.to_string(),
                amount: &request.amount,
                draft: request.draft,
            })
            .send()
            .await
            .map_err(|e| MeteringError::ExternalUnavailable(format!("tax service: {}", e)))?;

        if !response.status().is_success() {
            return Ok(TaxAttempt::Failed(format!(
                "tax service returned {}",
                response.status()
            )));
        }

        let body: HttpTaxResponse = response
            .json()
            .await
            .map_err(|e| MeteringError::ExternalUnavailable(format!("tax service body: {}", e)))?;
        Ok(TaxAttempt::Rate(body.rate))
    }
}

/// Providers by kind, each call bounded by `timeout`.
pub struct TaxRegistry {
    providers: HashMap<TaxProviderKind, Arc<dyn TaxProvider>>,
    timeout: Duration,
}

impl TaxRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            providers: HashMap::new(),
            timeout,
        }
    }

    /// Local and external providers, plus HTTP when a tax service is configured.
    pub fn with_defaults(timeout: Duration, tax_service_url: Option<&str>) -> Self {
        let registry = Self::new(timeout)
            .register(Arc::new(LocalTaxProvider))
            .register(Arc::new(ExternalTaxProvider));
        match tax_service_url {
            Some(url) => registry.register(Arc::new(HttpTaxProvider::new(url))),
            None => registry,
        }
    }

    pub fn register(mut self, provider: Arc<dyn TaxProvider>) -> Self {
        self.providers.insert(provider.kind(), provider);
        self
    }

    async fn attempt(&self, kind: TaxProviderKind, request: &TaxRequest) -> TaxAttempt {
        let Some(provider) = self.providers.get(&kind) else {
            return TaxAttempt::Failed("provider not configured".to_string());
        };
        match tokio::time::timeout(self.timeout, provider.get_rate(request)).await {
            Ok(Ok(attempt)) => attempt,
            Ok(Err(e)) => TaxAttempt::Failed(e.to_string()),
            Err(_) => TaxAttempt::Failed(format!("timed out after {:?}", self.timeout)),
        }
    }

    /// Walk the preference order, stopping at the first provider that succeeds.
    #[instrument(skip(self, request), fields(customer_id = %request.customer.id))]
    pub async fn resolve(&self, request: &TaxRequest) -> Option<TaxResolution> {
        let mut attempts = Vec::new();
        for kind in preference_order(&request.customer, &request.organization) {
            let attempt = self.attempt(kind, request).await;
            record_tax_attempt(kind.as_str(), attempt.outcome());
            if let TaxAttempt::Failed(reason) = &attempt {
                warn!(provider = kind.as_str(), reason = %reason, "Tax provider failed, trying next");
            }
            let succeeded = !matches!(attempt, TaxAttempt::Failed(_));
            attempts.push((kind, attempt));
            if succeeded {
                break;
            }
        }
        resolve_tax_rate(&attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn parties(customer: Vec<TaxProviderKind>, org: Vec<TaxProviderKind>) -> (Customer, Organization) {
        let organization = Organization {
            id: Uuid::new_v4(),
            name: "Acme".into(),
            tax_rate: Some(Decimal::from(5)),
            tax_providers: org,
            net_terms_days: None,
        };
        let customer = Customer {
            id: Uuid::new_v4(),
            organization_id: organization.id,
            external_id: "cust_1".into(),
            name: "Customer".into(),
            tax_rate: None,
            tax_providers: customer,
            payment_provider: None,
            net_terms_days: None,
        };
        (customer, organization)
    }

    #[test]
    fn first_success_wins() {
        let attempts = vec![
            (TaxProviderKind::Http, TaxAttempt::Failed("down".into())),
            (TaxProviderKind::Local, TaxAttempt::Rate(Decimal::from(7))),
            (TaxProviderKind::External, TaxAttempt::ExternallyDecided),
        ];
        let resolved = resolve_tax_rate(&attempts).unwrap();
        assert_eq!(resolved.provider, TaxProviderKind::Local);
        assert_eq!(resolved.rate, Decimal::from(7));
    }

    #[test]
    fn external_short_circuits_to_zero() {
        let attempts = vec![(TaxProviderKind::External, TaxAttempt::ExternallyDecided)];
        assert_eq!(resolve_tax_rate(&attempts).unwrap().rate, Decimal::ZERO);
    }

    #[test]
    fn all_failures_resolve_to_none() {
        let attempts = vec![(TaxProviderKind::Local, TaxAttempt::Failed("unset".into()))];
        assert_eq!(resolve_tax_rate(&attempts), None);
    }

    #[test]
    fn customer_order_precedes_organization_without_repeats() {
        let (customer, org) = parties(
            vec![TaxProviderKind::Http, TaxProviderKind::Local],
            vec![TaxProviderKind::Local, TaxProviderKind::External],
        );
        assert_eq!(
            preference_order(&customer, &org),
            vec![
                TaxProviderKind::Http,
                TaxProviderKind::Local,
                TaxProviderKind::External
            ]
        );
    }

    struct SlowProvider;

    #[async_trait]
    impl TaxProvider for SlowProvider {
        fn kind(&self) -> TaxProviderKind {
            TaxProviderKind::Http
        }

        async fn get_rate(&self, _request: &TaxRequest) -> Result<TaxAttempt, MeteringError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(TaxAttempt::Rate(Decimal::from(99)))
        }
    }

    #[tokio::test]
    async fn timed_out_provider_falls_through_to_local() {
        let registry = TaxRegistry::new(Duration::from_millis(20))
            .register(Arc::new(SlowProvider))
            .register(Arc::new(LocalTaxProvider));
        let (customer, organization) = parties(vec![TaxProviderKind::Http, TaxProviderKind::Local], vec![]);
        let resolved = registry
            .resolve(&TaxRequest {
                customer,
                organization,
                amount: Decimal::from(100),
                draft: false,
            })
            .await
            .unwrap();
        assert_eq!(resolved.provider, TaxProviderKind::Local);
        assert_eq!(resolved.rate, Decimal::from(5));
    }
}
