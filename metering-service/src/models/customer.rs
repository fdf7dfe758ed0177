//! Customers and organizations as read by the billing engine.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Tax provider identifiers, tried in a configured preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaxProviderKind {
    /// Rate configured on the customer, else the organization.
    Local,
    /// Tax is decided by an external system; no local tax is applied.
    External,
    /// Rate fetched from a tax service over HTTP.
    Http,
}

impl TaxProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaxProviderKind::Local => "local",
            TaxProviderKind::External => "external",
            TaxProviderKind::Http => "http",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    /// Percentage, e.g. 8.25.
    pub tax_rate: Option<Decimal>,
    #[serde(default)]
    pub tax_providers: Vec<TaxProviderKind>,
    pub net_terms_days: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub external_id: String,
    pub name: String,
    pub tax_rate: Option<Decimal>,
    #[serde(default)]
    pub tax_providers: Vec<TaxProviderKind>,
    /// Key of the payment processor holding this customer's account.
    pub payment_provider: Option<String>,
    pub net_terms_days: Option<i64>,
}
