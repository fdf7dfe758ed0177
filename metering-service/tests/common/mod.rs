//! Test helper module for metering-service integration tests.
//!
//! Builds organizations, plans and subscriptions over the in-process store so
//! the engine can be exercised without PostgreSQL.

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use metering_service::config::BillingSettings;
use metering_service::invoicing::renewal::billing_records_for;
use metering_service::models::{
    Aggregation, BalanceStatus, BatchRounding, ChargeBehavior, ChargeTiming, Customer,
    CustomerBalanceAdjustment, Event, Metric, MetricDefinition, MetricType, Organization,
    PlanComponent, PlanDuration, PlanVersion, PriceTier, RecurringCharge, SubscriptionRecord,
    TierType,
};
use metering_service::proration::period_end;
use metering_service::rating::MetricProvisioner;
use metering_service::services::{
    init_metrics, EventStore, InvoiceNotifier, LogNotifier, MemoryStore, PaymentRegistry,
    TaxRegistry,
};
use metering_service::startup::{router, AppState};
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use uuid::Uuid;

pub const TEST_CURRENCY: &str = "USD";
pub const TEST_EVENT_NAME: &str = "api_tokens";

pub fn dec(s: &str) -> Decimal {
    s.parse().unwrap()
}

pub fn ts(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
}

pub fn test_settings() -> BillingSettings {
    BillingSettings {
        sweep_interval_secs: 0,
        external_call_timeout_ms: 2000,
        ..BillingSettings::default()
    }
}

/// One organization with one customer and a provisioned Counter SUM metric.
pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub organization: Organization,
    pub customer: Customer,
    pub metric: Metric,
}

impl Fixture {
    pub async fn new() -> Self {
        init_metrics();
        let store = Arc::new(MemoryStore::new());

        let organization = Organization {
            id: Uuid::new_v4(),
            name: "Acme".to_string(),
            tax_rate: None,
            tax_providers: Vec::new(),
            net_terms_days: None,
        };
        store.insert_organization(organization.clone()).await;

        let metric = provision(
            &store,
            MetricDefinition {
                organization_id: organization.id,
                metric_type: Some(MetricType::Counter),
                event_name: Some(TEST_EVENT_NAME.to_string()),
                property_name: Some("tokens".to_string()),
                aggregation: Some(Aggregation::Sum),
                ..Default::default()
            },
        )
        .await;

        let customer = new_customer(organization.id, "cust_ext_1");
        store.insert_customer(customer.clone()).await;

        Self {
            store,
            organization,
            customer,
            metric,
        }
    }

    pub async fn add_customer(&self, external_id: &str) -> Customer {
        let customer = new_customer(self.organization.id, external_id);
        self.store.insert_customer(customer.clone()).await;
        customer
    }

    pub async fn update_customer(&mut self, customer: Customer) {
        self.store.insert_customer(customer.clone()).await;
        if customer.id == self.customer.id {
            self.customer = customer;
        }
    }

    /// Monthly "Pro": $30 in advance plus the metric priced 50 free, then $0.05 per unit.
    pub fn pro_plan(&self) -> PlanVersion {
        PlanVersion {
            id: Uuid::new_v4(),
            organization_id: self.organization.id,
            plan_name: "Pro".to_string(),
            currency: TEST_CURRENCY.to_string(),
            plan_duration: PlanDuration::Monthly,
            recurring_charges: vec![flat_charge("Platform fee", dec("30"))],
            components: vec![PlanComponent {
                id: Uuid::new_v4(),
                metric_id: self.metric.id,
                tiers: vec![
                    PriceTier {
                        tier_type: TierType::Free,
                        range_start: Decimal::ZERO,
                        range_end: Some(dec("50")),
                        cost_per_batch: Decimal::ZERO,
                        metric_units_per_batch: Decimal::ONE,
                        batch_rounding: BatchRounding::NoRounding,
                    },
                    PriceTier {
                        tier_type: TierType::PerUnit,
                        range_start: dec("50"),
                        range_end: None,
                        cost_per_batch: dec("0.05"),
                        metric_units_per_batch: Decimal::ONE,
                        batch_rounding: BatchRounding::NoRounding,
                    },
                ],
                prepaid_units: None,
            }],
            price_adjustment: None,
        }
    }

    /// Monthly plan with a single in-advance flat fee.
    pub fn flat_plan(&self, amount: Decimal) -> PlanVersion {
        PlanVersion {
            id: Uuid::new_v4(),
            organization_id: self.organization.id,
            plan_name: "Starter".to_string(),
            currency: TEST_CURRENCY.to_string(),
            plan_duration: PlanDuration::Monthly,
            recurring_charges: vec![flat_charge("Seat", amount)],
            components: Vec::new(),
            price_adjustment: None,
        }
    }

    /// Attach `customer` to `plan` for one period starting at `start`.
    pub async fn subscribe(
        &self,
        customer: &Customer,
        plan: &PlanVersion,
        start: DateTime<Utc>,
        auto_renew: bool,
    ) -> SubscriptionRecord {
        self.store.insert_plan_version(plan.clone()).await;
        let record = SubscriptionRecord {
            id: Uuid::new_v4(),
            organization_id: self.organization.id,
            customer_id: customer.id,
            plan_version_id: plan.id,
            start_date: start,
            usage_start_date: start,
            end_date: period_end(start, plan.plan_duration),
            quantity: Decimal::ONE,
            auto_renew,
            fully_billed: false,
            is_one_time: false,
            filters: Vec::new(),
        };
        let billing_records = billing_records_for(&record, plan);
        self.store
            .insert_subscription(record.clone(), billing_records, Vec::new())
            .await;
        record
    }

    /// Store one metric event per `(time, tokens)` pair.
    pub async fn record_usage(&self, customer: &Customer, usage: &[(DateTime<Utc>, i64)]) {
        let events: Vec<Event> = usage
            .iter()
            .map(|(time_created, tokens)| Event {
                organization_id: self.organization.id,
                customer_id: customer.id,
                event_name: TEST_EVENT_NAME.to_string(),
                properties: json!({ "tokens": tokens })
                    .as_object()
                    .cloned()
                    .unwrap_or_default(),
                time_created: *time_created,
                idempotency_id: Uuid::new_v4().to_string(),
                inserted_at: *time_created,
            })
            .collect();
        self.store
            .insert_events(&events)
            .await
            .expect("Failed to insert events");
    }

    pub async fn grant_balance(&self, customer: &Customer, amount: Decimal, at: DateTime<Utc>) {
        self.store
            .insert_balance(CustomerBalanceAdjustment {
                id: Uuid::new_v4(),
                organization_id: self.organization.id,
                customer_id: customer.id,
                currency: TEST_CURRENCY.to_string(),
                amount,
                description: "Goodwill credit".to_string(),
                created_at: at,
                expires_at: None,
                status: BalanceStatus::Active,
                parent_adjustment_id: None,
                invoice_id: None,
            })
            .await;
    }

    pub fn state(&self) -> AppState {
        AppState::new(self.store.clone(), test_settings())
    }

    pub fn state_with(
        &self,
        taxes: TaxRegistry,
        payments: PaymentRegistry,
        notifier: Arc<dyn InvoiceNotifier>,
    ) -> AppState {
        AppState::with_collaborators(
            self.store.clone(),
            test_settings(),
            Arc::new(taxes),
            Arc::new(payments),
            notifier,
        )
    }

    pub fn state_with_taxes(&self, taxes: TaxRegistry) -> AppState {
        self.state_with(taxes, payments(), Arc::new(LogNotifier))
    }
}

pub fn timeout() -> Duration {
    test_settings().external_call_timeout()
}

pub fn payments() -> PaymentRegistry {
    PaymentRegistry::new(timeout())
}

pub fn default_taxes() -> TaxRegistry {
    TaxRegistry::with_defaults(timeout(), None)
}

pub fn flat_charge(name: &str, amount: Decimal) -> RecurringCharge {
    RecurringCharge {
        id: Uuid::new_v4(),
        name: name.to_string(),
        amount,
        charge_timing: ChargeTiming::InAdvance,
        charge_behavior: ChargeBehavior::ChargeFull,
    }
}

pub async fn provision(store: &Arc<MemoryStore>, definition: MetricDefinition) -> Metric {
    MetricProvisioner::new(store.clone(), store.clone())
        .provision(definition)
        .await
        .expect("Failed to provision metric")
}

fn new_customer(organization_id: Uuid, external_id: &str) -> Customer {
    Customer {
        id: Uuid::new_v4(),
        organization_id,
        external_id: external_id.to_string(),
        name: format!("Customer {}", external_id),
        tax_rate: None,
        tax_providers: Vec::new(),
        payment_provider: None,
        net_terms_days: None,
    }
}

/// Test application serving the HTTP router over an in-process store.
pub struct TestApp {
    pub http_address: String,
    pub state: AppState,
}

impl TestApp {
    pub async fn spawn(state: AppState) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind random port");
        let port = listener.local_addr().expect("Failed to read local addr").port();
        let app = router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("Server failed");
        });

        Self {
            http_address: format!("http://127.0.0.1:{}", port),
            state,
        }
    }
}
