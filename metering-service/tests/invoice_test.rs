//! Invoice generation integration tests for metering-service.

mod common;

use async_trait::async_trait;
use chrono::Duration;
use common::{dec, default_taxes, payments, timeout, ts, Fixture, TEST_CURRENCY};
use metering_service::invoicing::balance::spendable;
use metering_service::invoicing::GenerateInvoiceOptions;
use metering_service::models::{
    AdjustmentType, BillingRecord, BillingRecordKind, BillingType, ChargeableItemType, Invoice,
    InvoiceDocument, InvoiceLineItem, PaymentStatus, PriceAdjustment, PriceAdjustmentKind,
    SubscriptionRecord, TaxProviderKind,
};
use metering_service::services::{
    BillingStore, InvoiceCommit, LogNotifier, PaymentProcessor, PaymentRegistry, TaxRegistry,
    WebhookNotifier,
};
use metering_service::MeteringError;
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn usage_record(fixture: &Fixture, record: &SubscriptionRecord) -> BillingRecord {
    fixture
        .store
        .list_billing_records(record.id)
        .await
        .unwrap()
        .into_iter()
        .find(|br| matches!(br.kind, BillingRecordKind::Usage { .. }))
        .expect("usage billing record")
}

async fn flat_record(fixture: &Fixture, record: &SubscriptionRecord) -> BillingRecord {
    fixture
        .store
        .list_billing_records(record.id)
        .await
        .unwrap()
        .into_iter()
        .find(|br| matches!(br.kind, BillingRecordKind::Recurring { .. }))
        .expect("recurring billing record")
}

fn line<'a>(document: &'a InvoiceDocument, kind: ChargeableItemType) -> &'a InvoiceLineItem {
    document
        .line_items
        .iter()
        .find(|li| li.chargeable_item_type == kind)
        .expect("line item of kind")
}

/// Pro plan for January with 120 units used.
async fn january_pro(fixture: &Fixture, auto_renew: bool) -> SubscriptionRecord {
    let plan = fixture.pro_plan();
    let record = fixture
        .subscribe(&fixture.customer, &plan, ts(2024, 1, 1, 0, 0), auto_renew)
        .await;
    fixture
        .record_usage(
            &fixture.customer,
            &[(ts(2024, 1, 5, 10, 0), 70), (ts(2024, 1, 20, 15, 30), 50)],
        )
        .await;
    record
}

/// A committed invoice that already charged `quantity` units for `revenue` on `br`.
async fn previously_invoiced(
    fixture: &Fixture,
    record: &SubscriptionRecord,
    br: &BillingRecord,
    quantity: Decimal,
    revenue: Decimal,
) {
    let invoice_id = Uuid::new_v4();
    let issued = ts(2024, 1, 15, 0, 0);
    let document = InvoiceDocument {
        invoice: Invoice {
            id: invoice_id,
            organization_id: fixture.organization.id,
            customer_id: fixture.customer.id,
            currency: TEST_CURRENCY.to_string(),
            issue_date: issued,
            due_date: issued + Duration::days(30),
            payment_status: PaymentStatus::Unpaid,
            amount: revenue,
            payment_provider: None,
            external_payment_id: None,
            document_url: None,
        },
        line_items: vec![InvoiceLineItem {
            id: Uuid::new_v4(),
            invoice_id,
            name: "Pro - api_tokens".to_string(),
            start_date: br.start_date,
            end_date: issued,
            quantity: Some(quantity),
            base: revenue,
            billing_type: BillingType::Intermediate,
            chargeable_item_type: ChargeableItemType::UsageCharge,
            associated_subscription_record: Some(record.id),
            associated_billing_record: Some(br.id),
            associated_plan_version: Some(record.plan_version_id),
            associated_charge_record: None,
        }],
        adjustments: Vec::new(),
    };
    fixture
        .store
        .commit_invoice(&InvoiceCommit {
            document: Some(document),
            billing_record_updates: Vec::new(),
            charge_records_billed: Vec::new(),
            subscription_records_billed: Vec::new(),
            new_periods: Vec::new(),
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn flat_fee_and_usage_over_free_tier() {
    let fixture = Fixture::new().await;
    let record = january_pro(&fixture, false).await;
    let state = fixture.state();
    let issue = ts(2024, 2, 1, 0, 0);

    let documents = state
        .generator
        .generate_for_customer(fixture.customer.id, GenerateInvoiceOptions::finalize(issue))
        .await
        .unwrap();

    assert_eq!(documents.len(), 1);
    let document = &documents[0];
    assert_eq!(document.invoice.amount, dec("33.50"));
    assert_eq!(document.invoice.payment_status, PaymentStatus::Unpaid);
    assert_eq!(document.invoice.due_date, issue + Duration::days(30));

    let flat = line(document, ChargeableItemType::RecurringCharge);
    assert_eq!(flat.base, dec("30"));
    assert_eq!(flat.billing_type, BillingType::InAdvance);
    let usage = line(document, ChargeableItemType::UsageCharge);
    assert_eq!(usage.base, dec("3.50"));
    assert_eq!(usage.quantity, Some(Decimal::from(120)));
    assert_eq!(usage.billing_type, BillingType::InArrears);

    assert!(usage_record(&fixture, &record).await.fully_billed);
    assert!(flat_record(&fixture, &record).await.fully_billed);
    assert_eq!(fixture.store.invoices_for_customer(fixture.customer.id).await.len(), 1);

    // Nothing is left to bill for the period.
    let again = state
        .generator
        .generate_for_customer(
            fixture.customer.id,
            GenerateInvoiceOptions::finalize(issue + Duration::days(1)),
        )
        .await
        .unwrap();
    assert!(again.is_empty());
}

#[tokio::test]
async fn draft_preview_is_not_persisted() {
    let fixture = Fixture::new().await;
    let record = january_pro(&fixture, false).await;
    let state = fixture.state();

    let documents = state
        .generator
        .generate_for_customer(
            fixture.customer.id,
            GenerateInvoiceOptions::draft(ts(2024, 1, 15, 0, 0)),
        )
        .await
        .unwrap();

    assert_eq!(documents.len(), 1);
    let document = &documents[0];
    assert_eq!(document.invoice.payment_status, PaymentStatus::Draft);
    // 70 units so far, 20 of them beyond the free tier.
    let usage = line(document, ChargeableItemType::UsageCharge);
    assert_eq!(usage.base, dec("1.00"));
    assert_eq!(usage.billing_type, BillingType::Intermediate);
    assert_eq!(document.invoice.amount, dec("31.00"));

    assert!(fixture.store.invoices_for_customer(fixture.customer.id).await.is_empty());
    assert!(!flat_record(&fixture, &record).await.fully_billed);
}

#[tokio::test]
async fn balance_is_drawn_down_as_applied_credit() {
    let fixture = Fixture::new().await;
    let plan = fixture.flat_plan(dec("25"));
    let start = ts(2024, 3, 1, 0, 0);
    fixture.subscribe(&fixture.customer, &plan, start, false).await;
    fixture.grant_balance(&fixture.customer, dec("10"), start).await;
    let state = fixture.state();

    let documents = state
        .generator
        .generate_for_customer(fixture.customer.id, GenerateInvoiceOptions::finalize(start))
        .await
        .unwrap();

    let document = &documents[0];
    assert_eq!(document.invoice.amount, dec("15"));
    let credit = line(document, ChargeableItemType::CustomerAdjustment);
    assert_eq!(credit.name, "Applied Credit");
    assert_eq!(credit.base, dec("-10"));

    let entries = fixture
        .store
        .balance_entries(fixture.customer.id, TEST_CURRENCY)
        .await
        .unwrap();
    assert_eq!(spendable(&entries, start), Decimal::ZERO);
}

#[tokio::test]
async fn usage_going_backwards_aborts_the_invoice() {
    let fixture = Fixture::new().await;
    let record = january_pro(&fixture, false).await;
    let br = usage_record(&fixture, &record).await;
    previously_invoiced(&fixture, &record, &br, Decimal::from(200), dec("7.50")).await;
    let state = fixture.state();

    let err = state
        .generator
        .generate_for_customer(
            fixture.customer.id,
            GenerateInvoiceOptions::finalize(ts(2024, 2, 1, 0, 0)),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, MeteringError::InvariantViolation(_)));
    assert_eq!(fixture.store.invoices_for_customer(fixture.customer.id).await.len(), 1);
    assert!(!usage_record(&fixture, &record).await.fully_billed);
    assert!(!flat_record(&fixture, &record).await.fully_billed);
}

#[tokio::test]
async fn second_invoice_bills_only_the_usage_delta() {
    let fixture = Fixture::new().await;
    let record = january_pro(&fixture, false).await;
    let br = usage_record(&fixture, &record).await;
    previously_invoiced(&fixture, &record, &br, Decimal::from(100), dec("2.50")).await;
    let state = fixture.state();

    let documents = state
        .generator
        .generate_for_customer(
            fixture.customer.id,
            GenerateInvoiceOptions::finalize(ts(2024, 2, 1, 0, 0)),
        )
        .await
        .unwrap();

    let usage = line(&documents[0], ChargeableItemType::UsageCharge);
    assert_eq!(usage.quantity, Some(Decimal::from(20)));
    assert_eq!(usage.base, dec("1.00"));
    assert_eq!(documents[0].invoice.amount, dec("31.00"));
}

#[tokio::test]
async fn fixed_plan_discount_is_recorded_once() {
    let fixture = Fixture::new().await;
    let mut plan = fixture.pro_plan();
    plan.price_adjustment = Some(PriceAdjustment {
        kind: PriceAdjustmentKind::Fixed,
        amount: dec("5"),
    });
    fixture
        .subscribe(&fixture.customer, &plan, ts(2024, 1, 1, 0, 0), false)
        .await;
    fixture
        .record_usage(&fixture.customer, &[(ts(2024, 1, 5, 10, 0), 120)])
        .await;
    let state = fixture.state();

    let documents = state
        .generator
        .generate_for_customer(
            fixture.customer.id,
            GenerateInvoiceOptions::finalize(ts(2024, 2, 1, 0, 0)),
        )
        .await
        .unwrap();

    let document = &documents[0];
    let discounts: Vec<_> = document
        .adjustments
        .iter()
        .filter(|a| a.adjustment_type == AdjustmentType::PlanDiscount)
        .collect();
    assert_eq!(discounts.len(), 1);
    assert_eq!(discounts[0].amount, dec("-5"));
    assert_eq!(document.invoice.amount, dec("28.50"));
}

#[tokio::test]
async fn tax_rate_comes_from_the_tax_service() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rates"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "rate": 10 })))
        .expect(1)
        .mount(&server)
        .await;

    let mut fixture = Fixture::new().await;
    let mut customer = fixture.customer.clone();
    customer.tax_providers = vec![TaxProviderKind::Http, TaxProviderKind::Local];
    customer.tax_rate = Some(dec("8"));
    fixture.update_customer(customer).await;
    january_pro(&fixture, false).await;
    let state =
        fixture.state_with_taxes(TaxRegistry::with_defaults(timeout(), Some(server.uri().as_str())));

    let documents = state
        .generator
        .generate_for_customer(
            fixture.customer.id,
            GenerateInvoiceOptions::finalize(ts(2024, 2, 1, 0, 0)),
        )
        .await
        .unwrap();

    let document = &documents[0];
    let tax: Decimal = document
        .adjustments
        .iter()
        .filter(|a| a.adjustment_type == AdjustmentType::SalesTax)
        .map(|a| a.amount)
        .sum();
    assert_eq!(tax, dec("3.35"));
    assert_eq!(document.invoice.amount, dec("36.85"));
}

#[tokio::test]
async fn failing_tax_service_falls_back_to_local_rate() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rates"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let mut fixture = Fixture::new().await;
    let mut customer = fixture.customer.clone();
    customer.tax_providers = vec![TaxProviderKind::Http, TaxProviderKind::Local];
    customer.tax_rate = Some(dec("8"));
    fixture.update_customer(customer).await;
    january_pro(&fixture, false).await;
    let state =
        fixture.state_with_taxes(TaxRegistry::with_defaults(timeout(), Some(server.uri().as_str())));

    let documents = state
        .generator
        .generate_for_customer(
            fixture.customer.id,
            GenerateInvoiceOptions::finalize(ts(2024, 2, 1, 0, 0)),
        )
        .await
        .unwrap();

    assert_eq!(documents[0].invoice.amount, dec("36.18"));
}

#[tokio::test]
async fn no_tax_when_every_provider_fails() {
    let fixture = Fixture::new().await;
    january_pro(&fixture, false).await;
    let state = fixture.state_with_taxes(default_taxes());

    let documents = state
        .generator
        .generate_for_customer(
            fixture.customer.id,
            GenerateInvoiceOptions::finalize(ts(2024, 2, 1, 0, 0)),
        )
        .await
        .unwrap();

    assert!(documents[0].adjustments.is_empty());
    assert_eq!(documents[0].invoice.amount, dec("33.50"));
}

#[tokio::test]
async fn webhook_is_notified_after_commit() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks/invoices"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let fixture = Fixture::new().await;
    january_pro(&fixture, false).await;
    let notifier = WebhookNotifier::new(format!("{}/hooks/invoices", server.uri()), timeout());
    let state = fixture.state_with(default_taxes(), payments(), Arc::new(notifier));

    let documents = state
        .generator
        .generate_for_customer(
            fixture.customer.id,
            GenerateInvoiceOptions::finalize(ts(2024, 2, 1, 0, 0)),
        )
        .await
        .unwrap();

    let mut received = Vec::new();
    for _ in 0..50 {
        received = server.received_requests().await.unwrap_or_default();
        if !received.is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert_eq!(received.len(), 1);
    let body: serde_json::Value = received[0].body_json().unwrap();
    assert_eq!(body["event"], "invoice.created");
    assert_eq!(
        body["invoice"]["invoice"]["id"],
        documents[0].invoice.id.to_string()
    );
}

#[tokio::test]
async fn failed_commit_releases_the_drawn_balance() {
    let fixture = Fixture::new().await;
    let plan = fixture.flat_plan(dec("25"));
    let start = ts(2024, 3, 1, 0, 0);
    let record = fixture.subscribe(&fixture.customer, &plan, start, false).await;
    fixture.grant_balance(&fixture.customer, dec("10"), start).await;
    let state = fixture.state();

    fixture.store.fail_next_commit();
    let err = state
        .generator
        .generate_for_customer(fixture.customer.id, GenerateInvoiceOptions::finalize(start))
        .await
        .unwrap_err();
    assert!(matches!(err, MeteringError::Database(_)));

    let entries = fixture
        .store
        .balance_entries(fixture.customer.id, TEST_CURRENCY)
        .await
        .unwrap();
    assert_eq!(spendable(&entries, start), dec("10"));
    assert!(fixture.store.invoices_for_customer(fixture.customer.id).await.is_empty());
    assert!(!flat_record(&fixture, &record).await.fully_billed);

    // The retry sees the full balance again.
    let documents = state
        .generator
        .generate_for_customer(fixture.customer.id, GenerateInvoiceOptions::finalize(start))
        .await
        .unwrap();
    assert_eq!(documents[0].invoice.amount, dec("15"));
}

#[tokio::test]
async fn auto_renewal_prebills_the_next_period() {
    let fixture = Fixture::new().await;
    let record = january_pro(&fixture, true).await;
    let state = fixture.state();

    let documents = state
        .generator
        .generate_for_customer(
            fixture.customer.id,
            GenerateInvoiceOptions::finalize(ts(2024, 2, 1, 0, 0)),
        )
        .await
        .unwrap();
    assert_eq!(documents[0].invoice.amount, dec("63.50"));
    let flat_lines = documents[0]
        .line_items
        .iter()
        .filter(|li| li.chargeable_item_type == ChargeableItemType::RecurringCharge)
        .count();
    assert_eq!(flat_lines, 2);

    let subscriptions = fixture
        .store
        .subscriptions_for_customer(fixture.customer.id)
        .await;
    assert_eq!(subscriptions.len(), 2);
    let next = subscriptions
        .iter()
        .find(|sr| sr.id != record.id)
        .expect("renewed record");
    assert_eq!(next.start_date, ts(2024, 2, 1, 0, 0));
    assert_eq!(next.end_date, ts(2024, 3, 1, 0, 0));
    assert!(!next.fully_billed);
    assert!(flat_record(&fixture, next).await.fully_billed);

    // February bills only its usage beyond the free tier and pre-bills March.
    fixture
        .record_usage(&fixture.customer, &[(ts(2024, 2, 10, 9, 0), 60)])
        .await;
    let documents = state
        .generator
        .generate_for_customer(
            fixture.customer.id,
            GenerateInvoiceOptions::finalize(ts(2024, 3, 1, 0, 0)),
        )
        .await
        .unwrap();
    assert_eq!(documents.len(), 1);
    let usage = line(&documents[0], ChargeableItemType::UsageCharge);
    assert_eq!(usage.base, dec("0.50"));
    assert_eq!(documents[0].invoice.amount, dec("30.50"));
}

#[tokio::test]
async fn one_invoice_per_currency() {
    let fixture = Fixture::new().await;
    january_pro(&fixture, false).await;
    let mut euro_plan = fixture.flat_plan(dec("12"));
    euro_plan.currency = "EUR".to_string();
    fixture
        .subscribe(&fixture.customer, &euro_plan, ts(2024, 1, 1, 0, 0), false)
        .await;
    let state = fixture.state();

    let documents = state
        .generator
        .generate_for_customer(
            fixture.customer.id,
            GenerateInvoiceOptions::finalize(ts(2024, 2, 1, 0, 0)),
        )
        .await
        .unwrap();

    let currencies: Vec<&str> = documents
        .iter()
        .map(|d| d.invoice.currency.as_str())
        .collect();
    assert_eq!(currencies, vec!["EUR", "USD"]);
    assert_eq!(documents[0].invoice.amount, dec("12"));
    assert_eq!(documents[1].invoice.amount, dec("33.50"));
}

#[tokio::test]
async fn batch_spanning_customers_is_rejected() {
    let fixture = Fixture::new().await;
    let other = fixture.add_customer("cust_ext_2").await;
    let plan = fixture.flat_plan(dec("25"));
    let start = ts(2024, 3, 1, 0, 0);
    let first = fixture.subscribe(&fixture.customer, &plan, start, false).await;
    let second = fixture.subscribe(&other, &plan, start, false).await;
    let state = fixture.state();

    let err = state
        .generator
        .generate(&[first, second], GenerateInvoiceOptions::finalize(start))
        .await
        .unwrap_err();
    assert!(matches!(err, MeteringError::InvariantViolation(_)));
    assert!(fixture.store.invoices_for_customer(fixture.customer.id).await.is_empty());
    assert!(fixture.store.invoices_for_customer(other.id).await.is_empty());
}

struct FakeProcessor {
    status_checks: AtomicUsize,
}

#[async_trait]
impl PaymentProcessor for FakeProcessor {
    async fn create_payment_object(&self, _invoice: &Invoice) -> Result<Option<String>, MeteringError> {
        Ok(Some("pi_test".to_string()))
    }

    async fn update_status(&self, external_id: &str) -> Result<PaymentStatus, MeteringError> {
        assert_eq!(external_id, "pi_test");
        self.status_checks.fetch_add(1, Ordering::SeqCst);
        Ok(PaymentStatus::Paid)
    }
}

#[tokio::test]
async fn payment_status_moves_from_unpaid_to_paid() {
    let mut fixture = Fixture::new().await;
    let mut customer = fixture.customer.clone();
    customer.payment_provider = Some("fake".to_string());
    fixture.update_customer(customer).await;
    let plan = fixture.flat_plan(dec("25"));
    let start = ts(2024, 3, 1, 0, 0);
    fixture.subscribe(&fixture.customer, &plan, start, false).await;

    let processor = Arc::new(FakeProcessor {
        status_checks: AtomicUsize::new(0),
    });
    let state = fixture.state_with(
        default_taxes(),
        PaymentRegistry::new(timeout()).register("fake", processor.clone()),
        Arc::new(LogNotifier),
    );

    let documents = state
        .generator
        .generate_for_customer(fixture.customer.id, GenerateInvoiceOptions::finalize(start))
        .await
        .unwrap();
    let invoice_id = documents[0].invoice.id;
    assert_eq!(documents[0].invoice.external_payment_id.as_deref(), Some("pi_test"));
    let stored = fixture.store.get_invoice(invoice_id).await.unwrap();
    assert_eq!(stored.invoice.payment_provider.as_deref(), Some("fake"));
    assert_eq!(stored.invoice.payment_status, PaymentStatus::Unpaid);

    let status = state.generator.refresh_payment_status(invoice_id).await.unwrap();
    assert_eq!(status, PaymentStatus::Paid);
    let stored = fixture.store.get_invoice(invoice_id).await.unwrap();
    assert_eq!(stored.invoice.payment_status, PaymentStatus::Paid);

    // Paid invoices are not checked again.
    state.generator.refresh_payment_status(invoice_id).await.unwrap();
    assert_eq!(processor.status_checks.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn invoice_covered_by_credit_is_paid_immediately() {
    let fixture = Fixture::new().await;
    let plan = fixture.flat_plan(dec("10"));
    let start = ts(2024, 3, 1, 0, 0);
    fixture.subscribe(&fixture.customer, &plan, start, false).await;
    fixture.grant_balance(&fixture.customer, dec("10"), start).await;
    let state = fixture.state();

    let documents = state
        .generator
        .generate_for_customer(fixture.customer.id, GenerateInvoiceOptions::finalize(start))
        .await
        .unwrap();

    assert_eq!(documents[0].invoice.amount, Decimal::ZERO);
    assert_eq!(documents[0].invoice.payment_status, PaymentStatus::Paid);
}
