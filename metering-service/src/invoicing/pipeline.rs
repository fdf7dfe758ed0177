//! Invoice generation for one customer.
//!
//! Each invoice moves through typed stages so a step cannot run out of order:
//! [`LineItemsAssembled`] → [`DiscountsApplied`] → [`TaxApplied`] →
//! [`BalanceApplied`] → [`FinalizedInvoice`]. Everything up to tax only reads
//! from the stores; balance movement and the commit are the only writes, and
//! a failed commit releases the balance it moved.

use super::balance::{spendable, APPLIED_CREDIT, CREDIT_GRANTED};
use super::discounts::apply_plan_discount;
use super::line_items::{flat_fee, usage_fee, FeeContext, Fees, MeteredUsage, RECONCILED_TOLERANCE};
use super::renewal::next_period;
use super::taxes::{apply_tax, taxable_subtotal};
use crate::config::BillingSettings;
use crate::error::MeteringError;
use crate::models::{
    BalanceStatus, BillingRecord, BillingRecordKind, BillingType, ChargeTiming,
    ChargeableItemType, Customer, CustomerBalanceAdjustment, Invoice, InvoiceDocument,
    InvoiceLineItem, InvoicedTotals, Organization, PaymentStatus, PlanVersion, SubscriptionRecord,
};
use crate::proration::TimeRange;
use crate::rating::{RatingEngine, UsageWindow};
use crate::services::metrics::{record_invoice_amount, record_invoice_generated};
use crate::services::{
    record_error, BillingRecordUpdate, BillingStore, CustomerLocks, InvoiceCommit,
    InvoiceNotifier, InvoiceRenderer, NewSubscriptionPeriod, PaymentRegistry, TaxRegistry,
    TaxRequest, TaxResolution,
};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct GenerateInvoiceOptions {
    /// Preview only: nothing is persisted and no balance moves.
    pub draft: bool,
    /// Pre-bill the in-advance fees of a renewing subscription's next period.
    /// Implies materializing that period.
    pub charge_next_plan: bool,
    pub generate_next_subscription_record: bool,
    pub issue_date: DateTime<Utc>,
}

impl GenerateInvoiceOptions {
    pub fn draft(issue_date: DateTime<Utc>) -> Self {
        Self {
            draft: true,
            charge_next_plan: false,
            generate_next_subscription_record: false,
            issue_date,
        }
    }

    /// What the billing sweep uses.
    pub fn finalize(issue_date: DateTime<Utc>) -> Self {
        Self {
            draft: false,
            charge_next_plan: true,
            generate_next_subscription_record: true,
            issue_date,
        }
    }

    fn renews(&self) -> bool {
        self.charge_next_plan || self.generate_next_subscription_record
    }
}

#[derive(Debug, Clone)]
struct InvoiceWork {
    document: InvoiceDocument,
    billing_record_updates: Vec<BillingRecordUpdate>,
    charge_records_billed: Vec<Uuid>,
    subscription_records_billed: Vec<Uuid>,
    new_periods: Vec<NewSubscriptionPeriod>,
}

impl InvoiceWork {
    fn new(invoice: Invoice) -> Self {
        Self {
            document: InvoiceDocument {
                invoice,
                line_items: Vec::new(),
                adjustments: Vec::new(),
            },
            billing_record_updates: Vec::new(),
            charge_records_billed: Vec::new(),
            subscription_records_billed: Vec::new(),
            new_periods: Vec::new(),
        }
    }

    fn absorb(&mut self, fees: Fees) {
        self.document.line_items.extend(fees.line_items);
        self.billing_record_updates
            .extend(fees.billing_record_update);
        self.charge_records_billed.extend(fees.charge_records_billed);
    }

    fn moves_billing_state(&self) -> bool {
        !self.billing_record_updates.is_empty()
            || !self.charge_records_billed.is_empty()
            || !self.subscription_records_billed.is_empty()
            || !self.new_periods.is_empty()
    }

    fn into_commit(self, keep_document: bool) -> InvoiceCommit {
        InvoiceCommit {
            document: keep_document.then_some(self.document),
            billing_record_updates: self.billing_record_updates,
            charge_records_billed: self.charge_records_billed,
            subscription_records_billed: self.subscription_records_billed,
            new_periods: self.new_periods,
        }
    }
}

/// Flat fees, usage fees and pre-billed next-period fees, in that order.
#[derive(Debug, Clone)]
pub struct LineItemsAssembled(InvoiceWork);

#[derive(Debug, Clone)]
pub struct DiscountsApplied(InvoiceWork);

#[derive(Debug, Clone)]
pub struct TaxApplied(InvoiceWork);

#[derive(Debug, Clone)]
pub struct BalanceApplied(InvoiceWork);

#[derive(Debug, Clone)]
pub struct FinalizedInvoice(InvoiceWork);

/// How the customer balance touched an invoice.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BalanceOutcome {
    Untouched,
    /// Credit drawn down to offset a positive total.
    Drawn(Decimal),
    /// Credit granted for a negative total.
    Granted(Decimal),
}

impl LineItemsAssembled {
    pub fn document(&self) -> &InvoiceDocument {
        &self.0.document
    }

    pub fn apply_discounts(mut self, plans: &HashMap<Uuid, PlanVersion>) -> DiscountsApplied {
        let mut scopes: Vec<(Uuid, Uuid)> = Vec::new();
        for item in &self.0.document.line_items {
            if let (Some(record), Some(plan)) =
                (item.associated_subscription_record, item.associated_plan_version)
            {
                if !scopes.contains(&(record, plan)) {
                    scopes.push((record, plan));
                }
            }
        }
        for (record, plan) in scopes {
            if let Some(adjustment) = plans.get(&plan).and_then(|p| p.price_adjustment.as_ref()) {
                apply_plan_discount(&mut self.0.document, record, adjustment);
            }
        }
        DiscountsApplied(self.0)
    }
}

impl DiscountsApplied {
    pub fn document(&self) -> &InvoiceDocument {
        &self.0.document
    }

    pub fn taxable_subtotal(&self) -> Decimal {
        taxable_subtotal(&self.0.document)
    }

    /// `None` when every provider failed; the invoice then carries no tax.
    pub fn apply_tax(mut self, resolution: Option<&TaxResolution>) -> TaxApplied {
        if let Some(resolution) = resolution {
            apply_tax(&mut self.0.document, resolution.rate);
        }
        TaxApplied(self.0)
    }
}

impl TaxApplied {
    pub fn document(&self) -> &InvoiceDocument {
        &self.0.document
    }

    pub fn total(&self) -> Decimal {
        self.0.document.total()
    }

    pub fn apply_balance(mut self, outcome: BalanceOutcome) -> BalanceApplied {
        let line = match outcome {
            BalanceOutcome::Untouched => None,
            BalanceOutcome::Drawn(amount) if amount.is_zero() => None,
            BalanceOutcome::Drawn(amount) => Some((APPLIED_CREDIT, -amount)),
            BalanceOutcome::Granted(amount) => Some((CREDIT_GRANTED, amount)),
        };
        if let Some((name, base)) = line {
            let invoice = &self.0.document.invoice;
            let item = InvoiceLineItem {
                id: Uuid::new_v4(),
                invoice_id: invoice.id,
                name: name.to_string(),
                start_date: invoice.issue_date,
                end_date: invoice.issue_date,
                quantity: None,
                base,
                billing_type: BillingType::OneTime,
                chargeable_item_type: ChargeableItemType::CustomerAdjustment,
                associated_subscription_record: None,
                associated_billing_record: None,
                associated_plan_version: None,
                associated_charge_record: None,
            };
            self.0.document.line_items.push(item);
        }
        BalanceApplied(self.0)
    }
}

impl BalanceApplied {
    pub fn document(&self) -> &InvoiceDocument {
        &self.0.document
    }

    pub fn finalize(mut self, draft: bool, due_date: DateTime<Utc>) -> FinalizedInvoice {
        let amount = self
            .0
            .document
            .total()
            .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
        let invoice = &mut self.0.document.invoice;
        invoice.amount = amount;
        invoice.due_date = due_date;
        invoice.payment_status = if draft {
            PaymentStatus::Draft
        } else if amount.abs() < RECONCILED_TOLERANCE {
            PaymentStatus::Paid
        } else {
            PaymentStatus::Unpaid
        };
        FinalizedInvoice(self.0)
    }
}

impl FinalizedInvoice {
    pub fn document(&self) -> &InvoiceDocument {
        &self.0.document
    }

    pub fn into_document(self) -> InvoiceDocument {
        self.0.document
    }

    pub fn into_commit(self) -> InvoiceCommit {
        self.0.into_commit(true)
    }
}

/// Every record must belong to one customer of one organization.
fn single_owner(records: &[SubscriptionRecord]) -> Result<Option<(Uuid, Uuid)>, MeteringError> {
    let Some(first) = records.first() else {
        return Ok(None);
    };
    if records
        .iter()
        .any(|r| r.customer_id != first.customer_id || r.organization_id != first.organization_id)
    {
        return Err(MeteringError::InvariantViolation(format!(
            "invoice batch spans more than one customer (first record {})",
            first.id
        )));
    }
    Ok(Some((first.organization_id, first.customer_id)))
}

pub struct InvoiceGenerator {
    store: Arc<dyn BillingStore>,
    rating: Arc<RatingEngine>,
    taxes: Arc<TaxRegistry>,
    payments: Arc<PaymentRegistry>,
    notifier: Arc<dyn InvoiceNotifier>,
    renderer: Option<Arc<dyn InvoiceRenderer>>,
    locks: Arc<CustomerLocks>,
    settings: BillingSettings,
}

impl InvoiceGenerator {
    pub fn new(
        store: Arc<dyn BillingStore>,
        rating: Arc<RatingEngine>,
        taxes: Arc<TaxRegistry>,
        payments: Arc<PaymentRegistry>,
        notifier: Arc<dyn InvoiceNotifier>,
        locks: Arc<CustomerLocks>,
        settings: BillingSettings,
    ) -> Self {
        Self {
            store,
            rating,
            taxes,
            payments,
            notifier,
            renderer: None,
            locks,
            settings,
        }
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn InvoiceRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    /// Invoice every open subscription record of a customer.
    #[instrument(skip(self, options), fields(customer_id = %customer_id, draft = options.draft))]
    pub async fn generate_for_customer(
        &self,
        customer_id: Uuid,
        options: GenerateInvoiceOptions,
    ) -> Result<Vec<InvoiceDocument>, MeteringError> {
        let _guard = self.locks.lock(customer_id).await;
        let records = self
            .store
            .list_open_subscription_records(customer_id, options.issue_date)
            .await?;
        self.generate_locked(&records, options)
            .await
            .inspect_err(|e| report_failure(customer_id, e))
    }

    /// Invoice the given records, which must share one customer.
    #[instrument(skip(self, records, options), fields(records = records.len(), draft = options.draft))]
    pub async fn generate(
        &self,
        records: &[SubscriptionRecord],
        options: GenerateInvoiceOptions,
    ) -> Result<Vec<InvoiceDocument>, MeteringError> {
        let Some((_, customer_id)) = single_owner(records).inspect_err(|e| {
            if let Some(first) = records.first() {
                report_failure(first.customer_id, e);
            }
        })?
        else {
            return Ok(Vec::new());
        };
        let _guard = self.locks.lock(customer_id).await;
        self.generate_locked(records, options)
            .await
            .inspect_err(|e| report_failure(customer_id, e))
    }

    async fn generate_locked(
        &self,
        records: &[SubscriptionRecord],
        options: GenerateInvoiceOptions,
    ) -> Result<Vec<InvoiceDocument>, MeteringError> {
        let Some((organization_id, customer_id)) = single_owner(records)? else {
            return Ok(Vec::new());
        };
        let organization = self.store.get_organization(organization_id).await?;
        let customer = self.store.get_customer(customer_id).await?;

        let mut plans: HashMap<Uuid, PlanVersion> = HashMap::new();
        for record in records {
            if !plans.contains_key(&record.plan_version_id) {
                let plan = self.store.get_plan_version(record.plan_version_id).await?;
                plans.insert(plan.id, plan);
            }
        }

        let mut by_currency: BTreeMap<&str, Vec<&SubscriptionRecord>> = BTreeMap::new();
        for record in records {
            if let Some(plan) = plans.get(&record.plan_version_id) {
                by_currency.entry(plan.currency.as_str()).or_default().push(record);
            }
        }

        // Every currency is assembled before anything is written.
        let mut taxed = Vec::with_capacity(by_currency.len());
        for (currency, group) in &by_currency {
            let discounted = self
                .assemble(&customer, currency, group, &plans, options)
                .await?
                .apply_discounts(&plans);
            let resolution = if discounted.document().line_items.is_empty() {
                None
            } else {
                self.resolve_tax(&customer, &organization, &discounted, options.draft)
                    .await
            };
            taxed.push(discounted.apply_tax(resolution.as_ref()));
        }

        let net_terms = customer
            .net_terms_days
            .or(organization.net_terms_days)
            .unwrap_or(self.settings.default_net_terms_days);
        let due_date = options.issue_date + Duration::days(net_terms);

        let mut documents = Vec::new();
        for invoice in taxed {
            if invoice.document().line_items.is_empty() {
                if !options.draft && invoice.0.moves_billing_state() {
                    self.store.commit_invoice(&invoice.0.into_commit(false)).await?;
                }
                continue;
            }

            let outcome = self.move_balance(&invoice, options).await?;
            let finalized = invoice.apply_balance(outcome).finalize(options.draft, due_date);
            if options.draft {
                documents.push(finalized.into_document());
                continue;
            }

            let document = self.commit(finalized).await?;
            documents.push(self.after_commit(&customer, document).await);
        }

        info!(
            organization_id = %organization_id,
            customer_id = %customer_id,
            invoices = documents.len(),
            draft = options.draft,
            "Invoice generation complete"
        );
        Ok(documents)
    }

    fn is_billable(billing_record: &BillingRecord, options: &GenerateInvoiceOptions) -> bool {
        !billing_record.fully_billed
            && (options.draft || billing_record.next_invoicing_date <= options.issue_date)
    }

    async fn assemble(
        &self,
        customer: &Customer,
        currency: &str,
        records: &[&SubscriptionRecord],
        plans: &HashMap<Uuid, PlanVersion>,
        options: GenerateInvoiceOptions,
    ) -> Result<LineItemsAssembled, MeteringError> {
        let issue_date = options.issue_date;
        let mut work = InvoiceWork::new(Invoice {
            id: Uuid::new_v4(),
            organization_id: customer.organization_id,
            customer_id: customer.id,
            currency: currency.to_string(),
            issue_date,
            due_date: issue_date,
            payment_status: PaymentStatus::Draft,
            amount: Decimal::ZERO,
            payment_provider: None,
            external_payment_id: None,
            document_url: None,
        });
        let invoice_id = work.document.invoice.id;

        let mut flat_fees = Vec::new();
        let mut usage_fees = Vec::new();
        let mut next_period_fees = Vec::new();

        for record in records {
            let plan = plans.get(&record.plan_version_id).ok_or_else(|| {
                MeteringError::NotFound(format!("plan version {} not found", record.plan_version_id))
            })?;
            let ctx = FeeContext {
                invoice_id,
                record,
                plan,
                issue_date,
            };

            for br in self.store.list_billing_records(record.id).await? {
                match br.kind {
                    BillingRecordKind::Recurring { charge_id } => {
                        if !Self::is_billable(&br, &options) {
                            continue;
                        }
                        let charge = plan.recurring_charge(charge_id).ok_or_else(|| {
                            MeteringError::Configuration(format!(
                                "recurring charge {} missing from plan version {}",
                                charge_id, plan.id
                            ))
                        })?;
                        let already = self
                            .store
                            .invoiced_totals(
                                br.id,
                                &[
                                    ChargeableItemType::RecurringCharge,
                                    ChargeableItemType::OneTimeCharge,
                                ],
                            )
                            .await?;
                        flat_fees.push(flat_fee(&ctx, &br, charge, already.revenue));
                    }
                    BillingRecordKind::Usage { component_id } => {
                        if br.fully_billed {
                            continue;
                        }
                        let charge_records = self.store.list_charge_records(br.id).await?;
                        let due = Self::is_billable(&br, &options);
                        let prepaid_pending = charge_records
                            .iter()
                            .any(|cr| !cr.fully_billed && cr.start_date <= issue_date);
                        if !due && !prepaid_pending {
                            continue;
                        }
                        let component = plan.component(component_id).ok_or_else(|| {
                            MeteringError::Configuration(format!(
                                "component {} missing from plan version {}",
                                component_id, plan.id
                            ))
                        })?;
                        let metric = self.store.get_metric(component.metric_id).await?;
                        let (usage, already_invoiced) = if due {
                            let window = UsageWindow::for_record(record, issue_date)
                                .clipped(TimeRange::new(br.start_date, br.end_date));
                            let usage = self
                                .rating
                                .handler(&metric)?
                                .total_billable_usage(&window)
                                .await?;
                            let already = self
                                .store
                                .invoiced_totals(br.id, &[ChargeableItemType::UsageCharge])
                                .await?;
                            (Some(usage), already)
                        } else {
                            (None, InvoicedTotals::default())
                        };
                        usage_fees.push(usage_fee(
                            &ctx,
                            &MeteredUsage {
                                billing_record: &br,
                                component,
                                metric_name: &metric.event_name,
                                charge_records: &charge_records,
                                usage,
                                already_invoiced,
                            },
                        )?);
                    }
                }
            }

            let ended = record.end_date <= issue_date;
            if ended {
                work.subscription_records_billed.push(record.id);
            }
            if ended && record.auto_renew && !record.is_one_time && options.renews() {
                let mut period = next_period(record, plan);
                if options.charge_next_plan {
                    next_period_fees.push(
                        self.prebill_next_period(&mut period, plan, invoice_id, issue_date)
                            .await?,
                    );
                }
                work.new_periods.push(period);
            }
        }

        for fees in flat_fees.into_iter().chain(usage_fees).chain(next_period_fees) {
            work.absorb(fees);
        }
        Ok(LineItemsAssembled(work))
    }

    async fn resolve_tax(
        &self,
        customer: &Customer,
        organization: &Organization,
        invoice: &DiscountsApplied,
        draft: bool,
    ) -> Option<TaxResolution> {
        let request = TaxRequest {
            customer: customer.clone(),
            organization: organization.clone(),
            amount: invoice.taxable_subtotal(),
            draft,
        };
        let resolution = self.taxes.resolve(&request).await;
        if resolution.is_none() {
            warn!(
                customer_id = %customer.id,
                invoice_id = %invoice.document().invoice.id,
                "No tax provider succeeded, invoicing without tax"
            );
        }
        resolution
    }

    /// Grant or draw credit for the invoice total. Drafts only look at the balance.
    async fn move_balance(
        &self,
        invoice: &TaxApplied,
        options: GenerateInvoiceOptions,
    ) -> Result<BalanceOutcome, MeteringError> {
        let total = invoice.total();
        let header = &invoice.document().invoice;
        if total < Decimal::ZERO {
            let credit = -total;
            if !options.draft {
                self.store
                    .grant_credit(&CustomerBalanceAdjustment {
                        id: Uuid::new_v4(),
                        organization_id: header.organization_id,
                        customer_id: header.customer_id,
                        currency: header.currency.clone(),
                        amount: credit,
                        description: CREDIT_GRANTED.to_string(),
                        created_at: options.issue_date,
                        expires_at: None,
                        status: BalanceStatus::Active,
                        parent_adjustment_id: None,
                        invoice_id: Some(header.id),
                    })
                    .await?;
            }
            return Ok(BalanceOutcome::Granted(credit));
        }
        if total > Decimal::ZERO {
            let drawn = if options.draft {
                let entries = self
                    .store
                    .balance_entries(header.customer_id, &header.currency)
                    .await?;
                spendable(&entries, options.issue_date).min(total)
            } else {
                self.store
                    .draw_down(
                        header.organization_id,
                        header.customer_id,
                        &header.currency,
                        total,
                        header.id,
                        options.issue_date,
                    )
                    .await?
            };
            return Ok(BalanceOutcome::Drawn(drawn));
        }
        Ok(BalanceOutcome::Untouched)
    }

    async fn commit(&self, finalized: FinalizedInvoice) -> Result<InvoiceDocument, MeteringError> {
        let commit = finalized.into_commit();
        let Some(document) = commit.document.clone() else {
            return Err(MeteringError::InvariantViolation(
                "finalized invoice has no document".to_string(),
            ));
        };
        if let Err(e) = self.store.commit_invoice(&commit).await {
            if let Err(release) = self.store.release_invoice_balance(document.invoice.id).await {
                error!(
                    invoice_id = %document.invoice.id,
                    error = %release,
                    "Failed to release balance after aborted invoice"
                );
            }
            return Err(e);
        }
        Ok(document)
    }

    /// Payment object, metrics, notification and rendering. Nothing here fails the invoice.
    async fn after_commit(&self, customer: &Customer, mut document: InvoiceDocument) -> InvoiceDocument {
        let organization_id = document.invoice.organization_id.to_string();
        record_invoice_generated(&organization_id, document.invoice.payment_status.as_str());
        record_invoice_amount(
            &organization_id,
            &document.invoice.currency,
            document.invoice.amount.to_f64().unwrap_or_default(),
        );

        if document.invoice.payment_status == PaymentStatus::Unpaid {
            if let Some(provider) = customer.payment_provider.as_deref() {
                self.attach_payment_object(provider, &mut document).await;
            }
        }

        let notifier = self.notifier.clone();
        let notified = document.clone();
        tokio::spawn(async move {
            notifier.invoice_created(&notified).await;
        });

        if let Some(renderer) = self.renderer.clone() {
            let store = self.store.clone();
            let rendered = document.clone();
            tokio::spawn(async move {
                let invoice_id = rendered.invoice.id;
                match renderer.render(&rendered).await {
                    Ok(url) => {
                        if let Err(e) = store.set_document_url(invoice_id, &url).await {
                            warn!(invoice_id = %invoice_id, error = %e, "Failed to store document url");
                        }
                    }
                    Err(e) => {
                        warn!(invoice_id = %invoice_id, error = %e, "Invoice rendering failed");
                        record_error(e.kind(), "render_invoice");
                    }
                }
            });
        }
        document
    }

    async fn attach_payment_object(&self, provider: &str, document: &mut InvoiceDocument) {
        let invoice_id = document.invoice.id;
        match self
            .payments
            .create_payment_object(provider, &document.invoice)
            .await
        {
            Ok(Some(external_id)) => {
                match self
                    .store
                    .set_payment_reference(invoice_id, provider, &external_id)
                    .await
                {
                    Ok(()) => {
                        document.invoice.payment_provider = Some(provider.to_string());
                        document.invoice.external_payment_id = Some(external_id);
                    }
                    Err(e) => {
                        warn!(invoice_id = %invoice_id, error = %e, "Failed to store payment reference")
                    }
                }
            }
            Ok(None) => {
                info!(invoice_id = %invoice_id, provider, "Payment processor declined to track invoice")
            }
            Err(e) => {
                warn!(invoice_id = %invoice_id, provider, error = %e, "Payment object creation failed");
                record_error(e.kind(), "create_payment_object");
            }
        }
    }

    /// In-advance flat fees and prepaid blocks of a freshly renewed period.
    async fn prebill_next_period(
        &self,
        period: &mut NewSubscriptionPeriod,
        plan: &PlanVersion,
        invoice_id: Uuid,
        issue_date: DateTime<Utc>,
    ) -> Result<Fees, MeteringError> {
        let mut fees = Fees::default();
        let ctx = FeeContext {
            invoice_id,
            record: &period.record,
            plan,
            issue_date: issue_date.max(period.record.start_date),
        };
        for br in period.billing_records.iter_mut() {
            match br.kind {
                BillingRecordKind::Recurring { charge_id } => {
                    let Some(charge) = plan
                        .recurring_charge(charge_id)
                        .filter(|c| c.charge_timing == ChargeTiming::InAdvance)
                    else {
                        continue;
                    };
                    let prebilled = flat_fee(&ctx, br, charge, Decimal::ZERO);
                    fees.line_items.extend(prebilled.line_items);
                    br.fully_billed = true;
                }
                BillingRecordKind::Usage { component_id } => {
                    let Some(component) = plan.component(component_id) else {
                        continue;
                    };
                    let blocks: Vec<_> = period
                        .charge_records
                        .iter()
                        .filter(|cr| cr.billing_record_id == br.id)
                        .cloned()
                        .collect();
                    if blocks.is_empty() {
                        continue;
                    }
                    let metric = self.store.get_metric(component.metric_id).await?;
                    let prepaid = usage_fee(
                        &ctx,
                        &MeteredUsage {
                            billing_record: br,
                            component,
                            metric_name: &metric.event_name,
                            charge_records: &blocks,
                            usage: None,
                            already_invoiced: InvoicedTotals::default(),
                        },
                    )?;
                    fees.line_items.extend(prepaid.line_items);
                    for cr in period
                        .charge_records
                        .iter_mut()
                        .filter(|cr| prepaid.charge_records_billed.contains(&cr.id))
                    {
                        cr.fully_billed = true;
                    }
                }
            }
        }
        Ok(fees)
    }

    /// Ask the processor for the latest status; UNPAID -> PAID is the only transition.
    #[instrument(skip(self))]
    pub async fn refresh_payment_status(&self, invoice_id: Uuid) -> Result<PaymentStatus, MeteringError> {
        let document = self.store.get_invoice(invoice_id).await?;
        let invoice = &document.invoice;
        if invoice.payment_status != PaymentStatus::Unpaid {
            return Ok(invoice.payment_status);
        }
        let (Some(provider), Some(external_id)) =
            (invoice.payment_provider.as_deref(), invoice.external_payment_id.as_deref())
        else {
            return Ok(invoice.payment_status);
        };

        let status = self.payments.update_status(provider, external_id).await?;
        if status == PaymentStatus::Paid && self.store.mark_invoice_paid(invoice_id).await? {
            info!(invoice_id = %invoice_id, provider, "Invoice paid");
        }
        Ok(match status {
            PaymentStatus::Paid => PaymentStatus::Paid,
            _ => PaymentStatus::Unpaid,
        })
    }
}

fn report_failure(customer_id: Uuid, e: &MeteringError) {
    error!(customer_id = %customer_id, error = %e, kind = e.kind(), "Invoice generation failed");
    record_error(e.kind(), "generate_invoice");
}
