//! Domain models for metering-service.

mod balance;
mod customer;
mod event;
mod invoice;
mod metric;
mod plan;
mod subscription;

pub use balance::{BalanceStatus, CustomerBalanceAdjustment};
pub use customer::{Customer, Organization, TaxProviderKind};
pub use event::{Event, RawEvent};
pub use invoice::{
    AdjustmentType, BillingType, ChargeableItemType, Invoice, InvoiceDocument, InvoiceLineItem,
    InvoiceLineItemAdjustment, InvoicedTotals, PaymentStatus,
};
pub use metric::{
    Aggregation, CategoricalFilter, CategoricalOperator, EventType, Metric, MetricDefinition,
    MetricStatus, MetricType, NumericFilter, NumericOperator, TimeGranularity,
};
pub use plan::{
    BatchRounding, ChargeBehavior, ChargeTiming, PlanComponent, PlanDuration, PlanVersion,
    PriceAdjustment, PriceAdjustmentKind, PriceTier, RecurringCharge, TierType,
};
pub use subscription::{
    BillingRecord, BillingRecordKind, BillingRecordState, ComponentChargeRecord,
    SubscriptionFilter, SubscriptionRecord,
};
