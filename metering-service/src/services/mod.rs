//! Services module for metering-service: storage, collaborators and metrics.

pub mod cache;
pub mod database;
pub mod locks;
pub mod memory;
pub mod metrics;
pub mod notifications;
pub mod payments;
pub mod store;
pub mod tax;

pub use cache::UsageCache;
pub use database::Database;
pub use locks::{CustomerGuard, CustomerLocks};
pub use memory::MemoryStore;
pub use metrics::{get_metrics, init_metrics, record_error};
pub use notifications::{InvoiceNotifier, InvoiceRenderer, LogNotifier, WebhookNotifier};
pub use payments::{PaymentProcessor, PaymentRegistry};
pub use store::{
    BillingRecordUpdate, BillingStore, CarryMode, EventStore, InvoiceCommit, NewSubscriptionPeriod,
    RollupDefinition, RollupStore, UsagePoint, UsageQuery, UsageRow, UsageSource, UsageStore,
};
pub use tax::{TaxAttempt, TaxProvider, TaxRegistry, TaxRequest, TaxResolution};
