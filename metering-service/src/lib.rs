//! metering-service: usage rating and invoice assembly.
//!
//! Raw events flow through [`ingestion`] into the usage store, [`rating`]
//! turns them into billable quantities per metric type, and [`invoicing`]
//! assembles those quantities into finalized invoices.

pub mod config;
pub mod error;
pub mod ingestion;
pub mod invoicing;
pub mod models;
pub mod proration;
pub mod rating;
pub mod services;
pub mod startup;

pub use error::MeteringError;
