//! Invoice assembly: line items, discounts, tax, customer balance and finalization.

pub mod balance;
pub mod discounts;
pub mod line_items;
pub mod pipeline;
pub mod pricing;
pub mod renewal;
pub mod sweep;
pub mod taxes;

pub use pipeline::{
    BalanceApplied, BalanceOutcome, DiscountsApplied, FinalizedInvoice, GenerateInvoiceOptions,
    InvoiceGenerator, LineItemsAssembled, TaxApplied,
};
pub use pricing::tier_revenue;
pub use renewal::next_period;
pub use sweep::{BillingSweep, SweepSummary};
