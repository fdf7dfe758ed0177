//! Error taxonomy for the rating and invoicing engine.

use service_core::error::AppError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MeteringError {
    /// Metric/handler mismatch or an unusable definition such as invalid custom SQL.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    /// Fatal for the current customer's invoice generation; nothing is persisted.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("External service unavailable: {0}")]
    ExternalUnavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Customer not resolved: {0}")]
    CustomerNotResolved(String),

    #[error("Database error: {0}")]
    Database(anyhow::Error),
}

impl MeteringError {
    /// Label used for the `error_type` dimension of the error counter.
    pub fn kind(&self) -> &'static str {
        match self {
            MeteringError::Configuration(_) => "configuration",
            MeteringError::Validation(_) => "validation",
            MeteringError::InvariantViolation(_) => "invariant_violation",
            MeteringError::ExternalUnavailable(_) => "external_unavailable",
            MeteringError::NotFound(_) => "not_found",
            MeteringError::CustomerNotResolved(_) => "customer_not_resolved",
            MeteringError::Database(_) => "database",
        }
    }
}

impl From<sqlx::Error> for MeteringError {
    fn from(err: sqlx::Error) -> Self {
        MeteringError::Database(anyhow::Error::new(err))
    }
}

impl From<MeteringError> for AppError {
    fn from(err: MeteringError) -> Self {
        match err {
            MeteringError::Configuration(msg)
            | MeteringError::Validation(msg)
            | MeteringError::InvariantViolation(msg) => {
                AppError::BadRequest(anyhow::anyhow!(msg))
            }
            MeteringError::NotFound(msg) | MeteringError::CustomerNotResolved(msg) => {
                AppError::NotFound(anyhow::anyhow!(msg))
            }
            MeteringError::ExternalUnavailable(msg) => AppError::BadGateway(msg),
            MeteringError::Database(e) => AppError::DatabaseError(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invariant_violation_maps_to_bad_request() {
        let err: AppError = MeteringError::InvariantViolation("negative delta".into()).into();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[test]
    fn unresolved_customer_maps_to_not_found() {
        let err: AppError = MeteringError::CustomerNotResolved("cust_1".into()).into();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
