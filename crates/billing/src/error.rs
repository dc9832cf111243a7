//! Billing error types

/// How the caller should treat a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input; reject at the adapter with a 4xx
    Validation,
    /// Referenced identity or customer does not exist; log and drop
    NotFound,
    /// Dependency unreachable or overloaded; let the sender redeliver
    Transient,
    /// A write would break a record invariant
    Invariant,
}

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("Webhook signature invalid")]
    WebhookSignatureInvalid,

    #[error("Webhook payload malformed: {0}")]
    WebhookPayload(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Customer not found: {0}")]
    CustomerNotFound(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Store call timed out after {0} ms")]
    StoreTimeout(u64),

    #[error("Concurrent write conflict for identity {0}")]
    WriteConflict(String),

    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("{dependency} request failed: {message}")]
    Upstream {
        dependency: &'static str,
        message: String,
    },

    #[error("Invariant violated for identity {identity}: {reason}")]
    InvariantViolation { identity: String, reason: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BillingError::WebhookSignatureInvalid
            | BillingError::WebhookPayload(_)
            | BillingError::InvalidInput(_) => ErrorKind::Validation,
            BillingError::UserNotFound(_) | BillingError::CustomerNotFound(_) => {
                ErrorKind::NotFound
            }
            BillingError::InvariantViolation { .. } => ErrorKind::Invariant,
            BillingError::Config(_)
            | BillingError::Database(_)
            | BillingError::StoreTimeout(_)
            | BillingError::WriteConflict(_)
            | BillingError::StripeApi(_)
            | BillingError::Upstream { .. }
            | BillingError::Internal(_) => ErrorKind::Transient,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::StripeApi(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            BillingError::WebhookSignatureInvalid.kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            BillingError::CustomerNotFound("cus_1".into()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(BillingError::StoreTimeout(5000).kind(), ErrorKind::Transient);
        assert!(BillingError::Database("down".into()).is_transient());
        assert_eq!(
            BillingError::InvariantViolation {
                identity: "U1".into(),
                reason: "paid plan without customer".into(),
            }
            .kind(),
            ErrorKind::Invariant
        );
    }
}
