//! Entitlement Sync Error Types

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors raised while syncing entitlements with Stripe
#[derive(Error, Debug)]
pub enum SyncError {
    /// Stripe API error
    #[error("Stripe error: {0}")]
    Stripe(String),

    /// Webhook signature verification failed
    #[error("Webhook signature invalid: {0}")]
    WebhookSignature(String),

    /// Webhook payload parsing failed
    #[error("Webhook parse error: {0}")]
    WebhookParse(String),

    /// Client request failed validation
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// No billing customer is linked to the device
    #[error("No customer linked to device: {0}")]
    CustomerNotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),
}

impl SyncError {
    /// Check if this error is retryable
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Stripe(_) | Self::Storage(_))
    }

    /// Get user-friendly message
    pub const fn user_message(&self) -> &str {
        match self {
            Self::Stripe(_) => "Payment processing failed. Please try again.",
            Self::InvalidRequest(_) => "The request was invalid.",
            Self::CustomerNotFound(_) => "No billing account exists for this device.",
            Self::Config(_) => "Service configuration error.",
            _ => "An error occurred processing your request.",
        }
    }
}

impl From<stripe::StripeError> for SyncError {
    fn from(err: stripe::StripeError) -> Self {
        Self::Stripe(err.to_string())
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(err.to_string())
    }
}
