//! Billing Provider Abstraction
//!
//! Everything the service asks of Stripe goes through [`BillingProvider`], so
//! the reconciler and HTTP layer can be driven by a stub in tests.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::entitlement::{EntitlementPatch, EntitlementStatus, Plan};
use crate::error::Result;

/// Metadata key carrying the device linkage on checkout sessions and subscriptions
pub const DEVICE_ID_METADATA_KEY: &str = "deviceId";

/// Request to create a checkout session
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckoutRequest {
    /// Paid plan to subscribe to (never `Free`)
    pub plan: Plan,

    /// Device the subscription will be linked to
    pub device_id: String,
}

/// Result of creating a checkout session
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckoutSession {
    /// Stripe session ID
    pub id: String,

    /// URL to redirect the user to
    pub url: String,
}

/// Result of creating a billing portal session
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PortalSession {
    pub url: String,
}

/// The parts of a Stripe subscription reconciliation reads
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubscriptionSnapshot {
    pub id: String,

    /// Raw Stripe status string
    pub status: String,

    pub customer_id: Option<String>,

    /// Unix seconds
    pub trial_end: Option<i64>,

    /// Unix seconds
    pub current_period_end: Option<i64>,

    /// Recurring interval of the first item's price (`month`, `year`, ...)
    pub interval: Option<String>,

    pub metadata: HashMap<String, String>,
}

impl SubscriptionSnapshot {
    /// Device linked through metadata, if any
    pub fn device_id(&self) -> Option<&str> {
        self.metadata
            .get(DEVICE_ID_METADATA_KEY)
            .map(String::as_str)
            .filter(|id| !id.is_empty())
    }

    pub fn plan(&self) -> Plan {
        Plan::from_interval(self.interval.as_deref())
    }

    pub fn entitlement_status(&self) -> EntitlementStatus {
        EntitlementStatus::from_stripe(&self.status)
    }

    /// Expiry in milliseconds: trial end while trialing, otherwise period end,
    /// and nothing once inactive.
    pub fn expires_at_ms(&self) -> Option<i64> {
        let seconds = match self.entitlement_status() {
            EntitlementStatus::Inactive => None,
            EntitlementStatus::Trialing => self.trial_end.or(self.current_period_end),
            EntitlementStatus::Active | EntitlementStatus::PastDue => self.current_period_end,
        };
        seconds.map(|s| s.saturating_mul(1000))
    }

    /// Full entitlement state this subscription implies
    pub fn to_patch(&self) -> EntitlementPatch {
        EntitlementPatch::subscription(
            self.plan(),
            self.entitlement_status(),
            self.expires_at_ms(),
            self.customer_id.clone(),
        )
    }
}

/// Payment processor operations
#[async_trait]
pub trait BillingProvider: Send + Sync {
    /// Create a hosted checkout session for a subscription
    async fn create_checkout_session(&self, request: &CheckoutRequest) -> Result<CheckoutSession>;

    /// Create a billing portal session for an existing customer
    async fn create_portal_session(&self, customer_id: &str) -> Result<PortalSession>;

    /// Fetch the current state of a subscription
    async fn retrieve_subscription(&self, subscription_id: &str) -> Result<SubscriptionSnapshot>;

    /// Record the device linkage on the subscription's metadata
    async fn link_subscription(&self, subscription_id: &str, device_id: &str) -> Result<()>;
}
