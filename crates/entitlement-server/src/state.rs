//! Application State

use std::sync::Arc;

use entitlement_sync::{BillingProvider, EntitlementStore, SignatureVerifier, WebhookHandler};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Entitlement records, one per device
    pub store: Arc<dyn EntitlementStore>,

    /// Stripe integration (None if not configured)
    pub billing: Option<Billing>,
}

/// Everything that needs Stripe credentials
#[derive(Clone)]
pub struct Billing {
    pub provider: Arc<dyn BillingProvider>,
    pub webhooks: Arc<WebhookHandler>,
}

impl Billing {
    pub fn new(
        provider: Arc<dyn BillingProvider>,
        store: Arc<dyn EntitlementStore>,
        verifier: SignatureVerifier,
    ) -> Self {
        let webhooks = Arc::new(WebhookHandler::new(verifier, store, provider.clone()));
        Self { provider, webhooks }
    }
}
