//! Stripe Webhook Handling
//!
//! Reconciles subscription lifecycle events onto device entitlement records.
//!
//! Stripe delivers at least once and in no particular order, so every handler
//! here writes absolute state (never deltas) and treats an event it cannot
//! link to a device as a benign skip. Only a bad signature is an error; every
//! other failure is reported as [`ReconcileOutcome::Failed`] and acknowledged.

use std::sync::Arc;

use crate::entitlement::{EntitlementPatch, EntitlementRecord, EntitlementStatus, EntitlementStore};
use crate::error::{Result, SyncError};
use crate::event::{
    CheckoutSessionObject, EventEnvelope, InvoiceObject, LifecycleEvent, ObjectRef,
};
use crate::provider::{BillingProvider, SubscriptionSnapshot};
use crate::signature::SignatureVerifier;

/// Why an event produced no write
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// No device identifier could be resolved
    Unlinked,
    /// Event type the reconciler does not act on
    Unhandled,
}

/// Result of reconciling one event
#[derive(Debug)]
pub enum ReconcileOutcome {
    /// The device record was written; holds the record as stored
    Applied(EntitlementRecord),

    /// Nothing to do
    Skipped(SkipReason),

    /// Processing failed after the event was authenticated
    Failed(SyncError),
}

impl ReconcileOutcome {
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Applied(_) => "applied",
            Self::Skipped(SkipReason::Unlinked) => "skipped_unlinked",
            Self::Skipped(SkipReason::Unhandled) => "skipped_unhandled",
            Self::Failed(_) => "failed",
        }
    }
}

/// Maps lifecycle events onto the entitlement store
pub struct Reconciler {
    store: Arc<dyn EntitlementStore>,
    provider: Arc<dyn BillingProvider>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn EntitlementStore>, provider: Arc<dyn BillingProvider>) -> Self {
        Self { store, provider }
    }

    /// Apply one event. Never fails; failures come back as an outcome.
    pub async fn reconcile(&self, event: LifecycleEvent) -> ReconcileOutcome {
        match self.apply(event).await {
            Ok(outcome) => outcome,
            Err(e) => ReconcileOutcome::Failed(e),
        }
    }

    async fn apply(&self, event: LifecycleEvent) -> Result<ReconcileOutcome> {
        match event {
            LifecycleEvent::CheckoutCompleted(session) => self.checkout_completed(&session).await,

            // Same absolute state for created and updated.
            LifecycleEvent::SubscriptionCreated(subscription) => {
                self.write_subscription_state(&subscription).await
            }
            LifecycleEvent::SubscriptionUpdated(subscription) => {
                self.write_subscription_state(&subscription).await
            }

            LifecycleEvent::SubscriptionDeleted(subscription) => {
                self.subscription_deleted(&subscription).await
            }
            LifecycleEvent::InvoicePaymentFailed(invoice) => self.payment_failed(&invoice).await,
            LifecycleEvent::Other { event_type } => {
                tracing::debug!(event_type = %event_type, "Unhandled webhook event");
                Ok(ReconcileOutcome::Skipped(SkipReason::Unhandled))
            }
        }
    }

    /// Checkout only tells us the session happened. The subscription it
    /// created is the source of truth for status and trial end, so fetch it,
    /// make sure it carries the device link for later events, then write.
    async fn checkout_completed(&self, session: &CheckoutSessionObject) -> Result<ReconcileOutcome> {
        let Some(device_id) = session.device_id() else {
            return Ok(unlinked("checkout session has no device", &session.id));
        };
        let Some(subscription_id) = session.subscription.as_ref().map(ObjectRef::id) else {
            return Ok(unlinked("checkout session has no subscription", &session.id));
        };

        let subscription = self.provider.retrieve_subscription(subscription_id).await?;

        if subscription.device_id() != Some(device_id) {
            self.provider
                .link_subscription(subscription_id, device_id)
                .await?;
        }

        let mut patch = subscription.to_patch();
        if patch.customer_id.is_none() {
            patch.customer_id = session.customer.as_ref().map(|c| c.id().to_string());
        }

        let record = self.store.upsert(device_id, &patch).await?;

        tracing::info!(
            device_id = %device_id,
            subscription_id = %subscription_id,
            plan = %record.plan,
            status = %record.status,
            "Checkout completed"
        );

        Ok(ReconcileOutcome::Applied(record))
    }

    async fn write_subscription_state(
        &self,
        subscription: &SubscriptionSnapshot,
    ) -> Result<ReconcileOutcome> {
        let Some(device_id) = subscription.device_id() else {
            return Ok(unlinked("subscription has no device", &subscription.id));
        };

        let record = self.store.upsert(device_id, &subscription.to_patch()).await?;

        tracing::info!(
            device_id = %device_id,
            subscription_id = %subscription.id,
            plan = %record.plan,
            status = %record.status,
            "Updated entitlement"
        );

        Ok(ReconcileOutcome::Applied(record))
    }

    async fn subscription_deleted(
        &self,
        subscription: &SubscriptionSnapshot,
    ) -> Result<ReconcileOutcome> {
        let Some(device_id) = subscription.device_id() else {
            return Ok(unlinked("subscription has no device", &subscription.id));
        };

        let record = self
            .store
            .upsert(device_id, &EntitlementPatch::soft_reset())
            .await?;

        tracing::info!(
            device_id = %device_id,
            subscription_id = %subscription.id,
            "Subscription deleted, entitlement reset"
        );

        Ok(ReconcileOutcome::Applied(record))
    }

    /// Invoices carry no device metadata; the subscription they bill does.
    async fn payment_failed(&self, invoice: &InvoiceObject) -> Result<ReconcileOutcome> {
        let invoice_id = invoice.id.as_deref().unwrap_or_default();
        let Some(subscription_id) = invoice.subscription_id() else {
            return Ok(unlinked("invoice has no subscription", invoice_id));
        };

        let subscription = self.provider.retrieve_subscription(subscription_id).await?;
        let Some(device_id) = subscription.device_id() else {
            return Ok(unlinked("subscription has no device", subscription_id));
        };

        let record = self
            .store
            .upsert(
                device_id,
                &EntitlementPatch::status_only(EntitlementStatus::Inactive),
            )
            .await?;

        tracing::warn!(
            device_id = %device_id,
            subscription_id = %subscription_id,
            invoice_id = %invoice_id,
            "Invoice payment failed, entitlement deactivated"
        );

        Ok(ReconcileOutcome::Applied(record))
    }
}

fn unlinked(reason: &str, object_id: &str) -> ReconcileOutcome {
    tracing::debug!(object_id = %object_id, "{reason}, skipping");
    ReconcileOutcome::Skipped(SkipReason::Unlinked)
}

/// Webhook handler: authenticate, decode, reconcile
pub struct WebhookHandler {
    verifier: SignatureVerifier,
    reconciler: Reconciler,
}

impl WebhookHandler {
    pub fn new(
        verifier: SignatureVerifier,
        store: Arc<dyn EntitlementStore>,
        provider: Arc<dyn BillingProvider>,
    ) -> Self {
        Self {
            verifier,
            reconciler: Reconciler::new(store, provider),
        }
    }

    /// Process one delivery.
    ///
    /// Returns `Err` only when the signature does not verify; the caller must
    /// then reject the request. Any `Ok` outcome is to be acknowledged.
    pub async fn handle(&self, payload: &[u8], signature: &str) -> Result<ReconcileOutcome> {
        self.verifier.verify(payload, signature)?;

        let envelope = match EventEnvelope::from_slice(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::error!(error = %e, "Malformed webhook payload");
                return Ok(ReconcileOutcome::Failed(e));
            }
        };

        tracing::info!(
            event_id = %envelope.id,
            event_type = %envelope.type_,
            "Processing Stripe webhook"
        );

        let outcome = match LifecycleEvent::decode(&envelope) {
            Ok(event) => self.reconciler.reconcile(event).await,
            Err(e) => ReconcileOutcome::Failed(e),
        };

        match &outcome {
            ReconcileOutcome::Failed(e) => tracing::error!(
                event_id = %envelope.id,
                event_type = %envelope.type_,
                error = %e,
                retryable = e.is_retryable(),
                "Webhook processing failed, acknowledging anyway"
            ),
            other => tracing::debug!(
                event_id = %envelope.id,
                outcome = other.kind(),
                "Webhook processed"
            ),
        }

        Ok(outcome)
    }
}
