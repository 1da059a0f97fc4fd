//! # entitlement-sync
//!
//! Keeps per-device subscription entitlements in step with Stripe.
//!
//! ## Flow
//!
//! ```text
//! ┌──────────┐  signed event  ┌────────────────┐  patch  ┌──────────────────┐
//! │  Stripe  │───────────────▶│ WebhookHandler │────────▶│ EntitlementStore │
//! └──────────┘                │  (Reconciler)  │         └──────────────────┘
//!      ▲                      └────────────────┘                  │
//!      │ retrieve / link              │                           │ get
//!      └──────────────────────────────┘                    status endpoint
//! ```
//!
//! The device identifier travels to Stripe as `deviceId` metadata when a
//! checkout session is created, and is copied onto the subscription when the
//! checkout completes. Every later subscription or invoice event is linked
//! back to its device through that metadata. Events that cannot be linked are
//! skipped, never failed.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use entitlement_sync::{
//!     BillingConfig, SignatureVerifier, SqliteEntitlementStore, StripeClient, WebhookHandler,
//! };
//!
//! let config = BillingConfig::from_env()?;
//! let store = Arc::new(SqliteEntitlementStore::open("sqlite://entitlements.db?mode=rwc").await?);
//! let verifier = SignatureVerifier::new(&config.webhook_secret, config.webhook_tolerance_secs);
//! let handler = WebhookHandler::new(verifier, store, Arc::new(StripeClient::new(config)));
//!
//! // Err only for a bad signature; every Ok outcome gets a 200.
//! let outcome = handler.handle(&body, signature_header).await?;
//! ```

mod checkout;
mod entitlement;
mod error;
mod event;
mod provider;
mod signature;
mod sqlite;
mod webhook;

pub use checkout::{BillingConfig, DEFAULT_WEBHOOK_TOLERANCE_SECS, StripeClient};
pub use entitlement::{
    EntitlementPatch, EntitlementRecord, EntitlementStatus, EntitlementStore, EntitlementView,
    MemoryEntitlementStore, Plan,
};
pub use error::{Result, SyncError};
pub use event::{CheckoutSessionObject, InvoiceObject, LifecycleEvent};
pub use provider::{
    BillingProvider, CheckoutRequest, CheckoutSession, DEVICE_ID_METADATA_KEY, PortalSession,
    SubscriptionSnapshot,
};
pub use signature::SignatureVerifier;
pub use sqlite::SqliteEntitlementStore;
pub use webhook::{ReconcileOutcome, Reconciler, SkipReason, WebhookHandler};
