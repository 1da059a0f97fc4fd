//! Stripe Client
//!
//! Production [`BillingProvider`] on top of `async-stripe`: hosted checkout,
//! billing portal, and the subscription lookups the reconciler needs.

use std::collections::HashMap;

use async_trait::async_trait;
use stripe::{
    BillingPortalSession, CheckoutSession as StripeCheckoutSession, CheckoutSessionMode, Client,
    CreateBillingPortalSession, CreateCheckoutSession, CreateCheckoutSessionLineItems,
    CreateCheckoutSessionSubscriptionData, CustomerId, Subscription, SubscriptionId,
    UpdateSubscription,
};

use crate::entitlement::Plan;
use crate::error::{Result, SyncError};
use crate::provider::{
    BillingProvider, CheckoutRequest, CheckoutSession, DEVICE_ID_METADATA_KEY, PortalSession,
    SubscriptionSnapshot,
};

/// Default webhook timestamp tolerance in seconds
pub const DEFAULT_WEBHOOK_TOLERANCE_SECS: i64 = 300;

/// Stripe configuration
#[derive(Clone, Debug)]
pub struct BillingConfig {
    /// Stripe secret API key
    pub secret_key: String,

    /// Webhook signing secret (`whsec_...`)
    pub webhook_secret: String,

    /// Price ID billed monthly
    pub monthly_price_id: String,

    /// Price ID billed yearly
    pub yearly_price_id: String,

    /// Optional free trial applied at checkout
    pub trial_days: Option<u32>,

    /// Accepted clock skew for webhook signatures, in seconds
    pub webhook_tolerance_secs: i64,

    /// Base URL for success/cancel/return redirects
    pub app_base_url: String,
}

impl BillingConfig {
    /// Create from environment variables
    pub fn from_env() -> Result<Self> {
        let required = |name: &str| {
            std::env::var(name).map_err(|_| SyncError::Config(format!("{name} not set")))
        };

        let trial_days = match std::env::var("STRIPE_TRIAL_DAYS") {
            Ok(days) => Some(days.parse().map_err(|_| {
                SyncError::Config(format!("STRIPE_TRIAL_DAYS is not a number: {days}"))
            })?),
            Err(_) => None,
        };

        let webhook_tolerance_secs = match std::env::var("STRIPE_WEBHOOK_TOLERANCE_SECS") {
            Ok(secs) => secs.parse().map_err(|_| {
                SyncError::Config(format!("STRIPE_WEBHOOK_TOLERANCE_SECS is not a number: {secs}"))
            })?,
            Err(_) => DEFAULT_WEBHOOK_TOLERANCE_SECS,
        };

        Ok(Self {
            secret_key: required("STRIPE_SECRET_KEY")?,
            webhook_secret: required("STRIPE_WEBHOOK_SECRET")?,
            monthly_price_id: required("STRIPE_PRICE_MONTHLY")?,
            yearly_price_id: required("STRIPE_PRICE_YEARLY")?,
            trial_days: trial_days.filter(|days| *days > 0),
            webhook_tolerance_secs,
            app_base_url: std::env::var("APP_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".into()),
        })
    }

    /// Price ID for a paid plan
    pub fn price_id(&self, plan: Plan) -> Result<&str> {
        match plan {
            Plan::Monthly => Ok(&self.monthly_price_id),
            Plan::Yearly => Ok(&self.yearly_price_id),
            Plan::Free => Err(SyncError::InvalidRequest(
                "the free plan has no checkout".into(),
            )),
        }
    }

    /// Where Stripe sends the user after paying
    pub fn success_url(&self) -> String {
        self.url("/checkout/success?session_id={CHECKOUT_SESSION_ID}")
    }

    pub fn cancel_url(&self) -> String {
        self.url("/checkout/cancel")
    }

    /// Where the billing portal's back link goes
    pub fn portal_return_url(&self) -> String {
        self.url("/")
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.app_base_url.trim_end_matches('/'), path)
    }
}

/// Stripe client wrapper
pub struct StripeClient {
    client: Client,
    config: BillingConfig,
}

impl StripeClient {
    /// Create a new Stripe client
    pub fn new(config: BillingConfig) -> Self {
        Self {
            client: Client::new(&config.secret_key),
            config,
        }
    }

    /// Create from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(BillingConfig::from_env()?))
    }

    pub fn config(&self) -> &BillingConfig {
        &self.config
    }

    /// Get the webhook secret
    pub fn webhook_secret(&self) -> &str {
        &self.config.webhook_secret
    }

    fn parse_subscription_id(subscription_id: &str) -> Result<SubscriptionId> {
        subscription_id
            .parse::<SubscriptionId>()
            .map_err(|e| SyncError::Stripe(format!("Invalid subscription ID: {e}")))
    }
}

fn snapshot_from_stripe(subscription: &Subscription) -> SubscriptionSnapshot {
    let interval = subscription.items.data.first().and_then(|item| {
        item.price
            .as_ref()
            .and_then(|price| price.recurring.as_ref())
            .map(|recurring| recurring.interval.as_str().to_string())
    });

    SubscriptionSnapshot {
        id: subscription.id.to_string(),
        status: subscription.status.as_str().to_string(),
        customer_id: Some(subscription.customer.id().to_string()),
        trial_end: subscription.trial_end,
        current_period_end: Some(subscription.current_period_end),
        interval,
        metadata: subscription.metadata.clone(),
    }
}

#[async_trait]
impl BillingProvider for StripeClient {
    /// Create a Stripe Checkout session (hosted)
    ///
    /// The device ID rides along in session metadata, subscription metadata
    /// and `client_reference_id`, so every later event can be linked back.
    async fn create_checkout_session(&self, request: &CheckoutRequest) -> Result<CheckoutSession> {
        let price_id = self.config.price_id(request.plan)?;
        let success_url = self.config.success_url();
        let cancel_url = self.config.cancel_url();

        let mut metadata = HashMap::new();
        metadata.insert(DEVICE_ID_METADATA_KEY.to_string(), request.device_id.clone());
        metadata.insert("plan".to_string(), request.plan.as_str().to_string());

        let mut params = CreateCheckoutSession::new();
        params.mode = Some(CheckoutSessionMode::Subscription);
        params.success_url = Some(&success_url);
        params.cancel_url = Some(&cancel_url);
        params.client_reference_id = Some(&request.device_id);
        params.metadata = Some(metadata.clone());
        params.line_items = Some(vec![CreateCheckoutSessionLineItems {
            price: Some(price_id.to_string()),
            quantity: Some(1),
            ..Default::default()
        }]);
        params.subscription_data = Some(CreateCheckoutSessionSubscriptionData {
            metadata: Some(metadata),
            trial_period_days: self.config.trial_days,
            ..Default::default()
        });

        let session = StripeCheckoutSession::create(&self.client, params).await?;

        let url = session
            .url
            .ok_or_else(|| SyncError::Stripe("No checkout URL returned".into()))?;

        tracing::info!(
            session_id = %session.id,
            device_id = %request.device_id,
            plan = %request.plan,
            "Created checkout session"
        );

        Ok(CheckoutSession {
            id: session.id.to_string(),
            url,
        })
    }

    async fn create_portal_session(&self, customer_id: &str) -> Result<PortalSession> {
        let customer = customer_id
            .parse::<CustomerId>()
            .map_err(|e| SyncError::Stripe(format!("Invalid customer ID: {e}")))?;
        let return_url = self.config.portal_return_url();

        let mut params = CreateBillingPortalSession::new(customer);
        params.return_url = Some(&return_url);

        let session = BillingPortalSession::create(&self.client, params).await?;

        tracing::info!(customer_id = %customer_id, "Created billing portal session");

        Ok(PortalSession { url: session.url })
    }

    async fn retrieve_subscription(&self, subscription_id: &str) -> Result<SubscriptionSnapshot> {
        let id = Self::parse_subscription_id(subscription_id)?;
        let subscription = Subscription::retrieve(&self.client, &id, &[]).await?;
        Ok(snapshot_from_stripe(&subscription))
    }

    async fn link_subscription(&self, subscription_id: &str, device_id: &str) -> Result<()> {
        let id = Self::parse_subscription_id(subscription_id)?;

        let mut metadata = HashMap::new();
        metadata.insert(DEVICE_ID_METADATA_KEY.to_string(), device_id.to_string());

        let mut params = UpdateSubscription::new();
        params.metadata = Some(metadata);

        Subscription::update(&self.client, &id, params).await?;

        tracing::info!(
            subscription_id = %subscription_id,
            device_id = %device_id,
            "Linked subscription to device"
        );

        Ok(())
    }
}
