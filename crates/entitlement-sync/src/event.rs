//! Webhook Event Decoding
//!
//! Events are decoded into small local shapes rather than full Stripe objects:
//! the reconciler only needs a handful of fields, and tolerating unknown or
//! missing fields keeps API-version drift from turning into parse failures.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{Result, SyncError};
use crate::provider::{DEVICE_ID_METADATA_KEY, SubscriptionSnapshot};

pub const CHECKOUT_SESSION_COMPLETED: &str = "checkout.session.completed";
pub const SUBSCRIPTION_CREATED: &str = "customer.subscription.created";
pub const SUBSCRIPTION_UPDATED: &str = "customer.subscription.updated";
pub const SUBSCRIPTION_DELETED: &str = "customer.subscription.deleted";
pub const INVOICE_PAYMENT_FAILED: &str = "invoice.payment_failed";

/// Outer event envelope
#[derive(Clone, Debug, Deserialize)]
pub struct EventEnvelope {
    #[serde(default)]
    pub id: String,

    #[serde(rename = "type")]
    pub type_: String,

    #[serde(default)]
    pub created: Option<i64>,

    pub data: EventData,
}

#[derive(Clone, Debug, Deserialize)]
pub struct EventData {
    pub object: Value,
}

impl EventEnvelope {
    pub fn from_slice(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|e| SyncError::WebhookParse(e.to_string()))
    }
}

/// A reference to another Stripe object: either its ID or the expanded object
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum ObjectRef {
    Id(String),
    Expanded { id: String },
}

impl ObjectRef {
    pub fn id(&self) -> &str {
        match self {
            Self::Id(id) | Self::Expanded { id } => id,
        }
    }
}

/// `checkout.session` payload
#[derive(Clone, Debug, Deserialize)]
pub struct CheckoutSessionObject {
    pub id: String,

    #[serde(default)]
    pub customer: Option<ObjectRef>,

    #[serde(default)]
    pub subscription: Option<ObjectRef>,

    #[serde(default)]
    pub client_reference_id: Option<String>,

    #[serde(default)]
    pub metadata: Option<HashMap<String, String>>,
}

impl CheckoutSessionObject {
    /// Device from metadata, falling back to `client_reference_id`
    pub fn device_id(&self) -> Option<&str> {
        let non_empty = |id: &&String| !id.is_empty();
        self.metadata
            .as_ref()
            .and_then(|m| m.get(DEVICE_ID_METADATA_KEY))
            .filter(non_empty)
            .or_else(|| self.client_reference_id.as_ref().filter(non_empty))
            .map(String::as_str)
    }
}

/// `subscription` payload
#[derive(Clone, Debug, Deserialize)]
pub struct SubscriptionObject {
    pub id: String,

    #[serde(default)]
    pub status: String,

    #[serde(default)]
    pub customer: Option<ObjectRef>,

    #[serde(default)]
    pub trial_end: Option<i64>,

    #[serde(default)]
    pub current_period_end: Option<i64>,

    #[serde(default)]
    pub items: Option<SubscriptionItems>,

    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct SubscriptionItems {
    #[serde(default)]
    pub data: Vec<SubscriptionItem>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SubscriptionItem {
    #[serde(default)]
    pub price: Option<Price>,

    /// Newer API versions report the period per item
    #[serde(default)]
    pub current_period_end: Option<i64>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Price {
    #[serde(default)]
    pub recurring: Option<Recurring>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Recurring {
    pub interval: String,
}

impl SubscriptionObject {
    fn first_item(&self) -> Option<&SubscriptionItem> {
        self.items.as_ref().and_then(|items| items.data.first())
    }

    pub fn into_snapshot(self) -> SubscriptionSnapshot {
        let item = self.first_item();
        let interval = item
            .and_then(|item| item.price.as_ref())
            .and_then(|price| price.recurring.as_ref())
            .map(|recurring| recurring.interval.clone());
        let current_period_end = self
            .current_period_end
            .or_else(|| item.and_then(|item| item.current_period_end));

        SubscriptionSnapshot {
            customer_id: self.customer.as_ref().map(|c| c.id().to_string()),
            trial_end: self.trial_end,
            current_period_end,
            interval,
            id: self.id,
            status: self.status,
            metadata: self.metadata,
        }
    }
}

/// `invoice` payload
#[derive(Clone, Debug, Deserialize)]
pub struct InvoiceObject {
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub subscription: Option<ObjectRef>,

    /// Newer API versions move the subscription under `parent`
    #[serde(default)]
    pub parent: Option<InvoiceParent>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct InvoiceParent {
    #[serde(default)]
    pub subscription_details: Option<InvoiceSubscriptionDetails>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct InvoiceSubscriptionDetails {
    #[serde(default)]
    pub subscription: Option<ObjectRef>,
}

impl InvoiceObject {
    pub fn subscription_id(&self) -> Option<&str> {
        self.subscription
            .as_ref()
            .or_else(|| {
                self.parent
                    .as_ref()
                    .and_then(|p| p.subscription_details.as_ref())
                    .and_then(|d| d.subscription.as_ref())
            })
            .map(ObjectRef::id)
            .filter(|id| !id.is_empty())
    }
}

/// A webhook event narrowed to what the reconciler handles
#[derive(Clone, Debug)]
pub enum LifecycleEvent {
    CheckoutCompleted(CheckoutSessionObject),
    SubscriptionCreated(SubscriptionSnapshot),
    SubscriptionUpdated(SubscriptionSnapshot),
    SubscriptionDeleted(SubscriptionSnapshot),
    InvoicePaymentFailed(InvoiceObject),
    Other { event_type: String },
}

impl LifecycleEvent {
    /// Decode the envelope's object according to its type.
    pub fn decode(envelope: &EventEnvelope) -> Result<Self> {
        let object = &envelope.data.object;
        let event = match envelope.type_.as_str() {
            CHECKOUT_SESSION_COMPLETED => Self::CheckoutCompleted(parse_object(object)?),
            SUBSCRIPTION_CREATED => Self::SubscriptionCreated(parse_subscription(object)?),
            SUBSCRIPTION_UPDATED => Self::SubscriptionUpdated(parse_subscription(object)?),
            SUBSCRIPTION_DELETED => Self::SubscriptionDeleted(parse_subscription(object)?),
            INVOICE_PAYMENT_FAILED => Self::InvoicePaymentFailed(parse_object(object)?),
            other => Self::Other {
                event_type: other.to_string(),
            },
        };
        Ok(event)
    }
}

fn parse_object<T: serde::de::DeserializeOwned>(object: &Value) -> Result<T> {
    T::deserialize(object).map_err(|e| SyncError::WebhookParse(e.to_string()))
}

fn parse_subscription(object: &Value) -> Result<SubscriptionSnapshot> {
    parse_object::<SubscriptionObject>(object).map(SubscriptionObject::into_snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(type_: &str, object: Value) -> EventEnvelope {
        serde_json::from_value(json!({
            "id": "evt_1",
            "type": type_,
            "created": 1_700_000_000,
            "data": { "object": object }
        }))
        .unwrap()
    }

    #[test]
    fn test_decode_subscription_event() {
        let env = envelope(
            SUBSCRIPTION_UPDATED,
            json!({
                "id": "sub_1",
                "object": "subscription",
                "status": "past_due",
                "customer": "cus_1",
                "current_period_end": 1_800_000_000,
                "trial_end": null,
                "items": { "data": [ { "price": { "recurring": { "interval": "year" } } } ] },
                "metadata": { "deviceId": "abc" },
                "some_future_field": { "nested": true }
            }),
        );

        let LifecycleEvent::SubscriptionUpdated(sub) = LifecycleEvent::decode(&env).unwrap() else {
            panic!("expected SubscriptionUpdated");
        };
        assert_eq!(sub.id, "sub_1");
        assert_eq!(sub.status, "past_due");
        assert_eq!(sub.customer_id.as_deref(), Some("cus_1"));
        assert_eq!(sub.interval.as_deref(), Some("year"));
        assert_eq!(sub.current_period_end, Some(1_800_000_000));
        assert_eq!(sub.device_id(), Some("abc"));
    }

    #[test]
    fn test_period_end_falls_back_to_item() {
        let env = envelope(
            SUBSCRIPTION_CREATED,
            json!({
                "id": "sub_1",
                "status": "active",
                "customer": { "id": "cus_2", "object": "customer" },
                "items": { "data": [ { "current_period_end": 1_750_000_000 } ] }
            }),
        );

        let LifecycleEvent::SubscriptionCreated(sub) = LifecycleEvent::decode(&env).unwrap() else {
            panic!("expected SubscriptionCreated");
        };
        assert_eq!(sub.current_period_end, Some(1_750_000_000));
        assert_eq!(sub.customer_id.as_deref(), Some("cus_2"));
        assert_eq!(sub.interval, None);
    }

    #[test]
    fn test_checkout_device_falls_back_to_client_reference() {
        let env = envelope(
            CHECKOUT_SESSION_COMPLETED,
            json!({ "id": "cs_1", "client_reference_id": "dev-9", "subscription": "sub_1" }),
        );

        let LifecycleEvent::CheckoutCompleted(session) = LifecycleEvent::decode(&env).unwrap() else {
            panic!("expected CheckoutCompleted");
        };
        assert_eq!(session.device_id(), Some("dev-9"));
        assert_eq!(session.subscription.as_ref().map(ObjectRef::id), Some("sub_1"));
    }

    #[test]
    fn test_blank_metadata_device_falls_back_to_client_reference() {
        let session: CheckoutSessionObject = serde_json::from_value(json!({
            "id": "cs_2",
            "client_reference_id": "dev-9",
            "metadata": { "deviceId": "" }
        }))
        .unwrap();
        assert_eq!(session.device_id(), Some("dev-9"));

        let blank: CheckoutSessionObject = serde_json::from_value(json!({
            "id": "cs_3",
            "client_reference_id": "",
            "metadata": { "deviceId": "" }
        }))
        .unwrap();
        assert_eq!(blank.device_id(), None);
    }

    #[test]
    fn test_invoice_subscription_locations() {
        let legacy: InvoiceObject =
            serde_json::from_value(json!({ "id": "in_1", "subscription": "sub_1" })).unwrap();
        assert_eq!(legacy.subscription_id(), Some("sub_1"));

        let nested: InvoiceObject = serde_json::from_value(json!({
            "id": "in_2",
            "subscription": null,
            "parent": { "subscription_details": { "subscription": "sub_2" } }
        }))
        .unwrap();
        assert_eq!(nested.subscription_id(), Some("sub_2"));

        let none: InvoiceObject = serde_json::from_value(json!({ "id": "in_3" })).unwrap();
        assert_eq!(none.subscription_id(), None);
    }

    #[test]
    fn test_unknown_type_is_other() {
        let env = envelope("charge.refunded", json!({ "id": "ch_1" }));
        assert!(matches!(
            LifecycleEvent::decode(&env).unwrap(),
            LifecycleEvent::Other { event_type } if event_type == "charge.refunded"
        ));
    }

    #[test]
    fn test_wrong_shape_is_parse_error() {
        let env = envelope(SUBSCRIPTION_DELETED, json!({ "status": "canceled" }));
        assert!(matches!(
            LifecycleEvent::decode(&env),
            Err(SyncError::WebhookParse(_))
        ));
    }

    #[test]
    fn test_envelope_rejects_non_json() {
        assert!(EventEnvelope::from_slice(b"not json").is_err());
    }
}
