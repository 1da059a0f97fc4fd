//! Entitlement Records
//!
//! One record per device holding the latest known plan, status, expiry and
//! billing customer. Records are only ever patched in place; no history is kept.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{Result, SyncError};

/// Billing interval tier
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    #[default]
    Free,
    Monthly,
    Yearly,
}

impl Plan {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Monthly => "monthly",
            Self::Yearly => "yearly",
        }
    }

    /// Derive the plan from a Stripe recurring interval.
    ///
    /// Anything other than `year` counts as monthly, including a missing interval.
    pub fn from_interval(interval: Option<&str>) -> Self {
        match interval {
            Some("year") => Self::Yearly,
            _ => Self::Monthly,
        }
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Plan {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "free" => Ok(Self::Free),
            "monthly" => Ok(Self::Monthly),
            "yearly" => Ok(Self::Yearly),
            other => Err(SyncError::InvalidRequest(format!("unknown plan '{other}'"))),
        }
    }
}

/// Entitlement status, mirroring the subset of Stripe subscription statuses
/// clients care about
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitlementStatus {
    #[default]
    Inactive,
    Trialing,
    Active,
    PastDue,
}

impl EntitlementStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Trialing => "trialing",
            Self::Active => "active",
            Self::PastDue => "past_due",
        }
    }

    /// Map a raw Stripe subscription status.
    ///
    /// `canceled`, `unpaid`, `incomplete`, `incomplete_expired`, `paused` and
    /// anything unrecognised collapse to `Inactive`.
    pub fn from_stripe(status: &str) -> Self {
        match status {
            "trialing" => Self::Trialing,
            "active" => Self::Active,
            "past_due" => Self::PastDue,
            _ => Self::Inactive,
        }
    }
}

impl fmt::Display for EntitlementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntitlementStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "inactive" => Ok(Self::Inactive),
            "trialing" => Ok(Self::Trialing),
            "active" => Ok(Self::Active),
            "past_due" => Ok(Self::PastDue),
            other => Err(SyncError::Storage(format!("unknown status '{other}'"))),
        }
    }
}

/// A stored entitlement record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitlementRecord {
    /// Client-generated installation identifier
    pub device_id: String,

    /// Billing interval of the current subscription
    pub plan: Plan,

    /// Entitlement authority
    pub status: EntitlementStatus,

    /// Trial or period end, milliseconds since the epoch
    pub expires_at: Option<i64>,

    /// Stripe customer, set once a checkout completes
    pub customer_id: Option<String>,
}

impl EntitlementRecord {
    /// The implicit record of a device nothing is known about
    pub fn unknown(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            plan: Plan::Free,
            status: EntitlementStatus::Inactive,
            expires_at: None,
            customer_id: None,
        }
    }

    /// Overwrite the fields the patch carries.
    pub fn apply(&mut self, patch: &EntitlementPatch) {
        if let Some(plan) = patch.plan {
            self.plan = plan;
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(expires_at) = patch.expires_at {
            self.expires_at = expires_at;
        }
        if let Some(customer_id) = &patch.customer_id {
            self.customer_id = Some(customer_id.clone());
        }
    }

    /// Client-facing view of this record
    pub fn view(&self) -> EntitlementView {
        EntitlementView {
            plan: self.plan,
            status: self.status,
            expires_at: self.expires_at,
        }
    }
}

/// What the status endpoint reports for a device
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitlementView {
    pub plan: Plan,
    pub status: EntitlementStatus,
    pub expires_at: Option<i64>,
}

/// A partial update. `None` leaves the stored field as it is.
///
/// `expires_at` is doubly optional so a patch can clear the expiry
/// (`Some(None)`). `customer_id` can only be set, never cleared.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EntitlementPatch {
    pub plan: Option<Plan>,
    pub status: Option<EntitlementStatus>,
    pub expires_at: Option<Option<i64>>,
    pub customer_id: Option<String>,
}

impl EntitlementPatch {
    /// Full subscription state, as derived from a subscription object
    pub fn subscription(
        plan: Plan,
        status: EntitlementStatus,
        expires_at: Option<i64>,
        customer_id: Option<String>,
    ) -> Self {
        Self {
            plan: Some(plan),
            status: Some(status),
            expires_at: Some(expires_at),
            customer_id,
        }
    }

    /// Touch the status only
    pub fn status_only(status: EntitlementStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Back to free/inactive with no expiry; the customer link survives
    pub fn soft_reset() -> Self {
        Self {
            plan: Some(Plan::Free),
            status: Some(EntitlementStatus::Inactive),
            expires_at: Some(None),
            customer_id: None,
        }
    }
}

/// Entitlement storage trait
///
/// `upsert` must be atomic per device: concurrent patches for the same device
/// never interleave field writes.
#[async_trait]
pub trait EntitlementStore: Send + Sync {
    /// Get the record for a device
    async fn get(&self, device_id: &str) -> Result<Option<EntitlementRecord>>;

    /// Insert the device with defaults if absent, then apply the patch.
    /// Returns the record as stored afterwards.
    async fn upsert(&self, device_id: &str, patch: &EntitlementPatch) -> Result<EntitlementRecord>;

    /// Release the backing resources
    async fn close(&self) {}
}

/// In-memory entitlement store (for tests and local development)
#[derive(Default)]
pub struct MemoryEntitlementStore {
    records: RwLock<HashMap<String, EntitlementRecord>>,
}

impl MemoryEntitlementStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl EntitlementStore for MemoryEntitlementStore {
    async fn get(&self, device_id: &str) -> Result<Option<EntitlementRecord>> {
        Ok(self.records.read().await.get(device_id).cloned())
    }

    async fn upsert(&self, device_id: &str, patch: &EntitlementPatch) -> Result<EntitlementRecord> {
        let mut records = self.records.write().await;
        let record = records
            .entry(device_id.to_string())
            .or_insert_with(|| EntitlementRecord::unknown(device_id));
        record.apply(patch);
        Ok(record.clone())
    }
}
