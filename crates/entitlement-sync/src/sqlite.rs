//! SQLite Entitlement Store
//!
//! Durable [`EntitlementStore`] backed by a single `entitlements` table.

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use crate::entitlement::{EntitlementPatch, EntitlementRecord, EntitlementStore};
use crate::error::{Result, SyncError};

const CREATE_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS entitlements (
    device_id   TEXT PRIMARY KEY NOT NULL,
    plan        TEXT NOT NULL DEFAULT 'free',
    status      TEXT NOT NULL DEFAULT 'inactive',
    expires_at  INTEGER,
    customer_id TEXT,
    updated_at  INTEGER NOT NULL
)";

// Single statement, so the read-modify-write is atomic per row. Unqualified
// columns in DO UPDATE refer to the existing row.
const UPSERT: &str = r"
INSERT INTO entitlements (device_id, plan, status, expires_at, customer_id, updated_at)
VALUES (
    ?1,
    COALESCE(?2, 'free'),
    COALESCE(?3, 'inactive'),
    CASE WHEN ?4 THEN ?5 ELSE NULL END,
    ?6,
    ?7
)
ON CONFLICT(device_id) DO UPDATE SET
    plan        = COALESCE(?2, plan),
    status      = COALESCE(?3, status),
    expires_at  = CASE WHEN ?4 THEN ?5 ELSE expires_at END,
    customer_id = COALESCE(?6, customer_id),
    updated_at  = ?7
RETURNING device_id, plan, status, expires_at, customer_id";

const SELECT: &str = r"
SELECT device_id, plan, status, expires_at, customer_id
FROM entitlements
WHERE device_id = ?1";

/// SQLite-backed entitlement store
#[derive(Clone)]
pub struct SqliteEntitlementStore {
    pool: SqlitePool,
}

impl SqliteEntitlementStore {
    /// Connect and make sure the table exists.
    ///
    /// `url` is any sqlx SQLite URL, e.g. `sqlite://entitlements.db?mode=rwc`
    /// or `sqlite::memory:`.
    pub async fn open(url: &str) -> Result<Self> {
        // In-memory databases are per connection, so keep exactly one.
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        sqlx::query(CREATE_TABLE).execute(&pool).await?;

        tracing::info!(url = %url, "Opened entitlement store");

        Ok(Self { pool })
    }
}

fn record_from_row(row: &SqliteRow) -> Result<EntitlementRecord> {
    let plan: String = row.try_get("plan")?;
    let status: String = row.try_get("status")?;

    Ok(EntitlementRecord {
        device_id: row.try_get("device_id")?,
        plan: plan
            .parse()
            .map_err(|_| SyncError::Storage(format!("unknown plan '{plan}' in store")))?,
        status: status.parse()?,
        expires_at: row.try_get("expires_at")?,
        customer_id: row.try_get("customer_id")?,
    })
}

#[async_trait]
impl EntitlementStore for SqliteEntitlementStore {
    async fn get(&self, device_id: &str) -> Result<Option<EntitlementRecord>> {
        let row = sqlx::query(SELECT)
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    async fn upsert(&self, device_id: &str, patch: &EntitlementPatch) -> Result<EntitlementRecord> {
        let row = sqlx::query(UPSERT)
            .bind(device_id)
            .bind(patch.plan.map(|p| p.as_str()))
            .bind(patch.status.map(|s| s.as_str()))
            .bind(patch.expires_at.is_some())
            .bind(patch.expires_at.flatten())
            .bind(patch.customer_id.as_deref())
            .bind(chrono::Utc::now().timestamp_millis())
            .fetch_one(&self.pool)
            .await?;

        record_from_row(&row)
    }

    async fn close(&self) {
        self.pool.close().await;
        tracing::info!("Closed entitlement store");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::entitlement::{EntitlementStatus, EntitlementView, Plan};

    async fn memory_store() -> SqliteEntitlementStore {
        SqliteEntitlementStore::open("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_get_missing_device() {
        let store = memory_store().await;
        assert!(store.get("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_round_trip() {
        let store = memory_store().await;
        let written = store
            .upsert(
                "abc",
                &EntitlementPatch::subscription(
                    Plan::Monthly,
                    EntitlementStatus::Trialing,
                    Some(1_700_000_000_000),
                    Some("cus_1".into()),
                ),
            )
            .await
            .unwrap();

        let read = store.get("abc").await.unwrap().unwrap();
        assert_eq!(written, read);
        assert_eq!(read.plan, Plan::Monthly);
        assert_eq!(read.expires_at, Some(1_700_000_000_000));
    }

    #[tokio::test]
    async fn test_status_only_patch_keeps_other_fields() {
        let store = memory_store().await;
        store
            .upsert(
                "abc",
                &EntitlementPatch::subscription(
                    Plan::Monthly,
                    EntitlementStatus::Trialing,
                    Some(1_700_000_000_000),
                    Some("cus_1".into()),
                ),
            )
            .await
            .unwrap();

        let record = store
            .upsert("abc", &EntitlementPatch::status_only(EntitlementStatus::Inactive))
            .await
            .unwrap();

        assert_eq!(
            record,
            EntitlementRecord {
                device_id: "abc".into(),
                plan: Plan::Monthly,
                status: EntitlementStatus::Inactive,
                expires_at: Some(1_700_000_000_000),
                customer_id: Some("cus_1".into()),
            }
        );
    }

    #[tokio::test]
    async fn test_soft_reset_clears_expiry_and_keeps_customer() {
        let store = memory_store().await;
        store
            .upsert(
                "abc",
                &EntitlementPatch::subscription(
                    Plan::Yearly,
                    EntitlementStatus::Active,
                    Some(99),
                    Some("cus_9".into()),
                ),
            )
            .await
            .unwrap();

        let record = store.upsert("abc", &EntitlementPatch::soft_reset()).await.unwrap();

        assert_eq!(record.view(), EntitlementView::default());
        assert_eq!(record.customer_id.as_deref(), Some("cus_9"));
    }

    #[tokio::test]
    async fn test_insert_from_partial_patch_uses_defaults() {
        let store = memory_store().await;
        let record = store
            .upsert("fresh", &EntitlementPatch::status_only(EntitlementStatus::Inactive))
            .await
            .unwrap();

        assert_eq!(record, EntitlementRecord::unknown("fresh"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_patches_never_interleave() {
        let path = std::env::temp_dir().join(format!(
            "entitlements-race-{}-{}.db",
            std::process::id(),
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        let store = Arc::new(
            SqliteEntitlementStore::open(&format!("sqlite://{}?mode=rwc", path.display()))
                .await
                .unwrap(),
        );

        let renewal = EntitlementPatch::subscription(
            Plan::Yearly,
            EntitlementStatus::Active,
            Some(1_800_000_000_000),
            Some("cus_2".into()),
        );
        let reset = EntitlementPatch::soft_reset();
        let renewal_last = EntitlementView {
            plan: Plan::Yearly,
            status: EntitlementStatus::Active,
            expires_at: Some(1_800_000_000_000),
        };

        for i in 0..50 {
            let device = format!("dev-{i}");
            store
                .upsert(
                    &device,
                    &EntitlementPatch::subscription(
                        Plan::Monthly,
                        EntitlementStatus::Trialing,
                        Some(1_700_000_000_000),
                        Some("cus_1".into()),
                    ),
                )
                .await
                .unwrap();

            let first = tokio::spawn({
                let (store, device, patch) = (store.clone(), device.clone(), renewal.clone());
                async move { store.upsert(&device, &patch).await }
            });
            let second = tokio::spawn({
                let (store, device, patch) = (store.clone(), device.clone(), reset.clone());
                async move { store.upsert(&device, &patch).await }
            });
            first.await.unwrap().unwrap();
            second.await.unwrap().unwrap();

            let record = store.get(&device).await.unwrap().unwrap();
            let view = record.view();
            assert!(
                view == renewal_last || view == EntitlementView::default(),
                "interleaved write for {device}: {record:?}"
            );
            assert_eq!(record.customer_id.as_deref(), Some("cus_2"));
        }

        store.close().await;
        let _ = std::fs::remove_file(&path);
    }
}
