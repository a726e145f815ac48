//! Database connection pool, migrations, and health check.
//!
//! Shared Postgres connection pool used by the lease operations and the
//! read-only query interface.

pub mod items;
pub mod lease;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::error::Result;
use crate::model::{StageState, WorkItem};

/// Database handle. Owns the connection pool shared across all modules.
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| crate::error::Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// Simple health check — run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Get a reference to the connection pool (for submodules).
    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Column list matching [`WorkItemRow`], shared by every query that
/// returns whole items.
pub(crate) const ITEM_COLUMNS: &str = "id, metadata, \
     download_status, download_leased_by, download_leased_at, download_payload, download_error, \
     upload_status, upload_leased_by, upload_leased_at, upload_payload, upload_error, \
     created_at, updated_at";

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
pub(crate) struct WorkItemRow {
    id: String,
    metadata: serde_json::Value,
    download_status: String,
    download_leased_by: Option<String>,
    download_leased_at: Option<DateTime<Utc>>,
    download_payload: Option<serde_json::Value>,
    download_error: Option<String>,
    upload_status: String,
    upload_leased_by: Option<String>,
    upload_leased_at: Option<DateTime<Utc>>,
    upload_payload: Option<serde_json::Value>,
    upload_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl WorkItemRow {
    pub(crate) fn try_into_work_item(self) -> Result<WorkItem> {
        Ok(WorkItem {
            id: self.id,
            metadata: self.metadata,
            download: StageState {
                status: self.download_status.parse()?,
                leased_by: self.download_leased_by,
                leased_at: self.download_leased_at,
                payload: self.download_payload,
                error: self.download_error,
            },
            upload: StageState {
                status: self.upload_status.parse()?,
                leased_by: self.upload_leased_by,
                leased_at: self.upload_leased_at,
                payload: self.upload_payload,
                error: self.upload_error,
            },
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
