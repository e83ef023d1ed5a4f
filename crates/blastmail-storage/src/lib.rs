//! Persistence gateway contract + Postgres and in-memory implementations.

use std::collections::HashSet;

use anyhow::Context;
use async_trait::async_trait;
use blastmail_core::{CategoryKey, CategoryRecord, NewRecipient, RecipientRecord};
use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "blastmail-storage";

#[derive(Debug, Error)]
pub enum GatewayError {
    /// A unique index rejected the write; the caller should refetch and reuse.
    #[error("unique index conflict")]
    Conflict,
    /// The store cannot be reached at all. Fatal for the remaining work.
    #[error("persistence store unavailable: {0}")]
    Unavailable(anyhow::Error),
    /// The store refused the operation for a reason other than the indexes.
    #[error("persistence store rejected operation: {0}")]
    Rejected(String),
}

/// Outcome of a best-effort batch: non-conflicting records commit, records
/// that lost to the email unique index come back as `conflicts`.
#[derive(Debug, Clone, Default)]
pub struct BulkInsertOutcome {
    pub inserted_count: usize,
    pub conflicts: Vec<String>,
}

/// Category lookup/creation and bulk recipient insertion, as consumed by the
/// import engine. The store's unique indexes on `(user_id, category key)` and
/// on `email` are the authority under concurrency; the engine's own
/// check-then-act sequence is not atomic and does not need to be.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn find_category(
        &self,
        user_id: Uuid,
        key: &CategoryKey,
    ) -> Result<Option<CategoryRecord>, GatewayError>;

    /// Fails with [`GatewayError::Conflict`] when a concurrent import already
    /// created a category with the same key for this user.
    async fn create_category(
        &self,
        user_id: Uuid,
        name: &str,
        description: &str,
    ) -> Result<CategoryRecord, GatewayError>;

    async fn bulk_insert_recipients(
        &self,
        records: &[NewRecipient],
    ) -> Result<BulkInsertOutcome, GatewayError>;
}

/// Postgres-backed gateway. Uses runtime queries; the unique indexes created
/// by [`PgGateway::ensure_schema`] carry the dedup invariants.
#[derive(Debug, Clone)]
pub struct PgGateway {
    pool: PgPool,
}

impl PgGateway {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await
            .with_context(|| format!("connecting to {database_url}"))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the tables and the two authoritative unique indexes: one per
    /// user on the folded category name, one global on recipient email.
    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS categories (
                id UUID PRIMARY KEY,
                user_id UUID NOT NULL,
                name TEXT NOT NULL,
                description TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("creating categories table")?;

        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS categories_user_folded_name_idx
                ON categories (user_id, lower(btrim(name)))
            "#,
        )
        .execute(&self.pool)
        .await
        .context("creating category key index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS recipients (
                id UUID PRIMARY KEY,
                user_id UUID NOT NULL,
                name TEXT NOT NULL,
                email TEXT NOT NULL,
                category_id UUID NOT NULL REFERENCES categories (id),
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("creating recipients table")?;

        // Email uniqueness is global across users, mirroring the persisted
        // schema this engine was built against.
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS recipients_email_idx
                ON recipients (email)
            "#,
        )
        .execute(&self.pool)
        .await
        .context("creating recipient email index")?;

        Ok(())
    }
}

fn map_sqlx_error(err: sqlx::Error) -> GatewayError {
    // 23505 is Postgres' unique_violation; everything hitting an index
    // surfaces as a benign conflict.
    if let sqlx::Error::Database(db) = &err {
        if db.code().as_deref() == Some("23505") {
            return GatewayError::Conflict;
        }
    }
    match err {
        lost @ (sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed) => GatewayError::Unavailable(lost.into()),
        other => GatewayError::Rejected(other.to_string()),
    }
}

fn category_from_row(row: &sqlx::postgres::PgRow) -> Result<CategoryRecord, GatewayError> {
    Ok(CategoryRecord {
        id: row.try_get("id").map_err(map_sqlx_error)?,
        user_id: row.try_get("user_id").map_err(map_sqlx_error)?,
        name: row.try_get("name").map_err(map_sqlx_error)?,
        description: row.try_get("description").map_err(map_sqlx_error)?,
        created_at: row.try_get("created_at").map_err(map_sqlx_error)?,
        updated_at: row.try_get("updated_at").map_err(map_sqlx_error)?,
    })
}

#[async_trait]
impl PersistenceGateway for PgGateway {
    async fn find_category(
        &self,
        user_id: Uuid,
        key: &CategoryKey,
    ) -> Result<Option<CategoryRecord>, GatewayError> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, name, description, created_at, updated_at
              FROM categories
             WHERE user_id = $1
               AND lower(btrim(name)) = $2
            "#,
        )
        .bind(user_id)
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        row.as_ref().map(category_from_row).transpose()
    }

    async fn create_category(
        &self,
        user_id: Uuid,
        name: &str,
        description: &str,
    ) -> Result<CategoryRecord, GatewayError> {
        let now = Utc::now();
        let record = CategoryRecord {
            id: Uuid::new_v4(),
            user_id,
            name: name.to_string(),
            description: description.to_string(),
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO categories (id, user_id, name, description, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(record.id)
        .bind(record.user_id)
        .bind(&record.name)
        .bind(&record.description)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(record)
    }

    async fn bulk_insert_recipients(
        &self,
        records: &[NewRecipient],
    ) -> Result<BulkInsertOutcome, GatewayError> {
        let mut outcome = BulkInsertOutcome::default();

        // Per-record inserts so one conflicting email never rejects the rest
        // of the batch. `rows_affected == 0` means the email index won.
        for record in records {
            let result = sqlx::query(
                r#"
                INSERT INTO recipients (id, user_id, name, email, category_id, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (email) DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(record.user_id)
            .bind(&record.name)
            .bind(&record.email)
            .bind(record.category_id)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

            if result.rows_affected() == 0 {
                warn!(email = %record.email, "recipient email already present, skipping");
                outcome.conflicts.push(record.email.clone());
            } else {
                outcome.inserted_count += 1;
            }
        }

        Ok(outcome)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    categories: Vec<CategoryRecord>,
    recipients: Vec<RecipientRecord>,
    unavailable: bool,
    poisoned_category_names: HashSet<String>,
}

/// In-memory gateway enforcing the same unique indexes as Postgres, with
/// failure injection for the partial-failure tests.
#[derive(Debug, Default)]
pub struct MemoryGateway {
    state: Mutex<MemoryState>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate total loss of the store; every call fails `Unavailable`.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.unavailable = unavailable;
    }

    /// Make creation of this category name fail with a rejection.
    pub async fn poison_category_name(&self, name: &str) {
        self.state
            .lock()
            .await
            .poisoned_category_names
            .insert(name.to_string());
    }

    pub async fn categories(&self) -> Vec<CategoryRecord> {
        self.state.lock().await.categories.clone()
    }

    pub async fn recipients(&self) -> Vec<RecipientRecord> {
        self.state.lock().await.recipients.clone()
    }
}

fn unavailable() -> GatewayError {
    GatewayError::Unavailable(anyhow::anyhow!("in-memory store marked unavailable"))
}

#[async_trait]
impl PersistenceGateway for MemoryGateway {
    async fn find_category(
        &self,
        user_id: Uuid,
        key: &CategoryKey,
    ) -> Result<Option<CategoryRecord>, GatewayError> {
        let state = self.state.lock().await;
        if state.unavailable {
            return Err(unavailable());
        }
        Ok(state
            .categories
            .iter()
            .find(|c| c.user_id == user_id && CategoryKey::normalize(&c.name) == *key)
            .cloned())
    }

    async fn create_category(
        &self,
        user_id: Uuid,
        name: &str,
        description: &str,
    ) -> Result<CategoryRecord, GatewayError> {
        let mut state = self.state.lock().await;
        if state.unavailable {
            return Err(unavailable());
        }
        if state.poisoned_category_names.contains(name) {
            return Err(GatewayError::Rejected(format!(
                "category validation failed for {name:?}"
            )));
        }
        let key = CategoryKey::normalize(name);
        if state
            .categories
            .iter()
            .any(|c| c.user_id == user_id && CategoryKey::normalize(&c.name) == key)
        {
            return Err(GatewayError::Conflict);
        }
        let now = Utc::now();
        let record = CategoryRecord {
            id: Uuid::new_v4(),
            user_id,
            name: name.to_string(),
            description: description.to_string(),
            created_at: now,
            updated_at: now,
        };
        state.categories.push(record.clone());
        Ok(record)
    }

    async fn bulk_insert_recipients(
        &self,
        records: &[NewRecipient],
    ) -> Result<BulkInsertOutcome, GatewayError> {
        let mut state = self.state.lock().await;
        if state.unavailable {
            return Err(unavailable());
        }
        let mut outcome = BulkInsertOutcome::default();
        for record in records {
            if state.recipients.iter().any(|r| r.email == record.email) {
                outcome.conflicts.push(record.email.clone());
                continue;
            }
            state.recipients.push(RecipientRecord {
                id: Uuid::new_v4(),
                user_id: record.user_id,
                name: record.name.clone(),
                email: record.email.clone(),
                category_id: record.category_id,
                created_at: Utc::now(),
            });
            outcome.inserted_count += 1;
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> Uuid {
        Uuid::new_v4()
    }

    fn recipient(user_id: Uuid, category_id: Uuid, email: &str) -> NewRecipient {
        NewRecipient {
            user_id,
            name: "Someone".into(),
            email: email.into(),
            category_id,
        }
    }

    #[tokio::test]
    async fn create_then_find_roundtrips_through_the_key() {
        let gateway = MemoryGateway::new();
        let user_id = user();
        let created = gateway
            .create_category(user_id, "Sales", "quarterly leads")
            .await
            .expect("create");

        let found = gateway
            .find_category(user_id, &CategoryKey::normalize(" SALES "))
            .await
            .expect("find");
        assert_eq!(found.map(|c| c.id), Some(created.id));
    }

    #[tokio::test]
    async fn duplicate_key_create_conflicts_per_user_only() {
        let gateway = MemoryGateway::new();
        let user_a = user();
        let user_b = user();
        gateway
            .create_category(user_a, "Sales", "a")
            .await
            .expect("first create");

        let same_user = gateway.create_category(user_a, " sales ", "b").await;
        assert!(matches!(same_user, Err(GatewayError::Conflict)));

        // The index is scoped per user; another user may hold the same name.
        gateway
            .create_category(user_b, "Sales", "c")
            .await
            .expect("cross-user create");
    }

    #[tokio::test]
    async fn bulk_insert_commits_non_conflicting_records() {
        let gateway = MemoryGateway::new();
        let user_id = user();
        let category = gateway
            .create_category(user_id, "Sales", "")
            .await
            .expect("create");

        let first = gateway
            .bulk_insert_recipients(&[recipient(user_id, category.id, "a@example.com")])
            .await
            .expect("first batch");
        assert_eq!(first.inserted_count, 1);

        let second = gateway
            .bulk_insert_recipients(&[
                recipient(user_id, category.id, "a@example.com"),
                recipient(user_id, category.id, "b@example.com"),
            ])
            .await
            .expect("second batch");
        assert_eq!(second.inserted_count, 1);
        assert_eq!(second.conflicts, vec!["a@example.com".to_string()]);
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let gateway = MemoryGateway::new();
        gateway.set_unavailable(true).await;
        let err = gateway
            .find_category(user(), &CategoryKey::normalize("sales"))
            .await
            .expect_err("should fail");
        assert!(matches!(err, GatewayError::Unavailable(_)));
    }
}
