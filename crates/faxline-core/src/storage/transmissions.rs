//! Repository for transmission records.
//!
//! Writes are conditional: an update only lands if the row still carries the
//! status and retry count the caller read. Every lifecycle write changes at
//! least one of the two, so the pair works as a version.

use std::sync::Arc;

use sqlx::{Executor, PgPool, Postgres, Transaction};

use crate::{
    error::Result,
    models::{Transmission, TransmissionId, TransmissionStatus},
};

const COLUMNS: &str = r"
    id, direction, status, sender, recipient,
    artifact_ref, artifact_size, artifact_sha256,
    pages, duration_seconds, baud_rate, ecm_used, call_ref,
    queued_at, started_at, completed_at,
    error_code, error_message, retry_count, retry_limit, cost, updated_at
";

/// State a conditional write expects to find.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpectedState {
    /// Status read before computing the transition.
    pub status: TransmissionStatus,
    /// Retry count read before computing the transition.
    pub retry_count: i32,
}

impl ExpectedState {
    /// Captures the version of a freshly read transmission.
    pub const fn of(tx: &Transmission) -> Self {
        Self { status: tx.status, retry_count: tx.retry_count }
    }
}

/// Repository for transmission database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Inserts a new transmission.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails or the id already exists.
    pub async fn insert(&self, transmission: &Transmission) -> Result<()> {
        self.insert_impl(&*self.pool, transmission).await
    }

    /// Inserts a transmission within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn insert_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        transmission: &Transmission,
    ) -> Result<()> {
        self.insert_impl(&mut **tx, transmission).await
    }

    async fn insert_impl<'e, E>(&self, executor: E, t: &Transmission) -> Result<()>
    where
        E: Executor<'e, Database = Postgres>,
    {
        sqlx::query(
            r"
            INSERT INTO transmissions (
                id, direction, status, sender, recipient,
                artifact_ref, artifact_size, artifact_sha256,
                pages, duration_seconds, baud_rate, ecm_used, call_ref,
                queued_at, started_at, completed_at,
                error_code, error_message, retry_count, retry_limit, cost, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11,
                $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22
            )
            ",
        )
        .bind(t.id)
        .bind(t.direction)
        .bind(t.status)
        .bind(&t.sender)
        .bind(&t.recipient)
        .bind(&t.artifact.reference)
        .bind(t.artifact.size_bytes)
        .bind(&t.artifact.sha256)
        .bind(t.pages)
        .bind(t.duration_seconds)
        .bind(t.baud_rate)
        .bind(t.ecm_used)
        .bind(&t.call_ref)
        .bind(t.queued_at)
        .bind(t.started_at)
        .bind(t.completed_at)
        .bind(&t.error_code)
        .bind(&t.error_message)
        .bind(t.retry_count)
        .bind(t.retry_limit)
        .bind(t.cost)
        .bind(t.updated_at)
        .execute(executor)
        .await?;

        Ok(())
    }

    /// Finds a transmission by ID.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, id: TransmissionId) -> Result<Option<Transmission>> {
        let query = format!("SELECT {COLUMNS} FROM transmissions WHERE id = $1");
        let transmission = sqlx::query_as::<_, Transmission>(&query)
            .bind(id)
            .fetch_optional(&*self.pool)
            .await?;

        Ok(transmission)
    }

    /// Finds the transmission whose current attempt carries the given gateway
    /// call reference.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_call_ref(&self, call_ref: &str) -> Result<Option<Transmission>> {
        let query = format!(
            "SELECT {COLUMNS} FROM transmissions WHERE call_ref = $1 ORDER BY updated_at DESC LIMIT 1"
        );
        let transmission = sqlx::query_as::<_, Transmission>(&query)
            .bind(call_ref)
            .fetch_optional(&*self.pool)
            .await?;

        Ok(transmission)
    }

    /// Overwrites the mutable columns if the row still matches `expected`.
    ///
    /// Returns `false` when another writer got there first.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn update_if_unchanged_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        t: &Transmission,
        expected: ExpectedState,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE transmissions
            SET status = $4, pages = $5, duration_seconds = $6, baud_rate = $7,
                ecm_used = $8, call_ref = $9, started_at = $10, completed_at = $11,
                error_code = $12, error_message = $13, retry_count = $14,
                cost = $15, updated_at = $16
            WHERE id = $1 AND status = $2 AND retry_count = $3
            ",
        )
        .bind(t.id)
        .bind(expected.status)
        .bind(expected.retry_count)
        .bind(t.status)
        .bind(t.pages)
        .bind(t.duration_seconds)
        .bind(t.baud_rate)
        .bind(t.ecm_used)
        .bind(&t.call_ref)
        .bind(t.started_at)
        .bind(t.completed_at)
        .bind(&t.error_code)
        .bind(&t.error_message)
        .bind(t.retry_count)
        .bind(t.cost)
        .bind(t.updated_at)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
