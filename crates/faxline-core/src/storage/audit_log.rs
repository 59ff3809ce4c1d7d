//! Repository for the append-only transmission audit log.

use std::sync::Arc;

use sqlx::{Executor, PgPool, Postgres, Transaction};

use crate::{
    error::Result,
    models::{AuditLogEntry, TransmissionId},
};

/// Repository for audit log operations.
///
/// Entries are never updated or deleted.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Appends an entry.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn append(&self, entry: &AuditLogEntry) -> Result<()> {
        self.append_impl(&*self.pool, entry).await
    }

    /// Appends an entry within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn append_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        entry: &AuditLogEntry,
    ) -> Result<()> {
        self.append_impl(&mut **tx, entry).await
    }

    async fn append_impl<'e, E>(&self, executor: E, entry: &AuditLogEntry) -> Result<()>
    where
        E: Executor<'e, Database = Postgres>,
    {
        sqlx::query(
            r"
            INSERT INTO transmission_audit_log (
                id, transmission_id, recorded_at, level, message, details
            ) VALUES ($1, $2, $3, $4, $5, $6)
            ",
        )
        .bind(entry.id)
        .bind(entry.transmission_id)
        .bind(entry.recorded_at)
        .bind(entry.level)
        .bind(&entry.message)
        .bind(&entry.details)
        .execute(executor)
        .await?;

        Ok(())
    }

    /// Lists entries for a transmission, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_transmission(&self, id: TransmissionId) -> Result<Vec<AuditLogEntry>> {
        let entries = sqlx::query_as::<_, AuditLogEntry>(
            r"
            SELECT id, transmission_id, recorded_at, level, message, details
            FROM transmission_audit_log
            WHERE transmission_id = $1
            ORDER BY recorded_at ASC, seq ASC
            ",
        )
        .bind(id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(entries)
    }
}
