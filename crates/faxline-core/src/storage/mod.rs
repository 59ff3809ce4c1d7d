//! Database access layer implementing the repository pattern for transmission
//! persistence.
//!
//! All database operations go through these repositories. Operations that
//! touch several tables (a transition plus its audit entries) live on
//! [`Storage`] so they share one database transaction.

use std::sync::Arc;

use sqlx::PgPool;

pub mod audit_log;
pub mod endpoints;
pub mod memory;
pub mod transmissions;

pub use memory::MemoryStore;
pub use transmissions::ExpectedState;

use crate::{
    error::Result,
    models::{AuditLogEntry, Transmission},
};

const SCHEMA: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS transmissions (
        id UUID PRIMARY KEY,
        direction TEXT NOT NULL,
        status TEXT NOT NULL,
        sender TEXT NOT NULL,
        recipient TEXT NOT NULL,
        artifact_ref TEXT NOT NULL,
        artifact_size BIGINT NOT NULL DEFAULT 0,
        artifact_sha256 TEXT NOT NULL DEFAULT '',
        pages INTEGER NOT NULL DEFAULT 0,
        duration_seconds INTEGER NOT NULL DEFAULT 0,
        baud_rate INTEGER NOT NULL DEFAULT 14400,
        ecm_used BOOLEAN NOT NULL DEFAULT false,
        call_ref TEXT,
        queued_at TIMESTAMPTZ NOT NULL,
        started_at TIMESTAMPTZ,
        completed_at TIMESTAMPTZ,
        error_code TEXT,
        error_message TEXT,
        retry_count INTEGER NOT NULL DEFAULT 0,
        retry_limit INTEGER NOT NULL DEFAULT 3,
        cost NUMERIC(10, 4) NOT NULL DEFAULT 0,
        updated_at TIMESTAMPTZ NOT NULL,
        CONSTRAINT transmissions_retry_bounds CHECK (retry_count >= 0 AND retry_count <= retry_limit)
    )
    ",
    "CREATE INDEX IF NOT EXISTS transmissions_call_ref_idx ON transmissions (call_ref)",
    r"
    CREATE TABLE IF NOT EXISTS transmission_audit_log (
        seq BIGSERIAL,
        id UUID PRIMARY KEY,
        transmission_id UUID NOT NULL REFERENCES transmissions (id),
        recorded_at TIMESTAMPTZ NOT NULL,
        level TEXT NOT NULL,
        message TEXT NOT NULL,
        details JSONB
    )
    ",
    "CREATE INDEX IF NOT EXISTS transmission_audit_log_tx_idx ON transmission_audit_log (transmission_id, recorded_at)",
    r"
    CREATE TABLE IF NOT EXISTS delivery_endpoints (
        id UUID PRIMARY KEY,
        url TEXT NOT NULL,
        secret TEXT NOT NULL,
        on_received BOOLEAN NOT NULL DEFAULT true,
        on_sent BOOLEAN NOT NULL DEFAULT true,
        on_failed BOOLEAN NOT NULL DEFAULT true,
        is_active BOOLEAN NOT NULL DEFAULT true,
        consecutive_failures INTEGER NOT NULL DEFAULT 0,
        last_success_at TIMESTAMPTZ,
        last_failure_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL
    )
    ",
];

/// Container for all repository instances providing unified database access.
#[derive(Clone)]
pub struct Storage {
    /// Repository for transmission records.
    pub transmissions: Arc<transmissions::Repository>,

    /// Repository for the audit log.
    pub audit_log: Arc<audit_log::Repository>,

    /// Repository for webhook endpoints.
    pub endpoints: Arc<endpoints::Repository>,

    pool: Arc<PgPool>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            transmissions: Arc::new(transmissions::Repository::new(pool.clone())),
            audit_log: Arc::new(audit_log::Repository::new(pool.clone())),
            endpoints: Arc::new(endpoints::Repository::new(pool.clone())),
            pool,
        }
    }

    /// Performs a health check on the database connection.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.pool).await?;

        Ok(())
    }

    /// Creates the tables this crate needs if they do not exist yet.
    ///
    /// # Errors
    ///
    /// Returns error if any DDL statement fails.
    pub async fn migrate(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;

        tracing::info!(statements = SCHEMA.len(), "schema migration applied");
        Ok(())
    }

    /// Inserts a new transmission and its first audit entry atomically.
    ///
    /// # Errors
    ///
    /// Returns error if either insert fails; neither is then persisted.
    pub async fn insert_transmission(
        &self,
        transmission: &Transmission,
        entry: &AuditLogEntry,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        self.transmissions.insert_in_tx(&mut tx, transmission).await?;
        self.audit_log.append_in_tx(&mut tx, entry).await?;
        tx.commit().await?;

        Ok(())
    }

    /// Persists a transition together with its audit entries.
    ///
    /// Returns `false` without writing anything if the stored row no longer
    /// matches `expected`.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction fails; nothing is then persisted.
    pub async fn commit_transition(
        &self,
        transmission: &Transmission,
        expected: ExpectedState,
        entries: &[AuditLogEntry],
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        if !self.transmissions.update_if_unchanged_in_tx(&mut tx, transmission, expected).await? {
            tx.rollback().await?;
            return Ok(false);
        }

        for entry in entries {
            self.audit_log.append_in_tx(&mut tx, entry).await?;
        }
        tx.commit().await?;

        Ok(true)
    }
}
