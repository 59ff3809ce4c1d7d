//! Repository for webhook endpoint registrations.
//!
//! Registration itself is an external concern; this module reads active
//! subscriptions and maintains the advisory health columns.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres};

use crate::{
    error::Result,
    models::{DeliveryEndpoint, EndpointId},
};

/// Repository for endpoint database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Registers an endpoint.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails or the id already exists.
    pub async fn create(&self, endpoint: &DeliveryEndpoint) -> Result<EndpointId> {
        let id = sqlx::query_scalar::<Postgres, EndpointId>(
            r"
            INSERT INTO delivery_endpoints (
                id, url, secret, on_received, on_sent, on_failed, is_active,
                consecutive_failures, last_success_at, last_failure_at, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING id
            ",
        )
        .bind(endpoint.id)
        .bind(&endpoint.url)
        .bind(&endpoint.secret)
        .bind(endpoint.on_received)
        .bind(endpoint.on_sent)
        .bind(endpoint.on_failed)
        .bind(endpoint.is_active)
        .bind(endpoint.consecutive_failures)
        .bind(endpoint.last_success_at)
        .bind(endpoint.last_failure_at)
        .bind(endpoint.created_at)
        .fetch_one(&*self.pool)
        .await?;

        Ok(id)
    }

    /// Finds an endpoint by ID.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, id: EndpointId) -> Result<Option<DeliveryEndpoint>> {
        let endpoint = sqlx::query_as::<_, DeliveryEndpoint>(
            r"
            SELECT id, url, secret, on_received, on_sent, on_failed, is_active,
                   consecutive_failures, last_success_at, last_failure_at, created_at
            FROM delivery_endpoints
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(endpoint)
    }

    /// Lists active endpoints, oldest registration first.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_active(&self) -> Result<Vec<DeliveryEndpoint>> {
        let endpoints = sqlx::query_as::<_, DeliveryEndpoint>(
            r"
            SELECT id, url, secret, on_received, on_sent, on_failed, is_active,
                   consecutive_failures, last_success_at, last_failure_at, created_at
            FROM delivery_endpoints
            WHERE is_active = true
            ORDER BY created_at ASC, id ASC
            ",
        )
        .fetch_all(&*self.pool)
        .await?;

        Ok(endpoints)
    }

    /// Resets the failure counter after a successful delivery.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn record_success(&self, id: EndpointId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r"
            UPDATE delivery_endpoints
            SET consecutive_failures = 0, last_success_at = $2
            WHERE id = $1
            ",
        )
        .bind(id)
        .bind(at)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Increments the failure counter and returns its new value.
    ///
    /// Returns `None` if the endpoint no longer exists.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn record_failure(&self, id: EndpointId, at: DateTime<Utc>) -> Result<Option<i32>> {
        let failures = sqlx::query_scalar::<Postgres, i32>(
            r"
            UPDATE delivery_endpoints
            SET consecutive_failures = consecutive_failures + 1, last_failure_at = $2
            WHERE id = $1
            RETURNING consecutive_failures
            ",
        )
        .bind(id)
        .bind(at)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(failures)
    }
}
