//! In-memory store for tests and database-free runs.
//!
//! Mirrors the semantics of [`Storage`](super::Storage): conditional
//! transition writes, atomic audit appends and endpoint health updates. Clones
//! share state, so a lifecycle manager and a delivery dispatcher can observe
//! each other's writes.

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::ExpectedState;
use crate::{
    error::{CoreError, Result},
    models::{AuditLogEntry, DeliveryEndpoint, EndpointId, Transmission, TransmissionId},
};

#[derive(Default)]
struct MemoryState {
    transmissions: HashMap<TransmissionId, Transmission>,
    audit_log: Vec<AuditLogEntry>,
    endpoints: HashMap<EndpointId, DeliveryEndpoint>,
}

/// Shared in-memory store.
///
/// Supports injecting a one-shot write failure to exercise error paths.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
    write_error: Arc<RwLock<Option<String>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next write operation fail with `CoreError::Database`.
    pub async fn inject_write_error(&self, error: impl Into<String>) {
        *self.write_error.write().await = Some(error.into());
    }

    async fn take_write_error(&self) -> Result<()> {
        match self.write_error.write().await.take() {
            Some(error) => Err(CoreError::Database(error)),
            None => Ok(()),
        }
    }

    /// Inserts a new transmission and its first audit entry.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ConstraintViolation` if the id already exists.
    pub async fn insert_transmission(
        &self,
        transmission: &Transmission,
        entry: &AuditLogEntry,
    ) -> Result<()> {
        self.take_write_error().await?;

        let mut state = self.state.write().await;
        if state.transmissions.contains_key(&transmission.id) {
            return Err(CoreError::ConstraintViolation(format!(
                "transmission {} already exists",
                transmission.id
            )));
        }
        state.transmissions.insert(transmission.id, transmission.clone());
        state.audit_log.push(entry.clone());

        Ok(())
    }

    /// Finds a transmission by ID.
    ///
    /// # Errors
    ///
    /// Never fails; the signature matches the database store.
    pub async fn find_transmission(&self, id: TransmissionId) -> Result<Option<Transmission>> {
        Ok(self.state.read().await.transmissions.get(&id).cloned())
    }

    /// Finds the transmission currently carrying `call_ref`.
    ///
    /// # Errors
    ///
    /// Never fails; the signature matches the database store.
    pub async fn find_by_call_ref(&self, call_ref: &str) -> Result<Option<Transmission>> {
        let state = self.state.read().await;
        let found = state
            .transmissions
            .values()
            .filter(|t| t.call_ref.as_deref() == Some(call_ref))
            .max_by_key(|t| t.updated_at)
            .cloned();

        Ok(found)
    }

    /// Writes a transition and its audit entries if the stored row still
    /// matches `expected`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` for unknown ids, or an injected error.
    pub async fn commit_transition(
        &self,
        transmission: &Transmission,
        expected: ExpectedState,
        entries: &[AuditLogEntry],
    ) -> Result<bool> {
        self.take_write_error().await?;

        let mut state = self.state.write().await;
        let stored = state
            .transmissions
            .get_mut(&transmission.id)
            .ok_or_else(|| CoreError::NotFound(format!("transmission {}", transmission.id)))?;

        if ExpectedState::of(stored) != expected {
            return Ok(false);
        }
        *stored = transmission.clone();
        state.audit_log.extend_from_slice(entries);

        Ok(true)
    }

    /// Appends a standalone audit entry.
    ///
    /// # Errors
    ///
    /// Returns an injected error, if any.
    pub async fn append_audit(&self, entry: &AuditLogEntry) -> Result<()> {
        self.take_write_error().await?;
        self.state.write().await.audit_log.push(entry.clone());
        Ok(())
    }

    /// Returns audit entries for a transmission in append order.
    ///
    /// # Errors
    ///
    /// Never fails; the signature matches the database store.
    pub async fn audit_entries(&self, id: TransmissionId) -> Result<Vec<AuditLogEntry>> {
        let state = self.state.read().await;
        Ok(state.audit_log.iter().filter(|e| e.transmission_id == id).cloned().collect())
    }

    /// Registers an endpoint.
    pub async fn add_endpoint(&self, endpoint: DeliveryEndpoint) {
        self.state.write().await.endpoints.insert(endpoint.id, endpoint);
    }

    /// Finds an endpoint by ID.
    ///
    /// # Errors
    ///
    /// Never fails; the signature matches the database store.
    pub async fn find_endpoint(&self, id: EndpointId) -> Result<Option<DeliveryEndpoint>> {
        Ok(self.state.read().await.endpoints.get(&id).cloned())
    }

    /// Lists active endpoints, oldest registration first.
    ///
    /// # Errors
    ///
    /// Never fails; the signature matches the database store.
    pub async fn active_endpoints(&self) -> Result<Vec<DeliveryEndpoint>> {
        let state = self.state.read().await;
        let mut endpoints: Vec<_> =
            state.endpoints.values().filter(|e| e.is_active).cloned().collect();
        endpoints.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        Ok(endpoints)
    }

    /// Resets an endpoint's failure counter.
    ///
    /// # Errors
    ///
    /// Returns an injected error, if any.
    pub async fn record_endpoint_success(&self, id: EndpointId, at: DateTime<Utc>) -> Result<()> {
        self.take_write_error().await?;
        if let Some(endpoint) = self.state.write().await.endpoints.get_mut(&id) {
            endpoint.consecutive_failures = 0;
            endpoint.last_success_at = Some(at);
        }
        Ok(())
    }

    /// Increments an endpoint's failure counter and returns the new value.
    ///
    /// # Errors
    ///
    /// Returns an injected error, if any.
    pub async fn record_endpoint_failure(
        &self,
        id: EndpointId,
        at: DateTime<Utc>,
    ) -> Result<Option<i32>> {
        self.take_write_error().await?;
        let mut state = self.state.write().await;
        Ok(state.endpoints.get_mut(&id).map(|endpoint| {
            endpoint.consecutive_failures = endpoint.consecutive_failures.saturating_add(1);
            endpoint.last_failure_at = Some(at);
            endpoint.consecutive_failures
        }))
    }
}
