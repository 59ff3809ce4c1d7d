//! Storage abstraction for the lifecycle manager.
//!
//! Production uses [`PostgresLifecycleStorage`] over the core repositories;
//! tests and database-free runs use the core `MemoryStore`, which implements
//! the same trait.

use std::{future::Future, pin::Pin, sync::Arc};

use faxline_core::{
    error::Result,
    models::{AuditLogEntry, DeliveryEndpoint, Transmission, TransmissionId},
    storage::{ExpectedState, MemoryStore, Storage},
};

/// Boxed future returned by storage operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Storage operations required by the lifecycle manager.
pub trait LifecycleStorage: Send + Sync + 'static {
    /// Inserts a new transmission together with its first audit entry.
    fn insert_transmission(
        &self,
        transmission: Transmission,
        entry: AuditLogEntry,
    ) -> StoreFuture<'_, ()>;

    /// Finds a transmission by ID.
    fn find_transmission(&self, id: TransmissionId) -> StoreFuture<'_, Option<Transmission>>;

    /// Finds the transmission whose current attempt has this gateway call id.
    fn find_by_call_ref(&self, call_ref: String) -> StoreFuture<'_, Option<Transmission>>;

    /// Persists a transition and its audit entries atomically, provided the
    /// stored row still matches `expected`. Returns `false` on conflict.
    fn commit_transition(
        &self,
        transmission: Transmission,
        expected: ExpectedState,
        entries: Vec<AuditLogEntry>,
    ) -> StoreFuture<'_, bool>;

    /// Lists active webhook endpoints.
    fn active_endpoints(&self) -> StoreFuture<'_, Vec<DeliveryEndpoint>>;

    /// Lists audit entries for a transmission, oldest first.
    fn audit_entries(&self, id: TransmissionId) -> StoreFuture<'_, Vec<AuditLogEntry>>;
}

/// Production storage implementation using PostgreSQL.
pub struct PostgresLifecycleStorage {
    storage: Arc<Storage>,
}

impl PostgresLifecycleStorage {
    /// Creates a new PostgreSQL storage adapter.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

impl LifecycleStorage for PostgresLifecycleStorage {
    fn insert_transmission(
        &self,
        transmission: Transmission,
        entry: AuditLogEntry,
    ) -> StoreFuture<'_, ()> {
        Box::pin(async move { self.storage.insert_transmission(&transmission, &entry).await })
    }

    fn find_transmission(&self, id: TransmissionId) -> StoreFuture<'_, Option<Transmission>> {
        Box::pin(async move { self.storage.transmissions.find_by_id(id).await })
    }

    fn find_by_call_ref(&self, call_ref: String) -> StoreFuture<'_, Option<Transmission>> {
        Box::pin(async move { self.storage.transmissions.find_by_call_ref(&call_ref).await })
    }

    fn commit_transition(
        &self,
        transmission: Transmission,
        expected: ExpectedState,
        entries: Vec<AuditLogEntry>,
    ) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            self.storage.commit_transition(&transmission, expected, &entries).await
        })
    }

    fn active_endpoints(&self) -> StoreFuture<'_, Vec<DeliveryEndpoint>> {
        Box::pin(async move { self.storage.endpoints.find_active().await })
    }

    fn audit_entries(&self, id: TransmissionId) -> StoreFuture<'_, Vec<AuditLogEntry>> {
        Box::pin(async move { self.storage.audit_log.find_by_transmission(id).await })
    }
}

impl LifecycleStorage for MemoryStore {
    fn insert_transmission(
        &self,
        transmission: Transmission,
        entry: AuditLogEntry,
    ) -> StoreFuture<'_, ()> {
        Box::pin(async move { MemoryStore::insert_transmission(self, &transmission, &entry).await })
    }

    fn find_transmission(&self, id: TransmissionId) -> StoreFuture<'_, Option<Transmission>> {
        Box::pin(MemoryStore::find_transmission(self, id))
    }

    fn find_by_call_ref(&self, call_ref: String) -> StoreFuture<'_, Option<Transmission>> {
        Box::pin(async move { MemoryStore::find_by_call_ref(self, &call_ref).await })
    }

    fn commit_transition(
        &self,
        transmission: Transmission,
        expected: ExpectedState,
        entries: Vec<AuditLogEntry>,
    ) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            MemoryStore::commit_transition(self, &transmission, expected, &entries).await
        })
    }

    fn active_endpoints(&self) -> StoreFuture<'_, Vec<DeliveryEndpoint>> {
        Box::pin(MemoryStore::active_endpoints(self))
    }

    fn audit_entries(&self, id: TransmissionId) -> StoreFuture<'_, Vec<AuditLogEntry>> {
        Box::pin(MemoryStore::audit_entries(self, id))
    }
}
