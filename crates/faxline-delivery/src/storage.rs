//! Storage abstraction for the delivery dispatcher.
//!
//! The dispatcher only touches endpoint health columns and appends audit
//! entries. It never writes transmission state.

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use faxline_core::{
    error::Result, AuditLogEntry, DeliveryEndpoint, EndpointId, MemoryStore, Storage,
};

/// Boxed future returned by storage operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Storage operations required by the dispatcher.
pub trait DeliveryStorage: Send + Sync + 'static {
    /// Loads an endpoint's current health columns.
    fn find_endpoint(&self, id: EndpointId) -> StoreFuture<'_, Option<DeliveryEndpoint>>;

    /// Resets the failure counter and stamps the success time.
    fn record_endpoint_success(&self, id: EndpointId, at: DateTime<Utc>) -> StoreFuture<'_, ()>;

    /// Increments the failure counter, returning the new value.
    fn record_endpoint_failure(
        &self,
        id: EndpointId,
        at: DateTime<Utc>,
    ) -> StoreFuture<'_, Option<i32>>;

    /// Appends an audit entry to a transmission.
    fn append_audit(&self, entry: AuditLogEntry) -> StoreFuture<'_, ()>;
}

/// Production storage implementation using PostgreSQL.
pub struct PostgresDeliveryStorage {
    storage: Arc<Storage>,
}

impl PostgresDeliveryStorage {
    /// Creates a new PostgreSQL storage adapter.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

impl DeliveryStorage for PostgresDeliveryStorage {
    fn find_endpoint(&self, id: EndpointId) -> StoreFuture<'_, Option<DeliveryEndpoint>> {
        Box::pin(async move { self.storage.endpoints.find_by_id(id).await })
    }

    fn record_endpoint_success(&self, id: EndpointId, at: DateTime<Utc>) -> StoreFuture<'_, ()> {
        Box::pin(async move { self.storage.endpoints.record_success(id, at).await })
    }

    fn record_endpoint_failure(
        &self,
        id: EndpointId,
        at: DateTime<Utc>,
    ) -> StoreFuture<'_, Option<i32>> {
        Box::pin(async move { self.storage.endpoints.record_failure(id, at).await })
    }

    fn append_audit(&self, entry: AuditLogEntry) -> StoreFuture<'_, ()> {
        Box::pin(async move { self.storage.audit_log.append(&entry).await })
    }
}

impl DeliveryStorage for MemoryStore {
    fn find_endpoint(&self, id: EndpointId) -> StoreFuture<'_, Option<DeliveryEndpoint>> {
        Box::pin(MemoryStore::find_endpoint(self, id))
    }

    fn record_endpoint_success(&self, id: EndpointId, at: DateTime<Utc>) -> StoreFuture<'_, ()> {
        Box::pin(MemoryStore::record_endpoint_success(self, id, at))
    }

    fn record_endpoint_failure(
        &self,
        id: EndpointId,
        at: DateTime<Utc>,
    ) -> StoreFuture<'_, Option<i32>> {
        Box::pin(MemoryStore::record_endpoint_failure(self, id, at))
    }

    fn append_audit(&self, entry: AuditLogEntry) -> StoreFuture<'_, ()> {
        Box::pin(async move { MemoryStore::append_audit(self, &entry).await })
    }
}
