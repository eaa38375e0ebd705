use async_trait::async_trait;
use thiserror::Error;

use self::entities::{Entity, EntityKey, EntityKind};

pub mod backoff;
pub mod client;
pub mod entities;
pub mod memory;
pub mod nbctl;
pub mod ovsdb_json;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// database unreachable, lock contention, timeout
    #[error("Transient northbound database error: {}", .0)]
    Transient(String),
    /// schema or constraint violation
    #[error("Northbound database rejected the operation: {}", .0)]
    Permanent(String),
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Transient(_))
    }
}

/// Raw access to the northbound database. Implementations don't retry and
/// don't serialize anything; [`client::DbClient`] does.
#[async_trait]
pub trait NorthboundTransport: Send + Sync {
    async fn fetch(&self, key: &EntityKey) -> Result<Option<Entity>, TransportError>;
    /// Creates the entity or rewrites it to exactly `entity`.
    async fn apply(&self, entity: &Entity) -> Result<(), TransportError>;
    /// Removes the entity together with everything that lives in it.
    async fn remove(&self, key: &EntityKey) -> Result<(), TransportError>;
    async fn list(&self, kind: EntityKind) -> Result<Vec<Entity>, TransportError>;
}
