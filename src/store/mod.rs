//! Order persistence.
//!
//! Writes are optimistic: [`OrderStore::update`] only succeeds when the stored
//! version still matches the version the caller read, so two staff actions on
//! the same order can never silently overwrite each other.

mod memory;
mod postgres;

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::aggregates::{CallCenterStatus, DeliveryStatus, Order};

pub use memory::MemoryOrderStore;
pub use postgres::PgOrderStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("order {0} does not exist")]
    NotFound(Uuid),

    #[error("order {id} was modified concurrently (expected version {expected})")]
    Conflict { id: Uuid, expected: i64 },

    #[error("order {0} already exists")]
    Duplicate(Uuid),

    #[error("stored order is unreadable: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Default)]
pub struct OrderFilter {
    pub call_center_status: Option<CallCenterStatus>,
    pub delivery_status: Option<DeliveryStatus>,
    pub limit: u32,
    pub offset: u32,
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn insert(&self, order: &Order) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Order>, StoreError>;

    /// Persists `order` if the stored version equals `order.version()`, then bumps the stored version by one.
    async fn update(&self, order: &Order) -> Result<(), StoreError>;

    /// Newest first.
    async fn list(&self, filter: &OrderFilter) -> Result<Vec<Order>, StoreError>;
}
