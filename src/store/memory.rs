use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{OrderFilter, OrderStore, StoreError};
use crate::domain::aggregates::Order;

/// Process-local store, used when no database is configured and in tests.
#[derive(Default)]
pub struct MemoryOrderStore {
    orders: RwLock<HashMap<Uuid, Order>>,
}

impl MemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn detached(order: &Order) -> Order {
    let mut stored = order.clone();
    stored.events.clear();
    stored
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn insert(&self, order: &Order) -> Result<(), StoreError> {
        let mut orders = self.orders.write().await;
        if orders.contains_key(&order.id()) {
            return Err(StoreError::Duplicate(order.id()));
        }
        orders.insert(order.id(), detached(order));
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Order>, StoreError> {
        Ok(self.orders.read().await.get(&id).cloned())
    }

    async fn update(&self, order: &Order) -> Result<(), StoreError> {
        let mut orders = self.orders.write().await;
        let current = orders.get_mut(&order.id()).ok_or(StoreError::NotFound(order.id()))?;
        if current.version != order.version() {
            return Err(StoreError::Conflict { id: order.id(), expected: order.version() });
        }
        let mut stored = detached(order);
        stored.version += 1;
        *current = stored;
        Ok(())
    }

    async fn list(&self, filter: &OrderFilter) -> Result<Vec<Order>, StoreError> {
        let orders = self.orders.read().await;
        let mut matching: Vec<Order> = orders
            .values()
            .filter(|o| filter.call_center_status.map_or(true, |s| o.call_center_status() == s))
            .filter(|o| filter.delivery_status.map_or(true, |s| o.delivery_status() == s))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at().cmp(&a.created_at()));
        Ok(matching
            .into_iter()
            .skip(filter.offset as usize)
            .take(filter.limit as usize)
            .collect())
    }
}
