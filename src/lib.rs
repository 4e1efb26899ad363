//! OpenSASE Fulfillment
//!
//! Post-purchase order handling for a cash-on-delivery storefront.
//!
//! ## Features
//! - Order aggregate with line items and a `total == subtotal + delivery_fee` invariant
//! - Independent call-center, delivery and communication status axes
//! - Carrier integration: parcel creation, tracking, reference data, rate tables
//! - Shipping fee rules (billable weight, overweight and COD surcharges)
//! - Optimistic concurrency on every order write

use thiserror::Error;
use uuid::Uuid;

pub mod api;
pub mod carrier;
pub mod config;
pub mod domain;
pub mod fees;
pub mod lifecycle;
pub mod publisher;
pub mod store;

pub use carrier::{CarrierError, CarrierGateway, HttpCarrierClient, MockCarrier};
pub use config::AppConfig;
pub use domain::aggregates::{
    CallCenterStatus, CommunicationStatus, DeliverySelection, DeliveryStatus, Order, OrderItem,
};
pub use lifecycle::{Confirmation, LifecycleConfig, NewItem, NewOrder, OrderLifecycle, ShipmentAttempt};
pub use store::{MemoryOrderStore, OrderStore, PgOrderStore};

// =============================================================================
// Error Types
// =============================================================================

#[derive(Error, Debug)]
pub enum FulfillmentError {
    #[error("Order not found: {0}")]
    OrderNotFound(Uuid),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Transition rejected: {0}")]
    InvalidTransition(String),

    #[error("Order {0} is being modified concurrently, try again")]
    Conflict(Uuid),

    #[error("Carrier is not configured")]
    CarrierNotConfigured,

    #[error("Carrier unavailable: {0}")]
    CarrierUnavailable(String),

    #[error("Carrier rejected parcel: {0}")]
    CarrierRejected(String),

    #[error("Storage error: {0}")]
    StorageError(String),
}

pub type Result<T> = std::result::Result<T, FulfillmentError>;

impl From<domain::aggregates::OrderError> for FulfillmentError {
    fn from(e: domain::aggregates::OrderError) -> Self {
        use domain::aggregates::OrderError::*;
        match e {
            ItemNotFound(id) => Self::NotFound(format!("item {id}")),
            NoItems | NegativeAmount(_) | MissingField(_) | AmountOutOfRange(_) => Self::Validation(e.to_string()),
            InvalidTransition { .. } | NotConfirmed(_) | NotFreeForm(_) | Canceled | AlreadyShipped(_) => {
                Self::InvalidTransition(e.to_string())
            }
        }
    }
}

impl From<CarrierError> for FulfillmentError {
    fn from(e: CarrierError) -> Self {
        match e {
            CarrierError::NotConfigured => Self::CarrierNotConfigured,
            CarrierError::Unavailable(reason) => Self::CarrierUnavailable(reason),
            CarrierError::Rejected(reason) => Self::CarrierRejected(reason),
            CarrierError::NotFound(what) => Self::NotFound(format!("carrier record {what}")),
        }
    }
}

impl From<store::StoreError> for FulfillmentError {
    fn from(e: store::StoreError) -> Self {
        match e {
            store::StoreError::NotFound(id) => Self::OrderNotFound(id),
            store::StoreError::Conflict { id, .. } => Self::Conflict(id),
            other => Self::StorageError(other.to_string()),
        }
    }
}
