//! Aggregates module
pub mod order;
pub mod status;

pub use order::{Customer, DeliverySelection, DeliveryType, Destination, Order, OrderError, OrderItem};
pub use status::{CallCenterStatus, CommunicationStatus, DeliveryStatus, UnknownStatus};
