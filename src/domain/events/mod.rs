//! Domain events
use crate::domain::aggregates::{CallCenterStatus, DeliveryStatus};
use crate::domain::value_objects::Money;
use serde::Serialize;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrderEvent {
    Placed { order_id: Uuid, order_number: String, total: Money },
    StatusChanged { order_id: Uuid, from: CallCenterStatus, to: CallCenterStatus },
    ShipmentCreated { order_id: Uuid, tracking: String },
    ShipmentFailed { order_id: Uuid, reason: String },
    DeliveryChanged { order_id: Uuid, from: DeliveryStatus, to: DeliveryStatus },
    ItemsChanged { order_id: Uuid, subtotal: Money, total: Money },
}

impl OrderEvent {
    pub fn order_id(&self) -> Uuid {
        match self {
            Self::Placed { order_id, .. }
            | Self::StatusChanged { order_id, .. }
            | Self::ShipmentCreated { order_id, .. }
            | Self::ShipmentFailed { order_id, .. }
            | Self::DeliveryChanged { order_id, .. }
            | Self::ItemsChanged { order_id, .. } => *order_id,
        }
    }

    /// Subject suffix used when publishing, e.g. `orders.shipment_created`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Placed { .. } => "placed",
            Self::StatusChanged { .. } => "status_changed",
            Self::ShipmentCreated { .. } => "shipment_created",
            Self::ShipmentFailed { .. } => "shipment_failed",
            Self::DeliveryChanged { .. } => "delivery_changed",
            Self::ItemsChanged { .. } => "items_changed",
        }
    }
}
