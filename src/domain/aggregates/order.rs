//! Order Aggregate

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::domain::aggregates::status::{CallCenterStatus, CommunicationStatus, DeliveryStatus};
use crate::domain::events::OrderEvent;
use crate::domain::value_objects::{Money, OrderNumber, Quantity};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Order {
    pub(crate) id: Uuid,
    pub(crate) order_number: OrderNumber,
    pub(crate) customer: Customer,
    pub(crate) delivery: DeliverySelection,
    pub(crate) destination: Destination,
    pub(crate) items: Vec<OrderItem>,
    pub(crate) subtotal: Money,
    pub(crate) delivery_fee: Money,
    pub(crate) total: Money,
    pub(crate) notes: String,
    pub(crate) tracking_number: Option<String>,
    pub(crate) carrier_shipment_id: Option<String>,
    pub(crate) call_center_status: CallCenterStatus,
    pub(crate) delivery_status: DeliveryStatus,
    pub(crate) communication_status: Option<CommunicationStatus>,
    pub(crate) version: i64,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub(crate) events: Vec<OrderEvent>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer { pub name: String, pub phone: String, pub email: Option<String> }

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination { pub region_id: i64, pub region_name: String, pub sub_region: Option<String> }

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryType { HomeDelivery, Pickup }

/// Where the parcel goes: a street address, or a carrier desk the customer collects from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliverySelection {
    HomeDelivery { address: String },
    Pickup { desk_id: i64, desk_name: String },
}

impl DeliverySelection {
    pub fn delivery_type(&self) -> DeliveryType {
        match self {
            Self::HomeDelivery { .. } => DeliveryType::HomeDelivery,
            Self::Pickup { .. } => DeliveryType::Pickup,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub(crate) id: Uuid,
    pub(crate) product_id: String,
    pub(crate) product_name: String,
    pub(crate) variant: Option<String>,
    pub(crate) quantity: Quantity,
    pub(crate) unit_price: Money,
}

impl OrderItem {
    /// `unit_price` is the catalog price at the moment the item is added; it never changes afterwards.
    pub fn new(product_id: impl Into<String>, product_name: impl Into<String>, variant: Option<String>, quantity: Quantity, unit_price: Money) -> Result<Self, OrderError> {
        if unit_price.is_negative() { return Err(OrderError::NegativeAmount("unit_price")); }
        Ok(Self {
            id: Uuid::now_v7(), product_id: product_id.into(), product_name: product_name.into(),
            variant, quantity, unit_price,
        })
    }

    pub fn id(&self) -> Uuid { self.id }
    pub fn product_id(&self) -> &str { &self.product_id }
    pub fn product_name(&self) -> &str { &self.product_name }
    pub fn variant(&self) -> Option<&str> { self.variant.as_deref() }
    pub fn quantity(&self) -> Quantity { self.quantity }
    pub fn unit_price(&self) -> Money { self.unit_price }
    /// `None` when unit_price × quantity does not fit a `Decimal`.
    pub fn line_total(&self) -> Option<Money> { self.unit_price.checked_times(self.quantity) }
}

impl Order {
    pub fn place(customer: Customer, delivery: DeliverySelection, destination: Destination, delivery_fee: Money, items: Vec<OrderItem>) -> Result<Self, OrderError> {
        if items.is_empty() { return Err(OrderError::NoItems); }
        if delivery_fee.is_negative() { return Err(OrderError::NegativeAmount("delivery_fee")); }
        if customer.name.trim().is_empty() { return Err(OrderError::MissingField("customer.name")); }
        match &delivery {
            DeliverySelection::HomeDelivery { address } if address.trim().is_empty() => {
                return Err(OrderError::MissingField("delivery.address"));
            }
            DeliverySelection::Pickup { desk_name, .. } if desk_name.trim().is_empty() => {
                return Err(OrderError::MissingField("delivery.desk_name"));
            }
            _ => {}
        }
        let now = Utc::now();
        let mut order = Self {
            id: Uuid::now_v7(), order_number: OrderNumber::generate(now), customer, delivery, destination,
            items, subtotal: Money::ZERO, delivery_fee, total: Money::ZERO, notes: String::new(),
            tracking_number: None, carrier_shipment_id: None,
            call_center_status: CallCenterStatus::New, delivery_status: DeliveryStatus::NotReady,
            communication_status: None, version: 0, created_at: now, updated_at: now, events: vec![],
        };
        order.recalculate_totals()?;
        order.raise_event(OrderEvent::Placed { order_id: order.id, order_number: order.order_number.to_string(), total: order.total });
        Ok(order)
    }

    pub fn id(&self) -> Uuid { self.id }
    pub fn order_number(&self) -> &OrderNumber { &self.order_number }
    pub fn customer(&self) -> &Customer { &self.customer }
    pub fn delivery(&self) -> &DeliverySelection { &self.delivery }
    pub fn destination(&self) -> &Destination { &self.destination }
    pub fn items(&self) -> &[OrderItem] { &self.items }
    pub fn subtotal(&self) -> Money { self.subtotal }
    pub fn delivery_fee(&self) -> Money { self.delivery_fee }
    pub fn total(&self) -> Money { self.total }
    pub fn notes(&self) -> &str { &self.notes }
    pub fn tracking_number(&self) -> Option<&str> { self.tracking_number.as_deref() }
    pub fn carrier_shipment_id(&self) -> Option<&str> { self.carrier_shipment_id.as_deref() }
    pub fn call_center_status(&self) -> CallCenterStatus { self.call_center_status }
    pub fn delivery_status(&self) -> DeliveryStatus { self.delivery_status }
    pub fn communication_status(&self) -> Option<CommunicationStatus> { self.communication_status }
    pub fn version(&self) -> i64 { self.version }
    pub fn created_at(&self) -> DateTime<Utc> { self.created_at }
    pub fn updated_at(&self) -> DateTime<Utc> { self.updated_at }

    /// subtotal = Σ unit_price × quantity, total = subtotal + delivery_fee.
    /// On overflow nothing is written.
    pub fn recalculate_totals(&mut self) -> Result<(), OrderError> {
        let (subtotal, total) = totals(&self.items, self.delivery_fee)?;
        self.subtotal = subtotal;
        self.total = total;
        self.touch();
        Ok(())
    }

    /// Appends `\n[TAG] text` with the tag trimmed and upper-cased and the text trimmed.
    /// Earlier notes are never rewritten.
    pub fn append_note(&mut self, tag: &str, text: &str) {
        self.notes.push_str(&format!("\n[{}] {}", tag.trim().to_uppercase(), text.trim()));
        self.touch();
    }

    pub fn add_item(&mut self, item: OrderItem) -> Result<(), OrderError> {
        self.edit_items(|items| {
            items.push(item);
            Ok(())
        })
    }

    pub fn update_item_quantity(&mut self, item_id: Uuid, quantity: Quantity) -> Result<(), OrderError> {
        self.edit_items(|items| {
            let item = items.iter_mut().find(|i| i.id == item_id).ok_or(OrderError::ItemNotFound(item_id))?;
            item.quantity = quantity;
            Ok(())
        })
    }

    pub fn remove_item(&mut self, item_id: Uuid) -> Result<(), OrderError> {
        self.edit_items(|items| {
            let before = items.len();
            items.retain(|i| i.id != item_id);
            if items.len() == before { return Err(OrderError::ItemNotFound(item_id)); }
            Ok(())
        })
    }

    pub fn confirm(&mut self) -> Result<(), OrderError> {
        self.move_call_center(CallCenterStatus::Confirmed)?;
        self.append_note("CONFIRMED", "order confirmed by call center");
        Ok(())
    }

    pub fn cancel(&mut self, reason: &str) -> Result<(), OrderError> {
        self.move_call_center(CallCenterStatus::Canceled)?;
        self.append_note("CANCELED", reason);
        Ok(())
    }

    pub fn mark_no_response(&mut self, notes: Option<&str>) -> Result<(), OrderError> {
        self.move_call_center(CallCenterStatus::NoResponse)?;
        if let Some(text) = notes.filter(|t| !t.trim().is_empty()) {
            self.append_note("NO_RESPONSE", text);
        }
        Ok(())
    }

    /// Free-form write of PENDING, DOUBLE_ORDER or DELAYED.
    pub fn set_status(&mut self, status: CallCenterStatus) -> Result<(), OrderError> {
        if !status.is_free_form() { return Err(OrderError::NotFreeForm(status)); }
        self.move_call_center(status)
    }

    /// An order carries at most one carrier parcel; an existing tracking number is never replaced.
    pub fn record_shipment(&mut self, tracking: String, shipment_id: String) -> Result<(), OrderError> {
        if let Some(existing) = &self.tracking_number {
            return Err(OrderError::AlreadyShipped(existing.clone()));
        }
        self.append_note("SHIPMENT", &format!("carrier parcel created, tracking {tracking}"));
        self.raise_event(OrderEvent::ShipmentCreated { order_id: self.id, tracking: tracking.clone() });
        self.tracking_number = Some(tracking);
        self.carrier_shipment_id = Some(shipment_id);
        Ok(())
    }

    /// A second parcel was created while another confirmation already recorded one.
    pub fn record_duplicate_shipment(&mut self, orphan: &str) {
        let kept = self.tracking_number.clone().unwrap_or_default();
        self.append_note("SHIPMENT_DUPLICATE", &format!("carrier parcel {orphan} not attached, order keeps {kept}"));
        self.raise_event(OrderEvent::ShipmentFailed { order_id: self.id, reason: format!("duplicate carrier parcel {orphan}") });
    }

    /// Leaves the order unshipped; delivery stays where it was.
    pub fn record_shipment_failure(&mut self, reason: &str) {
        self.append_note("SHIPMENT_FAILED", reason);
        self.raise_event(OrderEvent::ShipmentFailed { order_id: self.id, reason: reason.to_string() });
    }

    pub fn mark_ready(&mut self) -> Result<(), OrderError> {
        self.move_delivery(DeliveryStatus::Ready, "ready for dispatch")
    }

    pub fn start_delivery(&mut self) -> Result<(), OrderError> {
        self.move_delivery(DeliveryStatus::InTransit, "delivery started")
    }

    pub fn complete_delivery(&mut self) -> Result<(), OrderError> {
        self.move_delivery(DeliveryStatus::Done, "delivery completed")
    }

    pub fn set_communication_status(&mut self, status: Option<CommunicationStatus>) {
        self.communication_status = status;
        self.touch();
    }

    pub fn take_events(&mut self) -> Vec<OrderEvent> { std::mem::take(&mut self.events) }

    fn move_call_center(&mut self, next: CallCenterStatus) -> Result<(), OrderError> {
        let from = self.call_center_status;
        if !from.can_transition_to(next) {
            return Err(OrderError::InvalidTransition { axis: "call_center", from: from.as_str(), to: next.as_str() });
        }
        self.call_center_status = next;
        self.touch();
        self.raise_event(OrderEvent::StatusChanged { order_id: self.id, from, to: next });
        Ok(())
    }

    fn move_delivery(&mut self, next: DeliveryStatus, note: &str) -> Result<(), OrderError> {
        if self.call_center_status != CallCenterStatus::Confirmed {
            return Err(OrderError::NotConfirmed(self.call_center_status));
        }
        let from = self.delivery_status;
        if !from.can_transition_to(next) {
            return Err(OrderError::InvalidTransition { axis: "delivery", from: from.as_str(), to: next.as_str() });
        }
        self.delivery_status = next;
        self.append_note(next.as_str(), note);
        self.raise_event(OrderEvent::DeliveryChanged { order_id: self.id, from, to: next });
        Ok(())
    }

    fn ensure_editable(&self) -> Result<(), OrderError> {
        if self.call_center_status == CallCenterStatus::Canceled { return Err(OrderError::Canceled); }
        Ok(())
    }

    /// Applies `edit` to a copy of the lines and commits only if the new totals fit.
    fn edit_items(&mut self, edit: impl FnOnce(&mut Vec<OrderItem>) -> Result<(), OrderError>) -> Result<(), OrderError> {
        self.ensure_editable()?;
        let mut items = self.items.clone();
        edit(&mut items)?;
        let (subtotal, total) = totals(&items, self.delivery_fee)?;
        self.items = items;
        self.subtotal = subtotal;
        self.total = total;
        self.touch();
        self.raise_event(OrderEvent::ItemsChanged { order_id: self.id, subtotal, total });
        Ok(())
    }

    fn raise_event(&mut self, e: OrderEvent) { self.events.push(e); }
    fn touch(&mut self) { self.updated_at = Utc::now(); }
}

fn totals(items: &[OrderItem], delivery_fee: Money) -> Result<(Money, Money), OrderError> {
    let subtotal = items
        .iter()
        .try_fold(Money::ZERO, |acc, item| acc.checked_add(item.line_total()?))
        .ok_or(OrderError::AmountOutOfRange("subtotal"))?;
    let total = subtotal.checked_add(delivery_fee).ok_or(OrderError::AmountOutOfRange("total"))?;
    Ok((subtotal, total))
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrderError {
    #[error("order must contain at least one item")]
    NoItems,
    #[error("{0} must not be negative")]
    NegativeAmount(&'static str),
    #[error("{0} is required")]
    MissingField(&'static str),
    #[error("item not found: {0}")]
    ItemNotFound(Uuid),
    #[error("invalid {axis} transition from {from} to {to}")]
    InvalidTransition { axis: &'static str, from: &'static str, to: &'static str },
    #[error("delivery status requires a CONFIRMED order, current status is {0}")]
    NotConfirmed(CallCenterStatus),
    #[error("{0} cannot be set directly")]
    NotFreeForm(CallCenterStatus),
    #[error("order is canceled")]
    Canceled,
    #[error("{0} is out of range")]
    AmountOutOfRange(&'static str),
    #[error("order already has carrier parcel {0}")]
    AlreadyShipped(String),
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn item(price: i64, qty: u32) -> OrderItem {
        OrderItem::new("P1", "Widget", None, Quantity::new(qty).unwrap(), Money::from_major(price)).unwrap()
    }

    pub(crate) fn sample_order() -> Order {
        Order::place(
            Customer { name: "Amina Benali".into(), phone: "0551234567".into(), email: None },
            DeliverySelection::HomeDelivery { address: "12 rue Didouche Mourad".into() },
            Destination { region_id: 16, region_name: "Alger".into(), sub_region: Some("Hydra".into()) },
            Money::from_major(300),
            vec![item(1000, 2), item(500, 1)],
        ).unwrap()
    }

    fn assert_totals_hold(order: &Order) {
        let expected = order.items().iter().try_fold(Money::ZERO, |acc, i| acc.checked_add(i.line_total()?)).unwrap();
        assert_eq!(order.subtotal(), expected);
        assert_eq!(Some(order.total()), order.subtotal().checked_add(order.delivery_fee()));
    }

    #[test]
    fn test_placement_totals_and_removal() {
        let mut order = sample_order();
        assert_eq!(order.subtotal(), Money::from_major(2500));
        assert_eq!(order.total(), Money::from_major(2800));
        let single = order.items()[1].id();
        order.remove_item(single).unwrap();
        assert_eq!(order.subtotal(), Money::from_major(2000));
        assert_eq!(order.total(), Money::from_major(2300));
    }

    #[test]
    fn test_every_item_mutation_keeps_totals() {
        let mut order = sample_order();
        order.add_item(item(250, 4)).unwrap();
        assert_totals_hold(&order);
        let first = order.items()[0].id();
        order.update_item_quantity(first, Quantity::new(5).unwrap()).unwrap();
        assert_totals_hold(&order);
        assert_eq!(order.subtotal(), Money::from_major(5000 + 500 + 1000));
        let missing = Uuid::now_v7();
        assert_eq!(order.remove_item(missing), Err(OrderError::ItemNotFound(missing)));
        assert_totals_hold(&order);
    }

    #[test]
    fn test_recalculate_is_idempotent() {
        let mut order = sample_order();
        order.recalculate_totals().unwrap();
        let (s, t) = (order.subtotal(), order.total());
        order.recalculate_totals().unwrap();
        assert_eq!((order.subtotal(), order.total()), (s, t));
    }

    #[test]
    fn test_notes_append_in_order() {
        let mut order = sample_order();
        order.append_note("a", "first");
        order.append_note("B", "second");
        order.append_note("c", "third");
        assert_eq!(order.notes(), "\n[A] first\n[B] second\n[C] third");
        order.append_note(" call ", "  ring back at noon ");
        assert!(order.notes().ends_with("\n[CALL] ring back at noon"));
    }

    #[test]
    fn test_overflowing_amounts_are_rejected() {
        let max = Money::new(rust_decimal::Decimal::MAX);
        let huge = OrderItem::new("P9", "Vault", None, Quantity::new(2).unwrap(), max).unwrap();
        let customer = Customer { name: "X".into(), phone: "0551234567".into(), email: None };
        let dest = Destination { region_id: 16, region_name: "Alger".into(), sub_region: None };
        let home = DeliverySelection::HomeDelivery { address: "1 rue".into() };
        let placed = Order::place(customer, home, dest, Money::ZERO, vec![huge.clone()]);
        assert_eq!(placed.unwrap_err(), OrderError::AmountOutOfRange("subtotal"));

        let mut order = sample_order();
        let before = (order.items().len(), order.subtotal(), order.total());
        assert_eq!(order.add_item(huge), Err(OrderError::AmountOutOfRange("subtotal")));
        assert_eq!((order.items().len(), order.subtotal(), order.total()), before);
        assert!(order.take_events().iter().all(|e| !matches!(e, OrderEvent::ItemsChanged { .. })));
    }

    #[test]
    fn test_recorded_shipment_is_never_replaced() {
        let mut order = sample_order();
        order.record_shipment("T1".into(), "S1".into()).unwrap();
        order.take_events();
        assert_eq!(order.record_shipment("T0".into(), "S0".into()), Err(OrderError::AlreadyShipped("T1".into())));
        assert_eq!(order.tracking_number(), Some("T1"));
        assert_eq!(order.carrier_shipment_id(), Some("S1"));
        assert!(order.take_events().is_empty());

        order.record_duplicate_shipment("T0");
        assert!(order.notes().ends_with("[SHIPMENT_DUPLICATE] carrier parcel T0 not attached, order keeps T1"));
        assert_eq!(order.tracking_number(), Some("T1"));
    }

    #[test]
    fn test_delivery_requires_confirmation() {
        let mut order = sample_order();
        assert_eq!(order.mark_ready(), Err(OrderError::NotConfirmed(CallCenterStatus::New)));
        order.confirm().unwrap();
        order.mark_ready().unwrap();
        assert!(matches!(order.complete_delivery(), Err(OrderError::InvalidTransition { axis: "delivery", .. })));
        order.start_delivery().unwrap();
        order.complete_delivery().unwrap();
        assert_eq!(order.delivery_status(), DeliveryStatus::Done);
        assert!(order.notes().contains("[DONE] delivery completed"));
    }

    #[test]
    fn test_call_center_transitions() {
        let mut order = sample_order();
        order.set_status(CallCenterStatus::Delayed).unwrap();
        assert_eq!(order.set_status(CallCenterStatus::Confirmed), Err(OrderError::NotFreeForm(CallCenterStatus::Confirmed)));
        order.mark_no_response(Some("rang twice")).unwrap();
        order.confirm().unwrap();
        assert!(matches!(order.confirm(), Err(OrderError::InvalidTransition { .. })));
        order.cancel("customer changed mind").unwrap();
        assert!(matches!(order.confirm(), Err(OrderError::InvalidTransition { axis: "call_center", from: "CANCELED", .. })));
        assert_eq!(order.add_item(item(10, 1)), Err(OrderError::Canceled));
        assert!(order.notes().ends_with("[CANCELED] customer changed mind"));
    }

    #[test]
    fn test_place_rejects_bad_shapes() {
        let customer = Customer { name: "X".into(), phone: "0551234567".into(), email: None };
        let dest = Destination { region_id: 1, region_name: "Adrar".into(), sub_region: None };
        let home = DeliverySelection::HomeDelivery { address: " ".into() };
        assert_eq!(Order::place(customer.clone(), home, dest.clone(), Money::ZERO, vec![item(1, 1)]).unwrap_err(), OrderError::MissingField("delivery.address"));
        let desk = DeliverySelection::Pickup { desk_id: 7, desk_name: "Adrar desk".into() };
        assert_eq!(Order::place(customer, desk, dest, Money::ZERO, vec![]).unwrap_err(), OrderError::NoItems);
    }

    #[test]
    fn test_events_drained_once() {
        let mut order = sample_order();
        order.confirm().unwrap();
        let events = order.take_events();
        assert_eq!(events.len(), 2);
        assert!(order.take_events().is_empty());
    }
}
