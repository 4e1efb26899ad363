//! Order lifecycle controller.
//!
//! Every operation loads the order, applies one aggregate method and writes it
//! back through the optimistic store, reloading and reapplying on a version
//! conflict. Carrier calls happen between writes, never inside one.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::carrier::{
    self, CarrierError, CarrierGateway, ParcelContext, PickupCenter, Region, Shipment, ShipmentEvent, ShipmentOutcome, SubRegion,
};
use crate::domain::aggregates::{
    CallCenterStatus, CommunicationStatus, Customer, DeliverySelection, Destination, Order, OrderError, OrderItem,
};
use crate::domain::value_objects::{Money, Quantity};
use crate::fees::{self, Package, QuoteError, ShippingQuote};
use crate::publisher::EventPublisher;
use crate::store::{OrderFilter, OrderStore, StoreError};
use crate::{FulfillmentError, Result};

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Extra attempts after a version conflict before giving up.
    pub write_retries: u32,
    /// Carrier region parcels are shipped from.
    pub origin_region_id: i64,
    pub parcel: ParcelContext,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewItem {
    pub product_id: String,
    pub product_name: String,
    #[serde(default)]
    pub variant: Option<String>,
    pub quantity: u32,
    /// Catalog price at the time the item is added.
    pub unit_price: Money,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewOrder {
    pub customer: Customer,
    pub delivery: DeliverySelection,
    pub destination: Destination,
    pub delivery_fee: Money,
    pub items: Vec<NewItem>,
}

/// Result of the shipment step of `confirm`, reported as data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ShipmentAttempt {
    Created { tracking: String, shipment_id: String },
    AlreadyShipped { tracking: String },
    /// Another confirmation recorded `kept` while this parcel was being created.
    Duplicate { tracking: String, kept: String, deleted: bool },
    NotConfigured,
    InvalidPhone { phone: String },
    InvalidParcel { reason: String },
    Rejected { reason: String },
    Unavailable { reason: String },
}

impl ShipmentAttempt {
    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created { .. })
    }

    fn failure_note(&self) -> Option<String> {
        match self {
            Self::Created { .. } | Self::AlreadyShipped { .. } | Self::Duplicate { .. } => None,
            Self::NotConfigured => Some("carrier not configured, parcel not created".to_string()),
            Self::InvalidPhone { phone } => Some(format!("invalid phone {phone}, parcel not created")),
            Self::InvalidParcel { reason } => Some(format!("{reason}, parcel not created")),
            Self::Rejected { reason } => Some(format!("carrier rejected parcel: {reason}")),
            Self::Unavailable { reason } => Some(format!("carrier unavailable: {reason}")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Confirmation {
    pub order: Order,
    pub shipment: ShipmentAttempt,
}

pub struct OrderLifecycle {
    store: Arc<dyn OrderStore>,
    carrier: Arc<dyn CarrierGateway>,
    events: Arc<dyn EventPublisher>,
    config: LifecycleConfig,
}

impl OrderLifecycle {
    pub fn new(
        store: Arc<dyn OrderStore>,
        carrier: Arc<dyn CarrierGateway>,
        events: Arc<dyn EventPublisher>,
        config: LifecycleConfig,
    ) -> Self {
        Self { store, carrier, events, config }
    }

    // -------------------------------------------------------------------------
    // Placement and reads
    // -------------------------------------------------------------------------

    #[instrument(skip(self, new_order), fields(customer = %new_order.customer.name))]
    pub async fn place_order(&self, new_order: NewOrder) -> Result<Order> {
        let items = new_order.items.into_iter().map(build_item).collect::<Result<Vec<_>>>()?;
        let mut order = Order::place(new_order.customer, new_order.delivery, new_order.destination, new_order.delivery_fee, items)?;
        self.store.insert(&order).await?;
        info!(order_id = %order.id(), order_number = %order.order_number(), total = %order.total(), "order placed");
        self.publish(&mut order).await;
        Ok(order)
    }

    pub async fn get(&self, id: Uuid) -> Result<Order> {
        self.store.get(id).await?.ok_or(FulfillmentError::OrderNotFound(id))
    }

    pub async fn list(&self, filter: &OrderFilter) -> Result<Vec<Order>> {
        Ok(self.store.list(filter).await?)
    }

    // -------------------------------------------------------------------------
    // Totals and notes
    // -------------------------------------------------------------------------

    #[instrument(skip(self))]
    pub async fn recalculate_totals(&self, id: Uuid) -> Result<Order> {
        self.mutate(id, Order::recalculate_totals).await
    }

    #[instrument(skip(self, text))]
    pub async fn append_note(&self, id: Uuid, tag: &str, text: &str) -> Result<Order> {
        if tag.trim().is_empty() || text.trim().is_empty() {
            return Err(FulfillmentError::Validation("note tag and text are required".to_string()));
        }
        self.mutate(id, |o| {
            o.append_note(tag, text);
            Ok(())
        })
        .await
    }

    // -------------------------------------------------------------------------
    // Items
    // -------------------------------------------------------------------------

    #[instrument(skip(self, item), fields(product_id = %item.product_id))]
    pub async fn add_item(&self, id: Uuid, item: NewItem) -> Result<Order> {
        let item = build_item(item)?;
        self.mutate(id, |o| o.add_item(item.clone())).await
    }

    #[instrument(skip(self))]
    pub async fn update_item_quantity(&self, id: Uuid, item_id: Uuid, quantity: u32) -> Result<Order> {
        let quantity = Quantity::new(quantity).map_err(|e| FulfillmentError::Validation(e.to_string()))?;
        self.mutate(id, |o| o.update_item_quantity(item_id, quantity)).await
    }

    #[instrument(skip(self))]
    pub async fn remove_item(&self, id: Uuid, item_id: Uuid) -> Result<Order> {
        self.mutate(id, |o| o.remove_item(item_id)).await
    }

    // -------------------------------------------------------------------------
    // Call-center axis
    // -------------------------------------------------------------------------

    /// Confirms the order, then tries to create the carrier parcel.
    ///
    /// The confirmation is committed before the carrier is contacted; a failed
    /// shipment attempt is recorded as a note and returned in
    /// [`Confirmation::shipment`], never as an error.
    ///
    /// If another confirmation recorded a parcel while this one was talking to
    /// the carrier, the stored tracking number wins and the late parcel is
    /// deleted at the carrier.
    #[instrument(skip(self))]
    pub async fn confirm(&self, id: Uuid) -> Result<Confirmation> {
        let confirmed = self.mutate(id, Order::confirm).await?;
        let attempt = self.attempt_shipment(&confirmed).await;
        if let ShipmentAttempt::AlreadyShipped { .. } = attempt {
            return Ok(Confirmation { order: confirmed, shipment: attempt });
        }

        let mut kept: Option<String> = None;
        let recorded = self
            .mutate(id, |o| {
                kept = None;
                match &attempt {
                    ShipmentAttempt::Created { tracking, shipment_id } => {
                        match o.record_shipment(tracking.clone(), shipment_id.clone()) {
                            Err(OrderError::AlreadyShipped(existing)) if existing != *tracking => {
                                o.record_duplicate_shipment(tracking);
                                kept = Some(existing);
                            }
                            Err(OrderError::AlreadyShipped(_)) => {}
                            other => other?,
                        }
                    }
                    other => {
                        if let Some(note) = other.failure_note() {
                            o.record_shipment_failure(&note);
                        }
                    }
                }
                Ok(())
            })
            .await;

        let order = match recorded {
            Ok(order) => order,
            Err(e) => {
                error!(order_id = %id, error = %e, attempt = ?attempt, "shipment outcome not recorded on order");
                confirmed
            }
        };
        let shipment = match (attempt, kept) {
            (ShipmentAttempt::Created { tracking, .. }, Some(kept)) => {
                warn!(order_id = %id, orphan = %tracking, %kept, "order already shipped, deleting duplicate carrier parcel");
                let deleted = match self.carrier.delete_shipment(&tracking).await {
                    Ok(()) => true,
                    Err(e) => {
                        error!(order_id = %id, orphan = %tracking, error = %e, "duplicate carrier parcel not deleted");
                        false
                    }
                };
                ShipmentAttempt::Duplicate { tracking, kept, deleted }
            }
            (attempt, _) => attempt,
        };
        Ok(Confirmation { order, shipment })
    }

    #[instrument(skip(self))]
    pub async fn cancel(&self, id: Uuid, reason: &str) -> Result<Order> {
        if reason.trim().is_empty() {
            return Err(FulfillmentError::Validation("cancellation reason is required".to_string()));
        }
        self.mutate(id, |o| o.cancel(reason)).await
    }

    #[instrument(skip(self))]
    pub async fn mark_no_response(&self, id: Uuid, notes: Option<&str>) -> Result<Order> {
        self.mutate(id, |o| o.mark_no_response(notes)).await
    }

    #[instrument(skip(self))]
    pub async fn set_status(&self, id: Uuid, status: CallCenterStatus) -> Result<Order> {
        self.mutate(id, |o| o.set_status(status)).await
    }

    // -------------------------------------------------------------------------
    // Delivery and communication axes
    // -------------------------------------------------------------------------

    #[instrument(skip(self))]
    pub async fn mark_ready(&self, id: Uuid) -> Result<Order> {
        self.mutate(id, Order::mark_ready).await
    }

    #[instrument(skip(self))]
    pub async fn start_delivery(&self, id: Uuid) -> Result<Order> {
        self.mutate(id, Order::start_delivery).await
    }

    #[instrument(skip(self))]
    pub async fn complete_delivery(&self, id: Uuid) -> Result<Order> {
        self.mutate(id, Order::complete_delivery).await
    }

    #[instrument(skip(self))]
    pub async fn set_communication_status(&self, id: Uuid, status: Option<CommunicationStatus>) -> Result<Order> {
        self.mutate(id, |o| {
            o.set_communication_status(status);
            Ok(())
        })
        .await
    }

    // -------------------------------------------------------------------------
    // Carrier reads
    // -------------------------------------------------------------------------

    /// Prices a parcel from the configured origin to one destination sub-region.
    pub async fn quote_shipping(
        &self,
        to_region_id: i64,
        sub_region_id: i64,
        package: Option<Package>,
        declared_value: Option<Decimal>,
    ) -> Result<ShippingQuote> {
        let package = package.unwrap_or(self.config.parcel.package);
        let negative = |v: Decimal| v < Decimal::ZERO;
        if [package.weight_kg, package.length_cm, package.width_cm, package.height_cm].into_iter().any(negative)
            || declared_value.is_some_and(negative)
        {
            return Err(FulfillmentError::Validation("weights, dimensions and declared value must not be negative".to_string()));
        }
        let rates = self.carrier.quote_rate(self.config.origin_region_id, to_region_id).await?;
        fees::quote(&rates, sub_region_id, &package, declared_value).map_err(|e| match e {
            QuoteError::UnknownSubRegion(_) => FulfillmentError::NotFound(format!("sub-region {sub_region_id} in region {to_region_id} rates")),
            QuoteError::OutOfRange(_) => FulfillmentError::Validation(e.to_string()),
        })
    }

    pub async fn list_regions(&self) -> Result<Vec<Region>> {
        Ok(self.carrier.list_regions().await?)
    }

    pub async fn list_sub_regions(&self, region_id: Option<i64>) -> Result<Vec<SubRegion>> {
        Ok(self.carrier.list_sub_regions(region_id).await?)
    }

    pub async fn list_pickup_centers(&self, region_id: Option<i64>) -> Result<Vec<PickupCenter>> {
        Ok(self.carrier.list_pickup_centers(region_id).await?)
    }

    pub async fn shipment_status(&self, id: Uuid) -> Result<Shipment> {
        let tracking = self.tracking_of(id).await?;
        Ok(self.carrier.get_shipment(&tracking).await?)
    }

    pub async fn shipment_history(&self, id: Uuid) -> Result<Vec<ShipmentEvent>> {
        let tracking = self.tracking_of(id).await?;
        Ok(self.carrier.get_shipment_history(&tracking).await?)
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    async fn tracking_of(&self, id: Uuid) -> Result<String> {
        self.get(id)
            .await?
            .tracking_number()
            .map(str::to_string)
            .ok_or_else(|| FulfillmentError::NotFound(format!("shipment for order {id}")))
    }

    async fn attempt_shipment(&self, order: &Order) -> ShipmentAttempt {
        if let Some(tracking) = order.tracking_number() {
            return ShipmentAttempt::AlreadyShipped { tracking: tracking.to_string() };
        }
        if !self.carrier.is_configured() {
            warn!(order_id = %order.id(), "carrier not configured, skipping parcel creation");
            return ShipmentAttempt::NotConfigured;
        }
        let phone = order.customer().phone.trim();
        if !carrier::validate_phone(phone) {
            warn!(order_id = %order.id(), %phone, "invalid phone, skipping parcel creation");
            return ShipmentAttempt::InvalidPhone { phone: phone.to_string() };
        }

        let parcel = match carrier::format_parcel(order, &self.config.parcel) {
            Ok(parcel) => parcel,
            Err(e) => {
                warn!(order_id = %order.id(), error = %e, "parcel not formatted, skipping parcel creation");
                return ShipmentAttempt::InvalidParcel { reason: e.to_string() };
            }
        };
        match self.carrier.create_shipment(&parcel).await {
            Ok(ShipmentOutcome::Created { tracking, shipment_id }) => {
                info!(order_id = %order.id(), %tracking, "carrier parcel created");
                ShipmentAttempt::Created { tracking, shipment_id }
            }
            Ok(ShipmentOutcome::Rejected { reason }) => {
                warn!(order_id = %order.id(), %reason, "carrier rejected parcel");
                ShipmentAttempt::Rejected { reason }
            }
            Err(e) => {
                warn!(order_id = %order.id(), error = %e, "carrier call failed");
                let reason = match e {
                    CarrierError::Unavailable(reason) => reason,
                    other => other.to_string(),
                };
                ShipmentAttempt::Unavailable { reason }
            }
        }
    }

    /// Load, apply `op`, write with a version check; retried on conflict.
    async fn mutate<F>(&self, id: Uuid, mut op: F) -> Result<Order>
    where
        F: FnMut(&mut Order) -> std::result::Result<(), OrderError> + Send,
    {
        let mut conflicts = 0;
        loop {
            let mut order = self.get(id).await?;
            op(&mut order)?;
            match self.store.update(&order).await {
                Ok(()) => {
                    order.version += 1;
                    self.publish(&mut order).await;
                    return Ok(order);
                }
                Err(StoreError::Conflict { expected, .. }) if conflicts < self.config.write_retries => {
                    conflicts += 1;
                    debug!(order_id = %id, expected, conflicts, "version conflict, reapplying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn publish(&self, order: &mut Order) {
        for event in order.take_events() {
            self.events.publish(&event).await;
        }
    }
}

fn build_item(item: NewItem) -> Result<OrderItem> {
    let quantity = Quantity::new(item.quantity).map_err(|e| FulfillmentError::Validation(e.to_string()))?;
    Ok(OrderItem::new(item.product_id, item.product_name, item.variant, quantity, item.unit_price)?)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::carrier::mock::MockBehavior;
    use crate::carrier::{MockCarrier, Parcel, RateTable, ShipmentPatch, SubRegionRate};
    use crate::domain::aggregates::DeliveryStatus;
    use crate::domain::events::OrderEvent;
    use crate::publisher::RecordingPublisher;
    use crate::store::MemoryOrderStore;

    fn config() -> LifecycleConfig {
        LifecycleConfig {
            write_retries: 3,
            origin_region_id: 9,
            parcel: ParcelContext {
                origin_region_name: "Blida".into(),
                package: Package {
                    weight_kg: Decimal::ONE,
                    length_cm: Decimal::from(30),
                    width_cm: Decimal::from(20),
                    height_cm: Decimal::from(10),
                },
                do_insurance: false,
            },
        }
    }

    fn new_item(price: i64, qty: u32) -> NewItem {
        NewItem { product_id: "P1".into(), product_name: "Widget".into(), variant: None, quantity: qty, unit_price: Money::from_major(price) }
    }

    fn new_order(phone: &str) -> NewOrder {
        NewOrder {
            customer: Customer { name: "Amina Benali".into(), phone: phone.into(), email: None },
            delivery: DeliverySelection::HomeDelivery { address: "12 rue Didouche Mourad".into() },
            destination: Destination { region_id: 16, region_name: "Alger".into(), sub_region: Some("Hydra".into()) },
            delivery_fee: Money::from_major(300),
            items: vec![new_item(1000, 2), new_item(500, 1)],
        }
    }

    fn lifecycle_with(store: Arc<dyn OrderStore>, carrier: Arc<MockCarrier>) -> (OrderLifecycle, Arc<RecordingPublisher>) {
        let events = Arc::new(RecordingPublisher::default());
        (OrderLifecycle::new(store, carrier, events.clone(), config()), events)
    }

    fn lifecycle(carrier: MockCarrier) -> (OrderLifecycle, Arc<MockCarrier>, Arc<RecordingPublisher>) {
        let carrier = Arc::new(carrier);
        let (lc, events) = lifecycle_with(Arc::new(MemoryOrderStore::new()), carrier.clone());
        (lc, carrier, events)
    }

    #[tokio::test]
    async fn test_scenario_totals_through_item_mutations() {
        let (lc, _, _) = lifecycle(MockCarrier::new());
        let order = lc.place_order(new_order("0551234567")).await.unwrap();
        assert_eq!(order.subtotal(), Money::from_major(2500));
        assert_eq!(order.total(), Money::from_major(2800));

        let single = order.items()[1].id();
        let order = lc.remove_item(order.id(), single).await.unwrap();
        assert_eq!(order.subtotal(), Money::from_major(2000));
        assert_eq!(order.total(), Money::from_major(2300));

        let order = lc.add_item(order.id(), new_item(150, 3)).await.unwrap();
        assert_eq!(order.total(), Money::from_major(2750));
        let added = order.items()[1].id();
        let order = lc.update_item_quantity(order.id(), added, 1).await.unwrap();
        assert_eq!(order.subtotal(), Money::from_major(2150));
        assert_eq!(order.subtotal().checked_add(order.delivery_fee()), Some(order.total()));

        let stored = lc.get(order.id()).await.unwrap();
        assert_eq!(stored.total(), Money::from_major(2450));
        assert_eq!(stored.version(), 3);
    }

    #[tokio::test]
    async fn test_item_validation_errors() {
        let (lc, _, _) = lifecycle(MockCarrier::new());
        let order = lc.place_order(new_order("0551234567")).await.unwrap();
        let item = order.items()[0].id();
        assert!(matches!(lc.update_item_quantity(order.id(), item, 0).await, Err(FulfillmentError::Validation(_))));
        assert!(matches!(lc.add_item(order.id(), new_item(-5, 1)).await, Err(FulfillmentError::Validation(_))));
        assert!(matches!(lc.remove_item(order.id(), Uuid::now_v7()).await, Err(FulfillmentError::NotFound(_))));
        let missing = Uuid::now_v7();
        assert!(matches!(lc.recalculate_totals(missing).await, Err(FulfillmentError::OrderNotFound(id)) if id == missing));
    }

    #[tokio::test]
    async fn test_recalculate_twice_is_stable() {
        let (lc, _, _) = lifecycle(MockCarrier::new());
        let order = lc.place_order(new_order("0551234567")).await.unwrap();
        let first = lc.recalculate_totals(order.id()).await.unwrap();
        let second = lc.recalculate_totals(order.id()).await.unwrap();
        assert_eq!((first.subtotal(), first.total()), (second.subtotal(), second.total()));
    }

    #[tokio::test]
    async fn test_confirm_creates_shipment() {
        let (lc, carrier, events) = lifecycle(MockCarrier::new());
        let order = lc.place_order(new_order("0551234567")).await.unwrap();

        let confirmation = lc.confirm(order.id()).await.unwrap();
        assert!(confirmation.shipment.is_created());
        let expected = format!("TRK-{}", order.order_number());
        assert_eq!(confirmation.order.tracking_number(), Some(expected.as_str()));
        assert_eq!(confirmation.order.call_center_status(), CallCenterStatus::Confirmed);
        assert!(confirmation.order.notes().contains("[SHIPMENT]"));

        let parcels = carrier.submitted();
        assert_eq!(parcels.len(), 1);
        assert_eq!(parcels[0].price, 2800);
        assert_eq!(parcels[0].from_region_name, "Blida");

        let kinds: Vec<&str> = events.events().iter().map(OrderEvent::kind).collect();
        assert_eq!(kinds, vec!["placed", "status_changed", "shipment_created"]);
    }

    #[tokio::test]
    async fn test_confirm_survives_carrier_failure() {
        let (lc, _, _) = lifecycle(MockCarrier::new().with_behavior(MockBehavior::Unavailable("connection reset".into())));
        let order = lc.place_order(new_order("0551234567")).await.unwrap();

        let confirmation = lc.confirm(order.id()).await.unwrap();
        assert_eq!(confirmation.shipment, ShipmentAttempt::Unavailable { reason: "connection reset".into() });

        let stored = lc.get(order.id()).await.unwrap();
        assert_eq!(stored.call_center_status(), CallCenterStatus::Confirmed);
        assert_eq!(stored.delivery_status(), DeliveryStatus::NotReady);
        assert_eq!(stored.tracking_number(), None);
        assert!(stored.notes().contains("[SHIPMENT_FAILED] carrier unavailable: connection reset"));
    }

    #[tokio::test]
    async fn test_confirm_records_rejection_and_skips() {
        let (lc, _, _) = lifecycle(MockCarrier::new().with_behavior(MockBehavior::Reject("unknown commune".into())));
        let order = lc.place_order(new_order("0551234567")).await.unwrap();
        let c = lc.confirm(order.id()).await.unwrap();
        assert_eq!(c.shipment, ShipmentAttempt::Rejected { reason: "unknown commune".into() });
        assert!(c.order.notes().contains("carrier rejected parcel: unknown commune"));

        let (lc, carrier, _) = lifecycle(MockCarrier::new());
        let order = lc.place_order(new_order("0123456789")).await.unwrap();
        let c = lc.confirm(order.id()).await.unwrap();
        assert_eq!(c.shipment, ShipmentAttempt::InvalidPhone { phone: "0123456789".into() });
        assert!(carrier.submitted().is_empty());

        let (lc, _, _) = lifecycle(MockCarrier::unconfigured());
        let order = lc.place_order(new_order("0551234567")).await.unwrap();
        let c = lc.confirm(order.id()).await.unwrap();
        assert_eq!(c.shipment, ShipmentAttempt::NotConfigured);
        assert_eq!(c.order.call_center_status(), CallCenterStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_reconfirm_does_not_ship_twice() {
        let (lc, carrier, _) = lifecycle(MockCarrier::new());
        let order = lc.place_order(new_order("0551234567")).await.unwrap();
        lc.confirm(order.id()).await.unwrap();
        lc.mark_no_response(order.id(), Some("unreachable before dispatch")).await.unwrap();
        let again = lc.confirm(order.id()).await.unwrap();
        assert!(matches!(again.shipment, ShipmentAttempt::AlreadyShipped { .. }));
        assert_eq!(carrier.submitted().len(), 1);

        // placed, confirm, record, no response, confirm: nothing further to write
        let stored = lc.get(order.id()).await.unwrap();
        assert_eq!(again.order.version(), 4);
        assert_eq!(stored.version(), 4);
        assert_eq!(stored.notes().matches("[SHIPMENT]").count(), 1);
    }

    #[tokio::test]
    async fn test_confirm_rejects_invalid_sources() {
        let (lc, carrier, _) = lifecycle(MockCarrier::new());
        let order = lc.place_order(new_order("0551234567")).await.unwrap();
        lc.cancel(order.id(), "duplicate of ORD-1").await.unwrap();
        assert!(matches!(lc.confirm(order.id()).await, Err(FulfillmentError::InvalidTransition(_))));
        assert!(carrier.submitted().is_empty());
        assert!(matches!(lc.cancel(order.id(), " ").await, Err(FulfillmentError::Validation(_))));
    }

    #[tokio::test]
    async fn test_delivery_flow_after_confirmation() {
        let (lc, _, _) = lifecycle(MockCarrier::new());
        let id = lc.place_order(new_order("0551234567")).await.unwrap().id();
        assert!(matches!(lc.mark_ready(id).await, Err(FulfillmentError::InvalidTransition(_))));

        lc.confirm(id).await.unwrap();
        lc.set_communication_status(id, Some(CommunicationStatus::SmsSent)).await.unwrap();
        lc.set_communication_status(id, Some(CommunicationStatus::Answered)).await.unwrap();
        lc.mark_ready(id).await.unwrap();
        assert!(matches!(lc.complete_delivery(id).await, Err(FulfillmentError::InvalidTransition(_))));
        lc.start_delivery(id).await.unwrap();
        let done = lc.complete_delivery(id).await.unwrap();

        assert_eq!(done.delivery_status(), DeliveryStatus::Done);
        assert_eq!(done.communication_status(), Some(CommunicationStatus::Answered));
        let notes = done.notes();
        let ready = notes.find("[READY]").unwrap();
        let transit = notes.find("[IN_TRANSIT]").unwrap();
        let complete = notes.find("[DONE]").unwrap();
        assert!(ready < transit && transit < complete);
    }

    #[tokio::test]
    async fn test_free_form_statuses() {
        let (lc, _, _) = lifecycle(MockCarrier::new());
        let id = lc.place_order(new_order("0551234567")).await.unwrap().id();
        lc.set_status(id, CallCenterStatus::DoubleOrder).await.unwrap();
        let order = lc.set_status(id, CallCenterStatus::Pending).await.unwrap();
        assert_eq!(order.call_center_status(), CallCenterStatus::Pending);
        assert!(matches!(lc.set_status(id, CallCenterStatus::Canceled).await, Err(FulfillmentError::InvalidTransition(_))));
    }

    #[tokio::test]
    async fn test_notes_append_in_call_order() {
        let (lc, _, _) = lifecycle(MockCarrier::new());
        let id = lc.place_order(new_order("0551234567")).await.unwrap().id();
        lc.append_note(id, "CALL", "first").await.unwrap();
        lc.append_note(id, "CALL", "second").await.unwrap();
        let order = lc.append_note(id, "CALL", "third").await.unwrap();
        assert_eq!(order.notes(), "\n[CALL] first\n[CALL] second\n[CALL] third");
        assert!(matches!(lc.append_note(id, "", "x").await, Err(FulfillmentError::Validation(_))));
    }

    /// Lets another writer slip in before the first update.
    struct InterleavingStore {
        inner: MemoryOrderStore,
        interfered: AtomicBool,
    }

    #[async_trait]
    impl OrderStore for InterleavingStore {
        async fn insert(&self, order: &Order) -> std::result::Result<(), StoreError> {
            self.inner.insert(order).await
        }
        async fn get(&self, id: Uuid) -> std::result::Result<Option<Order>, StoreError> {
            self.inner.get(id).await
        }
        async fn update(&self, order: &Order) -> std::result::Result<(), StoreError> {
            if !self.interfered.swap(true, Ordering::SeqCst) {
                let mut rival = self.inner.get(order.id()).await?.expect("order exists");
                rival.append_note("RIVAL", "concurrent staff note");
                self.inner.update(&rival).await?;
            }
            self.inner.update(order).await
        }
        async fn list(&self, filter: &OrderFilter) -> std::result::Result<Vec<Order>, StoreError> {
            self.inner.list(filter).await
        }
    }

    #[tokio::test]
    async fn test_conflicting_write_is_reapplied_not_lost() {
        let store = Arc::new(InterleavingStore { inner: MemoryOrderStore::new(), interfered: AtomicBool::new(true) });
        let (lc, _) = lifecycle_with(store.clone(), Arc::new(MockCarrier::new()));
        let id = lc.place_order(new_order("0551234567")).await.unwrap().id();

        store.interfered.store(false, Ordering::SeqCst);
        let order = lc.append_note(id, "MINE", "my note").await.unwrap();
        assert!(order.notes().contains("[RIVAL] concurrent staff note"));
        assert!(order.notes().ends_with("[MINE] my note"));
        assert_eq!(order.version(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_appends_all_survive() {
        let (lc, _, _) = lifecycle(MockCarrier::new());
        let lc = OrderLifecycle { config: LifecycleConfig { write_retries: 10, ..config() }, ..lc };
        let id = lc.place_order(new_order("0551234567")).await.unwrap().id();
        let (a, b, c, d, e) = tokio::join!(
            lc.append_note(id, "N", "one"),
            lc.append_note(id, "N", "two"),
            lc.append_note(id, "N", "three"),
            lc.append_note(id, "N", "four"),
            lc.append_note(id, "N", "five"),
        );
        for r in [a, b, c, d, e] {
            r.unwrap();
        }
        let order = lc.get(id).await.unwrap();
        for word in ["one", "two", "three", "four", "five"] {
            assert!(order.notes().contains(&format!("[N] {word}")));
        }
        assert_eq!(order.version(), 5);
    }

    /// Holds the first parcel creation until released. Trackings are `T0`, `T1`, ...
    #[derive(Default)]
    struct GatedCarrier {
        inner: MockCarrier,
        created: AtomicUsize,
        entered: Notify,
        release: Notify,
        deleted: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CarrierGateway for GatedCarrier {
        fn is_configured(&self) -> bool {
            true
        }
        async fn list_regions(&self) -> std::result::Result<Vec<Region>, CarrierError> {
            self.inner.list_regions().await
        }
        async fn list_sub_regions(&self, region_id: Option<i64>) -> std::result::Result<Vec<SubRegion>, CarrierError> {
            self.inner.list_sub_regions(region_id).await
        }
        async fn list_pickup_centers(&self, region_id: Option<i64>) -> std::result::Result<Vec<PickupCenter>, CarrierError> {
            self.inner.list_pickup_centers(region_id).await
        }
        async fn quote_rate(&self, from_region_id: i64, to_region_id: i64) -> std::result::Result<RateTable, CarrierError> {
            self.inner.quote_rate(from_region_id, to_region_id).await
        }
        async fn create_shipments(&self, parcels: &[Parcel]) -> std::result::Result<BTreeMap<String, ShipmentOutcome>, CarrierError> {
            let n = self.created.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                self.entered.notify_one();
                self.release.notified().await;
            }
            Ok(parcels
                .iter()
                .map(|p| (p.order_id.clone(), ShipmentOutcome::Created { tracking: format!("T{n}"), shipment_id: format!("S{n}") }))
                .collect())
        }
        async fn get_shipment(&self, tracking: &str) -> std::result::Result<Shipment, CarrierError> {
            self.inner.get_shipment(tracking).await
        }
        async fn get_shipment_history(&self, tracking: &str) -> std::result::Result<Vec<ShipmentEvent>, CarrierError> {
            self.inner.get_shipment_history(tracking).await
        }
        async fn update_shipment(&self, tracking: &str, patch: &ShipmentPatch) -> std::result::Result<Shipment, CarrierError> {
            self.inner.update_shipment(tracking, patch).await
        }
        async fn delete_shipment(&self, tracking: &str) -> std::result::Result<(), CarrierError> {
            self.deleted.lock().unwrap().push(tracking.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_overlapping_confirm_keeps_first_recorded_parcel() {
        let carrier = Arc::new(GatedCarrier::default());
        let events = Arc::new(RecordingPublisher::default());
        let lc = Arc::new(OrderLifecycle::new(Arc::new(MemoryOrderStore::new()), carrier.clone(), events, config()));
        let id = lc.place_order(new_order("0551234567")).await.unwrap().id();

        let slow = tokio::spawn({
            let lc = lc.clone();
            async move { lc.confirm(id).await }
        });
        carrier.entered.notified().await;
        lc.mark_no_response(id, Some("line dropped")).await.unwrap();
        let fast = lc.confirm(id).await.unwrap();
        assert_eq!(fast.shipment, ShipmentAttempt::Created { tracking: "T1".into(), shipment_id: "S1".into() });

        carrier.release.notify_one();
        let slow = slow.await.unwrap().unwrap();
        assert_eq!(slow.shipment, ShipmentAttempt::Duplicate { tracking: "T0".into(), kept: "T1".into(), deleted: true });
        assert_eq!(slow.order.tracking_number(), Some("T1"));

        let stored = lc.get(id).await.unwrap();
        assert_eq!(stored.tracking_number(), Some("T1"));
        assert_eq!(stored.carrier_shipment_id(), Some("S1"));
        assert!(stored.notes().contains("[SHIPMENT_DUPLICATE] carrier parcel T0 not attached, order keeps T1"));
        assert_eq!(*carrier.deleted.lock().unwrap(), vec!["T0".to_string()]);
        assert_eq!(carrier.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_confirm_with_unrepresentable_price_creates_no_parcel() {
        let (lc, carrier, _) = lifecycle(MockCarrier::new());
        let mut order = new_order("0551234567");
        order.items = vec![new_item(i64::MAX, 2)];
        let id = lc.place_order(order).await.unwrap().id();

        let c = lc.confirm(id).await.unwrap();
        assert!(matches!(&c.shipment, ShipmentAttempt::InvalidParcel { reason } if reason.contains("price")));
        assert!(carrier.submitted().is_empty());
        assert_eq!(c.order.call_center_status(), CallCenterStatus::Confirmed);
        assert!(c.order.notes().contains("[SHIPMENT_FAILED] parcel price does not fit"));
    }

    #[tokio::test]
    async fn test_amount_overflow_is_a_validation_error() {
        let (lc, _, _) = lifecycle(MockCarrier::new().with_rates(rates()));
        let mut order = new_order("0551234567");
        order.items = vec![NewItem { unit_price: Money::new(Decimal::MAX), ..new_item(0, 2) }];
        assert!(matches!(lc.place_order(order).await, Err(FulfillmentError::Validation(_))));

        let id = lc.place_order(new_order("0551234567")).await.unwrap().id();
        let huge = NewItem { unit_price: Money::new(Decimal::MAX), ..new_item(0, 1) };
        assert!(matches!(lc.add_item(id, huge).await, Err(FulfillmentError::Validation(_))));
        let stored = lc.get(id).await.unwrap();
        assert_eq!(stored.total(), Money::from_major(2800));
        assert_eq!(stored.version(), 0);

        let package = Package { length_cm: Decimal::MAX, ..config().parcel.package };
        assert!(matches!(lc.quote_shipping(16, 1601, Some(package), None).await, Err(FulfillmentError::Validation(_))));
    }

    fn rates() -> RateTable {
        let mut per_sub_region = BTreeMap::new();
        per_sub_region.insert("1601".to_string(), SubRegionRate {
            sub_region_id: 1601, sub_region_name: "Hydra".into(),
            express_home: Decimal::from(400), express_desk: Some(Decimal::from(300)),
            economic_home: None, economic_desk: None,
        });
        RateTable {
            zone: 1, return_fee: Decimal::from(200), cod_percent: Decimal::ONE, insurance_percent: Decimal::ONE,
            oversize_fee: Decimal::from(50), per_sub_region,
        }
    }

    #[tokio::test]
    async fn test_quote_shipping_uses_carrier_rates() {
        let (lc, _, _) = lifecycle(MockCarrier::new().with_rates(rates()));
        let quote = lc.quote_shipping(16, 1601, None, Some(Decimal::from(10000))).await.unwrap();
        assert_eq!(quote.express.home.total, Money::from_major(500));
        assert!(matches!(lc.quote_shipping(16, 42, None, None).await, Err(FulfillmentError::NotFound(_))));

        let (lc, _, _) = lifecycle(MockCarrier::unconfigured());
        assert!(matches!(lc.quote_shipping(16, 1601, None, None).await, Err(FulfillmentError::CarrierNotConfigured)));
    }

    #[tokio::test]
    async fn test_shipment_status_requires_tracking() {
        let (lc, _, _) = lifecycle(MockCarrier::new());
        let id = lc.place_order(new_order("0551234567")).await.unwrap().id();
        assert!(matches!(lc.shipment_status(id).await, Err(FulfillmentError::NotFound(_))));
        lc.confirm(id).await.unwrap();
        let shipment = lc.shipment_status(id).await.unwrap();
        assert!(shipment.tracking.starts_with("TRK-ORD-"));
        assert_eq!(lc.shipment_history(id).await.unwrap().len(), 1);
    }
}
