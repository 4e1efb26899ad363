//! Delivery carrier boundary.
//!
//! [`CarrierGateway`] is the only way the service talks to the external
//! carrier. [`HttpCarrierClient`] is the production implementation and
//! [`MockCarrier`] the scripted double used by tests.
//!
//! Per-parcel business rejections are data ([`ShipmentOutcome::Rejected`]);
//! only transport-level failures are errors.

mod client;
pub mod mock;

use std::collections::BTreeMap;

use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::domain::aggregates::{DeliverySelection, Order};
use crate::fees::Package;

pub use client::{CarrierConfig, HttpCarrierClient};
pub use mock::MockCarrier;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CarrierError {
    #[error("carrier credentials are not configured")]
    NotConfigured,

    #[error("carrier unavailable: {0}")]
    Unavailable(String),

    #[error("carrier rejected parcel: {0}")]
    Rejected(String),

    #[error("carrier has no record of {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParcelError {
    #[error("parcel {0} does not fit the carrier's whole-unit range")]
    OutOfRange(&'static str),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub zone: Option<u32>,
    #[serde(default)]
    pub is_deliverable: Option<bool>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubRegion {
    pub id: i64,
    pub name: String,
    pub region_id: i64,
    #[serde(default)]
    pub has_pickup_center: Option<bool>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PickupCenter {
    pub id: i64,
    pub name: String,
    pub region_id: i64,
    #[serde(default)]
    pub sub_region_id: Option<i64>,
    #[serde(default)]
    pub address: Option<String>,
}

/// Carrier fee table for one origin/destination region pair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateTable {
    pub zone: u32,
    pub return_fee: Decimal,
    pub cod_percent: Decimal,
    pub insurance_percent: Decimal,
    /// Per-kilogram rate applied above the overweight threshold.
    pub oversize_fee: Decimal,
    /// Keyed by the carrier's sub-region id.
    pub per_sub_region: BTreeMap<String, SubRegionRate>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubRegionRate {
    pub sub_region_id: i64,
    pub sub_region_name: String,
    pub express_home: Decimal,
    #[serde(default)]
    pub express_desk: Option<Decimal>,
    #[serde(default)]
    pub economic_home: Option<Decimal>,
    #[serde(default)]
    pub economic_desk: Option<Decimal>,
}

/// Parcel descriptor in the carrier's schema. Amounts and sizes are whole units.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parcel {
    pub order_id: String,
    pub from_region_name: String,
    pub firstname: String,
    pub familyname: String,
    pub contact_phone: String,
    pub address: String,
    pub to_region_name: String,
    pub to_sub_region_name: String,
    pub product_list: String,
    pub price: i64,
    pub do_insurance: bool,
    pub declared_value: i64,
    pub length: i64,
    pub width: i64,
    pub height: i64,
    pub weight: i64,
    pub freeshipping: bool,
    pub is_stopdesk: bool,
    pub stopdesk_id: Option<i64>,
    pub has_exchange: bool,
}

/// Sender-side facts the order itself does not carry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParcelContext {
    pub origin_region_name: String,
    pub package: Package,
    pub do_insurance: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ShipmentOutcome {
    Created { tracking: String, shipment_id: String },
    Rejected { reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shipment {
    pub tracking: String,
    pub order_id: String,
    pub status: String,
    #[serde(default)]
    pub price: Option<i64>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipmentEvent {
    pub tracking: String,
    pub status: String,
    pub date: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub center_name: Option<String>,
}

/// Partial parcel update; unset fields are left untouched carrier-side.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipmentPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firstname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub familyname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact_phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_region_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_sub_region_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_list: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_stopdesk: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopdesk_id: Option<i64>,
}

#[async_trait]
pub trait CarrierGateway: Send + Sync {
    /// True iff both credentials are present. Every other call refuses without I/O otherwise.
    fn is_configured(&self) -> bool;

    async fn list_regions(&self) -> Result<Vec<Region>, CarrierError>;

    async fn list_sub_regions(&self, region_id: Option<i64>) -> Result<Vec<SubRegion>, CarrierError>;

    async fn list_pickup_centers(&self, region_id: Option<i64>) -> Result<Vec<PickupCenter>, CarrierError>;

    async fn quote_rate(&self, from_region_id: i64, to_region_id: i64) -> Result<RateTable, CarrierError>;

    /// Submits parcels in one request; the result is keyed by each parcel's `order_id`.
    async fn create_shipments(&self, parcels: &[Parcel]) -> Result<BTreeMap<String, ShipmentOutcome>, CarrierError>;

    async fn create_shipment(&self, parcel: &Parcel) -> Result<ShipmentOutcome, CarrierError> {
        let mut results = self.create_shipments(std::slice::from_ref(parcel)).await?;
        results.remove(&parcel.order_id).ok_or_else(|| {
            CarrierError::Unavailable(format!("response has no entry for order {}", parcel.order_id))
        })
    }

    async fn get_shipment(&self, tracking: &str) -> Result<Shipment, CarrierError>;

    async fn get_shipment_history(&self, tracking: &str) -> Result<Vec<ShipmentEvent>, CarrierError>;

    async fn update_shipment(&self, tracking: &str, patch: &ShipmentPatch) -> Result<Shipment, CarrierError>;

    async fn delete_shipment(&self, tracking: &str) -> Result<(), CarrierError>;
}

/// Maps an order onto the carrier's parcel schema.
///
/// The customer name is split at its first space; a single-word name leaves
/// `familyname` empty. Money and sizes are rounded half away from zero; an
/// amount that does not fit an `i64` is an error.
pub fn format_parcel(order: &Order, ctx: &ParcelContext) -> Result<Parcel, ParcelError> {
    let name = order.customer().name.trim();
    let (firstname, familyname) = match name.split_once(' ') {
        Some((first, rest)) => (first.to_string(), rest.trim().to_string()),
        None => (name.to_string(), String::new()),
    };

    let (address, is_stopdesk, stopdesk_id) = match order.delivery() {
        DeliverySelection::HomeDelivery { address } => (address.clone(), false, None),
        DeliverySelection::Pickup { desk_id, desk_name } => (desk_name.clone(), true, Some(*desk_id)),
    };

    let product_list = order
        .items()
        .iter()
        .map(|i| match i.variant() {
            Some(v) => format!("{} ({}) x{}", i.product_name(), v, i.quantity().value()),
            None => format!("{} x{}", i.product_name(), i.quantity().value()),
        })
        .collect::<Vec<_>>()
        .join(", ");

    let destination = order.destination();
    Ok(Parcel {
        order_id: order.order_number().to_string(),
        from_region_name: ctx.origin_region_name.clone(),
        firstname,
        familyname,
        contact_phone: order.customer().phone.trim().to_string(),
        address,
        to_region_name: destination.region_name.clone(),
        to_sub_region_name: destination.sub_region.clone().unwrap_or_default(),
        product_list,
        price: whole_units(order.total().amount(), "price")?,
        do_insurance: ctx.do_insurance,
        declared_value: whole_units(order.subtotal().amount(), "declared_value")?,
        length: whole_units(ctx.package.length_cm, "length")?,
        width: whole_units(ctx.package.width_cm, "width")?,
        height: whole_units(ctx.package.height_cm, "height")?,
        weight: whole_units(ctx.package.weight_kg, "weight")?,
        freeshipping: false,
        is_stopdesk,
        stopdesk_id,
        has_exchange: false,
    })
}

fn whole_units(value: Decimal, field: &'static str) -> Result<i64, ParcelError> {
    value
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .ok_or(ParcelError::OutOfRange(field))
}

/// Accepts local mobile numbers (`0[5-7]` + 8 digits) and landlines
/// (`0[2-4]` + 7 digits, or 8 for the newer long form).
pub fn validate_phone(phone: &str) -> bool {
    let digits = phone.trim().as_bytes();
    if !digits.iter().all(u8::is_ascii_digit) {
        return false;
    }
    match digits {
        [b'0', b'5'..=b'7', rest @ ..] => rest.len() == 8,
        [b'0', b'2'..=b'4', rest @ ..] => rest.len() == 7 || rest.len() == 8,
        _ => false,
    }
}
