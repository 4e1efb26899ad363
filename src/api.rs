//! HTTP surface over [`OrderLifecycle`].

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post, put},
    Json, Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::error;
use uuid::Uuid;
use validator::Validate;

use crate::carrier::{PickupCenter, Region, Shipment, ShipmentEvent, SubRegion};
use crate::domain::aggregates::{
    CallCenterStatus, CommunicationStatus, Customer, DeliverySelection, DeliveryStatus, Destination, Order,
};
use crate::domain::value_objects::Money;
use crate::fees::{Package, ShippingQuote};
use crate::lifecycle::{Confirmation, NewItem, NewOrder, OrderLifecycle};
use crate::store::OrderFilter;
use crate::{FulfillmentError, Result};

type AppState = Arc<OrderLifecycle>;

pub fn build_router(lifecycle: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { Json(serde_json::json!({"status": "healthy", "service": "opensase-fulfillment"})) }))
        .route("/api/v1/orders", get(list_orders).post(place_order))
        .route("/api/v1/orders/:id", get(get_order))
        .route("/api/v1/orders/:id/confirm", post(confirm_order))
        .route("/api/v1/orders/:id/cancel", post(cancel_order))
        .route("/api/v1/orders/:id/no-response", post(mark_no_response))
        .route("/api/v1/orders/:id/status", put(set_status))
        .route("/api/v1/orders/:id/delivery/ready", post(mark_ready))
        .route("/api/v1/orders/:id/delivery/start", post(start_delivery))
        .route("/api/v1/orders/:id/delivery/complete", post(complete_delivery))
        .route("/api/v1/orders/:id/communication", put(set_communication))
        .route("/api/v1/orders/:id/notes", post(append_note))
        .route("/api/v1/orders/:id/items", post(add_item))
        .route("/api/v1/orders/:id/items/:item_id", patch(update_item).delete(remove_item))
        .route("/api/v1/orders/:id/recalculate", post(recalculate))
        .route("/api/v1/orders/:id/shipment", get(shipment_status))
        .route("/api/v1/orders/:id/shipment/history", get(shipment_history))
        .route("/api/v1/carrier/regions", get(list_regions))
        .route("/api/v1/carrier/subregions", get(list_sub_regions))
        .route("/api/v1/carrier/pickup-centers", get(list_pickup_centers))
        .route("/api/v1/carrier/quote", post(quote_shipping))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(lifecycle)
}

impl IntoResponse for FulfillmentError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::OrderNotFound(_) | Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Validation(_) | Self::InvalidTransition(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::CarrierNotConfigured => StatusCode::SERVICE_UNAVAILABLE,
            Self::CarrierUnavailable(_) | Self::CarrierRejected(_) => StatusCode::BAD_GATEWAY,
            Self::StorageError(reason) => {
                error!(%reason, "storage failure");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(serde_json::json!({"error": self.to_string()}))).into_response()
    }
}

fn check(request: &impl Validate) -> Result<()> {
    request.validate().map_err(|e| FulfillmentError::Validation(e.to_string()))
}

// -----------------------------------------------------------------------------
// Requests
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize, Validate)]
pub struct CustomerRequest {
    #[validate(length(min = 1, max = 200))]
    pub name: String,
    #[validate(length(min = 1, max = 20))]
    pub phone: String,
    #[validate(email)]
    pub email: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct ItemRequest {
    #[validate(length(min = 1))]
    pub product_id: String,
    #[validate(length(min = 1))]
    pub product_name: String,
    pub variant: Option<String>,
    #[validate(range(min = 1, max = 10000))]
    pub quantity: u32,
    pub unit_price: Money,
}

impl From<ItemRequest> for NewItem {
    fn from(r: ItemRequest) -> Self {
        Self { product_id: r.product_id, product_name: r.product_name, variant: r.variant, quantity: r.quantity, unit_price: r.unit_price }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct PlaceOrderRequest {
    pub customer: CustomerRequest,
    pub delivery: DeliverySelection,
    pub destination: Destination,
    pub delivery_fee: Money,
    #[validate(length(min = 1, max = 100))]
    pub items: Vec<ItemRequest>,
}

impl PlaceOrderRequest {
    fn into_new_order(self) -> Result<NewOrder> {
        check(&self)?;
        check(&self.customer)?;
        for item in &self.items {
            check(item)?;
        }
        let c = self.customer;
        Ok(NewOrder {
            customer: Customer { name: c.name, phone: c.phone, email: c.email },
            delivery: self.delivery,
            destination: self.destination,
            delivery_fee: self.delivery_fee,
            items: self.items.into_iter().map(NewItem::from).collect(),
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub call_center_status: Option<CallCenterStatus>,
    pub delivery_status: Option<DeliveryStatus>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct PaginatedResponse<T> {
    pub data: Vec<T>,
    pub page: u32,
    pub per_page: u32,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CancelRequest {
    #[validate(length(min = 1, max = 1000))]
    pub reason: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct NoResponseRequest {
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub status: CallCenterStatus,
}

#[derive(Debug, Deserialize)]
pub struct CommunicationRequest {
    pub status: Option<CommunicationStatus>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct NoteRequest {
    #[validate(length(min = 1, max = 40))]
    pub tag: String,
    #[validate(length(min = 1, max = 2000))]
    pub text: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct QuantityRequest {
    #[validate(range(min = 1, max = 10000))]
    pub quantity: u32,
}

#[derive(Debug, Deserialize)]
pub struct RegionParams {
    pub region_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct QuoteRequest {
    pub to_region_id: i64,
    pub sub_region_id: i64,
    pub package: Option<Package>,
    pub declared_value: Option<Decimal>,
}

// -----------------------------------------------------------------------------
// Orders
// -----------------------------------------------------------------------------

async fn place_order(State(s): State<AppState>, Json(r): Json<PlaceOrderRequest>) -> Result<(StatusCode, Json<Order>)> {
    let order = s.place_order(r.into_new_order()?).await?;
    Ok((StatusCode::CREATED, Json(order)))
}

async fn list_orders(State(s): State<AppState>, Query(p): Query<ListParams>) -> Result<Json<PaginatedResponse<Order>>> {
    let page = p.page.unwrap_or(1).max(1);
    let per_page = p.per_page.unwrap_or(20).clamp(1, 100);
    let offset = (page - 1)
        .checked_mul(per_page)
        .ok_or_else(|| FulfillmentError::Validation(format!("page {page} is out of range")))?;
    let filter = OrderFilter {
        call_center_status: p.call_center_status,
        delivery_status: p.delivery_status,
        limit: per_page,
        offset,
    };
    Ok(Json(PaginatedResponse { data: s.list(&filter).await?, page, per_page }))
}

async fn get_order(State(s): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Order>> {
    Ok(Json(s.get(id).await?))
}

async fn confirm_order(State(s): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Confirmation>> {
    Ok(Json(s.confirm(id).await?))
}

async fn cancel_order(State(s): State<AppState>, Path(id): Path<Uuid>, Json(r): Json<CancelRequest>) -> Result<Json<Order>> {
    check(&r)?;
    Ok(Json(s.cancel(id, &r.reason).await?))
}

async fn mark_no_response(State(s): State<AppState>, Path(id): Path<Uuid>, body: Option<Json<NoResponseRequest>>) -> Result<Json<Order>> {
    let r = body.map(|Json(r)| r).unwrap_or_default();
    Ok(Json(s.mark_no_response(id, r.notes.as_deref()).await?))
}

async fn set_status(State(s): State<AppState>, Path(id): Path<Uuid>, Json(r): Json<StatusRequest>) -> Result<Json<Order>> {
    Ok(Json(s.set_status(id, r.status).await?))
}

async fn mark_ready(State(s): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Order>> {
    Ok(Json(s.mark_ready(id).await?))
}

async fn start_delivery(State(s): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Order>> {
    Ok(Json(s.start_delivery(id).await?))
}

async fn complete_delivery(State(s): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Order>> {
    Ok(Json(s.complete_delivery(id).await?))
}

async fn set_communication(State(s): State<AppState>, Path(id): Path<Uuid>, Json(r): Json<CommunicationRequest>) -> Result<Json<Order>> {
    Ok(Json(s.set_communication_status(id, r.status).await?))
}

async fn append_note(State(s): State<AppState>, Path(id): Path<Uuid>, Json(r): Json<NoteRequest>) -> Result<Json<Order>> {
    check(&r)?;
    Ok(Json(s.append_note(id, &r.tag, &r.text).await?))
}

async fn add_item(State(s): State<AppState>, Path(id): Path<Uuid>, Json(r): Json<ItemRequest>) -> Result<Json<Order>> {
    check(&r)?;
    Ok(Json(s.add_item(id, r.into()).await?))
}

async fn update_item(State(s): State<AppState>, Path((id, item_id)): Path<(Uuid, Uuid)>, Json(r): Json<QuantityRequest>) -> Result<Json<Order>> {
    check(&r)?;
    Ok(Json(s.update_item_quantity(id, item_id, r.quantity).await?))
}

async fn remove_item(State(s): State<AppState>, Path((id, item_id)): Path<(Uuid, Uuid)>) -> Result<Json<Order>> {
    Ok(Json(s.remove_item(id, item_id).await?))
}

async fn recalculate(State(s): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Order>> {
    Ok(Json(s.recalculate_totals(id).await?))
}

async fn shipment_status(State(s): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Shipment>> {
    Ok(Json(s.shipment_status(id).await?))
}

async fn shipment_history(State(s): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Vec<ShipmentEvent>>> {
    Ok(Json(s.shipment_history(id).await?))
}

// -----------------------------------------------------------------------------
// Carrier reference data
// -----------------------------------------------------------------------------

async fn list_regions(State(s): State<AppState>) -> Result<Json<Vec<Region>>> {
    Ok(Json(s.list_regions().await?))
}

async fn list_sub_regions(State(s): State<AppState>, Query(p): Query<RegionParams>) -> Result<Json<Vec<SubRegion>>> {
    Ok(Json(s.list_sub_regions(p.region_id).await?))
}

async fn list_pickup_centers(State(s): State<AppState>, Query(p): Query<RegionParams>) -> Result<Json<Vec<PickupCenter>>> {
    Ok(Json(s.list_pickup_centers(p.region_id).await?))
}

async fn quote_shipping(State(s): State<AppState>, Json(r): Json<QuoteRequest>) -> Result<Json<ShippingQuote>> {
    Ok(Json(s.quote_shipping(r.to_region_id, r.sub_region_id, r.package, r.declared_value).await?))
}
