use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{OrderFilter, OrderStore, StoreError};
use crate::domain::aggregates::{Customer, DeliverySelection, Destination, Order, OrderItem};
use crate::domain::value_objects::{Money, OrderNumber, Quantity};

/// PostgreSQL store. Items live in `order_items` and are rewritten with their order in one transaction.
#[derive(Clone)]
pub struct PgOrderStore {
    pool: PgPool,
}

impl PgOrderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn load_items(&self, order_ids: &[Uuid]) -> Result<HashMap<Uuid, Vec<OrderItem>>, StoreError> {
        let rows = sqlx::query_as::<_, ItemRow>(
            "SELECT id, order_id, product_id, product_name, variant, quantity, unit_price \
             FROM order_items WHERE order_id = ANY($1) ORDER BY order_id, position",
        )
        .bind(order_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut grouped: HashMap<Uuid, Vec<OrderItem>> = HashMap::new();
        for row in rows {
            let order_id = row.order_id;
            grouped.entry(order_id).or_default().push(row.try_into()?);
        }
        Ok(grouped)
    }
}

#[derive(sqlx::FromRow)]
struct OrderRow {
    id: Uuid,
    order_number: String,
    customer_name: String,
    customer_phone: String,
    customer_email: Option<String>,
    delivery_type: String,
    delivery_address: Option<String>,
    pickup_desk_id: Option<i64>,
    pickup_desk_name: Option<String>,
    region_id: i64,
    region_name: String,
    sub_region: Option<String>,
    subtotal: Decimal,
    delivery_fee: Decimal,
    total: Decimal,
    notes: String,
    tracking_number: Option<String>,
    carrier_shipment_id: Option<String>,
    call_center_status: String,
    delivery_status: String,
    communication_status: Option<String>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct ItemRow {
    id: Uuid,
    order_id: Uuid,
    product_id: String,
    product_name: String,
    variant: Option<String>,
    quantity: i32,
    unit_price: Decimal,
}

const ORDER_COLUMNS: &str = "id, order_number, customer_name, customer_phone, customer_email, \
     delivery_type, delivery_address, pickup_desk_id, pickup_desk_name, region_id, region_name, sub_region, \
     subtotal, delivery_fee, total, notes, tracking_number, carrier_shipment_id, \
     call_center_status, delivery_status, communication_status, version, created_at, updated_at";

fn corrupt(e: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt(e.to_string())
}

impl TryFrom<ItemRow> for OrderItem {
    type Error = StoreError;

    fn try_from(row: ItemRow) -> Result<Self, Self::Error> {
        let quantity = u32::try_from(row.quantity).map_err(corrupt)?;
        Ok(OrderItem {
            id: row.id,
            product_id: row.product_id,
            product_name: row.product_name,
            variant: row.variant,
            quantity: Quantity::new(quantity).map_err(corrupt)?,
            unit_price: Money::new(row.unit_price),
        })
    }
}

impl OrderRow {
    fn into_order(self, items: Vec<OrderItem>) -> Result<Order, StoreError> {
        let delivery = match (self.delivery_type.as_str(), self.delivery_address, self.pickup_desk_id) {
            ("HOME_DELIVERY", Some(address), _) => DeliverySelection::HomeDelivery { address },
            ("PICKUP", _, Some(desk_id)) => DeliverySelection::Pickup {
                desk_id,
                desk_name: self.pickup_desk_name.unwrap_or_default(),
            },
            (other, _, _) => return Err(StoreError::Corrupt(format!("incomplete delivery selection {other}"))),
        };

        Ok(Order {
            id: self.id,
            order_number: OrderNumber::from(self.order_number),
            customer: Customer { name: self.customer_name, phone: self.customer_phone, email: self.customer_email },
            delivery,
            destination: Destination { region_id: self.region_id, region_name: self.region_name, sub_region: self.sub_region },
            items,
            subtotal: Money::new(self.subtotal),
            delivery_fee: Money::new(self.delivery_fee),
            total: Money::new(self.total),
            notes: self.notes,
            tracking_number: self.tracking_number,
            carrier_shipment_id: self.carrier_shipment_id,
            call_center_status: self.call_center_status.parse().map_err(corrupt)?,
            delivery_status: self.delivery_status.parse().map_err(corrupt)?,
            communication_status: self.communication_status.map(|s| s.parse()).transpose().map_err(corrupt)?,
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
            events: Vec::new(),
        })
    }
}

struct DeliveryColumns<'a> {
    kind: &'static str,
    address: Option<&'a str>,
    desk_id: Option<i64>,
    desk_name: Option<&'a str>,
}

fn delivery_columns(delivery: &DeliverySelection) -> DeliveryColumns<'_> {
    match delivery {
        DeliverySelection::HomeDelivery { address } => DeliveryColumns {
            kind: "HOME_DELIVERY", address: Some(address), desk_id: None, desk_name: None,
        },
        DeliverySelection::Pickup { desk_id, desk_name } => DeliveryColumns {
            kind: "PICKUP", address: None, desk_id: Some(*desk_id), desk_name: Some(desk_name),
        },
    }
}

async fn write_items(tx: &mut Transaction<'_, Postgres>, order: &Order) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM order_items WHERE order_id = $1")
        .bind(order.id())
        .execute(&mut **tx)
        .await?;
    for (position, item) in order.items().iter().enumerate() {
        sqlx::query(
            "INSERT INTO order_items (id, order_id, position, product_id, product_name, variant, quantity, unit_price) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(item.id())
        .bind(order.id())
        .bind(position as i32)
        .bind(item.product_id())
        .bind(item.product_name())
        .bind(item.variant())
        .bind(item.quantity().value() as i32)
        .bind(item.unit_price().amount())
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn insert(&self, order: &Order) -> Result<(), StoreError> {
        let delivery = delivery_columns(order.delivery());
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            "INSERT INTO orders (id, order_number, customer_name, customer_phone, customer_email, \
             delivery_type, delivery_address, pickup_desk_id, pickup_desk_name, region_id, region_name, sub_region, \
             subtotal, delivery_fee, total, notes, tracking_number, carrier_shipment_id, \
             call_center_status, delivery_status, communication_status, version, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24) \
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(order.id())
        .bind(order.order_number().as_str())
        .bind(&order.customer().name)
        .bind(&order.customer().phone)
        .bind(order.customer().email.as_deref())
        .bind(delivery.kind)
        .bind(delivery.address)
        .bind(delivery.desk_id)
        .bind(delivery.desk_name)
        .bind(order.destination().region_id)
        .bind(&order.destination().region_name)
        .bind(order.destination().sub_region.as_deref())
        .bind(order.subtotal().amount())
        .bind(order.delivery_fee().amount())
        .bind(order.total().amount())
        .bind(order.notes())
        .bind(order.tracking_number())
        .bind(order.carrier_shipment_id())
        .bind(order.call_center_status().as_str())
        .bind(order.delivery_status().as_str())
        .bind(order.communication_status().map(|s| s.as_str()))
        .bind(order.version())
        .bind(order.created_at())
        .bind(order.updated_at())
        .execute(&mut *tx)
        .await?;
        if inserted.rows_affected() == 0 {
            return Err(StoreError::Duplicate(order.id()));
        }
        write_items(&mut tx, order).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Order>, StoreError> {
        let row = sqlx::query_as::<_, OrderRow>(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else { return Ok(None) };
        let items = self.load_items(&[id]).await?.remove(&id).unwrap_or_default();
        row.into_order(items).map(Some)
    }

    async fn update(&self, order: &Order) -> Result<(), StoreError> {
        let delivery = delivery_columns(order.delivery());
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE orders SET customer_name = $3, customer_phone = $4, customer_email = $5, \
             delivery_type = $6, delivery_address = $7, pickup_desk_id = $8, pickup_desk_name = $9, \
             region_id = $10, region_name = $11, sub_region = $12, \
             subtotal = $13, delivery_fee = $14, total = $15, notes = $16, \
             tracking_number = $17, carrier_shipment_id = $18, \
             call_center_status = $19, delivery_status = $20, communication_status = $21, \
             updated_at = $22, version = version + 1 \
             WHERE id = $1 AND version = $2",
        )
        .bind(order.id())
        .bind(order.version())
        .bind(&order.customer().name)
        .bind(&order.customer().phone)
        .bind(order.customer().email.as_deref())
        .bind(delivery.kind)
        .bind(delivery.address)
        .bind(delivery.desk_id)
        .bind(delivery.desk_name)
        .bind(order.destination().region_id)
        .bind(&order.destination().region_name)
        .bind(order.destination().sub_region.as_deref())
        .bind(order.subtotal().amount())
        .bind(order.delivery_fee().amount())
        .bind(order.total().amount())
        .bind(order.notes())
        .bind(order.tracking_number())
        .bind(order.carrier_shipment_id())
        .bind(order.call_center_status().as_str())
        .bind(order.delivery_status().as_str())
        .bind(order.communication_status().map(|s| s.as_str()))
        .bind(order.updated_at())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            let exists: Option<(i64,)> = sqlx::query_as("SELECT version FROM orders WHERE id = $1")
                .bind(order.id())
                .fetch_optional(&mut *tx)
                .await?;
            return Err(match exists {
                Some(_) => StoreError::Conflict { id: order.id(), expected: order.version() },
                None => StoreError::NotFound(order.id()),
            });
        }

        write_items(&mut tx, order).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list(&self, filter: &OrderFilter) -> Result<Vec<Order>, StoreError> {
        let rows = sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders \
             WHERE ($1::text IS NULL OR call_center_status = $1) AND ($2::text IS NULL OR delivery_status = $2) \
             ORDER BY created_at DESC LIMIT $3 OFFSET $4"
        ))
        .bind(filter.call_center_status.map(|s| s.as_str()))
        .bind(filter.delivery_status.map(|s| s.as_str()))
        .bind(i64::from(filter.limit))
        .bind(i64::from(filter.offset))
        .fetch_all(&self.pool)
        .await?;

        let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
        let mut items = self.load_items(&ids).await?;
        rows.into_iter()
            .map(|row| {
                let order_items = items.remove(&row.id).unwrap_or_default();
                row.into_order(order_items)
            })
            .collect()
    }
}
