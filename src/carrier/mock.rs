//! Scripted in-memory carrier for tests.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{
    CarrierError, CarrierGateway, Parcel, PickupCenter, RateTable, Region, Shipment, ShipmentEvent,
    ShipmentOutcome, ShipmentPatch, SubRegion,
};

/// What `create_shipments` does with the next parcels.
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Accept every parcel, tracking `TRK-<order_id>`.
    Accept,
    /// Reject every parcel with this reason.
    Reject(String),
    /// Fail the whole call as a transport error.
    Unavailable(String),
}

pub struct MockCarrier {
    configured: bool,
    behavior: Mutex<MockBehavior>,
    submitted: Mutex<Vec<Parcel>>,
    rates: Option<RateTable>,
    regions: Vec<Region>,
}

impl Default for MockCarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCarrier {
    pub fn new() -> Self {
        Self {
            configured: true,
            behavior: Mutex::new(MockBehavior::Accept),
            submitted: Mutex::new(Vec::new()),
            rates: None,
            regions: Vec::new(),
        }
    }

    pub fn unconfigured() -> Self {
        Self { configured: false, ..Self::new() }
    }

    pub fn with_behavior(self, behavior: MockBehavior) -> Self {
        self.set_behavior(behavior);
        self
    }

    pub fn with_rates(mut self, rates: RateTable) -> Self {
        self.rates = Some(rates);
        self
    }

    pub fn with_regions(mut self, regions: Vec<Region>) -> Self {
        self.regions = regions;
        self
    }

    pub fn set_behavior(&self, behavior: MockBehavior) {
        *self.behavior.lock().unwrap_or_else(|e| e.into_inner()) = behavior;
    }

    /// Every parcel handed to `create_shipments`, in call order.
    pub fn submitted(&self) -> Vec<Parcel> {
        self.submitted.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn guard(&self) -> Result<(), CarrierError> {
        if self.configured { Ok(()) } else { Err(CarrierError::NotConfigured) }
    }
}

#[async_trait]
impl CarrierGateway for MockCarrier {
    fn is_configured(&self) -> bool {
        self.configured
    }

    async fn list_regions(&self) -> Result<Vec<Region>, CarrierError> {
        self.guard()?;
        Ok(self.regions.clone())
    }

    async fn list_sub_regions(&self, _region_id: Option<i64>) -> Result<Vec<SubRegion>, CarrierError> {
        self.guard()?;
        Ok(Vec::new())
    }

    async fn list_pickup_centers(&self, _region_id: Option<i64>) -> Result<Vec<PickupCenter>, CarrierError> {
        self.guard()?;
        Ok(Vec::new())
    }

    async fn quote_rate(&self, from_region_id: i64, to_region_id: i64) -> Result<RateTable, CarrierError> {
        self.guard()?;
        self.rates
            .clone()
            .ok_or_else(|| CarrierError::NotFound(format!("rates {from_region_id}->{to_region_id}")))
    }

    async fn create_shipments(&self, parcels: &[Parcel]) -> Result<BTreeMap<String, ShipmentOutcome>, CarrierError> {
        self.guard()?;
        let behavior = self.behavior.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let MockBehavior::Unavailable(reason) = behavior {
            return Err(CarrierError::Unavailable(reason));
        }
        self.submitted.lock().unwrap_or_else(|e| e.into_inner()).extend_from_slice(parcels);
        Ok(parcels
            .iter()
            .map(|p| {
                let outcome = match &behavior {
                    MockBehavior::Reject(reason) => ShipmentOutcome::Rejected { reason: reason.clone() },
                    _ => ShipmentOutcome::Created {
                        tracking: format!("TRK-{}", p.order_id),
                        shipment_id: format!("SHP-{}", p.order_id),
                    },
                };
                (p.order_id.clone(), outcome)
            })
            .collect())
    }

    async fn get_shipment(&self, tracking: &str) -> Result<Shipment, CarrierError> {
        self.guard()?;
        let parcels = self.submitted.lock().unwrap_or_else(|e| e.into_inner());
        parcels
            .iter()
            .find(|p| format!("TRK-{}", p.order_id) == tracking)
            .map(|p| Shipment {
                tracking: tracking.to_string(),
                order_id: p.order_id.clone(),
                status: "En préparation".to_string(),
                price: Some(p.price),
                updated_at: None,
            })
            .ok_or_else(|| CarrierError::NotFound(tracking.to_string()))
    }

    async fn get_shipment_history(&self, tracking: &str) -> Result<Vec<ShipmentEvent>, CarrierError> {
        let shipment = self.get_shipment(tracking).await?;
        Ok(vec![ShipmentEvent {
            tracking: shipment.tracking,
            status: shipment.status,
            date: "2024-01-01 00:00:00".to_string(),
            reason: None,
            center_name: None,
        }])
    }

    async fn update_shipment(&self, tracking: &str, patch: &ShipmentPatch) -> Result<Shipment, CarrierError> {
        let mut shipment = self.get_shipment(tracking).await?;
        if patch.price.is_some() {
            shipment.price = patch.price;
        }
        Ok(shipment)
    }

    async fn delete_shipment(&self, tracking: &str) -> Result<(), CarrierError> {
        self.guard()?;
        let mut parcels = self.submitted.lock().unwrap_or_else(|e| e.into_inner());
        let before = parcels.len();
        parcels.retain(|p| format!("TRK-{}", p.order_id) != tracking);
        if parcels.len() == before {
            return Err(CarrierError::NotFound(tracking.to_string()));
        }
        Ok(())
    }
}
