//! HTTP client for the carrier API.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{
    CarrierError, CarrierGateway, Parcel, PickupCenter, RateTable, Region, Shipment, ShipmentEvent,
    ShipmentOutcome, ShipmentPatch, SubRegion,
};

const API_ID_HEADER: &str = "X-API-ID";
const API_TOKEN_HEADER: &str = "X-API-TOKEN";

/// Carrier connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CarrierConfig {
    pub api_id: Option<String>,
    pub api_token: Option<String>,
    pub base_url: String,
    /// Bound on every request; there is no retry.
    pub timeout: Duration,
}

impl Default for CarrierConfig {
    fn default() -> Self {
        Self {
            api_id: None,
            api_token: None,
            base_url: "https://api.carrier.example/v1".to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

impl CarrierConfig {
    pub fn with_credentials(mut self, api_id: impl Into<String>, api_token: impl Into<String>) -> Self {
        self.api_id = Some(api_id.into());
        self.api_token = Some(api_token.into());
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Deserialize)]
struct ListEnvelope<T> {
    data: Vec<T>,
}

#[derive(Deserialize)]
struct ParcelResult {
    success: bool,
    #[serde(default)]
    tracking: Option<String>,
    #[serde(default)]
    shipment_id: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl From<ParcelResult> for ShipmentOutcome {
    fn from(r: ParcelResult) -> Self {
        match (r.success, r.tracking, r.shipment_id) {
            (true, Some(tracking), Some(shipment_id)) => ShipmentOutcome::Created { tracking, shipment_id },
            (true, _, _) => ShipmentOutcome::Rejected {
                reason: "carrier accepted the parcel without returning a tracking number".to_string(),
            },
            (false, _, _) => ShipmentOutcome::Rejected {
                reason: r.message.unwrap_or_else(|| "rejected without reason".to_string()),
            },
        }
    }
}

pub struct HttpCarrierClient {
    http: Client,
    config: CarrierConfig,
}

impl HttpCarrierClient {
    pub fn new(config: CarrierConfig) -> Result<Self, CarrierError> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| CarrierError::Unavailable(format!("cannot build http client: {e}")))?;
        Ok(Self { http, config })
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, CarrierError> {
        let (Some(id), Some(token)) = (&self.config.api_id, &self.config.api_token) else {
            return Err(CarrierError::NotConfigured);
        };
        let url = format!("{}/{}", self.config.base_url.trim_end_matches('/'), path.trim_start_matches('/'));
        debug!(%method, %url, "carrier request");
        Ok(self
            .http
            .request(method, url)
            .header(API_ID_HEADER, id)
            .header(API_TOKEN_HEADER, token))
    }

    async fn dispatch(&self, request: RequestBuilder, subject: &str) -> Result<Response, CarrierError> {
        let response = request.send().await.map_err(|e| {
            let reason = if e.is_timeout() { "request timed out".to_string() } else { e.to_string() };
            warn!(subject, %reason, "carrier transport failure");
            CarrierError::Unavailable(reason)
        })?;

        match response.status() {
            s if s.is_success() => Ok(response),
            StatusCode::NOT_FOUND => Err(CarrierError::NotFound(subject.to_string())),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                warn!(subject, "carrier refused credentials");
                Err(CarrierError::Unavailable("authentication rejected".to_string()))
            }
            s => {
                warn!(subject, status = %s, "carrier returned error status");
                Err(CarrierError::Unavailable(format!("unexpected status {s}")))
            }
        }
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder, subject: &str) -> Result<T, CarrierError> {
        self.dispatch(request, subject)
            .await?
            .json::<T>()
            .await
            .map_err(|e| CarrierError::Unavailable(format!("malformed response: {e}")))
    }

    async fn list<T: DeserializeOwned>(&self, path: &str, region_id: Option<i64>) -> Result<Vec<T>, CarrierError> {
        let mut request = self.request(Method::GET, path)?;
        if let Some(id) = region_id {
            request = request.query(&[("region_id", id)]);
        }
        let envelope: ListEnvelope<T> = self.send(request, path).await?;
        Ok(envelope.data)
    }
}

#[async_trait]
impl CarrierGateway for HttpCarrierClient {
    fn is_configured(&self) -> bool {
        self.config.api_id.is_some() && self.config.api_token.is_some()
    }

    async fn list_regions(&self) -> Result<Vec<Region>, CarrierError> {
        self.list("regions", None).await
    }

    async fn list_sub_regions(&self, region_id: Option<i64>) -> Result<Vec<SubRegion>, CarrierError> {
        self.list("subregions", region_id).await
    }

    async fn list_pickup_centers(&self, region_id: Option<i64>) -> Result<Vec<PickupCenter>, CarrierError> {
        self.list("pickup-centers", region_id).await
    }

    async fn quote_rate(&self, from_region_id: i64, to_region_id: i64) -> Result<RateTable, CarrierError> {
        let request = self
            .request(Method::GET, "rates")?
            .query(&[("from_region_id", from_region_id), ("to_region_id", to_region_id)]);
        self.send(request, "rates").await
    }

    async fn create_shipments(&self, parcels: &[Parcel]) -> Result<BTreeMap<String, ShipmentOutcome>, CarrierError> {
        let request = self.request(Method::POST, "parcels")?.json(parcels);
        let results: BTreeMap<String, ParcelResult> = self.send(request, "parcels").await?;
        Ok(results.into_iter().map(|(order_id, r)| (order_id, r.into())).collect())
    }

    async fn get_shipment(&self, tracking: &str) -> Result<Shipment, CarrierError> {
        let request = self.request(Method::GET, &format!("parcels/{tracking}"))?;
        self.send(request, tracking).await
    }

    async fn get_shipment_history(&self, tracking: &str) -> Result<Vec<ShipmentEvent>, CarrierError> {
        let request = self.request(Method::GET, "parcel-history")?.query(&[("tracking", tracking)]);
        let envelope: ListEnvelope<ShipmentEvent> = self.send(request, tracking).await?;
        Ok(envelope.data)
    }

    async fn update_shipment(&self, tracking: &str, patch: &ShipmentPatch) -> Result<Shipment, CarrierError> {
        let request = self.request(Method::PATCH, &format!("parcels/{tracking}"))?.json(patch);
        self.send(request, tracking).await
    }

    async fn delete_shipment(&self, tracking: &str) -> Result<(), CarrierError> {
        let request = self.request(Method::DELETE, &format!("parcels/{tracking}"))?;
        self.dispatch(request, tracking).await?;
        Ok(())
    }
}
