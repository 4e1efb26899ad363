//! OpenSASE Fulfillment - order lifecycle and carrier integration service

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use opensase_fulfillment::api::build_router;
use opensase_fulfillment::publisher::{EventPublisher, LogPublisher, NatsPublisher};
use opensase_fulfillment::{AppConfig, CarrierGateway, HttpCarrierClient, MemoryOrderStore, OrderLifecycle, OrderStore, PgOrderStore};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into())).with(tracing_subscriber::fmt::layer()).init();
    let config = AppConfig::from_env()?;

    let store: Arc<dyn OrderStore> = match &config.database_url {
        Some(url) => {
            let db = PgPoolOptions::new().max_connections(10).connect(url).await.context("connecting to DATABASE_URL")?;
            sqlx::migrate!("./migrations").run(&db).await?;
            Arc::new(PgOrderStore::new(db))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, orders are kept in memory");
            Arc::new(MemoryOrderStore::new())
        }
    };

    let events: Arc<dyn EventPublisher> = match &config.nats_url {
        Some(url) => match async_nats::connect(url.as_str()).await {
            Ok(client) => Arc::new(NatsPublisher::new(client, "orders")),
            Err(e) => {
                tracing::warn!(error = %e, "NATS unreachable, order events are only logged");
                Arc::new(LogPublisher)
            }
        },
        None => Arc::new(LogPublisher),
    };

    let carrier = HttpCarrierClient::new(config.carrier.clone())?;
    if !carrier.is_configured() {
        tracing::warn!("carrier credentials missing, confirmations will not create parcels");
    }

    let lifecycle = Arc::new(OrderLifecycle::new(store, Arc::new(carrier), events, config.lifecycle.clone()));
    let app = build_router(lifecycle);

    tracing::info!("🚀 OpenSASE Fulfillment listening on 0.0.0.0:{}", config.port);
    axum::serve(tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?, app).await?;
    Ok(())
}
