//! Outbound order events.
//!
//! Publishing happens after the order write has committed and never fails the
//! operation that produced the event.

use std::sync::Mutex;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::domain::events::OrderEvent;

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &OrderEvent);
}

/// Publishes each event as JSON on `<prefix>.<kind>`.
pub struct NatsPublisher {
    client: async_nats::Client,
    prefix: String,
}

impl NatsPublisher {
    pub fn new(client: async_nats::Client, prefix: impl Into<String>) -> Self {
        Self { client, prefix: prefix.into() }
    }

    pub fn subject(&self, event: &OrderEvent) -> String {
        format!("{}.{}", self.prefix, event.kind())
    }
}

#[async_trait]
impl EventPublisher for NatsPublisher {
    async fn publish(&self, event: &OrderEvent) {
        let payload = match serde_json::to_vec(event) {
            Ok(p) => p,
            Err(e) => {
                warn!(order_id = %event.order_id(), error = %e, "cannot encode order event");
                return;
            }
        };
        let subject = self.subject(event);
        if let Err(e) = self.client.publish(subject.clone(), payload.into()).await {
            warn!(%subject, error = %e, "order event not published");
        }
    }
}

/// Used when no broker is configured.
#[derive(Default)]
pub struct LogPublisher;

#[async_trait]
impl EventPublisher for LogPublisher {
    async fn publish(&self, event: &OrderEvent) {
        info!(order_id = %event.order_id(), kind = event.kind(), "order event");
    }
}

/// Keeps every event in memory; for tests.
#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<OrderEvent>>,
}

impl RecordingPublisher {
    pub fn events(&self) -> Vec<OrderEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, event: &OrderEvent) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).push(event.clone());
    }
}
