//! NATS implementation of the [crate::event::EventPublisher] trait

use anyhow::Context;
use cloudevents::{EventBuilder, EventBuilderV10};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::{instrument, warn};
use ulid::Ulid;
use uuid::Uuid;

use crate::event::EventPublisher;

/// NATS implementation of the [crate::event::EventPublisher] trait, sending
/// events to the bus with a CloudEvents payload envelope. Lifecycle events go
/// out on `wasmbus.evt.{lattice}.{name}`; invocation-result events on the
/// higher-volume `wasmbus.rpcevt.{lattice}`.
pub struct NatsEventPublisher {
    event_builder: EventBuilderV10,
    lattice: String,
    ctl_nats: async_nats::Client,
}

impl NatsEventPublisher {
    /// Create a new NATS event publisher.
    ///
    /// # Arguments
    ///
    /// * `source` - The source of the event, typically the host ID.
    /// * `lattice` - The lattice name to use for the event publisher.
    /// * `ctl_nats` - The NATS client to use for publishing events.
    pub fn new(source: String, lattice: String, ctl_nats: async_nats::Client) -> Self {
        Self {
            event_builder: EventBuilderV10::new().source(source),
            lattice,
            ctl_nats,
        }
    }

    fn build_event(&self, name: &str, data: serde_json::Value) -> anyhow::Result<Vec<u8>> {
        let now = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .context("failed to format current time")?;
        let ev = self
            .event_builder
            .clone()
            .ty(format!("com.wasmbus.lattice.{name}"))
            .id(Uuid::from_u128(Ulid::new().into()).to_string())
            .time(now)
            .data("application/json", data)
            .build()
            .context("failed to build cloud event")?;
        serde_json::to_vec(&ev).context("failed to serialize event")
    }

    async fn publish_on(
        &self,
        topic: String,
        name: &str,
        data: serde_json::Value,
    ) -> anyhow::Result<()> {
        let ev = self.build_event(name, data)?;
        let max_payload = self.ctl_nats.server_info().max_payload;
        if ev.len() > max_payload {
            warn!(
                size = ev.len(),
                max_size = max_payload,
                event = name,
                lattice = &self.lattice,
                "event payload is too large to publish and may fail",
            );
        }
        self.ctl_nats
            .publish(topic, ev.into())
            .await
            .with_context(|| format!("failed to publish `{name}` event"))
    }
}

#[async_trait::async_trait]
impl EventPublisher for NatsEventPublisher {
    #[instrument(skip(self, data))]
    async fn publish_event(&self, name: &str, data: serde_json::Value) -> anyhow::Result<()> {
        let topic = format!("wasmbus.evt.{}.{name}", self.lattice);
        self.publish_on(topic, name, data).await
    }

    #[instrument(skip(self, data))]
    async fn publish_invocation_event(
        &self,
        name: &str,
        data: serde_json::Value,
    ) -> anyhow::Result<()> {
        let topic = format!("wasmbus.rpcevt.{}", self.lattice);
        self.publish_on(topic, name, data).await
    }
}
