//! NATS implementation of the [crate::rpc::RpcSupervisor] trait

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use futures::stream::{AbortHandle, Abortable};
use futures::StreamExt;
use tokio::spawn;
use tokio::sync::Mutex;
use tracing::{debug, error, instrument, warn};
use wasmbus_core::TraceContext;

use crate::registry::InstanceRegistry;
use crate::rpc::RpcSupervisor;

/// Keeps one queue subscription per actor public key on
/// `wasmbus.rpc.{lattice}.{pk}`, delivering frames to registered instances
/// round-robin and publishing their serialized responses on the reply
/// subject. Frames for which no instance is registered are dropped.
pub struct NatsRpcSupervisor {
    rpc_nats: async_nats::Client,
    lattice_prefix: String,
    registry: Arc<InstanceRegistry>,
    subscriptions: Mutex<HashMap<String, AbortHandle>>,
}

impl NatsRpcSupervisor {
    #[must_use]
    pub fn new(
        rpc_nats: async_nats::Client,
        lattice_prefix: String,
        registry: Arc<InstanceRegistry>,
    ) -> Self {
        NatsRpcSupervisor {
            rpc_nats,
            lattice_prefix,
            registry,
            subscriptions: Mutex::default(),
        }
    }

    /// Abort every RPC subscription, e.g. during host shutdown
    pub async fn abort_all(&self) {
        for (_, subscription) in self.subscriptions.lock().await.drain() {
            subscription.abort();
        }
    }
}

#[async_trait::async_trait]
impl RpcSupervisor for NatsRpcSupervisor {
    #[instrument(level = "debug", skip(self))]
    async fn ensure_actor_rpc(&self, public_key: &str) -> anyhow::Result<()> {
        let mut subscriptions = self.subscriptions.lock().await;
        if subscriptions.contains_key(public_key) {
            return Ok(());
        }
        let topic = format!("wasmbus.rpc.{}.{public_key}", self.lattice_prefix);
        // the topic doubles as the queue group so that hosts on the lattice
        // share the load for actors running in multiple places
        let frames = self
            .rpc_nats
            .queue_subscribe(topic.clone(), topic.clone())
            .await
            .with_context(|| format!("failed to subscribe on {topic}"))?;
        debug!(%topic, "subscribed for actor RPC");

        let (abort, abort_reg) = AbortHandle::new_pair();
        let nats = self.rpc_nats.clone();
        let registry = Arc::clone(&self.registry);
        let subject = public_key.to_string();
        spawn(async move {
            let mut frames = Abortable::new(frames, abort_reg);
            let mut served: usize = 0;
            while let Some(message) = frames.next().await {
                let instances = registry.get(&subject).await;
                if instances.is_empty() {
                    warn!(public_key = %subject, "dropping RPC frame for actor with no running instances");
                    continue;
                }
                let instance = &instances[served % instances.len()];
                served = served.wrapping_add(1);
                let trace_context = message.headers.as_ref().map(trace_context_from_headers);
                match instance.handle_rpc(message.payload, trace_context).await {
                    Ok(response) => {
                        if let Some(reply) = message.reply {
                            if let Err(err) = nats.publish(reply, response).await {
                                error!(%err, "failed to publish invocation response");
                            }
                        }
                    }
                    Err(err) => {
                        // the instance halted mid-frame; the requester times out
                        warn!(%err, public_key = %subject, "actor instance dropped RPC frame");
                    }
                }
            }
        });
        subscriptions.insert(public_key.to_string(), abort);
        Ok(())
    }
}

fn trace_context_from_headers(headers: &async_nats::HeaderMap) -> TraceContext {
    headers
        .iter()
        .map(|(name, values)| {
            (
                std::str::from_utf8(name.as_ref())
                    .unwrap_or_default()
                    .to_string(),
                values
                    .first()
                    .map(|value| value.as_str().to_string())
                    .unwrap_or_default(),
            )
        })
        .collect()
}
