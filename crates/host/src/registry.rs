use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::instrument;
use uuid::Uuid;

use crate::actor::ActorInstance;
use crate::claims::StoredClaims;

/// Process-local registry of running actor instances, keyed by public key.
///
/// The same key may map to multiple live instances; entries are added when an
/// instance starts and removed when it halts. Control-interface queries are
/// served from here without entering any instance mailbox.
#[derive(Default)]
pub struct InstanceRegistry {
    instances: RwLock<HashMap<String, Vec<Arc<ActorInstance>>>>,
}

impl InstanceRegistry {
    #[instrument(level = "debug", skip_all, fields(public_key = %instance.public_key()))]
    pub async fn register(&self, instance: Arc<ActorInstance>) {
        self.instances
            .write()
            .await
            .entry(instance.public_key().to_string())
            .or_default()
            .push(instance);
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn deregister(&self, public_key: &str, instance_id: Uuid) {
        let mut instances = self.instances.write().await;
        if let Some(entries) = instances.get_mut(public_key) {
            entries.retain(|instance| instance.instance_id() != instance_id);
            if entries.is_empty() {
                instances.remove(public_key);
            }
        }
    }

    /// All live instances registered under the given public key
    pub async fn get(&self, public_key: &str) -> Vec<Arc<ActorInstance>> {
        self.instances
            .read()
            .await
            .get(public_key)
            .cloned()
            .unwrap_or_default()
    }

    async fn first(&self, public_key: &str) -> Option<Arc<ActorInstance>> {
        self.instances
            .read()
            .await
            .get(public_key)
            .and_then(|entries| entries.first().cloned())
    }

    /// Public claims of the actor registered under the key, or an empty map
    /// if no instance is running
    pub async fn claims(&self, public_key: &str) -> HashMap<String, String> {
        match self.first(public_key).await {
            Some(instance) => StoredClaims::from(instance.claims()).into(),
            None => HashMap::default(),
        }
    }

    /// Annotations of the actor registered under the key, or an empty map if
    /// no instance is running
    pub async fn annotations(&self, public_key: &str) -> BTreeMap<String, String> {
        match self.first(public_key).await {
            Some(instance) => instance.annotations().clone(),
            None => BTreeMap::default(),
        }
    }

    /// Image reference of the actor registered under the key, or `"n/a"` if
    /// no instance is running or the actor was not started from a reference
    pub async fn image_ref(&self, public_key: &str) -> String {
        self.first(public_key)
            .await
            .and_then(|instance| instance.image_ref().map(ToString::to_string))
            .unwrap_or_else(|| "n/a".to_string())
    }

    /// Instance id of the actor registered under the key, or `"??"` if no
    /// instance is running
    pub async fn instance_id(&self, public_key: &str) -> String {
        match self.first(public_key).await {
            Some(instance) => instance.instance_id().to_string(),
            None => "??".to_string(),
        }
    }

    /// The invocation currently being processed by the instance registered
    /// under the key, if any
    pub async fn current_invocation(&self, public_key: &str) -> Option<String> {
        match self.first(public_key).await {
            Some(instance) => instance.current_invocation().await,
            None => None,
        }
    }
}
