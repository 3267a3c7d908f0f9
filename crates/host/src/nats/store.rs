//! JetStream KV implementation of the lattice data store

use anyhow::Context;
use async_nats::jetstream;
use async_nats::jetstream::kv;
use tracing::{instrument, trace};

use crate::claims::{ClaimsStore, StoredClaims};
use crate::store::ReferenceMap;

/// Lattice-wide metadata bucket shared by every host: public claims under
/// `CLAIMS_{subject}` and reference-map entries under `REFMAP_{image_ref}`.
#[derive(Clone, Debug)]
pub struct LatticeStore {
    store: kv::Store,
}

impl LatticeStore {
    #[must_use]
    pub fn new(store: kv::Store) -> Self {
        LatticeStore { store }
    }

    /// Open the data bucket for the given lattice, creating it if this host
    /// is the first to come up
    pub async fn ensure(js: &jetstream::Context, lattice: &str) -> anyhow::Result<Self> {
        let bucket = format!("LATTICEDATA_{lattice}");
        let store = match js.get_key_value(bucket.as_str()).await {
            Ok(store) => store,
            Err(_) => js
                .create_key_value(kv::Config {
                    bucket: bucket.clone(),
                    ..Default::default()
                })
                .await
                .with_context(|| format!("failed to create KV bucket {bucket}"))?,
        };
        Ok(LatticeStore::new(store))
    }
}

#[async_trait::async_trait]
impl ClaimsStore for LatticeStore {
    #[instrument(level = "debug", skip_all, fields(subject = %claims.subject()))]
    async fn put_claims(&self, claims: StoredClaims) -> anyhow::Result<()> {
        let key = format!("CLAIMS_{}", claims.subject());
        trace!(?claims, ?key, "storing claims");
        let bytes = serde_json::to_vec(&claims)
            .context("failed to serialize claims")?
            .into();
        self.store
            .put(key, bytes)
            .await
            .context("failed to put claims")?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    async fn lookup_claims(&self, public_key: &str) -> anyhow::Result<Option<StoredClaims>> {
        let key = format!("CLAIMS_{public_key}");
        let Some(bytes) = self
            .store
            .get(key)
            .await
            .context("failed to get claims")?
        else {
            return Ok(None);
        };
        let claims = serde_json::from_slice(&bytes).context("failed to deserialize claims")?;
        Ok(Some(claims))
    }
}

#[async_trait::async_trait]
impl ReferenceMap for LatticeStore {
    #[instrument(level = "debug", skip(self))]
    async fn put_reference(&self, image_ref: &str, public_key: &str) -> anyhow::Result<()> {
        self.store
            .put(
                format!("REFMAP_{image_ref}"),
                public_key.to_string().into(),
            )
            .await
            .context("failed to put reference map entry")?;
        Ok(())
    }
}
