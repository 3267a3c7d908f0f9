//! Public claims cache entries for actors and capability providers.
//!
//! Every host on a lattice persists the (public) claims of the entities it
//! runs so that any other host can authorize invocations from them without
//! holding the signed module itself.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use wascap::jwt;

/// Consumed interface to the lattice-wide claims store
#[async_trait::async_trait]
pub trait ClaimsStore: Send + Sync {
    /// Persist public claims under the subject's public key
    async fn put_claims(&self, claims: StoredClaims) -> anyhow::Result<()>;

    /// Look up previously persisted claims by public key. `Ok(None)` means no
    /// entity with that key has advertised claims on this lattice
    async fn lookup_claims(&self, public_key: &str) -> anyhow::Result<Option<StoredClaims>>;
}

/// The public projection of signed claims, as persisted to the lattice
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum StoredClaims {
    Actor(StoredActorClaims),
    Provider(StoredProviderClaims),
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct StoredActorClaims {
    pub call_alias: String,
    #[serde(alias = "iss")]
    pub issuer: String,
    pub name: String,
    #[serde(alias = "rev")]
    pub revision: String,
    #[serde(alias = "sub")]
    pub subject: String,
    pub caps: Vec<String>,
    pub tags: Vec<String>,
    pub version: String,
    /// Unix timestamp after which these claims are no longer valid, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct StoredProviderClaims {
    pub contract_id: String,
    #[serde(alias = "iss")]
    pub issuer: String,
    pub name: String,
    #[serde(alias = "rev")]
    pub revision: String,
    #[serde(alias = "sub")]
    pub subject: String,
    pub version: String,
    /// Unix timestamp after which these claims are no longer valid, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

impl StoredClaims {
    /// The public key these claims describe
    #[must_use]
    pub fn subject(&self) -> &str {
        match self {
            StoredClaims::Actor(claims) => &claims.subject,
            StoredClaims::Provider(claims) => &claims.subject,
        }
    }

    /// When the claims stop being valid, if an expiry was signed in
    #[must_use]
    pub fn expires_at(&self) -> Option<u64> {
        match self {
            StoredClaims::Actor(claims) => claims.expires_at,
            StoredClaims::Provider(claims) => claims.expires_at,
        }
    }
}

impl From<&jwt::Claims<jwt::Actor>> for StoredClaims {
    fn from(claims: &jwt::Claims<jwt::Actor>) -> Self {
        let metadata = claims.metadata.clone().unwrap_or_default();
        StoredClaims::Actor(StoredActorClaims {
            call_alias: metadata.call_alias.unwrap_or_default(),
            issuer: claims.issuer.clone(),
            name: metadata.name.unwrap_or_default(),
            revision: metadata.rev.unwrap_or_default().to_string(),
            subject: claims.subject.clone(),
            caps: metadata.caps.unwrap_or_default(),
            tags: metadata.tags.unwrap_or_default(),
            version: metadata.ver.unwrap_or_default(),
            expires_at: claims.expires,
        })
    }
}

impl From<&jwt::Claims<jwt::CapabilityProvider>> for StoredClaims {
    fn from(claims: &jwt::Claims<jwt::CapabilityProvider>) -> Self {
        let metadata = claims.metadata.clone().unwrap_or_default();
        StoredClaims::Provider(StoredProviderClaims {
            contract_id: metadata.capid,
            issuer: claims.issuer.clone(),
            name: metadata.name.unwrap_or_default(),
            revision: metadata.rev.unwrap_or_default().to_string(),
            subject: claims.subject.clone(),
            version: metadata.ver.unwrap_or_default(),
            expires_at: claims.expires,
        })
    }
}

#[allow(clippy::implicit_hasher)]
impl From<StoredClaims> for HashMap<String, String> {
    fn from(claims: StoredClaims) -> Self {
        match claims {
            StoredClaims::Actor(claims) => HashMap::from([
                ("call_alias".to_string(), claims.call_alias),
                ("issuer".to_string(), claims.issuer),
                ("name".to_string(), claims.name),
                ("revision".to_string(), claims.revision),
                ("subject".to_string(), claims.subject),
                ("caps".to_string(), claims.caps.join(",")),
                ("tags".to_string(), claims.tags.join(",")),
                ("version".to_string(), claims.version),
            ]),
            StoredClaims::Provider(claims) => HashMap::from([
                ("contract_id".to_string(), claims.contract_id),
                ("issuer".to_string(), claims.issuer),
                ("name".to_string(), claims.name),
                ("revision".to_string(), claims.revision),
                ("subject".to_string(), claims.subject),
                ("version".to_string(), claims.version),
            ]),
        }
    }
}

#[cfg(test)]
mod test {
    use wascap::prelude::ClaimsBuilder;

    use super::*;

    #[test]
    fn stored_claims_roundtrip_discriminates_variants() {
        let actor = StoredClaims::Actor(StoredActorClaims {
            call_alias: "echo".into(),
            issuer: "ACLUSTER".into(),
            name: "echo".into(),
            revision: "3".into(),
            subject: "MACTOR".into(),
            caps: vec!["wasmcloud:httpserver".into()],
            tags: vec![],
            version: "1.0.0".into(),
            expires_at: None,
        });
        let provider = StoredClaims::Provider(StoredProviderClaims {
            contract_id: "wasmcloud:httpserver".into(),
            issuer: "ACLUSTER".into(),
            name: "httpserver".into(),
            revision: "1".into(),
            subject: "VPROVIDER".into(),
            version: "0.9.0".into(),
            expires_at: Some(12345),
        });

        let actor_json = serde_json::to_vec(&actor).expect("serialize actor claims");
        let provider_json = serde_json::to_vec(&provider).expect("serialize provider claims");

        assert!(matches!(
            serde_json::from_slice(&actor_json).expect("deserialize actor claims"),
            StoredClaims::Actor(StoredActorClaims { ref subject, .. }) if subject == "MACTOR"
        ));
        assert!(matches!(
            serde_json::from_slice(&provider_json).expect("deserialize provider claims"),
            StoredClaims::Provider(StoredProviderClaims { ref contract_id, .. })
                if contract_id == "wasmcloud:httpserver"
        ));
    }

    #[test]
    fn actor_claims_projection() {
        let claims = ClaimsBuilder::new()
            .subject("MACTOR")
            .issuer("ACLUSTER")
            .with_metadata(jwt::Actor {
                name: Some("kvcounter".into()),
                caps: Some(vec!["wasmcloud:keyvalue".into()]),
                rev: Some(2),
                ver: Some("0.2.0".into()),
                ..Default::default()
            })
            .build();
        let stored = StoredClaims::from(&claims);
        assert_eq!(stored.subject(), "MACTOR");
        let map: HashMap<String, String> = stored.into();
        assert_eq!(map["caps"], "wasmcloud:keyvalue");
        assert_eq!(map["revision"], "2");
    }
}
