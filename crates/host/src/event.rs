use std::collections::BTreeMap;

use serde_json::json;
use uuid::Uuid;
use wascap::jwt;
use wasmbus_core::WasmCloudEntity;

/// A trait for publishing host events. This can be implemented by any
/// transport that can send the serialized event to the appropriate
/// destination.
#[async_trait::async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a lifecycle event that occurred in the host. The event name is
    /// the type of event being published and the data is its payload. By
    /// default this is a no-op.
    async fn publish_event(
        &self,
        _event_name: &str,
        _data: serde_json::Value,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Publish an invocation-result event. These are emitted once per
    /// delivered invocation and go out on a separate, higher-volume topic
    /// than lifecycle events. By default this is a no-op.
    async fn publish_invocation_event(
        &self,
        _event_name: &str,
        _data: serde_json::Value,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A default implementation of the [EventPublisher] trait that does nothing.
/// This is useful for testing or when no event publishing is required.
#[derive(Default)]
pub struct DefaultEventPublisher {}
impl EventPublisher for DefaultEventPublisher {}

fn format_actor_claims(claims: &jwt::Claims<jwt::Actor>) -> serde_json::Value {
    let issuer = &claims.issuer;
    let not_before_human = claims
        .not_before
        .map(|n| n.to_string())
        .unwrap_or_else(|| "never".to_string());
    let expires_human = claims
        .expires
        .map(|n| n.to_string())
        .unwrap_or_else(|| "never".to_string());
    if let Some(actor) = &claims.metadata {
        json!({
            "call_alias": actor.call_alias,
            "caps": actor.caps,
            "issuer": issuer,
            "tags": actor.tags,
            "name": actor.name,
            "version": actor.ver,
            "revision": actor.rev,
            "not_before_human": not_before_human,
            "expires_human": expires_human,
        })
    } else {
        json!({
            "issuer": issuer,
            "not_before_human": not_before_human,
            "expires_human": expires_human,
        })
    }
}

pub fn actor_started(
    claims: &jwt::Claims<jwt::Actor>,
    annotations: &BTreeMap<String, String>,
    instance_id: Uuid,
    image_ref: impl AsRef<str>,
) -> serde_json::Value {
    json!({
        "public_key": claims.subject,
        "image_ref": image_ref.as_ref(),
        "api_version": "n/a",
        "instance_id": instance_id,
        "annotations": annotations,
        "claims": format_actor_claims(claims),
    })
}

pub fn actor_start_failed(
    public_key: impl AsRef<str>,
    image_ref: impl AsRef<str>,
    error: &anyhow::Error,
) -> serde_json::Value {
    json!({
        "public_key": public_key.as_ref(),
        "image_ref": image_ref.as_ref(),
        "error": format!("{error:#}"),
    })
}

pub fn actor_stopped(
    public_key: impl AsRef<str>,
    annotations: &BTreeMap<String, String>,
    instance_id: Uuid,
) -> serde_json::Value {
    json!({
        "public_key": public_key.as_ref(),
        "instance_id": instance_id,
        "annotations": annotations,
    })
}

pub fn actor_updated(
    public_key: impl AsRef<str>,
    revision: Option<i32>,
    instance_id: Uuid,
) -> serde_json::Value {
    json!({
        "public_key": public_key.as_ref(),
        "revision": revision,
        "instance_id": instance_id,
    })
}

pub fn actor_update_failed(
    public_key: impl AsRef<str>,
    instance_id: Uuid,
    reason: impl AsRef<str>,
) -> serde_json::Value {
    json!({
        "public_key": public_key.as_ref(),
        "instance_id": instance_id,
        "reason": reason.as_ref(),
    })
}

/// Payload shared by `invocation_succeeded` and `invocation_failed` events.
/// `bytes` is the full byte length of the response payload, even when the
/// response itself was externalized to the object store.
pub fn invocation_result(
    origin: &WasmCloudEntity,
    target: &WasmCloudEntity,
    operation: impl AsRef<str>,
    bytes: u64,
) -> serde_json::Value {
    json!({
        "source": {
            "public_key": origin.public_key,
            "contract_id": origin.contract_id,
            "link_name": origin.link_name,
        },
        "dest": {
            "public_key": target.public_key,
            "contract_id": target.contract_id,
            "link_name": target.link_name,
        },
        "operation": operation.as_ref(),
        "bytes": bytes,
    })
}
