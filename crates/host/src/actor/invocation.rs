//! The invocation pipeline: unpack, anti-forgery, capability check, policy,
//! dechunk, dispatch, and the chunked-response rule.
//!
//! Denials short-circuit as an early [`InvocationResponse`]; no failure in
//! this pipeline crashes the instance and every delivered frame produces
//! exactly one response and one invocation-result event.

use tracing::{error, warn, Span};

use wasmbus_core::chunking::CHUNK_THRESHOLD_BYTES;
use wasmbus_core::{deserialize, Invocation, InvocationResponse};
use wasmbus_tracing::context::TraceContextInjector;

use super::{HostServices, InstanceState};
use crate::event;
use crate::policy::{is_expired, RequestSource, RequestTarget, Response as PolicyDecision};

pub(crate) async fn handle_invocation(
    state: &InstanceState,
    services: &HostServices,
    payload: &[u8],
) -> InvocationResponse {
    let (response, inv) = match deserialize::<Invocation>(payload) {
        Ok(mut inv) => {
            Span::current().record("invocation_id", tracing::field::display(&inv.id));
            *state.current_invocation.write().await = Some(inv.id.clone());
            let response = match run_gates(state, services, &mut inv).await {
                Ok(()) => dispatch(state, services, &inv).await,
                Err(denied) => denied,
            };
            *state.current_invocation.write().await = None;
            (response, inv)
        }
        Err(err) => {
            warn!(%err, "failed to deserialize invocation");
            let response = deny(state, "", "Failed to deserialize invocation");
            (response, Invocation::default())
        }
    };

    let event_name = if response.error.is_none() {
        "invocation_succeeded"
    } else {
        "invocation_failed"
    };
    // the response record's content_length survives chunking, so the event
    // reports the real response size even when the wire msg was emptied
    let data = event::invocation_result(
        &inv.origin,
        &inv.target,
        &inv.operation,
        response.content_length,
    );
    if let Err(err) = services
        .events
        .publish_invocation_event(event_name, data)
        .await
    {
        error!(%err, "failed to publish invocation result event");
    }
    response
}

/// A short-circuit response for a frame that failed a pipeline gate
fn deny(
    state: &InstanceState,
    invocation_id: &str,
    error: impl Into<String>,
) -> InvocationResponse {
    InvocationResponse {
        msg: Vec::new(),
        invocation_id: invocation_id.to_string(),
        instance_id: state.instance_id.to_string(),
        error: Some(error.into()),
        content_length: 0,
    }
}

/// Runs the three authorization gates and the dechunk step, in order. The
/// policy evaluator is never consulted for a frame that failed the capability
/// check, and no payload is materialized for a frame any gate rejected.
async fn run_gates(
    state: &InstanceState,
    services: &HostServices,
    inv: &mut Invocation,
) -> Result<(), InvocationResponse> {
    if let Err(err) = inv.validate_antiforgery(&services.cluster_issuers) {
        warn!(%err, "anti-forgery check failed");
        return Err(deny(
            state,
            &inv.id,
            format!("Anti-forgery check failed: {err}"),
        ));
    }

    // An origin that does not identify itself with a contract id is another
    // actor and passes unconditionally. A capability provider may only invoke
    // an actor whose claims include the provider's contract id, with or
    // without a link name on the wire.
    let contract_id = &inv.origin.contract_id;
    if !contract_id.is_empty() {
        let claimed = state
            .claims
            .metadata
            .as_ref()
            .and_then(|metadata| metadata.caps.as_ref())
            .map(|caps| caps.contains(contract_id))
            .unwrap_or_default();
        if !claimed {
            warn!(%contract_id, "invocation source lacks required capability claim");
            return Err(deny(
                state,
                &inv.id,
                format!(
                    "Invocation source does not have the required capability claim {contract_id}"
                ),
            ));
        }
    }

    let source_claims = match services.claims.lookup_claims(&inv.origin.public_key).await {
        Ok(Some(claims)) => claims,
        Ok(None) => {
            warn!(public_key = %inv.origin.public_key, "no claims advertised for invocation source");
            return Err(deny(
                state,
                &inv.id,
                "Policy evaluation rejected invocation attempt",
            ));
        }
        Err(err) => {
            error!(%err, "failed to look up source claims");
            return Err(deny(
                state,
                &inv.id,
                "Policy evaluation rejected invocation attempt",
            ));
        }
    };
    let target_claims = match services.claims.lookup_claims(&inv.target.public_key).await {
        Ok(Some(claims)) => claims,
        Ok(None) => {
            warn!(public_key = %inv.target.public_key, "no claims advertised for invocation target");
            return Err(deny(
                state,
                &inv.id,
                "Policy evaluation rejected invocation attempt",
            ));
        }
        Err(err) => {
            error!(%err, "failed to look up target claims");
            return Err(deny(
                state,
                &inv.id,
                "Policy evaluation rejected invocation attempt",
            ));
        }
    };
    if source_claims.expires_at().map(is_expired).unwrap_or_default() {
        warn!(public_key = %inv.origin.public_key, "invocation source claims have expired");
        return Err(deny(
            state,
            &inv.id,
            "Policy evaluation rejected invocation attempt",
        ));
    }

    let mut source = RequestSource::from(&source_claims);
    // the link name is carried on the wire, not in claims
    if !inv.origin.link_name.is_empty() {
        source.link_name = Some(inv.origin.link_name.clone());
    }
    let target = RequestTarget::from(&target_claims);
    match services
        .policy
        .evaluate_perform_invocation(source, target)
        .await
    {
        Ok(PolicyDecision {
            permitted: true, ..
        }) => {}
        Ok(PolicyDecision {
            request_id,
            message,
            ..
        }) => {
            warn!(request_id, ?message, "policy denied invocation");
            return Err(deny(
                state,
                &inv.id,
                "Policy evaluation rejected invocation attempt",
            ));
        }
        Err(err) => {
            error!(%err, "policy evaluation failed");
            return Err(deny(
                state,
                &inv.id,
                "Policy evaluation rejected invocation attempt",
            ));
        }
    }

    // materialize a chunked payload only after every gate has passed
    if inv.content_length > inv.msg.len() as u64 {
        match services.chunks.dechunk(&inv.id).await {
            Ok(msg) => inv.msg = msg,
            Err(err) => {
                // proceed with an empty payload; the runtime's rejection is
                // the observable outcome
                error!(%err, "failed to dechunk invocation payload");
                inv.msg = Vec::new();
            }
        }
    }

    Ok(())
}

/// Dispatch to the wasm runtime and apply the chunked-response rule
async fn dispatch(
    state: &InstanceState,
    services: &HostServices,
    inv: &Invocation,
) -> InvocationResponse {
    let actor_reference = state.actor_reference.read().await.clone();
    let trace_context = TraceContextInjector::default_with_span().into();
    match services
        .runtime
        .invoke(&actor_reference, &inv.operation, inv.msg.clone(), trace_context)
        .await
    {
        Ok(msg) => chunk_response(state, services, &inv.id, msg).await,
        Err(err) => {
            error!(%err, "actor invocation failed");
            InvocationResponse {
                msg: Vec::new(),
                invocation_id: inv.id.clone(),
                instance_id: state.instance_id.to_string(),
                error: Some(format!("{err:#}")),
                content_length: 0,
            }
        }
    }
}

async fn chunk_response(
    state: &InstanceState,
    services: &HostServices,
    invocation_id: &str,
    msg: Vec<u8>,
) -> InvocationResponse {
    let content_length = msg.len() as u64;
    let msg = if msg.len() > CHUNK_THRESHOLD_BYTES {
        match services
            .chunks
            .chunkify(&format!("{invocation_id}-r"), &msg)
            .await
        {
            Ok(()) => Vec::new(),
            Err(err) => {
                // best effort: leave the payload inline and let the bus try
                error!(%err, "failed to chunkify response");
                msg
            }
        }
    } else {
        msg
    };
    InvocationResponse {
        msg,
        invocation_id: invocation_id.to_string(),
        instance_id: state.instance_id.to_string(),
        error: None,
        content_length,
    }
}
