//! The per-actor instance controller.
//!
//! Every running actor is a mailbox-serialized task: lifecycle commands,
//! live updates, and invocations are processed strictly one at a time in
//! arrival order, while introspection is served from a shared snapshot so
//! callers never queue behind a long-running invocation.

mod invocation;

use core::sync::atomic::{AtomicBool, Ordering};

use std::collections::BTreeMap;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context as _};
use bytes::Bytes;
use tokio::spawn;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::timeout;
use tracing::{error, info, info_span, instrument, warn, Instrument as _};
use tracing_opentelemetry::OpenTelemetrySpanExt;
use uuid::Uuid;
use wascap::jwt;
use wasmbus_core::TraceContext;
use wasmbus_tracing::context::get_span_context;

use crate::claims::{ClaimsStore, StoredClaims};
use crate::event;
use crate::policy::PolicyEvaluator;
use crate::registry::InstanceRegistry;
use crate::rpc::RpcSupervisor;
use crate::runtime::{ActorReference, Runtime};
use crate::store::{ChunkStore, ReferenceMap};
use crate::EventPublisher;

const INSTANCE_MAILBOX_SIZE: usize = 256;

/// Hard deadline on a live update observed by the outer caller. The update
/// itself blocks the mailbox, so this also bounds how long invocations queue.
const LIVE_UPDATE_DEADLINE: Duration = Duration::from_secs(30);

/// Everything a supervisor provides to start one actor instance
pub struct StartActor {
    /// Claims extracted from the signed module
    pub claims: jwt::Claims<jwt::Actor>,
    /// The raw signed module bytes to precompile
    pub bytes: Vec<u8>,
    /// Registry reference the module was fetched from, if any
    pub image_ref: Option<String>,
    /// Opaque annotations attached by the supervisor
    pub annotations: BTreeMap<String, String>,
    /// Public key of the host starting this instance
    pub host_id: String,
}

/// A request to replace the running module's bytecode in place
pub struct UpdateActor {
    pub new_bytes: Vec<u8>,
    /// Claims of the replacement module, persisted to the lattice on success.
    /// The instance's own startup claims are immutable
    pub new_claims: Option<jwt::Claims<jwt::Actor>>,
    pub new_image_ref: Option<String>,
    pub trace_context: Option<TraceContext>,
}

/// Shared services every instance on a host consumes. The runtime, stores,
/// and evaluator are host- or lattice-wide and safe for concurrent use.
pub struct HostServices {
    pub lattice_prefix: String,
    /// Issuers whose signed invocations this host trusts
    pub cluster_issuers: Vec<String>,
    pub runtime: Arc<dyn Runtime>,
    pub events: Arc<dyn EventPublisher>,
    pub policy: Arc<dyn PolicyEvaluator>,
    pub claims: Arc<dyn ClaimsStore>,
    pub chunks: Arc<dyn ChunkStore>,
    pub references: Arc<dyn ReferenceMap>,
    pub rpc: Arc<dyn RpcSupervisor>,
    pub registry: Arc<InstanceRegistry>,
}

/// Runtime metadata of one actor instance.
///
/// Everything except `actor_reference` and `current_invocation` is immutable
/// after start; those two cells are written only by the owning mailbox task,
/// so readers never contend with each other.
pub(crate) struct InstanceState {
    pub(crate) instance_id: Uuid,
    pub(crate) claims: jwt::Claims<jwt::Actor>,
    pub(crate) image_ref: Option<String>,
    pub(crate) annotations: BTreeMap<String, String>,
    pub(crate) host_id: String,
    pub(crate) lattice_prefix: String,
    pub(crate) healthy: AtomicBool,
    pub(crate) actor_reference: RwLock<ActorReference>,
    pub(crate) current_invocation: RwLock<Option<String>>,
}

enum Command {
    Rpc {
        payload: Bytes,
        trace_context: Option<TraceContext>,
        reply: oneshot::Sender<Bytes>,
    },
    Update {
        update: UpdateActor,
        reply: oneshot::Sender<()>,
    },
    Halt {
        reply: oneshot::Sender<()>,
    },
}

/// A handle to one running actor instance.
///
/// Commands funnel into the instance's mailbox and execute serially;
/// introspection reads the shared state snapshot directly.
pub struct ActorInstance {
    state: Arc<InstanceState>,
    commands: mpsc::Sender<Command>,
}

impl ActorInstance {
    /// Start a new instance: precompile the module, advertise its claims,
    /// ensure RPC delivery, publish `actor_started`, and register the
    /// instance under its public key.
    ///
    /// On precompile failure no instance remains: an `actor_start_failed`
    /// event is published and the error returned to the supervisor.
    #[instrument(level = "debug", skip_all, fields(public_key = %cmd.claims.subject, host_id = %cmd.host_id))]
    pub async fn start(
        cmd: StartActor,
        services: Arc<HostServices>,
    ) -> anyhow::Result<Arc<ActorInstance>> {
        let StartActor {
            claims,
            bytes,
            image_ref,
            annotations,
            host_id,
        } = cmd;

        let actor_reference = match services.runtime.precompile(bytes).await {
            Ok(reference) => reference,
            Err(err) => {
                error!(%err, "failed to precompile actor module");
                let data = event::actor_start_failed(
                    &claims.subject,
                    image_ref.as_deref().unwrap_or_default(),
                    &err,
                );
                if let Err(e) = services.events.publish_event("actor_start_failed", data).await {
                    error!(err = %e, "failed to publish actor start failed event");
                }
                return Err(err).context("failed to precompile actor module");
            }
        };

        let instance_id = Uuid::new_v4();
        services
            .claims
            .put_claims(StoredClaims::from(&claims))
            .await
            .context("failed to persist actor claims")?;
        services
            .rpc
            .ensure_actor_rpc(&claims.subject)
            .await
            .context("failed to ensure actor RPC subscription")?;
        if let Some(image_ref) = image_ref.as_deref().filter(|r| !r.is_empty()) {
            services
                .references
                .put_reference(image_ref, &claims.subject)
                .await
                .context("failed to write reference map entry")?;
        }

        // published before the mailbox exists, so it strictly precedes any
        // invocation event from this instance
        let data = event::actor_started(
            &claims,
            &annotations,
            instance_id,
            image_ref.as_deref().unwrap_or_default(),
        );
        if let Err(e) = services.events.publish_event("actor_started", data).await {
            error!(err = %e, "failed to publish actor started event");
        }

        let state = Arc::new(InstanceState {
            instance_id,
            claims,
            image_ref,
            annotations,
            host_id,
            lattice_prefix: services.lattice_prefix.clone(),
            healthy: AtomicBool::new(true),
            actor_reference: RwLock::new(actor_reference),
            current_invocation: RwLock::new(None),
        });
        let (commands, inbox) = mpsc::channel(INSTANCE_MAILBOX_SIZE);
        let instance = Arc::new(ActorInstance {
            state: Arc::clone(&state),
            commands,
        });
        services.registry.register(Arc::clone(&instance)).await;
        spawn(
            InstanceTask {
                state,
                services,
                inbox,
            }
            .run(),
        );
        info!(instance_id = %instance.instance_id(), "actor instance started");
        Ok(instance)
    }

    /// Deliver a serialized invocation frame to this instance and wait for
    /// the serialized response. Errors only if the instance has halted;
    /// otherwise a response is always produced, even for denied or failed
    /// invocations.
    pub async fn handle_rpc(
        &self,
        payload: Bytes,
        trace_context: Option<TraceContext>,
    ) -> anyhow::Result<Bytes> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Rpc {
                payload,
                trace_context,
                reply: tx,
            })
            .await
            .map_err(|_| anyhow!("actor instance is not running"))?;
        rx.await.context("actor instance stopped before replying")
    }

    /// Replace the running module's bytecode. Invocations queue behind the
    /// update. The reply is always success; a failed update leaves the
    /// previous module serving and is reported via `actor_update_failed`.
    pub async fn perform_live_update(&self, update: UpdateActor) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Update { update, reply: tx })
            .await
            .map_err(|_| anyhow!("actor instance is not running"))?;
        timeout(LIVE_UPDATE_DEADLINE, rx)
            .await
            .context("live update deadline exceeded")?
            .context("actor instance stopped during live update")?;
        Ok(())
    }

    /// Halt the instance: publish `actor_stopped`, deregister, and stop the
    /// mailbox after the in-flight invocation (if any) completes. Halting an
    /// instance that already stopped is a no-op.
    pub async fn halt(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Halt { reply: tx })
            .await
            .is_err()
        {
            return;
        }
        let _ = rx.await;
    }

    #[must_use]
    pub fn public_key(&self) -> &str {
        &self.state.claims.subject
    }

    #[must_use]
    pub fn instance_id(&self) -> Uuid {
        self.state.instance_id
    }

    #[must_use]
    pub fn claims(&self) -> &jwt::Claims<jwt::Actor> {
        &self.state.claims
    }

    #[must_use]
    pub fn annotations(&self) -> &BTreeMap<String, String> {
        &self.state.annotations
    }

    #[must_use]
    pub fn image_ref(&self) -> Option<&str> {
        self.state.image_ref.as_deref()
    }

    #[must_use]
    pub fn host_id(&self) -> &str {
        &self.state.host_id
    }

    #[must_use]
    pub fn lattice_prefix(&self) -> &str {
        &self.state.lattice_prefix
    }

    #[must_use]
    pub fn healthy(&self) -> bool {
        self.state.healthy.load(Ordering::Relaxed)
    }

    /// The invocation currently being processed, if any
    pub async fn current_invocation(&self) -> Option<String> {
        self.state.current_invocation.read().await.clone()
    }

    /// The module reference invocations are currently dispatched to
    pub async fn actor_reference(&self) -> ActorReference {
        self.state.actor_reference.read().await.clone()
    }
}

/// The mailbox task owning one instance. Commands execute strictly in
/// arrival order; replies to callers that went away are dropped silently.
struct InstanceTask {
    state: Arc<InstanceState>,
    services: Arc<HostServices>,
    inbox: mpsc::Receiver<Command>,
}

impl InstanceTask {
    async fn run(mut self) {
        while let Some(command) = self.inbox.recv().await {
            match command {
                Command::Rpc {
                    payload,
                    trace_context,
                    reply,
                } => {
                    let response = self.handle_rpc(&payload, trace_context.as_ref()).await;
                    let _ = reply.send(response);
                }
                Command::Update { update, reply } => {
                    self.perform_update(update).await;
                    let _ = reply.send(());
                }
                Command::Halt { reply } => {
                    self.halt().await;
                    let _ = reply.send(());
                    break;
                }
            }
        }
    }

    async fn handle_rpc(&self, payload: &[u8], trace_context: Option<&TraceContext>) -> Bytes {
        let span = info_span!(
            "Handle Invocation",
            instance_id = %self.state.instance_id,
            public_key = %self.state.claims.subject,
            invocation_id = tracing::field::Empty,
        );
        // propagate the caller's context only when the frame actually carries
        // one; otherwise the span starts a fresh trace
        if let Some(ctx) = trace_context.filter(|ctx| ctx.contains_key("traceparent")) {
            span.set_parent(get_span_context(ctx));
        }
        let response = invocation::handle_invocation(&self.state, &self.services, payload)
            .instrument(span)
            .await;
        match wasmbus_core::serialize(&response) {
            Ok(buf) => buf.into(),
            Err(err) => {
                error!(%err, "failed to serialize invocation response");
                Bytes::new()
            }
        }
    }

    async fn perform_update(&self, update: UpdateActor) {
        let span = info_span!(
            "Perform Live Update",
            public_key = %self.state.claims.subject,
            actor_ref = %update.new_image_ref.as_deref().unwrap_or_default(),
            instance_id = %self.state.instance_id,
        );
        if let Some(ctx) = update
            .trace_context
            .as_ref()
            .filter(|ctx| ctx.contains_key("traceparent"))
        {
            span.set_parent(get_span_context(ctx));
        }
        let UpdateActor {
            new_bytes,
            new_claims,
            ..
        } = update;
        async {
            match self.services.runtime.precompile(new_bytes).await {
                Ok(new_reference) => {
                    if let Some(claims) = &new_claims {
                        if let Err(err) = self
                            .services
                            .claims
                            .put_claims(StoredClaims::from(claims))
                            .await
                        {
                            error!(%err, "failed to persist updated actor claims");
                        }
                    }
                    let superseded = {
                        let mut reference = self.state.actor_reference.write().await;
                        mem::replace(&mut *reference, new_reference)
                    };
                    if let Err(err) = self.services.runtime.release(superseded).await {
                        warn!(%err, "failed to release superseded actor module");
                    }
                    let revision = new_claims
                        .as_ref()
                        .or(Some(&self.state.claims))
                        .and_then(|claims| claims.metadata.as_ref())
                        .and_then(|metadata| metadata.rev);
                    let data = event::actor_updated(
                        &self.state.claims.subject,
                        revision,
                        self.state.instance_id,
                    );
                    if let Err(e) = self.services.events.publish_event("actor_updated", data).await
                    {
                        error!(err = %e, "failed to publish actor updated event");
                    }
                    info!("actor live update complete");
                }
                Err(err) => {
                    // the previous module keeps serving
                    error!(%err, "failed to perform live update");
                    let data = event::actor_update_failed(
                        &self.state.claims.subject,
                        self.state.instance_id,
                        format!("{err:#}"),
                    );
                    if let Err(e) = self
                        .services
                        .events
                        .publish_event("actor_update_failed", data)
                        .await
                    {
                        error!(err = %e, "failed to publish actor update failed event");
                    }
                }
            }
        }
        .instrument(span)
        .await;
    }

    async fn halt(&self) {
        let data = event::actor_stopped(
            &self.state.claims.subject,
            &self.state.annotations,
            self.state.instance_id,
        );
        if let Err(e) = self.services.events.publish_event("actor_stopped", data).await {
            error!(err = %e, "failed to publish actor stopped event");
        }
        self.services
            .registry
            .deregister(&self.state.claims.subject, self.state.instance_id)
            .await;
        info!(
            public_key = %self.state.claims.subject,
            instance_id = %self.state.instance_id,
            "actor instance stopped"
        );
    }
}
