//! End-to-end tests for the actor instance controller, driving the lifecycle
//! and the invocation pipeline through in-memory implementations of the
//! consumed interfaces.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail};
use bytes::Bytes;
use nkeys::KeyPair;
use wascap::jwt;
use wascap::prelude::ClaimsBuilder;
use wasmbus_core::chunking::CHUNK_THRESHOLD_BYTES;
use wasmbus_core::{deserialize, serialize, Invocation, InvocationResponse, WasmCloudEntity};
use wasmbus_host::actor::{ActorInstance, HostServices, StartActor, UpdateActor};
use wasmbus_host::claims::{ClaimsStore, StoredClaims};
use wasmbus_host::event::EventPublisher;
use wasmbus_host::policy::{
    PolicyEvaluator, RequestSource, RequestTarget, Response as PolicyResponse,
};
use wasmbus_host::registry::InstanceRegistry;
use wasmbus_host::rpc::RpcSupervisor;
use wasmbus_host::runtime::{ActorReference, Runtime};
use wasmbus_host::store::{ChunkStore, ReferenceMap};

const LATTICE: &str = "default";
const ACTOR_KEY: &str = "MACTOR";
const CALLER_KEY: &str = "MCALLER";
const PROVIDER_KEY: &str = "VPROVIDER";

/// Runtime double: mints `module-N` references, echoes payloads unless told
/// to answer with a fixed-size response or fail, and records every dispatch.
#[derive(Default)]
struct FakeRuntime {
    precompiled: AtomicUsize,
    precompile_error: Mutex<Option<String>>,
    response_size: Mutex<Option<usize>>,
    invoke_error: Mutex<Option<String>>,
    invocations: Mutex<Vec<(String, String, usize)>>,
}

impl FakeRuntime {
    fn fail_next_precompile(&self, reason: &str) {
        *self.precompile_error.lock().expect("lock") = Some(reason.to_string());
    }

    fn respond_with_size(&self, size: usize) {
        *self.response_size.lock().expect("lock") = Some(size);
    }

    fn invocations(&self) -> Vec<(String, String, usize)> {
        self.invocations.lock().expect("lock").clone()
    }
}

#[async_trait::async_trait]
impl Runtime for FakeRuntime {
    async fn precompile(&self, _bytes: Vec<u8>) -> anyhow::Result<ActorReference> {
        if let Some(reason) = self.precompile_error.lock().expect("lock").take() {
            bail!(reason);
        }
        let n = self.precompiled.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ActorReference::new(format!("module-{n}")))
    }

    async fn invoke(
        &self,
        actor: &ActorReference,
        operation: &str,
        payload: Vec<u8>,
        _trace_context: wasmbus_core::TraceContext,
    ) -> anyhow::Result<Vec<u8>> {
        self.invocations.lock().expect("lock").push((
            actor.to_string(),
            operation.to_string(),
            payload.len(),
        ));
        if let Some(reason) = self.invoke_error.lock().expect("lock").take() {
            bail!(reason);
        }
        match *self.response_size.lock().expect("lock") {
            Some(size) => Ok(vec![b'x'; size]),
            None => Ok(payload),
        }
    }
}

/// Records every published event in arrival order, tagged with the channel it
/// went out on (`evt` for lifecycle, `rpcevt` for invocation results)
#[derive(Default)]
struct RecordingEvents {
    events: Mutex<Vec<(String, String, serde_json::Value)>>,
}

impl RecordingEvents {
    fn all(&self) -> Vec<(String, String, serde_json::Value)> {
        self.events.lock().expect("lock").clone()
    }

    fn named(&self, name: &str) -> Vec<serde_json::Value> {
        self.all()
            .into_iter()
            .filter(|(_, n, _)| n == name)
            .map(|(_, _, data)| data)
            .collect()
    }
}

#[async_trait::async_trait]
impl EventPublisher for RecordingEvents {
    async fn publish_event(&self, name: &str, data: serde_json::Value) -> anyhow::Result<()> {
        self.events
            .lock()
            .expect("lock")
            .push(("evt".to_string(), name.to_string(), data));
        Ok(())
    }

    async fn publish_invocation_event(
        &self,
        name: &str,
        data: serde_json::Value,
    ) -> anyhow::Result<()> {
        self.events
            .lock()
            .expect("lock")
            .push(("rpcevt".to_string(), name.to_string(), data));
        Ok(())
    }
}

#[derive(Default)]
struct FakeClaimsStore {
    claims: Mutex<HashMap<String, StoredClaims>>,
}

#[async_trait::async_trait]
impl ClaimsStore for FakeClaimsStore {
    async fn put_claims(&self, claims: StoredClaims) -> anyhow::Result<()> {
        self.claims
            .lock()
            .expect("lock")
            .insert(claims.subject().to_string(), claims);
        Ok(())
    }

    async fn lookup_claims(&self, public_key: &str) -> anyhow::Result<Option<StoredClaims>> {
        Ok(self.claims.lock().expect("lock").get(public_key).cloned())
    }
}

#[derive(Default)]
struct FakePolicy {
    deny: Mutex<bool>,
    evaluations: AtomicUsize,
}

impl FakePolicy {
    fn deny_all(&self) {
        *self.deny.lock().expect("lock") = true;
    }

    fn evaluations(&self) -> usize {
        self.evaluations.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl PolicyEvaluator for FakePolicy {
    async fn evaluate_perform_invocation(
        &self,
        _source: RequestSource,
        _target: RequestTarget,
    ) -> anyhow::Result<PolicyResponse> {
        self.evaluations.fetch_add(1, Ordering::SeqCst);
        Ok(PolicyResponse {
            request_id: "test".to_string(),
            permitted: !*self.deny.lock().expect("lock"),
            message: None,
        })
    }
}

#[derive(Default)]
struct FakeChunkStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    fail_chunkify: Mutex<bool>,
    dechunks: AtomicUsize,
}

impl FakeChunkStore {
    fn seed(&self, key: &str, bytes: Vec<u8>) {
        self.objects
            .lock()
            .expect("lock")
            .insert(key.to_string(), bytes);
    }

    fn stored(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().expect("lock").get(key).cloned()
    }

    fn dechunks(&self) -> usize {
        self.dechunks.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ChunkStore for FakeChunkStore {
    async fn chunkify(&self, key: &str, bytes: &[u8]) -> anyhow::Result<()> {
        if *self.fail_chunkify.lock().expect("lock") {
            bail!("object store unavailable");
        }
        self.seed(key, bytes.to_vec());
        Ok(())
    }

    async fn dechunk(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        self.dechunks.fetch_add(1, Ordering::SeqCst);
        self.stored(key)
            .ok_or_else(|| anyhow!("no object stored under {key}"))
    }
}

#[derive(Default)]
struct FakeReferenceMap {
    references: Mutex<Vec<(String, String)>>,
}

#[async_trait::async_trait]
impl ReferenceMap for FakeReferenceMap {
    async fn put_reference(&self, image_ref: &str, public_key: &str) -> anyhow::Result<()> {
        self.references
            .lock()
            .expect("lock")
            .push((image_ref.to_string(), public_key.to_string()));
        Ok(())
    }
}

#[derive(Default)]
struct FakeRpcSupervisor {
    ensured: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl RpcSupervisor for FakeRpcSupervisor {
    async fn ensure_actor_rpc(&self, public_key: &str) -> anyhow::Result<()> {
        self.ensured
            .lock()
            .expect("lock")
            .push(public_key.to_string());
        Ok(())
    }
}

struct Harness {
    cluster_key: KeyPair,
    host_key: KeyPair,
    runtime: Arc<FakeRuntime>,
    events: Arc<RecordingEvents>,
    policy: Arc<FakePolicy>,
    claims_store: Arc<FakeClaimsStore>,
    chunks: Arc<FakeChunkStore>,
    references: Arc<FakeReferenceMap>,
    rpc: Arc<FakeRpcSupervisor>,
    registry: Arc<InstanceRegistry>,
    services: Arc<HostServices>,
}

impl Harness {
    fn new() -> Self {
        let cluster_key = KeyPair::new_cluster();
        let host_key = KeyPair::new_server();
        let runtime = Arc::new(FakeRuntime::default());
        let events = Arc::new(RecordingEvents::default());
        let policy = Arc::new(FakePolicy::default());
        let claims_store = Arc::new(FakeClaimsStore::default());
        let chunks = Arc::new(FakeChunkStore::default());
        let references = Arc::new(FakeReferenceMap::default());
        let rpc = Arc::new(FakeRpcSupervisor::default());
        let registry = Arc::new(InstanceRegistry::default());
        let services = Arc::new(HostServices {
            lattice_prefix: LATTICE.to_string(),
            cluster_issuers: vec![cluster_key.public_key()],
            runtime: Arc::clone(&runtime) as _,
            events: Arc::clone(&events) as _,
            policy: Arc::clone(&policy) as _,
            claims: Arc::clone(&claims_store) as _,
            chunks: Arc::clone(&chunks) as _,
            references: Arc::clone(&references) as _,
            rpc: Arc::clone(&rpc) as _,
            registry: Arc::clone(&registry),
        });
        Harness {
            cluster_key,
            host_key,
            runtime,
            events,
            policy,
            claims_store,
            chunks,
            references,
            rpc,
            registry,
            services,
        }
    }

    fn actor_claims(&self, caps: &[&str]) -> jwt::Claims<jwt::Actor> {
        ClaimsBuilder::new()
            .subject(ACTOR_KEY)
            .issuer("ACLUSTER")
            .with_metadata(jwt::Actor {
                name: Some("echo".to_string()),
                caps: Some(caps.iter().map(ToString::to_string).collect()),
                rev: Some(1),
                ver: Some("0.1.0".to_string()),
                ..Default::default()
            })
            .build()
    }

    async fn start_actor(&self, caps: &[&str]) -> Arc<ActorInstance> {
        ActorInstance::start(
            StartActor {
                claims: self.actor_claims(caps),
                bytes: b"\0asm".to_vec(),
                image_ref: Some("registry.example.com/echo:0.1.0".to_string()),
                annotations: BTreeMap::from([("managed-by".to_string(), "test".to_string())]),
                host_id: self.host_key.public_key(),
            },
            Arc::clone(&self.services),
        )
        .await
        .expect("failed to start actor instance")
    }

    /// Advertise claims for an actor-shaped invocation source
    async fn advertise_caller(&self, public_key: &str, expires_at: Option<u64>) {
        let claims = ClaimsBuilder::new()
            .subject(public_key)
            .issuer("ACLUSTER")
            .with_metadata(jwt::Actor {
                name: Some("caller".to_string()),
                ..Default::default()
            })
            .build();
        let mut stored = StoredClaims::from(&claims);
        if let StoredClaims::Actor(ref mut actor) = stored {
            actor.expires_at = expires_at;
        }
        self.claims_store
            .put_claims(stored)
            .await
            .expect("failed to advertise caller claims");
    }

    /// Advertise claims for a provider-shaped invocation source
    async fn advertise_provider(&self, public_key: &str, contract_id: &str) {
        let claims = ClaimsBuilder::new()
            .subject(public_key)
            .issuer("ACLUSTER")
            .with_metadata(jwt::CapabilityProvider {
                name: Some("provider".to_string()),
                capid: contract_id.to_string(),
                ..Default::default()
            })
            .build();
        self.claims_store
            .put_claims(StoredClaims::from(&claims))
            .await
            .expect("failed to advertise provider claims");
    }

    fn invocation(
        &self,
        origin: WasmCloudEntity,
        operation: &str,
        msg: Vec<u8>,
    ) -> Invocation {
        Invocation::new(
            &self.cluster_key,
            &self.host_key,
            origin,
            actor_entity(ACTOR_KEY),
            operation,
            msg,
            wasmbus_core::TraceContext::default(),
        )
        .expect("failed to create invocation")
    }

    async fn roundtrip(&self, instance: &ActorInstance, inv: &Invocation) -> InvocationResponse {
        let frame = serialize(inv).expect("failed to serialize invocation");
        let reply = instance
            .handle_rpc(Bytes::from(frame), None)
            .await
            .expect("instance did not reply");
        deserialize(&reply).expect("failed to deserialize invocation response")
    }
}

fn actor_entity(public_key: &str) -> WasmCloudEntity {
    WasmCloudEntity {
        public_key: public_key.to_string(),
        ..Default::default()
    }
}

fn provider_entity(public_key: &str, contract_id: &str, link_name: &str) -> WasmCloudEntity {
    WasmCloudEntity {
        public_key: public_key.to_string(),
        contract_id: contract_id.to_string(),
        link_name: link_name.to_string(),
    }
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn happy_path_invocation_echoes_and_publishes_success() {
    let harness = Harness::new();
    let instance = harness.start_actor(&[]).await;
    harness.advertise_caller(CALLER_KEY, None).await;

    let inv = harness.invocation(actor_entity(CALLER_KEY), "Echo", b"hello".to_vec());
    let response = harness.roundtrip(&instance, &inv).await;

    assert_eq!(response.error, None);
    assert_eq!(response.msg, b"hello");
    assert_eq!(response.content_length, 5);
    assert_eq!(response.invocation_id, inv.id);
    assert_eq!(response.instance_id, instance.instance_id().to_string());

    let succeeded = harness.events.named("invocation_succeeded");
    assert_eq!(succeeded.len(), 1);
    assert_eq!(succeeded[0]["bytes"], 5);
    assert_eq!(succeeded[0]["operation"], "Echo");
    assert_eq!(succeeded[0]["source"]["public_key"], CALLER_KEY);
    assert_eq!(succeeded[0]["dest"]["public_key"], ACTOR_KEY);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn start_advertises_claims_subscription_and_reference() {
    let harness = Harness::new();
    let instance = harness.start_actor(&[]).await;

    assert!(harness
        .claims_store
        .lookup_claims(ACTOR_KEY)
        .await
        .expect("lookup failed")
        .is_some());
    assert_eq!(
        harness.rpc.ensured.lock().expect("lock").as_slice(),
        &[ACTOR_KEY.to_string()]
    );
    assert_eq!(
        harness.references.references.lock().expect("lock").as_slice(),
        &[(
            "registry.example.com/echo:0.1.0".to_string(),
            ACTOR_KEY.to_string()
        )]
    );

    let started = harness.events.named("actor_started");
    assert_eq!(started.len(), 1);
    assert_eq!(started[0]["public_key"], ACTOR_KEY);
    assert_eq!(started[0]["instance_id"], instance.instance_id().to_string());
    assert_eq!(started[0]["claims"]["name"], "echo");
    assert_eq!(started[0]["claims"]["revision"], 1);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn chunked_request_is_dechunked_before_dispatch() {
    let harness = Harness::new();
    let instance = harness.start_actor(&[]).await;
    harness.advertise_caller(CALLER_KEY, None).await;

    let mut inv = harness.invocation(actor_entity(CALLER_KEY), "Ingest", Vec::new());
    inv.content_length = 2_000_000;
    harness.chunks.seed(&inv.id, vec![7u8; 2_000_000]);

    let response = harness.roundtrip(&instance, &inv).await;
    assert_eq!(response.error, None);

    let invocations = harness.runtime.invocations();
    assert_eq!(invocations.len(), 1);
    assert_eq!(invocations[0].1, "Ingest");
    assert_eq!(invocations[0].2, 2_000_000);
    assert_eq!(harness.chunks.dechunks(), 1);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn oversized_response_is_chunked_out_of_band() {
    let harness = Harness::new();
    let instance = harness.start_actor(&[]).await;
    harness.advertise_caller(CALLER_KEY, None).await;
    harness.runtime.respond_with_size(1_500_000);

    let inv = harness.invocation(actor_entity(CALLER_KEY), "Fetch", b"all".to_vec());
    let response = harness.roundtrip(&instance, &inv).await;

    assert_eq!(response.error, None);
    assert!(response.msg.is_empty());
    assert_eq!(response.content_length, 1_500_000);
    let stored = harness
        .chunks
        .stored(&format!("{}-r", inv.id))
        .expect("response was not chunked");
    assert_eq!(stored.len(), 1_500_000);

    // the event reports the real response size even though the request was
    // 3 bytes and the wire msg was emptied by chunking
    let succeeded = harness.events.named("invocation_succeeded");
    assert_eq!(succeeded.len(), 1);
    assert_eq!(succeeded[0]["bytes"], 1_500_000);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn response_at_threshold_stays_inline() {
    let harness = Harness::new();
    let instance = harness.start_actor(&[]).await;
    harness.advertise_caller(CALLER_KEY, None).await;
    harness.runtime.respond_with_size(CHUNK_THRESHOLD_BYTES);

    let inv = harness.invocation(actor_entity(CALLER_KEY), "Fetch", b"all".to_vec());
    let response = harness.roundtrip(&instance, &inv).await;

    assert_eq!(response.error, None);
    assert_eq!(response.msg.len(), CHUNK_THRESHOLD_BYTES);
    assert_eq!(response.content_length, CHUNK_THRESHOLD_BYTES as u64);
    assert!(harness.chunks.stored(&format!("{}-r", inv.id)).is_none());
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn response_chunk_store_failure_falls_back_to_inline() {
    let harness = Harness::new();
    let instance = harness.start_actor(&[]).await;
    harness.advertise_caller(CALLER_KEY, None).await;
    harness.runtime.respond_with_size(1_500_000);
    *harness.chunks.fail_chunkify.lock().expect("lock") = true;

    let inv = harness.invocation(actor_entity(CALLER_KEY), "Fetch", b"all".to_vec());
    let response = harness.roundtrip(&instance, &inv).await;

    // best-effort: the payload stays inline and the invocation still succeeds
    assert_eq!(response.error, None);
    assert_eq!(response.msg.len(), 1_500_000);
    assert_eq!(response.content_length, 1_500_000);
    assert_eq!(harness.events.named("invocation_succeeded").len(), 1);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn provider_without_claimed_contract_is_denied_before_policy() {
    let harness = Harness::new();
    let instance = harness.start_actor(&["wasmcloud:keyvalue"]).await;

    let inv = harness.invocation(
        provider_entity(PROVIDER_KEY, "wasmcloud:httpserver", "default"),
        "HandleRequest",
        b"GET /".to_vec(),
    );
    let response = harness.roundtrip(&instance, &inv).await;

    assert_eq!(
        response.error.as_deref(),
        Some("Invocation source does not have the required capability claim wasmcloud:httpserver")
    );
    // the capability gate short-circuits the rest of the pipeline
    assert_eq!(harness.policy.evaluations(), 0);
    assert_eq!(harness.chunks.dechunks(), 0);
    assert!(harness.runtime.invocations().is_empty());
    assert_eq!(harness.events.named("invocation_failed").len(), 1);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn contract_id_without_link_name_still_triggers_capability_gate() {
    let harness = Harness::new();
    let instance = harness.start_actor(&["wasmcloud:keyvalue"]).await;

    // no link name on the wire; the contract id alone identifies a provider
    let inv = harness.invocation(
        provider_entity(PROVIDER_KEY, "wasmcloud:httpserver", ""),
        "HandleRequest",
        b"GET /".to_vec(),
    );
    let response = harness.roundtrip(&instance, &inv).await;

    assert_eq!(
        response.error.as_deref(),
        Some("Invocation source does not have the required capability claim wasmcloud:httpserver")
    );
    assert_eq!(harness.policy.evaluations(), 0);
    assert!(harness.runtime.invocations().is_empty());
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn provider_with_claimed_contract_is_permitted() {
    let harness = Harness::new();
    let instance = harness.start_actor(&["wasmcloud:httpserver"]).await;
    harness
        .advertise_provider(PROVIDER_KEY, "wasmcloud:httpserver")
        .await;

    let inv = harness.invocation(
        provider_entity(PROVIDER_KEY, "wasmcloud:httpserver", "default"),
        "HandleRequest",
        b"GET /".to_vec(),
    );
    let response = harness.roundtrip(&instance, &inv).await;

    assert_eq!(response.error, None);
    assert_eq!(harness.policy.evaluations(), 1);
    assert_eq!(harness.runtime.invocations().len(), 1);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn policy_denial_rejects_invocation() {
    let harness = Harness::new();
    let instance = harness.start_actor(&[]).await;
    harness.advertise_caller(CALLER_KEY, None).await;
    harness.policy.deny_all();

    let inv = harness.invocation(actor_entity(CALLER_KEY), "Echo", b"hello".to_vec());
    let response = harness.roundtrip(&instance, &inv).await;

    assert_eq!(
        response.error.as_deref(),
        Some("Policy evaluation rejected invocation attempt")
    );
    assert!(harness.runtime.invocations().is_empty());
    assert_eq!(harness.chunks.dechunks(), 0);
    assert_eq!(harness.events.named("invocation_failed").len(), 1);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn expired_source_claims_are_denied() {
    let harness = Harness::new();
    let instance = harness.start_actor(&[]).await;
    // expired one second after the epoch
    harness.advertise_caller(CALLER_KEY, Some(1)).await;

    let inv = harness.invocation(actor_entity(CALLER_KEY), "Echo", b"hello".to_vec());
    let response = harness.roundtrip(&instance, &inv).await;

    assert_eq!(
        response.error.as_deref(),
        Some("Policy evaluation rejected invocation attempt")
    );
    assert!(harness.runtime.invocations().is_empty());
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn unknown_source_claims_are_denied() {
    let harness = Harness::new();
    let instance = harness.start_actor(&[]).await;

    let inv = harness.invocation(actor_entity(CALLER_KEY), "Echo", b"hello".to_vec());
    let response = harness.roundtrip(&instance, &inv).await;

    assert_eq!(
        response.error.as_deref(),
        Some("Policy evaluation rejected invocation attempt")
    );
    assert!(harness.runtime.invocations().is_empty());
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn forged_invocation_is_rejected() {
    let harness = Harness::new();
    let instance = harness.start_actor(&[]).await;
    harness.advertise_caller(CALLER_KEY, None).await;

    let mut inv = harness.invocation(actor_entity(CALLER_KEY), "Echo", b"hello".to_vec());
    // tamper with the payload after signing
    inv.msg = b"evil!".to_vec();

    let response = harness.roundtrip(&instance, &inv).await;
    let error = response.error.expect("expected an anti-forgery error");
    assert!(
        error.starts_with("Anti-forgery check failed:"),
        "unexpected error: {error}"
    );
    assert!(harness.runtime.invocations().is_empty());
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn undecodable_frame_still_gets_a_reply_and_event() {
    let harness = Harness::new();
    let instance = harness.start_actor(&[]).await;

    let reply = instance
        .handle_rpc(Bytes::from_static(b"\xc1 not msgpack"), None)
        .await
        .expect("instance did not reply");
    let response: InvocationResponse = deserialize(&reply).expect("undecodable response");

    assert_eq!(
        response.error.as_deref(),
        Some("Failed to deserialize invocation")
    );
    assert_eq!(harness.events.named("invocation_failed").len(), 1);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn failed_runtime_invocation_reports_error() {
    let harness = Harness::new();
    let instance = harness.start_actor(&[]).await;
    harness.advertise_caller(CALLER_KEY, None).await;
    *harness.runtime.invoke_error.lock().expect("lock") = Some("guest trapped".to_string());

    let inv = harness.invocation(actor_entity(CALLER_KEY), "Echo", b"hello".to_vec());
    let response = harness.roundtrip(&instance, &inv).await;

    assert_eq!(response.error.as_deref(), Some("guest trapped"));
    assert!(response.msg.is_empty());
    assert_eq!(response.content_length, 0);
    assert_eq!(harness.events.named("invocation_failed").len(), 1);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn live_update_swaps_module_and_publishes_event() {
    let harness = Harness::new();
    let instance = harness.start_actor(&[]).await;
    let before = instance.actor_reference().await;

    let new_claims = ClaimsBuilder::new()
        .subject(ACTOR_KEY)
        .issuer("ACLUSTER")
        .with_metadata(jwt::Actor {
            name: Some("echo".to_string()),
            rev: Some(2),
            ver: Some("0.2.0".to_string()),
            ..Default::default()
        })
        .build();
    instance
        .perform_live_update(UpdateActor {
            new_bytes: b"\0asm v2".to_vec(),
            new_claims: Some(new_claims),
            new_image_ref: Some("registry.example.com/echo:0.2.0".to_string()),
            trace_context: None,
        })
        .await
        .expect("live update failed");

    let after = instance.actor_reference().await;
    assert_ne!(before, after);

    let updated = harness.events.named("actor_updated");
    assert_eq!(updated.len(), 1);
    assert_eq!(updated[0]["public_key"], ACTOR_KEY);
    assert_eq!(updated[0]["revision"], 2);
    assert_eq!(updated[0]["instance_id"], instance.instance_id().to_string());
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn failed_live_update_retains_previous_module() {
    let harness = Harness::new();
    let instance = harness.start_actor(&[]).await;
    harness.advertise_caller(CALLER_KEY, None).await;
    let before = instance.actor_reference().await;
    harness.runtime.fail_next_precompile("bad magic");

    // a failed update still replies success
    instance
        .perform_live_update(UpdateActor {
            new_bytes: b"not wasm".to_vec(),
            new_claims: None,
            new_image_ref: None,
            trace_context: None,
        })
        .await
        .expect("failed update must not error the caller");

    assert_eq!(instance.actor_reference().await, before);
    assert!(harness.events.named("actor_updated").is_empty());
    let failed = harness.events.named("actor_update_failed");
    assert_eq!(failed.len(), 1);
    let reason = failed[0]["reason"].as_str().expect("reason string");
    assert!(reason.contains("bad magic"), "unexpected reason: {reason}");

    // subsequent invocations are dispatched to the original module
    let inv = harness.invocation(actor_entity(CALLER_KEY), "Echo", b"still here".to_vec());
    let response = harness.roundtrip(&instance, &inv).await;
    assert_eq!(response.error, None);
    let invocations = harness.runtime.invocations();
    assert_eq!(invocations[0].0, before.to_string());
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn halt_publishes_stopped_once_and_is_idempotent() {
    let harness = Harness::new();
    let instance = harness.start_actor(&[]).await;

    instance.halt().await;
    instance.halt().await;

    assert_eq!(harness.events.named("actor_stopped").len(), 1);
    assert!(harness.registry.get(ACTOR_KEY).await.is_empty());
    assert!(instance
        .handle_rpc(Bytes::from_static(b"frame"), None)
        .await
        .is_err());
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn lifecycle_events_bracket_invocation_events() {
    let harness = Harness::new();
    let instance = harness.start_actor(&[]).await;
    harness.advertise_caller(CALLER_KEY, None).await;

    let inv = harness.invocation(actor_entity(CALLER_KEY), "Echo", b"hello".to_vec());
    let _ = harness.roundtrip(&instance, &inv).await;
    instance.halt().await;

    let names: Vec<String> = harness
        .events
        .all()
        .into_iter()
        .map(|(_, name, _)| name)
        .collect();
    let started = names
        .iter()
        .position(|n| n == "actor_started")
        .expect("actor_started missing");
    let succeeded = names
        .iter()
        .position(|n| n == "invocation_succeeded")
        .expect("invocation_succeeded missing");
    let stopped = names
        .iter()
        .position(|n| n == "actor_stopped")
        .expect("actor_stopped missing");
    assert!(started < succeeded && succeeded < stopped);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn invocation_events_use_the_rpc_channel() {
    let harness = Harness::new();
    let instance = harness.start_actor(&[]).await;
    harness.advertise_caller(CALLER_KEY, None).await;

    let inv = harness.invocation(actor_entity(CALLER_KEY), "Echo", b"hello".to_vec());
    let _ = harness.roundtrip(&instance, &inv).await;

    for (channel, name, _) in harness.events.all() {
        if name.starts_with("invocation_") {
            assert_eq!(channel, "rpcevt");
        } else {
            assert_eq!(channel, "evt");
        }
    }
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn precompile_failure_refuses_to_start() {
    let harness = Harness::new();
    harness.runtime.fail_next_precompile("bad magic");

    let result = ActorInstance::start(
        StartActor {
            claims: harness.actor_claims(&[]),
            bytes: b"not wasm".to_vec(),
            image_ref: None,
            annotations: BTreeMap::new(),
            host_id: harness.host_key.public_key(),
        },
        Arc::clone(&harness.services),
    )
    .await;

    assert!(result.is_err());
    assert_eq!(harness.events.named("actor_start_failed").len(), 1);
    assert!(harness.events.named("actor_started").is_empty());
    assert!(harness.registry.get(ACTOR_KEY).await.is_empty());
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn registry_queries_fall_back_to_documented_defaults() {
    let harness = Harness::new();

    assert_eq!(harness.registry.image_ref("NOBODY").await, "n/a");
    assert_eq!(harness.registry.instance_id("NOBODY").await, "??");
    assert!(harness.registry.claims("NOBODY").await.is_empty());
    assert!(harness.registry.annotations("NOBODY").await.is_empty());
    assert_eq!(harness.registry.current_invocation("NOBODY").await, None);

    let instance = harness.start_actor(&[]).await;
    assert_eq!(
        harness.registry.instance_id(ACTOR_KEY).await,
        instance.instance_id().to_string()
    );
    assert_eq!(
        harness.registry.image_ref(ACTOR_KEY).await,
        "registry.example.com/echo:0.1.0"
    );
    assert_eq!(harness.registry.claims(ACTOR_KEY).await["subject"], ACTOR_KEY);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn identity_is_stable_across_updates_and_invocations() {
    let harness = Harness::new();
    let instance = harness.start_actor(&[]).await;
    harness.advertise_caller(CALLER_KEY, None).await;
    let instance_id = instance.instance_id();

    let inv = harness.invocation(actor_entity(CALLER_KEY), "Echo", b"hello".to_vec());
    let _ = harness.roundtrip(&instance, &inv).await;
    instance
        .perform_live_update(UpdateActor {
            new_bytes: b"\0asm v2".to_vec(),
            new_claims: None,
            new_image_ref: None,
            trace_context: None,
        })
        .await
        .expect("live update failed");

    assert_eq!(instance.instance_id(), instance_id);
    assert_eq!(instance.public_key(), ACTOR_KEY);
}
