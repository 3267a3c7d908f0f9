#![doc = include_str!("../README.md")]
#![forbid(clippy::unwrap_used)]

/// [crate::actor::ActorInstance]: the per-actor instance controller — lifecycle,
/// mailbox, and the invocation pipeline
pub mod actor;

/// [crate::claims::ClaimsStore] trait and the public claims cache entries
pub mod claims;

/// [crate::event::EventPublisher] trait and lifecycle/invocation event payloads
pub mod event;

/// NATS implementations of the consumed interfaces: event publisher, lattice
/// data store, and actor RPC subscription supervisor
pub mod nats;

/// [crate::policy::PolicyEvaluator] trait for layering additional security
/// policies on top of the host
pub mod policy;

/// [crate::registry::InstanceRegistry]: the process-local registry of running
/// actor instances keyed by public key
pub mod registry;

/// [crate::rpc::RpcSupervisor] trait for keeping actor RPC subscriptions alive
pub mod rpc;

/// [crate::runtime::Runtime] trait: the wasm runtime consumed by instances
pub mod runtime;

/// [crate::store::ChunkStore] and [crate::store::ReferenceMap] traits for
/// lattice-wide storage consumed by instances
pub mod store;

pub use actor::{ActorInstance, HostServices, StartActor, UpdateActor};
pub use claims::{ClaimsStore, StoredClaims};
pub use event::{DefaultEventPublisher, EventPublisher};
pub use policy::{
    HostInfo as PolicyHostInfo, PolicyEvaluator, PolicyManager, Response as PolicyResponse,
};
pub use registry::InstanceRegistry;
pub use rpc::RpcSupervisor;
pub use runtime::{ActorReference, Runtime};
pub use store::{ChunkStore, ReferenceMap};
