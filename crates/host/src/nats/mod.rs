//! NATS implementations of the interfaces the instance controller consumes:
//! the CloudEvents publisher, the lattice data store (claims and reference
//! map), and the actor RPC subscription supervisor.

mod event;
mod rpc;
mod store;

pub use event::NatsEventPublisher;
pub use rpc::NatsRpcSupervisor;
pub use store::LatticeStore;
