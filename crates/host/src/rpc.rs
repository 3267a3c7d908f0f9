/// Supervises the bus subscriptions that deliver actor RPC frames.
///
/// Subscriptions are keyed by `(lattice_prefix, public_key)`; ensuring one
/// that already exists is a no-op, so every instance start may call this
/// unconditionally.
#[async_trait::async_trait]
pub trait RpcSupervisor: Send + Sync {
    /// Idempotently ensure an RPC subscription is running for the given actor
    /// public key on this supervisor's lattice
    async fn ensure_actor_rpc(&self, public_key: &str) -> anyhow::Result<()>;
}
