use core::fmt;

use std::sync::Arc;

use wasmbus_core::TraceContext;

/// Opaque handle to a precompiled actor module.
///
/// The runtime owns the compiled artifact; instances hold this non-owning
/// reference and pass it back on every dispatch. References are cheap to
/// clone and compare.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ActorReference(Arc<str>);

impl ActorReference {
    #[must_use]
    pub fn new(reference: impl Into<Arc<str>>) -> Self {
        ActorReference(reference.into())
    }
}

impl fmt::Display for ActorReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The wasm runtime service shared by all instances on a host.
///
/// `invoke` must be safe for concurrent calls with distinct
/// [`ActorReference`]s.
#[async_trait::async_trait]
pub trait Runtime: Send + Sync {
    /// Compile the signed module bytes, returning a reference for later
    /// dispatch. The runtime keeps ownership of the compiled artifact.
    async fn precompile(&self, bytes: Vec<u8>) -> anyhow::Result<ActorReference>;

    /// Dispatch an operation to a previously precompiled module. The trace
    /// context travels as an opaque blob for the runtime to restore around
    /// guest calls.
    async fn invoke(
        &self,
        actor: &ActorReference,
        operation: &str,
        payload: Vec<u8>,
        trace_context: TraceContext,
    ) -> anyhow::Result<Vec<u8>>;

    /// Release a compiled artifact the host no longer dispatches to, e.g. the
    /// superseded module after a live update. By default this is a no-op for
    /// runtimes that reclaim artifacts themselves.
    async fn release(&self, _actor: ActorReference) -> anyhow::Result<()> {
        Ok(())
    }
}
