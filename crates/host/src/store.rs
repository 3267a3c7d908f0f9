use std::io::Cursor;

use wasmbus_core::chunking::ChunkEndpoint;

/// The lattice object store used for payloads too large to travel inline.
///
/// Request chunks are keyed by invocation id; response chunks by
/// `"{invocation_id}-r"` (the caller formats the key).
#[async_trait::async_trait]
pub trait ChunkStore: Send + Sync {
    /// Store a payload under the given key
    async fn chunkify(&self, key: &str, bytes: &[u8]) -> anyhow::Result<()>;

    /// Retrieve the full payload stored under the given key
    async fn dechunk(&self, key: &str) -> anyhow::Result<Vec<u8>>;
}

#[async_trait::async_trait]
impl ChunkStore for ChunkEndpoint {
    async fn chunkify(&self, key: &str, bytes: &[u8]) -> anyhow::Result<()> {
        ChunkEndpoint::chunkify(self, key, Cursor::new(bytes.to_vec())).await
    }

    async fn dechunk(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        self.get_unchunkified(key).await
    }
}

/// The lattice reference map, associating image references with the public
/// key of the actor they resolve to
#[async_trait::async_trait]
pub trait ReferenceMap: Send + Sync {
    /// Record that `image_ref` currently resolves to `public_key`
    async fn put_reference(&self, image_ref: &str, public_key: &str) -> anyhow::Result<()>;
}
