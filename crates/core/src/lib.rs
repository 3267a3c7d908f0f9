#![forbid(clippy::unwrap_used)]

use anyhow::Context;
use serde::{Deserialize, Serialize};

pub mod chunking;

pub mod lattice;
pub use lattice::*;

pub mod otel;
pub use otel::*;

/// Public key (nkey) of a cluster issuer
pub type ClusterIssuerKey = String;

/// Encode a wire record with the lattice's self-describing binary encoding (msgpack)
pub fn serialize<T: Serialize>(data: &T) -> anyhow::Result<Vec<u8>> {
    rmp_serde::to_vec_named(data).context("failed to serialize")
}

/// Decode a wire record previously encoded with [serialize]
pub fn deserialize<'de, T: Deserialize<'de>>(buf: &'de [u8]) -> anyhow::Result<T> {
    rmp_serde::from_slice(buf).context("failed to deserialize")
}
