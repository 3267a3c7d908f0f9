//! Core reusable logic around [OpenTelemetry ("OTEL")](https://opentelemetry.io/) support

use std::collections::HashMap;

/// Distributed tracing context carried alongside an invocation.
///
/// The keys and values are the W3C trace-context headers (`traceparent`,
/// `tracestate`, ...) serialized as an opaque string map so they survive the
/// lattice wire format without the host interpreting them.
pub type TraceContext = HashMap<String, String>;
