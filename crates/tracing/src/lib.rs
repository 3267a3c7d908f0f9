//! Trace-context propagation helpers for the wasmBus host.
//!
//! The host never interprets tracing headers itself; it extracts a parent
//! span context from inbound frames and injects the current context into
//! outbound runtime calls, both through [`wasmbus_core::TraceContext`].

#![warn(clippy::pedantic)]

pub mod context;
