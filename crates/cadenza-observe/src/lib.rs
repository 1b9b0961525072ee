//! Observability setup for Cadenza.

pub mod tracing_setup;
