//! Observability for the workflow engine
//!
//! Metrics instruments and tracing bootstrap. Emission is infallible by
//! construction; no observability failure can affect a workflow outcome.

pub mod metrics;
pub mod tracing;
