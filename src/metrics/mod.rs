//! Prometheus metrics for the Stash operator
//!
//! Exposed on the ops address next to the health endpoints.

mod prometheus;

pub use prometheus::*;
