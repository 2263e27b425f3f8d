//! Prometheus metrics for the Kaspr Operator
//!
//! Exposes reconciliation, rebalance, hung member and resource sync metrics
//! alongside the health endpoints.

mod prometheus;

pub use prometheus::*;
