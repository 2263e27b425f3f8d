//! Reconciliation logic for KasprApp resources
//!
//! Each submodule owns one concern of a pass:
//! - `subscriptions`: linked resource snapshots and subscription change detection
//! - `members`: member state tracking from status reads
//! - `hung`: hung member strikes and terminations
//! - `rebalance`: the single rebalance decision of a pass
//! - `status`: conditions and status subresource writes
//! - `app`: the pass that ties them together
//!
//! `component` reconciles the agents, tables, web views and tasks themselves.

pub mod app;
pub mod component;
pub mod hung;
pub mod members;
pub mod rebalance;
pub mod status;
pub mod subscriptions;
