//! Kaspr Kubernetes Operator
//!
//! Manages Kaspr stream processing applications in Kubernetes. It syncs
//! their StatefulSets and peer objects from `KasprApp` resources and mounts
//! the definitions of their agents, tables, web views and tasks into the
//! members. It also tracks member health, triggers rebalances when topic
//! subscriptions change and terminates members stuck rebalancing.

pub mod adapters;
pub mod controllers;
pub mod crd;
pub mod error;
pub mod metrics;
pub mod reconcilers;
pub mod resources;
pub mod settings;

pub use error::{Error, Result};
