//! Kubernetes controllers for Kaspr CRDs
//!
//! The KasprApp controller turns watch events into reconciliation requests;
//! the passes themselves are driven by the reconciliation queue. Component
//! controllers reconcile agents, tables, web views and tasks directly.

mod app_controller;
mod component_controller;
mod queue;

pub use app_controller::{app_key, run as run_app_controller, run_pass};
pub use component_controller::run as run_component_controller;
pub use queue::{QueueConsumer, ReconciliationQueue};

use std::collections::BTreeSet;
use std::fmt::Debug;
use std::sync::Arc;

use dashmap::DashMap;
use kube::core::NamespaceResourceScope;
use kube::runtime::events::Reporter;
use kube::runtime::reflector::ObjectRef;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;

use crate::adapters::KasprWebClient;
use crate::crd::KasprApp;
use crate::error::Result;
use crate::settings::Settings;

/// Api over the watched namespace, or the whole cluster
pub(crate) fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Queue of KasprApp passes
pub type AppQueue = ReconciliationQueue<ObjectRef<KasprApp>>;

/// Shared context for all controllers
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Operator-wide settings
    pub settings: Settings,
    /// Pending and running reconciliation passes
    pub queue: Arc<AppQueue>,
    /// Member web API client
    pub web_client: KasprWebClient,
    /// Event reporter identity
    pub reporter: Reporter,
    /// Members whose termination failed, per app, retried on the next pass
    termination_retries: DashMap<ObjectRef<KasprApp>, BTreeSet<String>>,
}

impl Context {
    /// Create a new context
    pub fn new(client: Client, settings: Settings, queue: Arc<AppQueue>) -> Result<Self> {
        let web_client = KasprWebClient::new(settings.client_timeout())?;
        Ok(Self {
            client,
            settings,
            queue,
            web_client,
            reporter: "kaspr-operator".into(),
            termination_retries: DashMap::new(),
        })
    }

    pub fn termination_retries(&self, app: &ObjectRef<KasprApp>) -> BTreeSet<String> {
        self.termination_retries
            .get(app)
            .map(|members| members.clone())
            .unwrap_or_default()
    }

    pub fn set_termination_retries(&self, app: &ObjectRef<KasprApp>, members: BTreeSet<String>) {
        if members.is_empty() {
            self.termination_retries.remove(app);
        } else {
            self.termination_retries.insert(app.clone(), members);
        }
    }

    /// Drop all in-memory state for a deleted app
    pub fn forget(&self, app: &ObjectRef<KasprApp>) {
        self.queue.forget(app);
        self.termination_retries.remove(app);
    }
}
