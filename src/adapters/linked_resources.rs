//! Lookup of the sibling resources bound to an app through its label

use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

use kube::api::ListParams;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::crd::{KasprAgent, KasprTable, KasprTask, KasprWebView, APP_LABEL};
use crate::error::{Error, Result};

const LIST_TIMEOUT: Duration = Duration::from_secs(30);

/// Every sibling resource currently labelled for one app
#[derive(Clone, Debug, Default)]
pub struct LinkedResources {
    pub agents: Vec<KasprAgent>,
    pub tables: Vec<KasprTable>,
    pub webviews: Vec<KasprWebView>,
    pub tasks: Vec<KasprTask>,
}

/// Label selector matching the siblings of `app_name`
pub fn app_selector(app_name: &str) -> String {
    format!("{}={}", APP_LABEL, app_name)
}

/// Fetch all four sibling kinds.
///
/// Fails as a whole when any single list call fails, so callers never see
/// a partial view. An empty list is a successful lookup.
pub async fn fetch_linked_resources(
    client: &Client,
    namespace: &str,
    app_name: &str,
) -> Result<LinkedResources> {
    let params = ListParams::default().labels(&app_selector(app_name));

    let (agents, tables, webviews, tasks) = tokio::try_join!(
        list_kind::<KasprAgent>(client, namespace, &params),
        list_kind::<KasprTable>(client, namespace, &params),
        list_kind::<KasprWebView>(client, namespace, &params),
        list_kind::<KasprTask>(client, namespace, &params),
    )?;

    debug!(
        app = %app_name,
        agents = agents.len(),
        tables = tables.len(),
        webviews = webviews.len(),
        tasks = tasks.len(),
        "Fetched linked resources"
    );

    Ok(LinkedResources {
        agents,
        tables,
        webviews,
        tasks,
    })
}

async fn list_kind<K>(client: &Client, namespace: &str, params: &ListParams) -> Result<Vec<K>>
where
    K: Resource<Scope = kube::core::NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Debug,
{
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    bounded(&K::kind(&()), LIST_TIMEOUT, api.list(params))
        .await
        .map(|list| list.items)
}

/// Await one list call, failing the lookup when it errors or outlives `timeout`
async fn bounded<T, F>(kind: &str, timeout: Duration, call: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, kube::Error>>,
{
    let fetch_error = |message: String| Error::LinkedResourceFetch {
        kind: kind.to_string(),
        message,
    };
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| fetch_error(format!("list timed out after {:?}", timeout)))?
        .map_err(|e| fetch_error(e.to_string()))
}
