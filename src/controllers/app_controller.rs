//! KasprApp controller
//!
//! Watches KasprApp resources, their StatefulSets and the four sibling kinds.
//! Every event only requests a pass from the reconciliation queue.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::{
    api::ListParams,
    runtime::{
        controller::{Action, Controller},
        finalizer::{finalizer, Event as FinalizerEvent},
        reflector::ObjectRef,
        watcher::Config as WatcherConfig,
    },
    Api, Resource, ResourceExt,
};
use tracing::{debug, error, info, instrument};

use crate::controllers::{scoped_api, Context};
use crate::crd::{KasprAgent, KasprApp, KasprTable, KasprTask, KasprWebView, APP_LABEL};
use crate::error::{Error, Result};
use crate::metrics;
use crate::reconcilers::app as app_reconciler;

/// Finalizer name for KasprApp resources
const FINALIZER_NAME: &str = "kaspr.io/app-finalizer";

const KIND: &str = "KasprApp";

/// Queue key of an app
pub fn app_key(app: &KasprApp) -> ObjectRef<KasprApp> {
    ObjectRef::from_obj(app)
}

/// Map a labelled sibling resource to the app it belongs to
fn owning_app<K: Resource>(obj: K) -> Option<ObjectRef<KasprApp>> {
    let app = obj.labels().get(APP_LABEL)?.clone();
    let namespace = obj.namespace()?;
    Some(ObjectRef::new(&app).within(&namespace))
}

/// Run the KasprApp controller
pub async fn run(context: Arc<Context>) {
    let client = context.client.clone();
    let namespace = context.settings.namespace().map(str::to_string);
    let namespace = namespace.as_deref();
    let apps: Api<KasprApp> = scoped_api(&client, namespace);

    // Verify CRD is installed
    if let Err(e) = apps.list(&ListParams::default().limit(1)).await {
        error!("KasprApp CRD not installed: {}", e);
        return;
    }

    info!(namespace = namespace.unwrap_or("*"), "Starting KasprApp controller");

    let wc = WatcherConfig::default();
    let labelled = WatcherConfig::default().labels(APP_LABEL);

    Controller::new(apps, wc.clone())
        .owns(scoped_api::<StatefulSet>(&client, namespace), wc)
        .watches(
            scoped_api::<KasprAgent>(&client, namespace),
            labelled.clone(),
            owning_app,
        )
        .watches(
            scoped_api::<KasprTable>(&client, namespace),
            labelled.clone(),
            owning_app,
        )
        .watches(
            scoped_api::<KasprWebView>(&client, namespace),
            labelled.clone(),
            owning_app,
        )
        .watches(
            scoped_api::<KasprTask>(&client, namespace),
            labelled,
            owning_app,
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    debug!(
                        name = %obj.name,
                        namespace = obj.namespace.as_deref().unwrap_or("default"),
                        "Handled KasprApp event"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Controller error");
                    metrics::RECONCILIATION_ERRORS
                        .with_label_values(&[KIND, "ControllerError"])
                        .inc();
                }
            }
        })
        .await;
}

/// Controller entry point: manage the finalizer and request a pass
#[instrument(skip(ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile(obj: Arc<KasprApp>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<KasprApp> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer(&api, FINALIZER_NAME, obj, |event| async {
        match event {
            FinalizerEvent::Apply(app) => apply(app, ctx.clone()).await,
            FinalizerEvent::Cleanup(app) => cleanup(app, ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::Finalizer(Box::new(e)))
}

async fn apply(app: Arc<KasprApp>, ctx: Arc<Context>) -> Result<Action> {
    if ctx.queue.request_reconciliation(app_key(&app)) {
        debug!("Reconciliation requested");
    }
    Ok(Action::requeue(ctx.settings.periodic_interval()))
}

/// Cleanup when resource is being deleted
async fn cleanup(app: Arc<KasprApp>, ctx: Arc<Context>) -> Result<Action> {
    info!(name = %app.name_any(), "Cleaning up KasprApp");
    // Child objects are garbage collected through their owner references
    ctx.forget(&app_key(&app));
    Ok(Action::await_change())
}

/// Error policy for the controller
fn error_policy(obj: Arc<KasprApp>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        name = %obj.name_any(),
        error = %error,
        "Failed to handle KasprApp event, scheduling retry"
    );

    let requeue_duration = match error {
        Error::Kube(_) | Error::Finalizer(_) => Duration::from_secs(15),
        Error::Config(_) | Error::Validation(_) => Duration::from_secs(300),
        _ => Duration::from_secs(30),
    };

    Action::requeue(requeue_duration)
}

/// Run one reconciliation pass for a queued app.
///
/// The app is re-read so the pass works on its latest state rather than the
/// state at request time.
pub async fn run_pass(key: ObjectRef<KasprApp>, ctx: Arc<Context>) -> Result<()> {
    let namespace = key.namespace.clone().unwrap_or_else(|| "default".to_string());
    let api: Api<KasprApp> = Api::namespaced(ctx.client.clone(), &namespace);

    let Some(app) = api.get_opt(&key.name).await? else {
        debug!(name = %key.name, namespace = %namespace, "KasprApp gone, dropping");
        ctx.forget(&key);
        return Ok(());
    };
    if app.meta().deletion_timestamp.is_some() {
        return Ok(());
    }

    let _timer = metrics::RECONCILE_DURATION
        .with_label_values(&[KIND])
        .start_timer();

    match app_reconciler::reconcile(&app, &ctx).await {
        Ok(()) => {
            metrics::RECONCILIATIONS
                .with_label_values(&[KIND, "success"])
                .inc();
            Ok(())
        }
        Err(e) => {
            metrics::RECONCILIATIONS
                .with_label_values(&[KIND, "error"])
                .inc();
            metrics::RECONCILIATION_ERRORS
                .with_label_values(&[KIND, e.reason()])
                .inc();
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::KasprTableSpec;
    use std::collections::BTreeMap;

    fn table(labels: Option<BTreeMap<String, String>>) -> KasprTable {
        let mut table = KasprTable::new(
            "totals",
            KasprTableSpec {
                name: "totals".to_string(),
                description: None,
                is_global: None,
                key_serializer: None,
                value_serializer: None,
                partitions: None,
                extra_topic_configs: BTreeMap::new(),
                window: None,
            },
        );
        table.metadata.namespace = Some("streams".to_string());
        table.metadata.labels = labels;
        table
    }

    #[test]
    fn test_sibling_maps_to_labelled_app() {
        let labels = BTreeMap::from([(APP_LABEL.to_string(), "orders".to_string())]);
        let app = owning_app(table(Some(labels))).unwrap();
        assert_eq!(app.name, "orders");
        assert_eq!(app.namespace.as_deref(), Some("streams"));
    }

    #[test]
    fn test_unlabelled_sibling_maps_to_nothing() {
        assert!(owning_app(table(None)).is_none());
    }
}
