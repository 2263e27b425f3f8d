//! Component controllers
//!
//! One controller per component kind. Each watches the labelled components
//! and the definitions ConfigMaps they own.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{
    api::ListParams,
    runtime::{
        controller::{Action, Controller},
        watcher::Config as WatcherConfig,
    },
    Api, Resource, ResourceExt,
};
use tracing::{debug, error, info, instrument};

use crate::controllers::{scoped_api, Context};
use crate::crd::APP_LABEL;
use crate::error::{Error, Result};
use crate::metrics;
use crate::reconcilers::component as component_reconciler;
use crate::resources::AppComponent;

/// Run the controller for component kind `K`
pub async fn run<K: AppComponent>(context: Arc<Context>) {
    let kind = K::kind(&()).to_string();
    let client = context.client.clone();
    let namespace = context.settings.namespace().map(str::to_string);
    let namespace = namespace.as_deref();
    let components: Api<K> = scoped_api(&client, namespace);

    if let Err(e) = components.list(&ListParams::default().limit(1)).await {
        error!("{} CRD not installed: {}", kind, e);
        return;
    }

    info!(kind = %kind, namespace = namespace.unwrap_or("*"), "Starting component controller");

    let labelled = WatcherConfig::default().labels(APP_LABEL);

    Controller::new(components, labelled.clone())
        .owns(scoped_api::<ConfigMap>(&client, namespace), labelled)
        .shutdown_on_signal()
        .run(reconcile::<K>, error_policy::<K>, context)
        .for_each(|result| {
            let kind = kind.clone();
            async move {
                match result {
                    Ok((obj, _action)) => {
                        debug!(kind = %kind, name = %obj.name, "Reconciled component");
                    }
                    Err(e) => {
                        error!(kind = %kind, error = %e, "Controller error");
                        metrics::RECONCILIATION_ERRORS
                            .with_label_values(&[&kind, "ControllerError"])
                            .inc();
                    }
                }
            }
        })
        .await;
}

#[instrument(skip(obj, ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile<K: AppComponent>(obj: Arc<K>, ctx: Arc<Context>) -> Result<Action> {
    let kind = K::kind(&()).to_string();
    if obj.meta().deletion_timestamp.is_some() {
        // The definitions ConfigMap goes with its owner
        return Ok(Action::await_change());
    }

    let _timer = metrics::RECONCILE_DURATION
        .with_label_values(&[&kind])
        .start_timer();

    match component_reconciler::reconcile(obj.as_ref(), &ctx).await {
        Ok(()) => {
            metrics::RECONCILIATIONS
                .with_label_values(&[&kind, "success"])
                .inc();
            Ok(Action::requeue(ctx.settings.periodic_interval()))
        }
        Err(e) => {
            metrics::RECONCILIATIONS
                .with_label_values(&[&kind, "error"])
                .inc();
            metrics::RECONCILIATION_ERRORS
                .with_label_values(&[&kind, e.reason()])
                .inc();
            Err(e)
        }
    }
}

fn error_policy<K: AppComponent>(obj: Arc<K>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        kind = %K::kind(&()),
        name = %obj.name_any(),
        error = %error,
        "Failed to reconcile component, scheduling retry"
    );

    let requeue_duration = match error {
        Error::Kube(_) => Duration::from_secs(15),
        Error::Validation(_) | Error::Serialization(_) | Error::Yaml(_) => Duration::from_secs(300),
        _ => Duration::from_secs(30),
    };
    Action::requeue(requeue_duration)
}
