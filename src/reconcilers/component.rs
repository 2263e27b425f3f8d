//! Component reconciliation
//!
//! Keeps the definitions ConfigMap of an agent, table, web view or task in
//! sync and records whether the app it is labelled for exists.

use chrono::{DateTime, Utc};
use kube::api::{Patch, PatchParams};
use kube::runtime::events::{Event, EventType, Recorder};
use kube::{Api, Resource, ResourceExt};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::controllers::Context;
use crate::crd::{AppLookup, ComponentAppRef, ComponentStatus, KasprApp};
use crate::error::Result;
use crate::resources::{render_component, sync_resource, AppComponent, RenderedComponent, FIELD_MANAGER};

/// Next status of a component, or None when nothing changed
pub fn next_status(
    previous: Option<&ComponentStatus>,
    rendered: &RenderedComponent,
    lookup: AppLookup,
    now: DateTime<Utc>,
) -> Option<ComponentStatus> {
    let mut next = ComponentStatus {
        app: Some(ComponentAppRef {
            name: rendered.app.clone(),
            status: lookup,
        }),
        config_map: Some(rendered.names.config_map.clone()),
        hash: Some(rendered.hash.clone()),
        last_update_time: None,
    };

    let unchanged = previous.is_some_and(|previous| {
        previous.app == next.app
            && previous.config_map == next.config_map
            && previous.hash == next.hash
    });
    if unchanged {
        return None;
    }
    next.last_update_time = Some(now);
    Some(next)
}

/// App lookup result worth an Event: the first one and every flip
pub fn lookup_transition(previous: Option<&ComponentStatus>, lookup: AppLookup) -> Option<AppLookup> {
    let previous = previous
        .and_then(|status| status.app.as_ref())
        .map(|app| app.status);
    (previous != Some(lookup)).then_some(lookup)
}

fn lookup_event(lookup: AppLookup, app: &str) -> Event {
    match lookup {
        AppLookup::AppFound => Event {
            type_: EventType::Normal,
            reason: lookup.as_str().into(),
            note: Some(format!("Found KasprApp '{}'", app)),
            action: "LookupApp".into(),
            secondary: None,
        },
        AppLookup::AppNotFound => Event {
            type_: EventType::Warning,
            reason: lookup.as_str().into(),
            note: Some(format!("KasprApp '{}' does not exist", app)),
            action: "LookupApp".into(),
            secondary: None,
        },
    }
}

/// Sync one component's ConfigMap and status
#[instrument(skip(component, ctx), fields(kind = %K::kind(&()), name = %component.name_any(), namespace = component.namespace()))]
pub async fn reconcile<K: AppComponent>(component: &K, ctx: &Context) -> Result<()> {
    let namespace = component.namespace().unwrap_or_else(|| "default".to_string());
    let rendered = render_component(component)?;

    let outcome = sync_resource(&ctx.client, &namespace, rendered.config_map.clone()).await?;
    debug!(outcome = outcome.as_str(), config_map = %rendered.names.config_map, "Synced definitions");

    let apps: Api<KasprApp> = Api::namespaced(ctx.client.clone(), &namespace);
    let lookup = match apps.get_opt(&rendered.app).await? {
        Some(_) => AppLookup::AppFound,
        None => AppLookup::AppNotFound,
    };

    let previous = component.component_status();
    let transition = lookup_transition(previous, lookup);

    if let Some(status) = next_status(previous, &rendered, lookup, Utc::now()) {
        let api: Api<K> = Api::namespaced(ctx.client.clone(), &namespace);
        api.patch_status(
            &component.name_any(),
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&json!({ "status": status })),
        )
        .await?;
        info!(app = %rendered.app, lookup = lookup.as_str(), "Component status updated");
    }

    if let Some(lookup) = transition {
        let recorder = Recorder::new(ctx.client.clone(), ctx.reporter.clone(), component.object_ref(&()));
        if let Err(e) = recorder.publish(lookup_event(lookup, &rendered.app)).await {
            warn!(error = %e, "Failed to publish app lookup event");
        }
    }
    Ok(())
}
