//! Kaspr Kubernetes Operator
//!
//! Main entry point for the operator. Sets up the Kubernetes client, the
//! reconciliation queue, the KasprApp controller and the component
//! controllers, and runs them until a shutdown signal arrives.

use std::sync::Arc;

use clap::Parser;
use kube::Client;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use kaspr_operator::{
    controllers::{self, Context, ReconciliationQueue},
    crd::{KasprAgent, KasprTable, KasprTask, KasprWebView},
    metrics,
    settings::Settings,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    init_tracing();

    let settings = Settings::parse();
    info!(?settings, "Starting Kaspr Operator");

    // Create Kubernetes client
    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    let (queue, consumer) = ReconciliationQueue::new();
    let poll_interval = settings.poll_interval();
    let metrics_port = settings.metrics_port;

    // Create shared context
    let context = Arc::new(Context::new(client, settings, queue.clone())?);

    // Start metrics server
    let metrics_handle = tokio::spawn(metrics::serve(metrics_port));
    info!("Metrics server starting on port {}", metrics_port);

    let shutdown = CancellationToken::new();
    let pass_context = context.clone();
    let consumer_handle = tokio::spawn(consumer.run(
        queue,
        poll_interval,
        shutdown.clone(),
        move |key| controllers::run_pass(key, pass_context.clone()),
    ));

    let app_controller = controllers::run_app_controller(context.clone());
    let component_controllers = futures::future::join4(
        controllers::run_component_controller::<KasprAgent>(context.clone()),
        controllers::run_component_controller::<KasprTable>(context.clone()),
        controllers::run_component_controller::<KasprWebView>(context.clone()),
        controllers::run_component_controller::<KasprTask>(context),
    );
    metrics::OPERATOR_HEALTH.set(1.0);

    // Handle graceful shutdown
    tokio::select! {
        _ = app_controller => {
            info!("KasprApp controller stopped");
        }
        _ = component_controllers => {
            info!("Component controllers stopped");
        }
        _ = consumer_handle => {
            error!("Reconciliation queue exited unexpectedly");
        }
        _ = metrics_handle => {
            error!("Metrics server exited unexpectedly");
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, stopping operator");
        }
    }

    metrics::OPERATOR_HEALTH.set(0.0);
    shutdown.cancel();
    info!("Kaspr Operator stopped");
    Ok(())
}

/// Initialize tracing subscriber
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,kube=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received CTRL+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
