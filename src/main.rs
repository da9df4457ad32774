//! Sample controller - reconciles Foo resources into Deployments

use std::sync::Arc;

use clap::Parser;
use k8s_openapi::api::apps::v1::Deployment;
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::{Api, Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use sample_controller::cache::{CacheSync, ObjectName};
use sample_controller::config::{Cli, ControllerConfig};
use sample_controller::controller::{Context, Controller};
use sample_controller::crd::Foo;
use sample_controller::feed::informer::Informer;
use sample_controller::feed::EventHandler;
use sample_controller::owner::OwnerResolver;
use sample_controller::queue::{default_controller_rate_limiter, RetryQueue};
use sample_controller::telemetry::init_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&Foo::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_tracing(cli.log_json)?;
    let config = cli.controller_config()?;
    let client = cli.client().await?;

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    run_controller(client, config, cancel).await
}

/// Wire caches, change feed and workers together and run until cancelled
async fn run_controller(
    client: Client,
    config: ControllerConfig,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let (foo_store, foo_writer) = reflector::store::<Foo>();
    let (deployment_store, deployment_writer) = reflector::store::<Deployment>();

    let queue: Arc<RetryQueue<ObjectName>> =
        Arc::new(RetryQueue::new(default_controller_rate_limiter(&config.backoff)));
    let handler = EventHandler::new(
        queue.clone(),
        OwnerResolver::new(Arc::new(foo_store.clone())),
    );

    info!("Setting up event handlers");
    let foos: Api<Foo> = Api::all(client.clone());
    let foo_informer = Informer::new(foo_writer).with_resync(config.resync_period);
    let foo_feed = tokio::spawn({
        let handler = handler.clone();
        foo_informer.run(
            watcher(foos, watcher::Config::default()).default_backoff(),
            cancel.clone(),
            move |event| handler.on_foo(event),
        )
    });

    let deployments: Api<Deployment> = Api::all(client.clone());
    let deployment_informer =
        Informer::new(deployment_writer).with_resync(config.resync_period);
    let deployment_feed = tokio::spawn({
        let handler = handler.clone();
        deployment_informer.run(
            watcher(deployments, watcher::Config::default()).default_backoff(),
            cancel.clone(),
            move |event| handler.on_owned(event),
        )
    });

    let ctx = Arc::new(Context::new(
        client,
        foo_store.clone(),
        deployment_store.clone(),
    ));
    let caches: Vec<Arc<dyn CacheSync>> = vec![Arc::new(foo_store), Arc::new(deployment_store)];
    let controller = Controller::new(queue, ctx, caches)
        .with_cache_sync_timeout(config.cache_sync_timeout);

    let result = controller.run(config.workers, cancel.clone()).await;

    // Stop the feeds whichever way the controller ended
    cancel.cancel();
    for (name, feed) in [("foo", foo_feed), ("deployment", deployment_feed)] {
        if let Err(e) = feed.await {
            error!(feed = name, error = %e, "informer task failed");
        }
    }

    result.map_err(|e| anyhow::anyhow!("Error running controller: {}", e))?;
    info!("Controller stopped");
    Ok(())
}

/// Cancel `cancel` on the first SIGTERM or SIGINT
async fn cancel_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => info!("Received SIGINT"),
                Err(e) => {
                    error!(error = %e, "Failed to listen for SIGINT");
                    return;
                }
            },
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            return;
        }
        info!("Received Ctrl+C");
    }

    cancel.cancel();
}
