use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use meshnet_crds::v1alpha1::endpoint::Endpoint;

use crate::Result;
use crate::handler::SyncHandler;
use crate::healthchecker::HealthChecker;

/// Watches Endpoint objects and feeds the sync handler and health checker
/// until cancelled. Apply events map to the created entry points (updates
/// are no-ops in the handler contract); deletes map to removed.
pub async fn run_endpoint_sync(
    client: Client,
    handler: Arc<SyncHandler>,
    health: Arc<HealthChecker>,
    local_cluster_id: String,
    cancel: CancellationToken,
) -> Result<()> {
    let api: Api<Endpoint> = Api::all(client);
    let stream = watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => {
                info!("endpoint sync stopped");
                health.stop();
                return Ok(());
            }
            event = stream.next() => event,
        };

        match event {
            Some(Ok(watcher::Event::Apply(endpoint) | watcher::Event::InitApply(endpoint))) => {
                on_apply(&handler, &health, &local_cluster_id, &endpoint);
            }
            Some(Ok(watcher::Event::Delete(endpoint))) => {
                on_delete(&handler, &health, &local_cluster_id, &endpoint);
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!("endpoint watch failed: {}", e);
            }
            None => return Ok(()),
        }
    }
}

fn on_apply(handler: &SyncHandler, health: &HealthChecker, local_cluster_id: &str, endpoint: &Endpoint) {
    let result = if endpoint.spec.cluster_id == local_cluster_id {
        handler.local_endpoint_created(endpoint)
    } else {
        health.endpoint_created(endpoint);
        handler.remote_endpoint_created(endpoint)
    };

    if let Err(e) = result {
        error!(
            "failed to sync endpoint {} from cluster {}: {}",
            endpoint.name_any(),
            endpoint.spec.cluster_id,
            e
        );
    }
}

fn on_delete(handler: &SyncHandler, health: &HealthChecker, local_cluster_id: &str, endpoint: &Endpoint) {
    let result = if endpoint.spec.cluster_id == local_cluster_id {
        handler.local_endpoint_removed(endpoint)
    } else {
        health.endpoint_removed(endpoint);
        handler.remote_endpoint_removed(endpoint)
    };

    if let Err(e) = result {
        error!(
            "failed to remove endpoint {} from cluster {}: {}",
            endpoint.name_any(),
            endpoint.spec.cluster_id,
            e
        );
    }
}
