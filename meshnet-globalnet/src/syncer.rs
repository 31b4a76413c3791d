//! Contract with the external event syncer, plus a watcher-driven runtime
//! implementing it.
//!
//! The syncer delivers `(operation, object, requeue count)` serially per
//! object key and honors the `(writeback, requeue)` pair returned by the
//! controller's transform: a `Some` writeback is patched into the object's
//! status, and `requeue = true` redelivers the event after a backoff.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::api::{ListParams, Patch, PatchParams};
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Client, ResourceExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use meshnet_crds::v1alpha1::global_egress_ip::GlobalEgressIP;

use crate::Result;
use crate::base::should_requeue;
use crate::controller::GlobalEgressIpController;

/// Operation kinds delivered by the object-store syncer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

struct Delivery {
    obj: GlobalEgressIP,
    op: Operation,
    num_requeues: u32,
}

const DELIVERY_QUEUE_DEPTH: usize = 64;
const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_MAX_EXPONENT: u32 = 6;

/// Lists existing objects to restore pool reservations, then watches
/// GlobalEgressIP objects and feeds the controller until cancelled.
pub async fn run_global_egress_ip_syncer(
    client: Client,
    controller: Arc<GlobalEgressIpController>,
    cancel: CancellationToken,
) -> Result<()> {
    let api: Api<GlobalEgressIP> = Api::all(client.clone());

    let existing = api.list(&ListParams::default()).await?;
    controller.restore(&existing.items)?;

    let (tx, mut rx) = mpsc::channel::<Delivery>(DELIVERY_QUEUE_DEPTH);
    tokio::spawn(watch(api, tx.clone(), cancel.clone()));

    loop {
        let delivery = tokio::select! {
            _ = cancel.cancelled() => {
                info!("global egress IP syncer stopped");
                controller.stop();
                return Ok(());
            }
            delivery = rx.recv() => match delivery {
                Some(delivery) => delivery,
                None => return Ok(()),
            },
        };

        let (writeback, requeue) =
            controller.process(&delivery.obj, delivery.num_requeues, delivery.op);

        if let Some(updated) = writeback {
            write_status(&client, &updated).await;
        }

        if requeue {
            if !should_requeue(delivery.num_requeues) {
                error!(
                    "dropping event for {} after {} requeues",
                    delivery.obj.key(),
                    delivery.num_requeues
                );
                continue;
            }

            let tx = tx.clone();
            let delay = backoff(delivery.num_requeues);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx
                    .send(Delivery {
                        num_requeues: delivery.num_requeues + 1,
                        ..delivery
                    })
                    .await;
            });
        }
    }
}

async fn watch(
    api: Api<GlobalEgressIP>,
    tx: mpsc::Sender<Delivery>,
    cancel: CancellationToken,
) {
    let stream = watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            event = stream.next() => event,
        };

        let (obj, op) = match event {
            Some(Ok(watcher::Event::InitApply(obj))) => (obj, Operation::Create),
            Some(Ok(watcher::Event::Apply(obj))) => (obj, Operation::Update),
            Some(Ok(watcher::Event::Delete(obj))) => (obj, Operation::Delete),
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                error!("global egress IP watch failed: {}", e);
                continue;
            }
            None => return,
        };

        if tx.send(Delivery { obj, op, num_requeues: 0 }).await.is_err() {
            return;
        }
    }
}

async fn write_status(client: &Client, obj: &GlobalEgressIP) {
    let Some(ns) = obj.namespace() else { return };
    let api: Api<GlobalEgressIP> = Api::namespaced(client.clone(), &ns);
    let patch = serde_json::json!({ "status": obj.status });

    if let Err(e) = api
        .patch_status(&obj.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        warn!("failed to update status for {}/{}: {}", ns, obj.name_any(), e);
    }
}

fn backoff(num_requeues: u32) -> Duration {
    BACKOFF_BASE.saturating_mul(1 << num_requeues.min(BACKOFF_MAX_EXPONENT))
}
