use std::collections::HashMap;
use std::net::Ipv4Addr;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::core::Selector;
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use meshnet_dataplane::ipset::NamedIpSet;

use crate::{Error, Result};

/// Maintains IP-set membership for the ready workloads matching a selector
/// within one namespace. The watcher runs on its own task and mutates
/// nothing but the IP-set driver.
pub struct PodWatcher {
    pub(crate) selector: Option<LabelSelector>,
    named_ip_set: NamedIpSet,
    cancel: CancellationToken,
}

impl PodWatcher {
    /// Subscribes to pod events for `namespace` filtered by `selector`. An
    /// absent selector covers every pod in the namespace.
    pub fn start(
        client: Client,
        key: &str,
        namespace: &str,
        named_ip_set: NamedIpSet,
        selector: Option<&LabelSelector>,
    ) -> Result<Self> {
        let api: Api<Pod> = Api::namespaced(client, namespace);

        let mut config = watcher::Config::default();
        if let Some(selector) = selector {
            let parsed = Selector::try_from(selector.clone())
                .map_err(|e| Error::InvalidSelector(e.to_string()))?;
            config = config.labels_from(&parsed);
        }

        let cancel = CancellationToken::new();
        tokio::spawn(run(
            api,
            config,
            named_ip_set.clone(),
            key.to_owned(),
            cancel.clone(),
        ));

        Ok(Self {
            selector: selector.cloned(),
            named_ip_set,
            cancel,
        })
    }

    pub fn named_ip_set(&self) -> &NamedIpSet {
        &self.named_ip_set
    }

    /// Terminates the subscription. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

async fn run(
    api: Api<Pod>,
    config: watcher::Config,
    set: NamedIpSet,
    key: String,
    cancel: CancellationToken,
) {
    // Pod name to the address currently present in the set.
    let mut tracked: HashMap<String, Ipv4Addr> = HashMap::new();

    let stream = watcher(api, config).default_backoff();
    futures::pin_mut!(stream);

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("pod watcher for {} stopped", key);
                return;
            }
            event = stream.next() => event,
        };

        match event {
            Some(Ok(watcher::Event::Apply(pod) | watcher::Event::InitApply(pod))) => {
                let name = pod.name_any();
                match ready_pod_ip(&pod) {
                    Some(ip) => {
                        if tracked.get(&name) == Some(&ip) {
                            continue;
                        }
                        remove_tracked(&mut tracked, &set, &name, &key);
                        if let Err(e) = set.add(ip) {
                            error!("failed to add {} to ip set {} for {}: {}", ip, set.name(), key, e);
                            continue;
                        }
                        tracked.insert(name, ip);
                    }
                    None => remove_tracked(&mut tracked, &set, &name, &key),
                }
            }
            Some(Ok(watcher::Event::Delete(pod))) => {
                remove_tracked(&mut tracked, &set, &pod.name_any(), &key);
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!("pod watch for {} failed: {}", key, e);
            }
            None => return,
        }
    }
}

fn remove_tracked(
    tracked: &mut HashMap<String, Ipv4Addr>,
    set: &NamedIpSet,
    name: &str,
    key: &str,
) {
    if let Some(ip) = tracked.remove(name)
        && let Err(e) = set.remove(ip)
    {
        error!("failed to remove {} from ip set {} for {}: {}", ip, set.name(), key, e);
    }
}

fn ready_pod_ip(pod: &Pod) -> Option<Ipv4Addr> {
    let status = pod.status.as_ref()?;
    let ready = status
        .conditions
        .as_ref()
        .is_some_and(|cs| cs.iter().any(|c| c.type_ == "Ready" && c.status == "True"));
    if !ready {
        return None;
    }

    status.pod_ip.as_ref()?.parse().ok()
}
