use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, LabelSelector, Time};
use k8s_openapi::chrono::Utc;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info};

use meshnet_crds::v1alpha1::global_egress_ip::{
    CONDITION_ALLOCATED, GlobalEgressIP, GlobalEgressIpStatus,
};
use meshnet_dataplane::SnatTarget;
use meshnet_dataplane::filter::{EGRESS_MARK, EgressFilterDriver};
use meshnet_dataplane::ipset::{IpSetDriver, NamedIpSet};
use meshnet_ipam::IpPool;

use crate::base::{check_status_changed, ip_set_name, should_requeue, try_append_status_condition};
use crate::pod_watcher::PodWatcher;
use crate::syncer::Operation;
use crate::{Error, Result};

/// Reconciles declared egress IP counts against the pool and programs the
/// matching packet-rewrite and membership rules. One pod watcher is owned
/// per object key; events for a key are delivered serially by the syncer.
pub struct GlobalEgressIpController {
    client: Client,
    pool: Arc<IpPool>,
    ip_sets: Arc<dyn IpSetDriver>,
    filter: Arc<dyn EgressFilterDriver>,
    pod_watchers: Mutex<HashMap<String, PodWatcher>>,
}

impl GlobalEgressIpController {
    pub fn new(
        client: Client,
        pool: Arc<IpPool>,
        ip_sets: Arc<dyn IpSetDriver>,
        filter: Arc<dyn EgressFilterDriver>,
    ) -> Self {
        info!("creating the global egress IP controller");
        Self {
            client,
            pool,
            ip_sets,
            filter,
            pod_watchers: Mutex::new(HashMap::new()),
        }
    }

    /// Re-reserves the addresses recorded on existing objects and
    /// re-programs their rules, so a restarted process converges without
    /// persistent queues.
    pub fn restore(&self, existing: &[GlobalEgressIP]) -> Result<()> {
        for obj in existing {
            let Some(status) = obj.status.as_ref() else {
                continue;
            };
            if status.allocated_ips.is_empty() {
                continue;
            }

            let key = obj.key();
            self.pool.reserve(&status.allocated_ips)?;
            info!("reserved previously allocated IPs {:?} for {}", status.allocated_ips, key);

            self.program_egress_rules(
                &key,
                &status.allocated_ips,
                obj.spec.pod_selector.as_ref(),
                &self.named_ip_set(&key),
            )?;
        }

        Ok(())
    }

    /// Transform callback for the external syncer. Returns the object for
    /// status writeback when the status moved, plus the requeue decision.
    pub fn process(
        &self,
        obj: &GlobalEgressIP,
        num_requeues: u32,
        op: Operation,
    ) -> (Option<GlobalEgressIP>, bool) {
        let mut obj = obj.clone();
        let number_of_ips = obj.spec.number_of_ips.unwrap_or(1);
        let key = obj.key();

        info!("processing {} for GlobalEgressIP {}, numberOfIPs: {}", op, key, number_of_ips);

        match op {
            Operation::Create | Operation::Update => {
                let prev_status = obj.status.clone().unwrap_or_default();
                let mut status = obj.status.take().unwrap_or_default();

                let mut requeue = false;
                if self.validate(number_of_ips, &mut status) {
                    requeue = self.on_create_or_update(
                        &key,
                        number_of_ips,
                        &obj,
                        &mut status,
                        num_requeues,
                    );
                }

                obj.status = Some(status.clone());
                (check_status_changed(&prev_status, &status, obj), requeue)
            }
            Operation::Delete => (None, self.on_remove(&key, &obj, num_requeues)),
        }
    }

    /// Stops the controller and every child pod watcher.
    pub fn stop(&self) {
        for (_, watcher) in self.pod_watchers.lock().unwrap().drain() {
            watcher.stop();
        }
    }

    fn validate(&self, number_of_ips: i32, status: &mut GlobalEgressIpStatus) -> bool {
        if number_of_ips < 0 {
            try_append_status_condition(
                &mut status.conditions,
                allocation_condition(
                    "False",
                    "InvalidInput",
                    "the number of requested IPs cannot be negative".into(),
                ),
            );
            return false;
        }

        true
    }

    fn on_create_or_update(
        &self,
        key: &str,
        number_of_ips: i32,
        obj: &GlobalEgressIP,
        status: &mut GlobalEgressIpStatus,
        num_requeues: u32,
    ) -> bool {
        let selector = obj.spec.pod_selector.as_ref();

        if number_of_ips == 0 {
            // Nothing left to program; flushing is best-effort.
            let _ = self.flush_rules_and_release_ips(
                key,
                &ip_set_name(key),
                selector,
                status,
                num_requeues,
            );
            status.allocated_ips.clear();
            try_append_status_condition(
                &mut status.conditions,
                allocation_condition("False", "ZeroInput", "the specified number of IPs is 0".into()),
            );
            return false;
        }

        let Some(named_ip_set) = self.ensure_pod_watcher(key, obj, status) else {
            return true;
        };

        if number_of_ips as usize == status.allocated_ips.len() {
            debug!("update for {} is a no-op, {} IP(s) already allocated", key, number_of_ips);
            return false;
        }

        self.flush_rules_and_release_ips(key, named_ip_set.name(), selector, status, num_requeues)
            || self.allocate_global_ips(key, number_of_ips as usize, selector, status, &named_ip_set)
    }

    /// Starts the pod watcher for `key` if one is not already running. A
    /// changed selector is reported through a failure condition, but the
    /// existing watcher and its IP set stay in effect.
    fn ensure_pod_watcher(
        &self,
        key: &str,
        obj: &GlobalEgressIP,
        status: &mut GlobalEgressIpStatus,
    ) -> Option<NamedIpSet> {
        let mut watchers = self.pod_watchers.lock().unwrap();

        if let Some(existing) = watchers.get(key) {
            if existing.selector.as_ref() != obj.spec.pod_selector.as_ref() {
                error!("the pod selector for {} cannot be updated after creation", key);
                try_append_status_condition(
                    &mut status.conditions,
                    allocation_condition(
                        "False",
                        "PodSelectorUpdateNotSupported",
                        "the pod selector cannot be updated after creation".into(),
                    ),
                );
            }

            return Some(existing.named_ip_set().clone());
        }

        let namespace = match obj.namespace() {
            Some(namespace) => namespace,
            None => {
                error!("{}", Error::MissingNamespace(obj.name_any()));
                return None;
            }
        };

        let named_ip_set = self.named_ip_set(key);
        match PodWatcher::start(
            self.client.clone(),
            key,
            &namespace,
            named_ip_set.clone(),
            obj.spec.pod_selector.as_ref(),
        ) {
            Ok(watcher) => {
                watchers.insert(key.to_owned(), watcher);
                info!("started pod watcher for {}", key);
                Some(named_ip_set)
            }
            Err(e) => {
                error!("failed to start the pod watcher for {}: {}", key, e);
                None
            }
        }
    }

    /// Removes the egress rules for the currently-allocated IPs and returns
    /// them to the pool. Returns true when rule removal failed and the event
    /// should be redelivered; the IPs are then kept reserved for the retry.
    fn flush_rules_and_release_ips(
        &self,
        key: &str,
        ip_set_name: &str,
        selector: Option<&LabelSelector>,
        status: &mut GlobalEgressIpStatus,
        num_requeues: u32,
    ) -> bool {
        if status.allocated_ips.is_empty() {
            return false;
        }

        info!("flushing egress rules for previously allocated IPs {:?} for {}", status.allocated_ips, key);

        if let Some(snat) = SnatTarget::from_ips(&status.allocated_ips) {
            let removed = if selector.is_some() {
                self.filter
                    .remove_egress_rules_for_pods(key, ip_set_name, &snat, EGRESS_MARK)
            } else {
                self.filter
                    .remove_egress_rules_for_namespace(key, ip_set_name, &snat, EGRESS_MARK)
            };

            if let Err(e) = removed {
                error!("failed to flush the egress rules for {}: {}", key, e);
                if should_requeue(num_requeues) {
                    return true;
                }
            }
        }

        if let Err(e) = self.pool.release(&status.allocated_ips) {
            error!("failed to release IPs {:?} for {}: {}", status.allocated_ips, key, e);
        }

        false
    }

    fn allocate_global_ips(
        &self,
        key: &str,
        number_of_ips: usize,
        selector: Option<&LabelSelector>,
        status: &mut GlobalEgressIpStatus,
        named_ip_set: &NamedIpSet,
    ) -> bool {
        info!("allocating {} global IP(s) for {}", number_of_ips, key);

        status.allocated_ips.clear();

        let allocated = match self.pool.allocate(number_of_ips) {
            Ok(ips) => ips,
            Err(e) => {
                error!("failed to allocate IPs for {}: {}", key, e);
                try_append_status_condition(
                    &mut status.conditions,
                    allocation_condition(
                        "False",
                        "IPPoolAllocationFailed",
                        format!("error allocating {number_of_ips} global IP(s) from the pool: {e}"),
                    ),
                );
                return true;
            }
        };

        if let Err(e) = self.program_egress_rules(key, &allocated, selector, named_ip_set) {
            error!("failed to program the egress rules for {}: {}", key, e);
            try_append_status_condition(
                &mut status.conditions,
                allocation_condition(
                    "False",
                    "ProgramIPTableRulesFailed",
                    format!("error programming the egress rules: {e}"),
                ),
            );

            if let Err(e) = self.pool.release(&allocated) {
                error!("failed to release IPs {:?} for {}: {}", allocated, key, e);
            }

            return true;
        }

        try_append_status_condition(
            &mut status.conditions,
            allocation_condition("True", "Success", format!("allocated {number_of_ips} global IP(s)")),
        );
        status.allocated_ips = allocated;

        info!("allocated {:?} for {}", status.allocated_ips, key);
        false
    }

    fn program_egress_rules(
        &self,
        key: &str,
        allocated_ips: &[Ipv4Addr],
        selector: Option<&LabelSelector>,
        named_ip_set: &NamedIpSet,
    ) -> Result<()> {
        named_ip_set.create(true)?;

        let Some(snat) = SnatTarget::from_ips(allocated_ips) else {
            return Ok(());
        };

        let set_name = named_ip_set.name();
        if selector.is_some() {
            if let Err(e) = self
                .filter
                .add_egress_rules_for_pods(key, set_name, &snat, EGRESS_MARK)
            {
                let _ = self
                    .filter
                    .remove_egress_rules_for_pods(key, set_name, &snat, EGRESS_MARK);
                return Err(e.into());
            }
        } else if let Err(e) = self
            .filter
            .add_egress_rules_for_namespace(key, set_name, &snat, EGRESS_MARK)
        {
            let _ = self
                .filter
                .remove_egress_rules_for_namespace(key, set_name, &snat, EGRESS_MARK);
            return Err(e.into());
        }

        Ok(())
    }

    fn on_remove(&self, key: &str, obj: &GlobalEgressIP, num_requeues: u32) -> bool {
        if let Some(watcher) = self.pod_watchers.lock().unwrap().remove(key) {
            watcher.stop();
        }

        let named_ip_set = self.named_ip_set(key);
        let mut status = obj.status.clone().unwrap_or_default();

        if self.flush_rules_and_release_ips(
            key,
            named_ip_set.name(),
            obj.spec.pod_selector.as_ref(),
            &mut status,
            num_requeues,
        ) {
            return true;
        }

        if let Err(e) = named_ip_set.destroy() {
            error!("failed to destroy the ip set {} for {}: {}", named_ip_set.name(), key, e);
            if should_requeue(num_requeues) {
                return true;
            }
        }

        error!("successfully deleted all the egress rules for {}", key);
        false
    }

    fn named_ip_set(&self, key: &str) -> NamedIpSet {
        NamedIpSet::new(ip_set_name(key), Arc::clone(&self.ip_sets))
    }
}

fn allocation_condition(status: &str, reason: &str, message: String) -> Condition {
    Condition {
        last_transition_time: Time(Utc::now()),
        message,
        observed_generation: None,
        reason: reason.into(),
        status: status.into(),
        type_: CONDITION_ALLOCATED.into(),
    }
}
