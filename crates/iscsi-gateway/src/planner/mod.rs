//! Configuration planning: bring the persisted container configuration in
//! line with an IscsiGateway spec
//!
//! `Planner::update` is a pure diff. It mutates the held configuration in
//! place and reports whether anything changed so callers only write the
//! ConfigMap when needed. Sections touch disjoint keys, so the order they
//! run in does not affect the result.

mod instance;

pub use instance::{
    InstanceConfiguration, CEPH_MOUNT_PATH, CONFIG_MOUNT_PATH, DEV_MOUNT_PATH,
    LIB_MODULES_MOUNT_PATH, STATE_DIR,
};

use std::collections::HashSet;

use chrono::{Datelike, NaiveDate};
use tracing::debug;

use iscsi_common::crd::IscsiHostSpec;

use crate::container_config::{ContainerConfig, DiskTable, GlobalConfig, GlobalOptions, HostInfo};

/// Fixed part of derived target names
const TARGET_NAME_DOMAIN: &str = "com.redhat.iscsi-gw";

/// Derive the target IQN for `instance` on `date`
pub fn derived_target_name(instance: &str, date: NaiveDate) -> String {
    format!(
        "iqn.{}-{}.{}:{}",
        date.year(),
        date.day(),
        TARGET_NAME_DOMAIN,
        instance
    )
}

/// Whether a user-supplied target name can be used as is
///
/// Any non-empty name is accepted; the gateway containers reject malformed
/// IQNs themselves.
fn is_valid_target_name(name: &str) -> bool {
    !name.is_empty()
}

/// LUN lists are sets: order and repeats do not matter
fn same_luns(a: &[String], b: &[String]) -> bool {
    let a: HashSet<&str> = a.iter().map(String::as_str).collect();
    let b: HashSet<&str> = b.iter().map(String::as_str).collect();
    a == b
}

/// `pool/disk` references of a host, first occurrence of each kept
fn lun_references(host: &IscsiHostSpec) -> Vec<String> {
    let mut seen = HashSet::new();
    host.luns
        .iter()
        .map(|l| l.reference())
        .filter(|r| seen.insert(r.clone()))
        .collect()
}

/// Diff engine state: a gateway and the configuration persisted for it
#[derive(Clone, Debug)]
pub struct Planner<'a> {
    pub instance: InstanceConfiguration<'a>,
    pub state: ContainerConfig,
}

impl<'a> Planner<'a> {
    pub fn new(instance: InstanceConfiguration<'a>, state: ContainerConfig) -> Self {
        Self { instance, state }
    }

    /// Target name the gateway should export on `today`
    pub fn target_name(&self, today: NaiveDate) -> String {
        let requested = &self.instance.gateway.spec.target_name;
        if is_valid_target_name(requested) {
            requested.clone()
        } else {
            derived_target_name(&self.instance.instance_name(), today)
        }
    }

    /// Reconcile the held configuration with the gateway spec.
    ///
    /// Returns true when the configuration changed and must be persisted.
    pub fn update(&mut self, today: NaiveDate) -> bool {
        let target_changed = self.sync_target_name(today);
        let globals_changed = self.sync_globals();
        let storage_changed = self.sync_storage();
        let hosts_changed = self.sync_hosts();
        debug!(
            target_changed,
            globals_changed,
            storage_changed,
            hosts_changed,
            "planned container configuration"
        );
        target_changed | globals_changed | storage_changed | hosts_changed
    }

    fn sync_target_name(&mut self, today: NaiveDate) -> bool {
        let target = self.target_name(today);
        if self.state.target_name == target {
            return false;
        }
        self.state.target_name = target;
        true
    }

    /// Globals follow the operator config, field by field
    fn sync_globals(&mut self) -> bool {
        let cfg = self.instance.config;
        let Some(entry) = self.state.globals.entry.as_mut() else {
            self.state.globals.entry = Some(GlobalConfig {
                options: GlobalOptions {
                    hostname: cfg.hostname.clone(),
                    username: cfg.username.clone(),
                    password: cfg.password.clone(),
                },
            });
            return true;
        };

        let options = &mut entry.options;
        let mut changed = false;
        changed |= overwrite(&mut options.hostname, &cfg.hostname);
        changed |= overwrite(&mut options.username, &cfg.username);
        changed |= overwrite(&mut options.password, &cfg.password);
        changed
    }

    fn sync_storage(&mut self) -> bool {
        let desired = &self.instance.gateway.spec.storage;
        let mut changed = false;

        for pool in desired {
            let Some(disks) = self.state.storage.get_mut(&pool.pool_name) else {
                let disks: DiskTable = pool
                    .disks
                    .iter()
                    .map(|d| (d.disk_name.clone(), d.disk_size.clone()))
                    .collect();
                self.state.storage.insert(pool.pool_name.clone(), disks);
                changed = true;
                continue;
            };

            for disk in &pool.disks {
                match disks.get_mut(&disk.disk_name) {
                    Some(size) => changed |= overwrite(size, &disk.disk_size),
                    None => {
                        disks.insert(disk.disk_name.clone(), disk.disk_size.clone());
                        changed = true;
                    }
                }
            }

            let wanted: HashSet<&str> = pool.disks.iter().map(|d| d.disk_name.as_str()).collect();
            let before = disks.len();
            disks.retain(|name, _| wanted.contains(name.as_str()));
            changed |= disks.len() != before;
        }

        let wanted: HashSet<&str> = desired.iter().map(|p| p.pool_name.as_str()).collect();
        let before = self.state.storage.len();
        self.state
            .storage
            .retain(|name, _| wanted.contains(name.as_str()));
        changed |= self.state.storage.len() != before;

        changed
    }

    fn sync_hosts(&mut self) -> bool {
        let desired = &self.instance.gateway.spec.hosts;
        let mut changed = false;

        for host in desired {
            let luns = lun_references(host);
            let Some(info) = self.state.hosts.get_mut(&host.host_name) else {
                self.state.hosts.insert(
                    host.host_name.clone(),
                    HostInfo {
                        user: host.username.clone(),
                        password: host.password.clone(),
                        luns,
                    },
                );
                changed = true;
                continue;
            };

            changed |= overwrite(&mut info.user, &host.username);
            changed |= overwrite(&mut info.password, &host.password);
            if !same_luns(&info.luns, &luns) {
                info.luns = luns;
                changed = true;
            }
        }

        let wanted: HashSet<&str> = desired.iter().map(|h| h.host_name.as_str()).collect();
        let before = self.state.hosts.len();
        self.state
            .hosts
            .retain(|name, _| wanted.contains(name.as_str()));
        changed |= self.state.hosts.len() != before;

        changed
    }
}

/// Set `slot` to `value`, reporting whether it differed
fn overwrite(slot: &mut String, value: &str) -> bool {
    if slot.as_str() == value {
        return false;
    }
    *slot = value.to_string();
    true
}
