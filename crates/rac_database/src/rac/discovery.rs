//! Disk discovery through a short-lived probe DaemonSet.
//!
//! The probe mounts every spec device on every worker, prints one JSON record
//! per device and is deleted again once its logs have been read.

use std::collections::BTreeMap;

use futures::{stream, StreamExt};
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::v1::racdatabase::{DeviceStatus, DiskGroupStatus, RacDatabase, RacDatabaseSpec};
use crate::api::v1::DiskGroupType;
use crate::client::ClusterClient;
use crate::rac::builders::{build_probe_daemonset, probe_selector, PROBE_CONTAINER, PROBE_NAME};
use crate::util::config::OperatorConfig;
use crate::util::errors::{Error, Result, StdError};
use crate::util::poll::{poll_until, PollError};

/// Printed by the probe for every path that is not a block device.
pub const INVALID_DEVICE_MARKER: &str = "not a valid block device";

/// One line of probe output.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProbeRecord {
    pub disk: String,
    pub valid: bool,
    pub size_gb: u64,
}

/// Everything the probe saw, keyed by device path.
pub type Inventory = BTreeMap<String, DeviceStatus>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Discovery {
    pub inventory: Inventory,
    /// ASM-relevant groups, OTHERS excluded
    pub groups: Vec<DiskGroupStatus>,
}

pub fn parse_probe_log(log: &str) -> Vec<ProbeRecord> {
    log.lines()
        .map(str::trim)
        .filter(|l| l.starts_with('{'))
        .filter_map(|l| match serde_json::from_str::<ProbeRecord>(l) {
            Ok(r) => Some(r),
            Err(e) => {
                debug!("skipping probe line {l:?}: {e}");
                None
            }
        })
        .collect()
}

/// Creates the probe, or updates it in place when its volumes changed.
pub async fn ensure_probe<C: ClusterClient>(client: &C, db: &RacDatabase, devices: &[String]) -> Result<()> {
    let ns = db.namespace().unwrap_or_default();
    let mut desired = build_probe_daemonset(db, devices);

    match client.get_opt::<DaemonSet>(&ns, PROBE_NAME).await? {
        None => {
            client.create(&ns, &desired).await?;
            info!("created disk probe {ns}/{PROBE_NAME} for {} devices", devices.len());
        }
        Some(existing) => {
            let volumes = |ds: &DaemonSet| {
                ds.spec
                    .as_ref()
                    .and_then(|s| s.template.spec.as_ref())
                    .and_then(|p| p.volumes.clone())
            };
            if volumes(&existing) != volumes(&desired) {
                desired.metadata.resource_version = existing.metadata.resource_version.clone();
                client.replace(&ns, PROBE_NAME, &desired).await?;
                info!("updated disk probe {ns}/{PROBE_NAME} volumes");
            }
        }
    }
    Ok(())
}

fn probe_ready(ds: &DaemonSet) -> bool {
    ds.status
        .as_ref()
        .map(|s| s.desired_number_scheduled > 0 && s.number_ready == s.desired_number_scheduled)
        .unwrap_or(false)
}

async fn probe_logs<C: ClusterClient>(client: &C, ns: &str, selector: &str, parallelism: usize) -> Result<Vec<(String, String)>> {
    let pods: Vec<Pod> = client.list(ns, selector).await?;
    let mut logs: Vec<(String, String)> = stream::iter(pods.iter().map(ResourceExt::name_any))
        .map(|pod| async move {
            match client.pod_logs(ns, &pod, Some(PROBE_CONTAINER)).await {
                Ok(log) => Some((pod, log)),
                Err(e) => {
                    warn!("failed to read disk probe logs from {pod}: {e}");
                    None
                }
            }
        })
        .buffer_unordered(parallelism.max(1))
        .filter_map(|r| async move { r })
        .collect()
        .await;
    logs.sort();
    Ok(logs)
}

/// Waits for every probe pod to report ready.
///
/// On timeout the logs decide: an invalid device marker is a hard failure,
/// anything else is retried.
pub async fn wait_probe_ready<C: ClusterClient>(
    client: &C,
    db: &RacDatabase,
    config: &OperatorConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    let ns = db.namespace().unwrap_or_default();
    let ns_ref = ns.as_str();
    let res = poll_until(config.probe_ready, cancel, || async move {
        let ds = client.get_opt::<DaemonSet>(ns_ref, PROBE_NAME).await?;
        Ok::<_, Error>(ds.filter(probe_ready).map(|_| ()))
    })
    .await;

    match res {
        Ok(()) => Ok(()),
        Err(PollError::Failed(e)) => Err(e),
        Err(PollError::Cancelled) => Err(Error::StdError(StdError::Cancelled(
            "waiting for disk probe".to_string(),
        ))),
        Err(PollError::Timeout) => {
            let logs = probe_logs(client, &ns, &probe_selector(db), db.spec.node_names().len()).await?;
            let marker = logs
                .iter()
                .flat_map(|(_, log)| log.lines())
                .find(|l| l.contains(INVALID_DEVICE_MARKER));
            match marker {
                Some(line) => Err(Error::StdError(StdError::InvalidBlockDevice(line.trim().to_string()))),
                None => Err(Error::requeue(
                    StdError::Timeout(format!(
                        "disk probe not ready after {:?}",
                        config.probe_ready.timeout
                    )),
                    config.waiting_requeue,
                )),
            }
        }
    }
}

/// Reads every probe pod's log. A pod whose log cannot be read is skipped.
pub async fn collect_probe_records<C: ClusterClient>(client: &C, db: &RacDatabase, parallelism: usize) -> Result<Inventory> {
    let ns = db.namespace().unwrap_or_default();
    let logs = probe_logs(client, &ns, &probe_selector(db), parallelism).await?;

    let mut inventory = Inventory::new();
    for (pod, log) in &logs {
        for record in parse_probe_log(log) {
            debug!("probe {pod}: {record:?}");
            let valid = record.valid;
            // a device is only valid if every node that sees it agrees
            inventory
                .entry(record.disk.clone())
                .and_modify(|d| d.valid &= valid)
                .or_insert(DeviceStatus {
                    name: record.disk,
                    size_gb: record.size_gb,
                    valid,
                });
        }
    }
    if inventory.is_empty() {
        return Err(Error::StdError(StdError::Timeout(
            "disk probe produced no device records".to_string(),
        )));
    }
    Ok(inventory)
}

/// Builds ASM disk group status from the inventory. OTHERS groups are skipped.
pub fn regroup_by_spec(spec: &RacDatabaseSpec, inventory: &Inventory) -> Result<Vec<DiskGroupStatus>> {
    let mut groups = Vec::new();
    for group in spec.effective_disk_groups() {
        if group.type_ == DiskGroupType::Others {
            continue;
        }
        let disks: Vec<DeviceStatus> = group
            .disks
            .iter()
            .map(|d| {
                inventory.get(d).cloned().unwrap_or_else(|| DeviceStatus {
                    name: d.clone(),
                    size_gb: 0,
                    valid: false,
                })
            })
            .collect();

        let mut sized = disks.iter().filter(|d| d.valid && d.size_gb > 0);
        if let Some(first) = sized.next() {
            if let Some(odd) = sized.find(|d| d.size_gb != first.size_gb) {
                return Err(Error::StdError(StdError::DiskSizeMismatch {
                    disk_group: group.name.clone(),
                    disk: odd.name.clone(),
                    size_gb: odd.size_gb,
                    expected_gb: first.size_gb,
                }));
            }
        }

        groups.push(DiskGroupStatus {
            name: group.name,
            type_: group.type_,
            redundancy: group.redundancy,
            auto_update: group.auto_update,
            disks,
        });
    }
    Ok(groups)
}

/// Deletes the probe and waits until it is gone.
pub async fn cleanup_probe<C: ClusterClient>(
    client: &C,
    ns: &str,
    config: &OperatorConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    client.delete::<DaemonSet>(ns, PROBE_NAME).await?;
    let res = poll_until(config.probe_delete, cancel, || async move {
        let ds = client.get_opt::<DaemonSet>(ns, PROBE_NAME).await?;
        Ok::<_, Error>(ds.is_none().then_some(()))
    })
    .await;
    match res {
        Ok(()) => Ok(()),
        Err(PollError::Failed(e)) => Err(e),
        Err(PollError::Cancelled) => Err(Error::StdError(StdError::Cancelled(
            "waiting for disk probe deletion".to_string(),
        ))),
        Err(PollError::Timeout) => Err(Error::requeue(
            StdError::Timeout(format!("disk probe {ns}/{PROBE_NAME} still present")),
            config.waiting_requeue,
        )),
    }
}

/// Full discovery run. The probe is cleaned up whatever the outcome.
pub async fn run_discovery<C: ClusterClient>(
    client: &C,
    db: &RacDatabase,
    config: &OperatorConfig,
    cancel: &CancellationToken,
) -> Result<Discovery> {
    let ns = db.namespace().unwrap_or_default();
    let devices = db.spec.all_disks();
    if devices.is_empty() {
        info!("no ASM devices defined for {ns}/{}, skipping discovery", db.name_any());
        return Ok(Discovery::default());
    }

    let result = async {
        ensure_probe(client, db, &devices).await?;
        wait_probe_ready(client, db, config, cancel).await?;
        let inventory = collect_probe_records(client, db, db.spec.node_names().len()).await?;
        let groups = regroup_by_spec(&db.spec, &inventory)?;
        Ok::<_, Error>(Discovery { inventory, groups })
    }
    .await;

    let cleanup = cleanup_probe(client, &ns, config, cancel).await;
    match (result, cleanup) {
        (Ok(discovery), Ok(())) => {
            info!("discovered {} devices for {ns}/{}", discovery.inventory.len(), db.name_any());
            Ok(discovery)
        }
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(cleanup_err)) => {
            warn!("disk probe cleanup failed: {cleanup_err}");
            Err(e)
        }
    }
}
