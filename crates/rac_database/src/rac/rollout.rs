//! Per-node StatefulSet rollout and the ASM disk steps that hang off it.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Pod, VolumeDevice};
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::api::v1::racdatabase::{DiskGroupStatus, RacDatabase};
use crate::api::v1::DiskGroupType;
use crate::client::ClusterClient;
use crate::rac::asm::{self, AddDiskResult};
use crate::rac::builders::{build_statefulset, node_selector};
use crate::rac::lifecycle::{pods_state, PodsState};
use crate::rac::volumes::delete_volumes;
use crate::util::config::OperatorConfig;
use crate::util::errors::{Error, Result, StdError};
use crate::util::poll::{poll_until, PollError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolloutAction {
    Created,
    Updated,
    Unchanged,
}

/// Spec devices to attach, minus those the last discovery found unusable.
pub fn desired_devices(db: &RacDatabase, status_groups: &[DiskGroupStatus]) -> Vec<String> {
    let unusable: Vec<&str> = status_groups
        .iter()
        .flat_map(|g| g.disks.iter())
        .filter(|d| !d.valid || d.size_gb == 0)
        .map(|d| d.name.as_str())
        .collect();
    db.spec
        .all_disks()
        .into_iter()
        .filter(|d| !unusable.contains(&d.as_str()))
        .collect()
}

/// Block devices of the primary container.
pub fn attached_devices(sts: &StatefulSet) -> Vec<VolumeDevice> {
    sts.spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|p| p.containers.first())
        .and_then(|c| c.volume_devices.clone())
        .unwrap_or_default()
}

/// Creates the node's StatefulSet, or replaces it when its attached devices changed.
pub async fn ensure_statefulset<C: ClusterClient>(
    client: &C,
    db: &RacDatabase,
    node: &str,
    devices: &[String],
) -> Result<RolloutAction> {
    let ns = db.namespace().unwrap_or_default();
    let mut desired = build_statefulset(db, node, devices);

    let Some(existing) = client.get_opt::<StatefulSet>(&ns, node).await? else {
        client.create(&ns, &desired).await?;
        info!("created StatefulSet {ns}/{node}");
        return Ok(RolloutAction::Created);
    };

    if attached_devices(&existing) == attached_devices(&desired) {
        return Ok(RolloutAction::Unchanged);
    }

    desired.metadata.resource_version = existing.metadata.resource_version.clone();
    client.replace(&ns, node, &desired).await?;
    info!("updated StatefulSet {ns}/{node} to {} devices", devices.len());
    Ok(RolloutAction::Updated)
}

fn rollout_settled(sts: &StatefulSet) -> bool {
    match &sts.status {
        Some(s) => {
            s.observed_generation >= sts.metadata.generation
                && (s.update_revision.is_none() || s.current_revision == s.update_revision)
        }
        None => true,
    }
}

/// Waits until the StatefulSet carries `devices` and all of its pods are Running and Ready.
pub async fn wait_for_rollout<C: ClusterClient>(
    client: &C,
    db: &RacDatabase,
    node: &str,
    devices: &[String],
    config: &OperatorConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    let ns = db.namespace().unwrap_or_default();
    let ns_ref = ns.as_str();
    let want = attached_devices(&build_statefulset(db, node, devices));
    let want_ref = &want;
    let selector = node_selector(db, node);
    let selector_ref = selector.as_str();

    let res = poll_until(config.rollout, cancel, || async move {
        let Some(sts) = client.get_opt::<StatefulSet>(ns_ref, node).await? else {
            return Ok(None);
        };
        if attached_devices(&sts) != *want_ref || !rollout_settled(&sts) {
            return Ok(None);
        }
        let replicas = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1).max(0) as usize;
        let pods: Vec<Pod> = client.list(ns_ref, selector_ref).await?;
        Ok::<_, Error>((pods_state(&pods, replicas) == PodsState::AllReady).then_some(()))
    })
    .await;

    match res {
        Ok(()) => {
            info!("StatefulSet {ns}/{node} rolled out");
            Ok(())
        }
        Err(PollError::Failed(e)) => Err(e),
        Err(PollError::Cancelled) => Err(Error::StdError(StdError::Cancelled(format!(
            "waiting for rollout of {node}"
        )))),
        Err(PollError::Timeout) => Err(Error::requeue(
            StdError::Timeout(format!("StatefulSet {ns}/{node} not ready after {:?}", config.rollout.timeout)),
            config.waiting_requeue,
        )),
    }
}

/// Releases the volumes of removed devices once the last node no longer uses them.
pub async fn remove_disk_volumes<C: ClusterClient>(
    client: &C,
    db: &RacDatabase,
    removed: &[String],
    is_last_node: bool,
) -> Result<bool> {
    if !is_last_node || removed.is_empty() {
        return Ok(false);
    }
    delete_volumes(client, db, removed).await?;
    Ok(true)
}

/// Adds validated devices to their live ASM disk groups.
///
/// Only groups with `autoUpdate` are touched. Returns how many devices ASM now has.
pub async fn add_disks<C: ClusterClient>(client: &C, db: &RacDatabase, added: &[String]) -> Result<usize> {
    if added.is_empty() {
        return Ok(0);
    }
    let ns = db.namespace().unwrap_or_default();
    let pod = asm::healthy_pod(client, db).await?;
    let mut known_groups: BTreeMap<String, bool> = BTreeMap::new();
    let mut count = 0;

    for disk in added {
        let Some(group) = db.spec.group_of(disk) else {
            continue;
        };
        if group.type_ == DiskGroupType::Others {
            continue;
        }
        if !group.auto_update {
            info!("autoUpdate is off for {}, leaving {disk} for the DBA", group.name);
            continue;
        }

        let exists = match known_groups.get(&group.name) {
            Some(e) => *e,
            None => {
                let e = asm::disk_group_exists(client, &ns, &pod, &group.name).await?;
                known_groups.insert(group.name.clone(), e);
                e
            }
        };
        if !exists {
            return Err(Error::StdError(StdError::ExecError(format!(
                "disk group {} does not exist in ASM, cannot add {disk}",
                group.name
            ))));
        }

        match asm::add_disk(client, &ns, &pod, disk, &group.name).await? {
            AddDiskResult::Added | AddDiskResult::AlreadyPresent => count += 1,
        }
    }
    Ok(count)
}
