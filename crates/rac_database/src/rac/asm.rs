//! ASM commands run inside the database pods.

use tracing::{debug, info};

use crate::api::v1::racdatabase::RacDatabase;
use crate::client::ClusterClient;
use crate::rac::builders::{node_selector, pod_names, RAC_CONTAINER};
use crate::rac::lifecycle::is_pod_ready;
use crate::util::errors::{Error, Result, StdError};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

/// Printed by the startup scripts when the device is already part of the group.
pub const ALREADY_ADDED_MARKER: &str = "UPDATE_ASMDEVICES_NOT_UPDATED";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddDiskResult {
    Added,
    AlreadyPresent,
}

/// asmcmd takes group names without the `+` prefix.
fn bare(disk_group: &str) -> &str {
    disk_group.trim_start_matches('+')
}

fn grid(cmd: String) -> Vec<String> {
    vec!["bash".to_string(), "-c".to_string(), cmd]
}

pub fn lsdsk_command(disk_group: &str) -> Vec<String> {
    grid(format!("su - grid -c 'asmcmd lsdsk -G {} --suppressheader'", bare(disk_group)))
}

pub fn lsdg_command(disk_group: &str) -> Vec<String> {
    grid(format!("su - grid -c 'asmcmd lsdg --suppressheader' | grep -w {}", bare(disk_group)))
}

pub fn add_disk_command(disk: &str, disk_group: &str) -> Vec<String> {
    grid(format!(
        "python3 /opt/scripts/startup/scripts/main.py --updateasmdevices=\"diskname={disk};diskgroup={};processtype=addition\"",
        bare(disk_group)
    ))
}

/// Removes the local instance, RAC home and grid node of the pod it runs on.
pub fn delete_node_command() -> Vec<String> {
    grid(
        "python3 /opt/scripts/startup/scripts/main.py --delracnode=\"del_rachome=true;del_gridnode=true\"".to_string(),
    )
}

/// Pod to run ASM queries on: the last ready pod of the first node that has
/// one, falling back to the last pod of node 1.
pub async fn healthy_pod<C: ClusterClient>(client: &C, db: &RacDatabase) -> Result<String> {
    let ns = db.namespace().unwrap_or_default();
    let nodes = db.spec.node_names();
    for node in &nodes {
        let pods: Vec<Pod> = client.list(&ns, &node_selector(db, node)).await?;
        let mut ready: Vec<String> = pods.iter().filter(|p| is_pod_ready(p)).map(|p| p.name_any()).collect();
        ready.sort();
        if let Some(last) = ready.pop() {
            return Ok(last);
        }
    }
    let first = nodes
        .first()
        .ok_or_else(|| Error::StdError(StdError::InvalidArgument("no RAC nodes defined".to_string())))?;
    pod_names(first, 1)
        .pop()
        .ok_or_else(|| Error::StdError(StdError::InvalidArgument(format!("no pods for node {first}"))))
}

/// Disks currently in `disk_group` according to ASM.
pub async fn group_members<C: ClusterClient>(client: &C, ns: &str, pod: &str, disk_group: &str) -> Result<Vec<String>> {
    let out = client
        .exec(ns, pod, Some(RAC_CONTAINER), lsdsk_command(disk_group))
        .await?;
    if !out.success {
        return Err(Error::StdError(StdError::ExecError(format!(
            "asmcmd lsdsk -G {disk_group} on {pod} failed: {}",
            out.stderr.trim()
        ))));
    }
    let members: Vec<String> = out
        .stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();
    debug!("ASM group {disk_group} members on {pod}: {members:?}");
    Ok(members)
}

pub async fn disk_group_exists<C: ClusterClient>(client: &C, ns: &str, pod: &str, disk_group: &str) -> Result<bool> {
    let out = client
        .exec(ns, pod, Some(RAC_CONTAINER), lsdg_command(disk_group))
        .await?;
    // grep exits non-zero on no match
    Ok(out.success && !out.stdout.trim().is_empty())
}

pub async fn add_disk<C: ClusterClient>(
    client: &C,
    ns: &str,
    pod: &str,
    disk: &str,
    disk_group: &str,
) -> Result<AddDiskResult> {
    let out = client
        .exec(ns, pod, Some(RAC_CONTAINER), add_disk_command(disk, disk_group))
        .await?;
    if out.stdout.contains(ALREADY_ADDED_MARKER) {
        info!("disk {disk} already in {disk_group}");
        return Ok(AddDiskResult::AlreadyPresent);
    }
    if !out.success {
        return Err(Error::StdError(StdError::ExecError(format!(
            "adding {disk} to {disk_group} on {pod} failed: {}",
            out.stderr.trim()
        ))));
    }
    info!("added disk {disk} to {disk_group}");
    Ok(AddDiskResult::Added)
}

/// Deregisters the node served by `pod` from the cluster.
pub async fn delete_node<C: ClusterClient>(client: &C, ns: &str, pod: &str) -> Result<()> {
    let out = client
        .exec(ns, pod, Some(RAC_CONTAINER), delete_node_command())
        .await?;
    if !out.success {
        return Err(Error::StdError(StdError::ExecError(format!(
            "removing the cluster node on {pod} failed: {}",
            out.stderr.trim()
        ))));
    }
    info!("removed cluster node of {pod}");
    Ok(())
}
