//! Cluster scale-in and scale-out between two applied specs.

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Service};
use kube::ResourceExt;
use tracing::{debug, info};

use crate::api::v1::racdatabase::{RacDatabase, RacDatabaseSpec};
use crate::client::ClusterClient;
use crate::rac::asm;
use crate::rac::builders::{config_map_name, node_selector};
use crate::rac::lifecycle::is_pod_ready;
use crate::util::errors::{Error, Result, StdError};

/// Nodes of the last applied spec that the current spec no longer has, highest first.
pub fn dropped_nodes(last_applied: Option<&RacDatabaseSpec>, spec: &RacDatabaseSpec) -> Vec<String> {
    let Some(old) = last_applied else {
        return Vec::new();
    };
    let current = spec.node_names();
    let mut dropped: Vec<String> = old
        .node_names()
        .into_iter()
        .filter(|n| !current.contains(n))
        .collect();
    dropped.reverse();
    dropped
}

/// Nodes the current spec adds on top of an already applied one.
pub fn added_nodes(last_applied: Option<&RacDatabaseSpec>, spec: &RacDatabaseSpec) -> Vec<String> {
    let Some(old) = last_applied else {
        return Vec::new();
    };
    let known = old.node_names();
    spec.node_names().into_iter().filter(|n| !known.contains(n)).collect()
}

/// Takes `node` out of the cluster from its own pod, then deletes its StatefulSet,
/// ConfigMap and Service.
///
/// A node whose StatefulSet is already gone was deregistered by an earlier
/// pass; only the leftovers are deleted.
pub async fn remove_node<C: ClusterClient>(client: &C, db: &RacDatabase, node: &str) -> Result<()> {
    let ns = db.namespace().unwrap_or_default();

    if client.get_opt::<StatefulSet>(&ns, node).await?.is_some() {
        let pods: Vec<Pod> = client.list(&ns, &node_selector(db, node)).await?;
        let pod = pods
            .iter()
            .filter(|p| is_pod_ready(p))
            .map(|p| p.name_any())
            .min()
            .ok_or_else(|| {
                Error::StdError(StdError::ExecError(format!(
                    "node {node} has no ready pod to leave the cluster from"
                )))
            })?;
        asm::delete_node(client, &ns, &pod).await?;
        client.delete::<StatefulSet>(&ns, node).await?;
        info!("deleted StatefulSet {ns}/{node}");
    }

    let cm = config_map_name(node, &db.spec.db_name);
    if !client.delete::<ConfigMap>(&ns, &cm).await? {
        debug!("ConfigMap {ns}/{cm} already gone");
    }
    if !client.delete::<Service>(&ns, node).await? {
        debug!("Service {ns}/{node} already gone");
    }
    info!("removed node {node} from {ns}/{}", db.name_any());
    Ok(())
}

/// Removes every node the spec dropped. Returns the removed node names.
pub async fn remove_dropped_nodes<C: ClusterClient>(
    client: &C,
    db: &RacDatabase,
    last_applied: Option<&RacDatabaseSpec>,
) -> Result<Vec<String>> {
    let dropped = dropped_nodes(last_applied, &db.spec);
    for node in &dropped {
        remove_node(client, db, node).await?;
    }
    Ok(dropped)
}
