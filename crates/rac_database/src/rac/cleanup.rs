//! Finalizer cleanup of everything a `RacDatabase` owns.

use std::collections::BTreeSet;

use k8s_openapi::api::apps::v1::{DaemonSet, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Service};
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::api::v1::racdatabase::RacDatabase;
use crate::client::ClusterClient;
use crate::rac::builders::{config_map_name, database_selector, pv_name, scan_service_name, PROBE_NAME};
use crate::util::config::OperatorConfig;
use crate::util::errors::{Error, Result, StdError};
use crate::util::poll::{poll_until, PollError};

fn gone(kind: &str, name: &str, deleted: bool) {
    if !deleted {
        debug!("{kind} {name} already gone");
    }
}

/// Devices of the current spec and of the last applied one.
fn known_devices(db: &RacDatabase) -> BTreeSet<String> {
    let mut devices: BTreeSet<String> = db.spec.all_disks().into_iter().collect();
    if let Ok(Some(last)) = db.last_applied_spec() {
        devices.extend(last.all_disks());
    }
    devices
}

/// Nodes of the current spec and of the last applied one, so a scale-in that
/// never finished leaves nothing behind.
fn known_nodes(db: &RacDatabase) -> BTreeSet<String> {
    let mut nodes: BTreeSet<String> = db.spec.node_names().into_iter().collect();
    if let Ok(Some(last)) = db.last_applied_spec() {
        nodes.extend(last.node_names());
    }
    nodes
}

/// First owned object that still exists, as `<kind> <name>`.
async fn remaining<C: ClusterClient>(client: &C, db: &RacDatabase) -> Result<Option<String>> {
    let ns = db.namespace().unwrap_or_default();

    for node in known_nodes(db) {
        if client.get_opt::<StatefulSet>(&ns, &node).await?.is_some() {
            return Ok(Some(format!("StatefulSet {node}")));
        }
        let cm = config_map_name(&node, &db.spec.db_name);
        if client.get_opt::<ConfigMap>(&ns, &cm).await?.is_some() {
            return Ok(Some(format!("ConfigMap {cm}")));
        }
        if client.get_opt::<Service>(&ns, &node).await?.is_some() {
            return Ok(Some(format!("Service {node}")));
        }
    }
    if client.get_opt::<DaemonSet>(&ns, PROBE_NAME).await?.is_some() {
        return Ok(Some(format!("DaemonSet {PROBE_NAME}")));
    }
    let scan = scan_service_name(db);
    if client.get_opt::<Service>(&ns, &scan).await?.is_some() {
        return Ok(Some(format!("Service {scan}")));
    }
    let claims: Vec<PersistentVolumeClaim> = client.list(&ns, &database_selector(db)).await?;
    if let Some(claim) = claims.first() {
        return Ok(Some(format!("PersistentVolumeClaim {}", claim.name_any())));
    }
    if db.spec.storage_class.is_none() {
        for device in known_devices(db) {
            let name = pv_name(&device, &db.spec.db_name);
            if client.get_pv(&name).await?.is_some() {
                return Ok(Some(format!("PersistentVolume {name}")));
            }
        }
    }
    Ok(None)
}

/// Deletes owned objects, tolerating the ones that are already gone, and
/// waits until none of them is left.
///
/// PVs are cluster-scoped and only ours when no storage class was used, so
/// they are removed by name; everything else goes by name or label. Objects
/// still present at the deadline fail the call, which keeps the finalizer.
pub async fn cleanup_owned<C: ClusterClient>(
    client: &C,
    db: &RacDatabase,
    config: &OperatorConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    let ns = db.namespace().unwrap_or_default();

    for node in known_nodes(db) {
        gone("StatefulSet", &node, client.delete::<StatefulSet>(&ns, &node).await?);
        let cm = config_map_name(&node, &db.spec.db_name);
        gone("ConfigMap", &cm, client.delete::<ConfigMap>(&ns, &cm).await?);
        gone("Service", &node, client.delete::<Service>(&ns, &node).await?);
    }
    gone("DaemonSet", PROBE_NAME, client.delete::<DaemonSet>(&ns, PROBE_NAME).await?);
    let scan = scan_service_name(db);
    gone("Service", &scan, client.delete::<Service>(&ns, &scan).await?);

    let claims: Vec<PersistentVolumeClaim> = client.list(&ns, &database_selector(db)).await?;
    for claim in claims {
        let name = claim.name_any();
        gone("PersistentVolumeClaim", &name, client.delete::<PersistentVolumeClaim>(&ns, &name).await?);
    }

    if db.spec.storage_class.is_none() {
        for device in known_devices(db) {
            let name = pv_name(&device, &db.spec.db_name);
            gone("PersistentVolume", &name, client.delete_pv(&name).await?);
        }
    }

    let res = poll_until(config.cleanup, cancel, || async move {
        Ok::<_, Error>(remaining(client, db).await?.is_none().then_some(()))
    })
    .await;
    match res {
        Ok(()) => {
            info!("cleaned up resources of {ns}/{}", db.name_any());
            Ok(())
        }
        Err(PollError::Failed(e)) => Err(e),
        Err(PollError::Cancelled) => Err(Error::StdError(StdError::Cancelled(format!(
            "waiting for cleanup of {ns}/{}",
            db.name_any()
        )))),
        Err(PollError::Timeout) => {
            let left = remaining(client, db).await?.unwrap_or_else(|| "nothing".to_string());
            Err(Error::requeue(
                StdError::Timeout(format!("{left} of {ns}/{} still present after cleanup", db.name_any())),
                config.busy_requeue,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::v1::DiskGroupType::Data;
    use crate::client::mock::MockClusterClient;
    use crate::rac::builders::{build_pv, build_pvc, pvc_name};
    use crate::rac::testing::{database, group, NS};
    use crate::rac::{config, rollout, service};
    use crate::util::errors::ErrorClass;

    async fn cleanup(mock: &MockClusterClient, db: &RacDatabase) -> Result<()> {
        cleanup_owned(mock, db, &OperatorConfig::default(), &CancellationToken::new()).await
    }

    #[tokio::test]
    async fn cleanup_removes_everything_owned() {
        let mock = MockClusterClient::new();
        let db = database(vec![group("+DATA", Data, &["d1", "d2"])]);
        for d in ["d1", "d2"] {
            mock.insert_pv(build_pv(&db, d, 100));
            mock.insert(NS, build_pvc(&db, d, 100));
        }
        rollout::ensure_statefulset(&mock, &db, "racnode1", &db.spec.all_disks())
            .await
            .unwrap();
        config::ensure_config_maps(&mock, &db, &[]).await.unwrap();
        service::ensure_services(&mock, &db).await.unwrap();

        cleanup(&mock, &db).await.unwrap();

        assert!(mock.stored::<StatefulSet>(NS, "racnode1").is_none());
        assert!(mock.stored::<ConfigMap>(NS, "racnode1ORCLCDB-cmap").is_none());
        assert!(mock.stored::<Service>(NS, "orcl-scan").is_none());
        assert!(mock.stored::<PersistentVolumeClaim>(NS, &pvc_name("d1", "ORCLCDB")).is_none());
        assert!(mock.pv_names().is_empty());
    }

    #[tokio::test]
    async fn cleanup_tolerates_missing_objects() {
        let mock = MockClusterClient::new();
        let mut db = database(vec![group("+DATA", Data, &["d1"])]);
        db.spec.storage_class = Some("fast".to_string());
        cleanup(&mock, &db).await.unwrap();
        assert_eq!(mock.count("delete", "PersistentVolume"), 0);
        assert_eq!(mock.count("delete", "DaemonSet"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn lingering_object_keeps_cleanup_pending() {
        let mock = MockClusterClient::new();
        let db = database(vec![group("+DATA", Data, &["d1"])]);
        rollout::ensure_statefulset(&mock, &db, "racnode1", &db.spec.all_disks())
            .await
            .unwrap();
        mock.insert(NS, build_pvc(&db, "d1", 100));
        mock.linger_on_delete("StatefulSet", "racnode1");

        let err = cleanup(&mock, &db).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Transient);
        assert!(matches!(&err, Error::ErrorWithRequeue(e) if e.duration == OperatorConfig::default().busy_requeue));
        assert!(err.to_string().contains("StatefulSet racnode1"));
        // everything else was still deleted
        assert!(mock.stored::<PersistentVolumeClaim>(NS, &pvc_name("d1", "ORCLCDB")).is_none());
        assert!(mock.count("get", "StatefulSet") > 1);
    }

    #[tokio::test(start_paused = true)]
    async fn lingering_volume_keeps_cleanup_pending() {
        let mock = MockClusterClient::new();
        let db = database(vec![group("+DATA", Data, &["d1"])]);
        mock.insert_pv(build_pv(&db, "d1", 100));
        mock.linger_on_delete("PersistentVolume", &pv_name("d1", "ORCLCDB"));

        let err = cleanup(&mock, &db).await.unwrap_err();
        assert!(err.to_string().contains("PersistentVolume asm-pv-"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_cleanup_stops_waiting() {
        let mock = MockClusterClient::new();
        let db = database(vec![group("+DATA", Data, &["d1"])]);
        rollout::ensure_statefulset(&mock, &db, "racnode1", &db.spec.all_disks())
            .await
            .unwrap();
        mock.linger_on_delete("StatefulSet", "racnode1");
        let token = CancellationToken::new();
        token.cancel();

        let err = cleanup_owned(&mock, &db, &OperatorConfig::default(), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StdError(StdError::Cancelled(_))));
    }

    #[tokio::test]
    async fn nodes_of_an_unfinished_scale_in_are_cleaned_up() {
        let mock = MockClusterClient::new();
        let mut db = database(vec![group("+DATA", Data, &["d1"])]);
        db.spec.node_count = 2;
        rollout::ensure_statefulset(&mock, &db, "racnode2", &db.spec.all_disks())
            .await
            .unwrap();
        let applied = serde_json::to_string(&db.spec).unwrap();
        db.spec.node_count = 1;
        db.metadata.annotations = Some(
            [(
                crate::api::v1::racdatabase::LAST_APPLIED_SPEC_ANNOTATION.to_string(),
                applied,
            )]
            .into(),
        );

        cleanup(&mock, &db).await.unwrap();
        assert!(mock.stored::<StatefulSet>(NS, "racnode2").is_none());
    }
}
