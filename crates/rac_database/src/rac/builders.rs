//! Pure builders for every object a `RacDatabase` owns.
//!
//! Nothing in here talks to the API server; the engine decides when an object
//! is created, replaced or left alone.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec, StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Affinity, ConfigMap, ConfigMapEnvSource, Container, EnvFromSource, EnvVar, ExecAction, HostPathVolumeSource,
    LocalVolumeSource, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm,
    PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource,
    PersistentVolumeSpec, PodSpec, PodTemplateSpec, Probe, SecurityContext, Service, ServicePort,
    ServiceSpec, Volume, VolumeDevice, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::{Resource, ResourceExt};
use sha2::{Digest, Sha256};

use crate::api::v1::racdatabase::{RacDatabase, RacDatabaseSpec};

pub const LABEL_DATABASE: &str = "database.oracle.com/racdatabase";
pub const LABEL_NODE: &str = "database.oracle.com/rac-node";
pub const LABEL_ASM_DISK: &str = "database.oracle.com/asm-disk";

pub const RAC_CONTAINER: &str = "rac-node";
pub const PROBE_NAME: &str = "disk-check-daemonset";
pub const PROBE_APP: &str = "disk-check";
pub const PROBE_CONTAINER: &str = "disk-check";
pub const ENVFILE_KEY: &str = "envfile";
pub const SCAN_PORT: i32 = 1521;

const MAX_NAME_LEN: usize = 63;

/// Lowercase RFC 1123 label: anything else becomes `-`.
fn sanitize(raw: &str) -> String {
    let cleaned: String = raw
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    cleaned.trim_matches('-').to_string()
}

fn truncate_name(name: String) -> String {
    if name.len() <= MAX_NAME_LEN {
        return name;
    }
    name[..MAX_NAME_LEN].trim_end_matches('-').to_string()
}

/// First 8 hex chars of the SHA-256 of the device path.
pub fn device_hash(device: &str) -> String {
    let digest = Sha256::digest(device.as_bytes());
    hex::encode(digest)[..8].to_string()
}

pub fn pv_name(device: &str, db_name: &str) -> String {
    truncate_name(format!("asm-pv-{}-{}", device_hash(device), sanitize(db_name)))
}

pub fn pvc_name(device: &str, db_name: &str) -> String {
    truncate_name(format!("asm-pvc-{}-{}", device_hash(device), sanitize(db_name)))
}

pub fn config_map_name(node: &str, db_name: &str) -> String {
    format!("{node}{db_name}-cmap")
}

pub fn scan_service_name(db: &RacDatabase) -> String {
    format!("{}-scan", db.name_any())
}

/// Pods of a StatefulSet with `replicas` members, in ordinal order.
pub fn pod_names(node: &str, replicas: i32) -> Vec<String> {
    (0..replicas.max(1)).map(|i| format!("{node}-{i}")).collect()
}

pub fn database_selector(db: &RacDatabase) -> String {
    format!("{LABEL_DATABASE}={}", db.name_any())
}

pub fn node_selector(db: &RacDatabase, node: &str) -> String {
    format!("{LABEL_DATABASE}={},{LABEL_NODE}={node}", db.name_any())
}

pub fn probe_selector(db: &RacDatabase) -> String {
    format!("app={PROBE_APP},{LABEL_DATABASE}={}", db.name_any())
}

fn database_labels(db: &RacDatabase) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), "racdatabase".to_string()),
        ("app.kubernetes.io/managed-by".to_string(), "rac-operator".to_string()),
        (LABEL_DATABASE.to_string(), db.name_any()),
    ])
}

fn node_labels(db: &RacDatabase, node: &str) -> BTreeMap<String, String> {
    let mut labels = database_labels(db);
    labels.insert(LABEL_NODE.to_string(), node.to_string());
    labels
}

fn owned_meta(db: &RacDatabase, name: &str, labels: BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: db.namespace(),
        labels: Some(labels),
        owner_references: db.controller_owner_ref(&()).map(|owner| vec![owner]),
        ..Default::default()
    }
}

/// Pins pods or local volumes to the configured worker nodes.
fn worker_node_affinity(spec: &RacDatabaseSpec) -> Option<NodeSelector> {
    if spec.worker_nodes.is_empty() {
        return None;
    }
    Some(NodeSelector {
        node_selector_terms: vec![NodeSelectorTerm {
            match_expressions: Some(vec![NodeSelectorRequirement {
                key: "kubernetes.io/hostname".to_string(),
                operator: "In".to_string(),
                values: Some(spec.worker_nodes.clone()),
            }]),
            ..Default::default()
        }],
    })
}

fn gib(size_gb: u64) -> Quantity {
    Quantity(format!("{size_gb}Gi"))
}

/// Block devices attached to the primary container, in spec order.
pub fn volume_devices(db_name: &str, devices: &[String]) -> Vec<VolumeDevice> {
    devices
        .iter()
        .map(|d| VolumeDevice {
            name: pvc_name(d, db_name),
            device_path: d.clone(),
        })
        .collect()
}

/// The per-node StatefulSet. `devices` is the deduplicated list of block
/// devices to attach; each one must already have its claim.
pub fn build_statefulset(db: &RacDatabase, node: &str, devices: &[String]) -> StatefulSet {
    let labels = node_labels(db, node);
    let db_name = &db.spec.db_name;

    let volumes: Vec<Volume> = devices
        .iter()
        .map(|d| Volume {
            name: pvc_name(d, db_name),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: pvc_name(d, db_name),
                read_only: None,
            }),
            ..Default::default()
        })
        .collect();

    let container = Container {
        name: RAC_CONTAINER.to_string(),
        image: Some(db.spec.image.clone()),
        env: Some(vec![EnvVar {
            name: "DB_NAME".to_string(),
            value: Some(db_name.clone()),
            ..Default::default()
        }]),
        env_from: Some(vec![EnvFromSource {
            config_map_ref: Some(ConfigMapEnvSource {
                name: config_map_name(node, db_name),
                optional: Some(false),
            }),
            ..Default::default()
        }]),
        volume_devices: Some(volume_devices(db_name, devices)),
        security_context: Some(SecurityContext {
            privileged: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    };

    StatefulSet {
        metadata: owned_meta(db, node, labels.clone()),
        spec: Some(StatefulSetSpec {
            replicas: Some(1),
            service_name: Some(node.to_string()),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    hostname: Some(node.to_string()),
                    containers: vec![container],
                    volumes: Some(volumes),
                    affinity: worker_node_affinity(&db.spec).map(|selector| Affinity {
                        node_affinity: Some(NodeAffinity {
                            required_during_scheduling_ignored_during_execution: Some(selector),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Probe script: one JSON record per device, then a marker line and a
/// non-zero exit if any device is not a block device.
fn probe_script(devices: &[String]) -> String {
    let list = devices
        .iter()
        .map(|d| format!("\"{d}\""))
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        r#"invalid=0
for d in {list}; do
  if [ -b "$d" ]; then
    size=$(( $(blockdev --getsize64 "$d") / 1073741824 ))
    echo "{{\"disk\":\"$d\",\"valid\":true,\"sizeGb\":$size}}"
  else
    echo "{{\"disk\":\"$d\",\"valid\":false,\"sizeGb\":0}}"
    echo "$d is not a valid block device"
    invalid=1
  fi
done
[ "$invalid" -eq 0 ] || exit 1
touch /tmp/probe-done
sleep infinity
"#
    )
}

pub fn build_probe_daemonset(db: &RacDatabase, devices: &[String]) -> DaemonSet {
    let mut labels = database_labels(db);
    labels.insert("app".to_string(), PROBE_APP.to_string());

    let volumes: Vec<Volume> = devices
        .iter()
        .map(|d| Volume {
            name: format!("disk-{}", device_hash(d)),
            host_path: Some(HostPathVolumeSource {
                path: d.clone(),
                type_: None,
            }),
            ..Default::default()
        })
        .collect();
    let mounts: Vec<VolumeMount> = devices
        .iter()
        .map(|d| VolumeMount {
            name: format!("disk-{}", device_hash(d)),
            mount_path: d.clone(),
            ..Default::default()
        })
        .collect();

    let container = Container {
        name: PROBE_CONTAINER.to_string(),
        image: Some(db.spec.image.clone()),
        command: Some(vec!["/bin/bash".to_string(), "-c".to_string(), probe_script(devices)]),
        volume_mounts: Some(mounts),
        readiness_probe: Some(Probe {
            exec: Some(ExecAction {
                command: Some(vec!["test".to_string(), "-f".to_string(), "/tmp/probe-done".to_string()]),
            }),
            period_seconds: Some(2),
            ..Default::default()
        }),
        security_context: Some(SecurityContext {
            privileged: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    };

    DaemonSet {
        metadata: owned_meta(db, PROBE_NAME, labels.clone()),
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(volumes),
                    affinity: worker_node_affinity(&db.spec).map(|selector| Affinity {
                        node_affinity: Some(NodeAffinity {
                            required_during_scheduling_ignored_during_execution: Some(selector),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Local block PV for one device. Cluster-scoped, so it carries labels
/// instead of an owner reference.
pub fn build_pv(db: &RacDatabase, device: &str, size_gb: u64) -> PersistentVolume {
    let mut labels = database_labels(db);
    labels.insert(LABEL_ASM_DISK.to_string(), device_hash(device));

    PersistentVolume {
        metadata: ObjectMeta {
            name: Some(pv_name(device, &db.spec.db_name)),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            capacity: Some(BTreeMap::from([("storage".to_string(), gib(size_gb))])),
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            volume_mode: Some("Block".to_string()),
            persistent_volume_reclaim_policy: Some("Retain".to_string()),
            storage_class_name: Some(String::new()),
            local: Some(LocalVolumeSource {
                path: device.to_string(),
                fs_type: None,
            }),
            node_affinity: worker_node_affinity(&db.spec).map(|selector| {
                k8s_openapi::api::core::v1::VolumeNodeAffinity {
                    required: Some(selector),
                }
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn build_pvc(db: &RacDatabase, device: &str, size_gb: u64) -> PersistentVolumeClaim {
    let mut labels = database_labels(db);
    labels.insert(LABEL_ASM_DISK.to_string(), device_hash(device));

    let (storage_class_name, volume_name) = match &db.spec.storage_class {
        Some(sc) => (Some(sc.clone()), None),
        None => (Some(String::new()), Some(pv_name(device, &db.spec.db_name))),
    };

    PersistentVolumeClaim {
        metadata: owned_meta(db, &pvc_name(device, &db.spec.db_name), labels),
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            volume_mode: Some("Block".to_string()),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([("storage".to_string(), gib(size_gb))])),
                ..Default::default()
            }),
            storage_class_name,
            volume_name,
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn build_config_map(db: &RacDatabase, node: &str, envfile: &str) -> ConfigMap {
    ConfigMap {
        metadata: owned_meta(
            db,
            &config_map_name(node, &db.spec.db_name),
            node_labels(db, node),
        ),
        data: Some(BTreeMap::from([(ENVFILE_KEY.to_string(), envfile.to_string())])),
        ..Default::default()
    }
}

/// Headless service giving each node a stable DNS name.
pub fn build_node_service(db: &RacDatabase, node: &str) -> Service {
    let labels = node_labels(db, node);
    Service {
        metadata: owned_meta(db, node, labels.clone()),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            publish_not_ready_addresses: Some(true),
            selector: Some(labels),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn build_scan_service(db: &RacDatabase) -> Service {
    let labels = database_labels(db);
    Service {
        metadata: owned_meta(db, &scan_service_name(db), labels.clone()),
        spec: Some(ServiceSpec {
            selector: Some(labels),
            ports: Some(vec![ServicePort {
                name: Some("listener".to_string()),
                port: SCAN_PORT,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_json_diff::assert_json_include;
    use serde_json::json;

    fn db() -> RacDatabase {
        let mut db = RacDatabase::new(
            "orcl",
            RacDatabaseSpec {
                db_name: "ORCLCDB".to_string(),
                node_name_prefix: "racnode".to_string(),
                node_count: 2,
                image: "rac:latest".to_string(),
                worker_nodes: vec!["worker-1".to_string()],
                ..Default::default()
            },
        );
        db.metadata.namespace = Some("rac".to_string());
        db.metadata.uid = Some("1234".to_string());
        db
    }

    #[test]
    fn volume_names_are_stable_and_valid() {
        let a = pv_name("/dev/sdb", "ORCLCDB");
        assert_eq!(a, pv_name("/dev/sdb", "ORCLCDB"));
        assert_ne!(a, pv_name("/dev/sdc", "ORCLCDB"));
        assert!(a.starts_with("asm-pv-"));
        assert!(a.ends_with("-orclcdb"));
        assert!(pvc_name("/dev/sdb", "ORCLCDB").starts_with("asm-pvc-"));

        let long = pv_name("/dev/sdb", &"X".repeat(100));
        assert!(long.len() <= 63);
        assert!(!long.ends_with('-'));
    }

    #[test]
    fn statefulset_attaches_claims_for_each_device() {
        let devices = vec!["/dev/sdb".to_string(), "/dev/sdc".to_string()];
        let sts = build_statefulset(&db(), "racnode1", &devices);
        let pod = sts.spec.unwrap().template.spec.unwrap();
        let container = &pod.containers[0];
        assert_eq!(container.name, RAC_CONTAINER);
        let attached = container.volume_devices.clone().unwrap();
        assert_eq!(attached.len(), 2);
        assert_eq!(attached[0].device_path, "/dev/sdb");
        assert_eq!(attached[0].name, pvc_name("/dev/sdb", "ORCLCDB"));
        assert_eq!(pod.volumes.unwrap().len(), 2);
        assert_eq!(
            container.env_from.as_ref().unwrap()[0].config_map_ref.as_ref().unwrap().name,
            "racnode1ORCLCDB-cmap"
        );
        assert_eq!(sts.metadata.owner_references.unwrap()[0].name, "orcl");
    }

    #[test]
    fn probe_mounts_every_device_and_is_selectable() {
        let devices = vec!["/dev/sdb".to_string()];
        let ds = build_probe_daemonset(&db(), &devices);
        assert_eq!(ds.metadata.name.as_deref(), Some(PROBE_NAME));
        let labels = ds.metadata.labels.clone().unwrap();
        assert_eq!(labels.get("app").map(String::as_str), Some(PROBE_APP));
        let pod = ds.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.containers[0].name, PROBE_CONTAINER);
        assert_eq!(pod.volumes.unwrap()[0].host_path.as_ref().unwrap().path, "/dev/sdb");
        let script = &pod.containers[0].command.as_ref().unwrap()[2];
        assert!(script.contains(r#"{\"disk\":\"$d\",\"valid\":true,\"sizeGb\":$size}"#));
        assert!(script.contains("not a valid block device"));
    }

    #[test]
    fn claim_binds_to_local_pv_without_storage_class() {
        let mut db = db();
        let pvc = build_pvc(&db, "/dev/sdb", 100);
        let spec = pvc.spec.unwrap();
        assert_eq!(spec.volume_name, Some(pv_name("/dev/sdb", "ORCLCDB")));
        assert_eq!(spec.volume_mode.as_deref(), Some("Block"));

        db.spec.storage_class = Some("fast".to_string());
        let spec = build_pvc(&db, "/dev/sdb", 100).spec.unwrap();
        assert_eq!(spec.volume_name, None);
        assert_eq!(spec.storage_class_name.as_deref(), Some("fast"));

        let pv = build_pv(&db, "/dev/sdb", 100).spec.unwrap();
        assert_eq!(pv.local.unwrap().path, "/dev/sdb");
        assert_eq!(pv.capacity.unwrap()["storage"], Quantity("100Gi".to_string()));
    }

    #[test]
    fn services_expose_nodes_and_scan_listener() {
        let db = db();
        let node = serde_json::to_value(build_node_service(&db, "racnode2")).unwrap();
        assert_json_include!(
            actual: node,
            expected: json!({
                "metadata": {"name": "racnode2", "namespace": "rac"},
                "spec": {
                    "clusterIP": "None",
                    "publishNotReadyAddresses": true,
                    "selector": {LABEL_NODE: "racnode2", LABEL_DATABASE: "orcl"}
                }
            })
        );

        let scan = serde_json::to_value(build_scan_service(&db)).unwrap();
        assert_json_include!(
            actual: scan,
            expected: json!({
                "metadata": {"name": "orcl-scan"},
                "spec": {"ports": [{"name": "listener", "port": 1521}]}
            })
        );
    }
}
