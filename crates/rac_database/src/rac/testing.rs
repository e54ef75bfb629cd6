//! Fixtures shared by the engine tests.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Pod, PodCondition, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::api::v1::racdatabase::{DiskGroupSpec, RacDatabase, RacDatabaseSpec};
use crate::api::v1::DiskGroupType;
use crate::rac::builders::{LABEL_DATABASE, LABEL_NODE, PROBE_APP};

pub const NS: &str = "rac";
pub const NAME: &str = "orcl";

pub fn pod(phase: &str, ready: bool) -> Pod {
    Pod {
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: if ready { "True" } else { "False" }.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Pod `<node>-0` of the node's StatefulSet.
pub fn node_pod(node: &str, phase: &str, ready: bool) -> Pod {
    let mut p = pod(phase, ready);
    p.metadata = ObjectMeta {
        name: Some(format!("{node}-0")),
        namespace: Some(NS.to_string()),
        labels: Some(BTreeMap::from([
            (LABEL_DATABASE.to_string(), NAME.to_string()),
            (LABEL_NODE.to_string(), node.to_string()),
        ])),
        ..Default::default()
    };
    p
}

pub fn probe_pod(name: &str) -> Pod {
    let mut p = pod("Running", true);
    p.metadata = ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(NS.to_string()),
        labels: Some(BTreeMap::from([
            ("app".to_string(), PROBE_APP.to_string()),
            (LABEL_DATABASE.to_string(), NAME.to_string()),
        ])),
        ..Default::default()
    };
    p
}

pub fn group(name: &str, type_: DiskGroupType, disks: &[&str]) -> DiskGroupSpec {
    DiskGroupSpec {
        name: name.to_string(),
        type_,
        redundancy: "EXTERNAL".to_string(),
        disks: disks.iter().map(|d| d.to_string()).collect(),
        auto_update: true,
    }
}

pub fn spec(groups: Vec<DiskGroupSpec>) -> RacDatabaseSpec {
    RacDatabaseSpec {
        db_name: "ORCLCDB".to_string(),
        node_count: 1,
        node_name_prefix: "racnode".to_string(),
        image: "rac:latest".to_string(),
        asm_disk_groups: groups,
        ..Default::default()
    }
}

pub fn database(groups: Vec<DiskGroupSpec>) -> RacDatabase {
    let mut db = RacDatabase::new(NAME, spec(groups));
    db.metadata.namespace = Some(NS.to_string());
    db.metadata.uid = Some("6f1d2c1e".to_string());
    db.metadata.generation = Some(1);
    db
}
