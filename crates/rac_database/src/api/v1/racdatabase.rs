use std::collections::HashSet;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::api::v1::{conditions_schema, DiskGroupType, LifecycleState};

pub static RAC_DATABASE_FINALIZER: &str = "racdatabases.database.oracle.com/finalizer";

/// Annotation holding the JSON snapshot of the last fully applied spec.
pub static LAST_APPLIED_SPEC_ANNOTATION: &str = "racdatabases.database.oracle.com/old-spec";

/// Sentinel written by other status writers for fields they could not resolve.
pub const FIELD_NOT_DEFINED: &str = "NOT_DEFINED";

pub const DEFAULT_DISK_GROUP: &str = "+DATA";

#[derive(Default, Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum TopologyKind {
    /// Multi-node clustered database
    #[default]
    Rac,
    /// Single-node Oracle Restart
    Restart,
}

/// One ASM disk group as requested by the user.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DiskGroupSpec {
    pub name: String,
    #[serde(rename = "type", default)]
    pub type_: DiskGroupType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub redundancy: String,
    #[serde(default)]
    pub disks: Vec<String>,
    /// Allow the operator to add new disks of this group to the live ASM disk group
    #[serde(default)]
    pub auto_update: bool,
}

/// Pre disk-group storage layout, kept so upgrades can be detected.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LegacyAsmStorage {
    #[serde(default)]
    pub disks_by_size: Vec<LegacyDisksBySize>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LegacyDisksBySize {
    #[serde(default)]
    pub storage_size_in_gb: u32,
    #[serde(default)]
    pub disk_names: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RacConfigParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_characterset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crs_asm_disk_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_data_file_dest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_recovery_file_dest: Option<String>,
}

/// Generate the Kubernetes wrapper struct `RacDatabase` from our Spec and Status struct
///
/// This provides a hook for generating the CRD yaml (in crdgen)
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(kind = "RacDatabase", group = "database.oracle.com", version = "v1", namespaced)]
#[kube(status = "RacDatabaseStatus", shortname = "racdb")]
#[serde(rename_all = "camelCase")]
pub struct RacDatabaseSpec {
    #[serde(default = "default_db_name")]
    pub db_name: String,
    #[serde(default)]
    pub topology: TopologyKind,
    /// Number of RAC nodes, ignored for `Restart`
    #[serde(default = "default_node_count")]
    pub node_count: u8,
    #[serde(default = "default_node_name_prefix")]
    pub node_name_prefix: String,
    #[serde(default = "default_image")]
    pub image: String,

    #[serde(default)]
    pub asm_disk_groups: Vec<DiskGroupSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legacy_asm_storage: Option<LegacyAsmStorage>,

    /// Storage class for ASM volumes. Local block volumes are used when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
    /// Worker node hostnames the local volumes are pinned to
    #[serde(default)]
    pub worker_nodes: Vec<String>,

    #[serde(default)]
    pub config_params: RacConfigParams,

    #[serde(default)]
    pub is_failed: bool,
    #[serde(default)]
    pub is_manual: bool,
}

fn default_db_name() -> String {
    "ORCLCDB".to_string()
}
fn default_node_count() -> u8 {
    2
}
fn default_node_name_prefix() -> String {
    "racnode".to_string()
}
fn default_image() -> String {
    "container-registry.oracle.com/database/rac:latest".to_string()
}

impl RacDatabaseSpec {
    /// StatefulSet names, one per node, in rollout order.
    pub fn node_names(&self) -> Vec<String> {
        let count = match self.topology {
            TopologyKind::Rac => self.node_count.max(1),
            TopologyKind::Restart => 1,
        };
        (1..=count)
            .map(|i| format!("{}{}", self.node_name_prefix, i))
            .collect()
    }

    /// Disk groups with the legacy layout folded in as a single DATA group.
    pub fn effective_disk_groups(&self) -> Vec<DiskGroupSpec> {
        let mut groups = self.asm_disk_groups.clone();
        if let Some(legacy) = &self.legacy_asm_storage {
            let disks: Vec<String> = legacy
                .disks_by_size
                .iter()
                .flat_map(|d| d.disk_names.iter().cloned())
                .collect();
            if !disks.is_empty() && groups.is_empty() {
                groups.push(DiskGroupSpec {
                    name: DEFAULT_DISK_GROUP.to_string(),
                    type_: DiskGroupType::Data,
                    disks,
                    ..Default::default()
                });
            }
        }
        groups
    }

    /// Every device referenced by the spec, first occurrence wins.
    pub fn all_disks(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.effective_disk_groups()
            .into_iter()
            .flat_map(|dg| dg.disks)
            .filter(|d| !d.is_empty() && seen.insert(d.clone()))
            .collect()
    }

    /// The group a device belongs to in this spec.
    pub fn group_of(&self, disk: &str) -> Option<DiskGroupSpec> {
        self.effective_disk_groups()
            .into_iter()
            .find(|dg| dg.disks.iter().any(|d| d == disk))
    }

    pub fn has_legacy_storage(&self) -> bool {
        self.legacy_asm_storage
            .as_ref()
            .map(|l| l.disks_by_size.iter().any(|d| !d.disk_names.is_empty()))
            .unwrap_or(false)
    }
}

/// Observed size and validity of one block device.
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub name: String,
    #[serde(default)]
    pub size_gb: u64,
    #[serde(default)]
    pub valid: bool,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DiskGroupStatus {
    pub name: String,
    #[serde(rename = "type", default)]
    pub type_: DiskGroupType,
    #[serde(default)]
    pub redundancy: String,
    #[serde(default)]
    pub auto_update: bool,
    #[serde(default)]
    pub disks: Vec<DeviceStatus>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeDetails {
    #[serde(default)]
    pub mounted_devices: Vec<String>,
    #[serde(default)]
    pub pod_state: String,
    #[serde(default)]
    pub cluster_state: String,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RacNodeStatus {
    /// Pod name
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_details: Option<NodeDetails>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigParamsStatus {
    #[serde(default)]
    pub crs_asm_disk_group: String,
    #[serde(default)]
    pub db_data_file_dest: String,
    #[serde(default)]
    pub db_recovery_file_dest: String,
    #[serde(default)]
    pub db_characterset: String,
}

/// The status object of `RacDatabase`
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RacDatabaseStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<LifecycleState>,
    #[serde(default)]
    pub db_state: String,
    #[serde(default)]
    #[schemars(schema_with = "conditions_schema")]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub asm_disk_groups: Vec<DiskGroupStatus>,
    #[serde(default)]
    pub rac_nodes: Vec<RacNodeStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_params: Option<ConfigParamsStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// Set when a removal was deferred because some device had an unknown size
    #[serde(default)]
    pub force_discovery: bool,
}

impl RacDatabase {
    pub fn state(&self) -> Option<LifecycleState> {
        self.status.as_ref().and_then(|s| s.state)
    }

    /// Spec from the last fully successful pass, if any.
    pub fn last_applied_spec(&self) -> Result<Option<RacDatabaseSpec>, serde_json::Error> {
        match self
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(LAST_APPLIED_SPEC_ANNOTATION))
        {
            Some(raw) if !raw.is_empty() => serde_json::from_str(raw).map(Some),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn data_group(disks: &[&str]) -> DiskGroupSpec {
        DiskGroupSpec {
            name: "+DATA".to_string(),
            type_: DiskGroupType::Data,
            disks: disks.iter().map(|d| d.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn node_names_follow_topology() {
        let mut spec = RacDatabaseSpec {
            node_name_prefix: "racnode".to_string(),
            node_count: 3,
            ..Default::default()
        };
        assert_eq!(spec.node_names(), vec!["racnode1", "racnode2", "racnode3"]);

        spec.topology = TopologyKind::Restart;
        assert_eq!(spec.node_names(), vec!["racnode1"]);
    }

    #[test]
    fn legacy_storage_folds_into_data_group() {
        let spec = RacDatabaseSpec {
            legacy_asm_storage: Some(LegacyAsmStorage {
                disks_by_size: vec![LegacyDisksBySize {
                    storage_size_in_gb: 50,
                    disk_names: vec!["/dev/sdb".to_string(), "/dev/sdc".to_string()],
                }],
            }),
            ..Default::default()
        };
        let groups = spec.effective_disk_groups();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].name, "+DATA");
        assert_eq!(groups[0].disks, vec!["/dev/sdb", "/dev/sdc"]);
        assert!(spec.has_legacy_storage());
    }

    #[test]
    fn all_disks_deduplicates_in_order() {
        let mut reco = data_group(&["/dev/sdc", "/dev/sdb"]);
        reco.name = "+RECO".to_string();
        reco.type_ = DiskGroupType::Recovery;
        let spec = RacDatabaseSpec {
            asm_disk_groups: vec![data_group(&["/dev/sdb"]), reco],
            ..Default::default()
        };
        assert_eq!(spec.all_disks(), vec!["/dev/sdb", "/dev/sdc"]);
        assert_eq!(spec.group_of("/dev/sdc").map(|g| g.name), Some("+RECO".to_string()));
    }

    #[test]
    fn last_applied_spec_reads_annotation() {
        let old = RacDatabaseSpec {
            asm_disk_groups: vec![data_group(&["d1", "d2"])],
            ..Default::default()
        };
        let mut annotations = BTreeMap::new();
        annotations.insert(
            LAST_APPLIED_SPEC_ANNOTATION.to_string(),
            serde_json::to_string(&old).unwrap(),
        );
        let mut db = RacDatabase::new("db", RacDatabaseSpec::default());
        assert_eq!(db.last_applied_spec().unwrap(), None);

        db.metadata.annotations = Some(annotations);
        assert_eq!(db.last_applied_spec().unwrap(), Some(old));
    }
}
