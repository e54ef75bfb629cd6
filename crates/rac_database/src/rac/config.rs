//! Environment file consumed by the database startup scripts.

use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;
use tracing::info;

use crate::api::v1::racdatabase::{ConfigParamsStatus, DiskGroupStatus, RacDatabase, DEFAULT_DISK_GROUP};
use crate::api::v1::DiskGroupType;
use crate::client::ClusterClient;
use crate::rac::builders::{build_config_map, config_map_name, ENVFILE_KEY};
use crate::util::errors::Result;

const DEFAULT_CHARACTERSET: &str = "AL32UTF8";
const DEFAULT_OP_TYPE: &str = "setuprac";

fn plus(name: &str) -> String {
    if name.starts_with('+') {
        name.to_string()
    } else {
        format!("+{name}")
    }
}

fn non_empty(v: &Option<String>) -> Option<&str> {
    v.as_deref().filter(|s| !s.is_empty())
}

/// Comma-joined valid devices of every status group of `type_`.
fn device_list(status_groups: &[DiskGroupStatus], type_: DiskGroupType) -> String {
    status_groups
        .iter()
        .filter(|g| g.type_ == type_)
        .flat_map(|g| g.disks.iter())
        .filter(|d| d.valid)
        .map(|d| d.name.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

struct GroupInfo {
    name: Option<String>,
    redundancy: Option<String>,
}

fn group_info(db: &RacDatabase, type_: DiskGroupType) -> GroupInfo {
    let groups = db.spec.effective_disk_groups();
    let group = groups.iter().find(|g| g.type_ == type_);
    GroupInfo {
        name: group.map(|g| g.name.as_str()).filter(|n| !n.is_empty()).map(plus),
        redundancy: group.map(|g| g.redundancy.clone()).filter(|r| !r.is_empty()),
    }
}

/// Disk group destinations after applying explicit config params.
pub fn resolved_params(db: &RacDatabase) -> ConfigParamsStatus {
    let params = &db.spec.config_params;
    let crs = non_empty(&params.crs_asm_disk_group)
        .map(plus)
        .or(group_info(db, DiskGroupType::Crs).name)
        .unwrap_or_else(|| DEFAULT_DISK_GROUP.to_string());
    let data = non_empty(&params.db_data_file_dest)
        .map(plus)
        .or(group_info(db, DiskGroupType::Data).name)
        .unwrap_or_else(|| crs.clone());
    let reco = non_empty(&params.db_recovery_file_dest)
        .map(plus)
        .or(group_info(db, DiskGroupType::Recovery).name)
        .unwrap_or_else(|| crs.clone());
    ConfigParamsStatus {
        crs_asm_disk_group: crs,
        db_data_file_dest: data,
        db_recovery_file_dest: reco,
        db_characterset: non_empty(&params.db_characterset)
            .unwrap_or(DEFAULT_CHARACTERSET)
            .to_string(),
    }
}

/// CRLF-joined `KEY=VALUE` lines. Keys with nothing to say are left out.
pub fn build_envfile(db: &RacDatabase, status_groups: &[DiskGroupStatus]) -> String {
    let params = resolved_params(db);
    let crs = group_info(db, DiskGroupType::Crs);
    let data = group_info(db, DiskGroupType::Data);
    let reco = group_info(db, DiskGroupType::Recovery);
    let redo = group_info(db, DiskGroupType::Redo);

    let mut lines = vec![
        format!("DB_NAME={}", db.spec.db_name),
        format!("CRS_ASM_DISKGROUP={}", params.crs_asm_disk_group),
    ];
    let mut push = |key: &str, value: String| {
        if !value.is_empty() {
            lines.push(format!("{key}={value}"));
        }
    };

    push("CRS_ASM_DEVICE_LIST", device_list(status_groups, DiskGroupType::Crs));
    push("CRS_ASMDG_REDUNDANCY", crs.redundancy.unwrap_or_default());

    push("DB_DATA_FILE_DEST", params.db_data_file_dest);
    push("DB_ASM_DEVICE_LIST", device_list(status_groups, DiskGroupType::Data));
    push(
        "DB_ASMDG_PROPERTIES",
        data.redundancy.map(|r| format!("redundancy:{r}")).unwrap_or_default(),
    );

    push("DB_RECOVERY_FILE_DEST", params.db_recovery_file_dest);
    push("RECO_ASM_DEVICE_LIST", device_list(status_groups, DiskGroupType::Recovery));
    push(
        "RECO_ASMDG_PROPERTIES",
        reco.redundancy.map(|r| format!("redundancy:{r}")).unwrap_or_default(),
    );

    push("LOG_FILE_DEST", redo.name.unwrap_or_default());
    push("REDO_ASM_DEVICE_LIST", device_list(status_groups, DiskGroupType::Redo));
    push(
        "REDO_ASMDG_PROPERTIES",
        redo.redundancy.map(|r| format!("redundancy:{r}")).unwrap_or_default(),
    );

    push("DB_CHARACTERSET", params.db_characterset);
    push(
        "OP_TYPE",
        non_empty(&db.spec.config_params.op_type)
            .unwrap_or(DEFAULT_OP_TYPE)
            .to_string(),
    );

    lines.join("\r\n")
}

fn envfile_of(cm: &ConfigMap) -> Option<&str> {
    cm.data.as_ref().and_then(|d| d.get(ENVFILE_KEY)).map(String::as_str)
}

/// Creates each node's ConfigMap, or replaces it when the envfile changed.
/// Returns the number of ConfigMaps written.
pub async fn ensure_config_maps<C: ClusterClient>(
    client: &C,
    db: &RacDatabase,
    status_groups: &[DiskGroupStatus],
) -> Result<usize> {
    let ns = db.namespace().unwrap_or_default();
    let envfile = build_envfile(db, status_groups);
    let mut written = 0;

    for node in db.spec.node_names() {
        let name = config_map_name(&node, &db.spec.db_name);
        let mut desired = build_config_map(db, &node, &envfile);
        match client.get_opt::<ConfigMap>(&ns, &name).await? {
            None => {
                client.create(&ns, &desired).await?;
                info!("created ConfigMap {ns}/{name}");
                written += 1;
            }
            Some(existing) if envfile_of(&existing) != Some(envfile.as_str()) => {
                desired.metadata.resource_version = existing.metadata.resource_version.clone();
                client.replace(&ns, &name, &desired).await?;
                info!("updated envfile in ConfigMap {ns}/{name}");
                written += 1;
            }
            Some(_) => {}
        }
    }
    Ok(written)
}
