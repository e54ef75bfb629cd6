//! Field-level merge of a locally computed status with the latest copy from the API server.
//!
//! `self` is the locally computed value and wins wherever it is set; `latest`
//! only fills gaps. The rules per field kind:
//!
//! * optional values: take `latest` only when ours is `None`; optional structs recurse
//! * strings: take `latest` when ours is empty and theirs is neither empty nor
//!   [`FIELD_NOT_DEFINED`]
//! * plain scalars: take `latest` when ours is the zero value
//! * lists: take `latest` wholesale when ours is empty, otherwise merge by
//!   position and append the extra `latest` elements

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;

use crate::api::v1::racdatabase::{
    ConfigParamsStatus, DeviceStatus, DiskGroupStatus, NodeDetails, RacDatabaseStatus, RacNodeStatus,
    FIELD_NOT_DEFINED,
};

pub trait Merge {
    fn merge_from(&mut self, latest: &Self);
}

impl Merge for String {
    fn merge_from(&mut self, latest: &Self) {
        if self.is_empty() && !latest.is_empty() && latest != FIELD_NOT_DEFINED {
            self.clone_from(latest);
        }
    }
}

pub fn merge_scalar<T: Default + PartialEq + Clone>(ours: &mut T, latest: &T) {
    if *ours == T::default() {
        *ours = latest.clone();
    }
}

pub fn merge_option<T: Clone>(ours: &mut Option<T>, latest: &Option<T>) {
    if ours.is_none() {
        ours.clone_from(latest);
    }
}

pub fn merge_option_struct<T: Merge + Clone + Default>(ours: &mut Option<T>, latest: &Option<T>) {
    if let Some(theirs) = latest {
        ours.get_or_insert_with(T::default).merge_from(theirs);
    }
}

pub fn merge_list<T: Merge + Clone>(ours: &mut Vec<T>, latest: &[T]) {
    if latest.is_empty() {
        return;
    }
    if ours.is_empty() {
        *ours = latest.to_vec();
        return;
    }
    for (idx, theirs) in latest.iter().enumerate() {
        match ours.get_mut(idx) {
            Some(mine) => mine.merge_from(theirs),
            None => ours.push(theirs.clone()),
        }
    }
}

/// Conditions are keyed by type rather than position: a condition type we
/// carry is never overwritten, missing types are copied over.
pub fn merge_conditions(ours: &mut Vec<Condition>, latest: &[Condition]) {
    for theirs in latest {
        if !ours.iter().any(|c| c.type_ == theirs.type_) {
            ours.push(theirs.clone());
        }
    }
}

impl Merge for DeviceStatus {
    fn merge_from(&mut self, latest: &Self) {
        self.name.merge_from(&latest.name);
        merge_scalar(&mut self.size_gb, &latest.size_gb);
        merge_scalar(&mut self.valid, &latest.valid);
    }
}

impl Merge for DiskGroupStatus {
    fn merge_from(&mut self, latest: &Self) {
        self.name.merge_from(&latest.name);
        // the type always has a concrete value, only an unnamed group borrows it
        if self.name == latest.name || self.name.is_empty() {
            merge_scalar(&mut self.type_, &latest.type_);
        }
        self.redundancy.merge_from(&latest.redundancy);
        merge_scalar(&mut self.auto_update, &latest.auto_update);
        merge_list(&mut self.disks, &latest.disks);
    }
}

impl Merge for NodeDetails {
    fn merge_from(&mut self, latest: &Self) {
        merge_list(&mut self.mounted_devices, &latest.mounted_devices);
        self.pod_state.merge_from(&latest.pod_state);
        self.cluster_state.merge_from(&latest.cluster_state);
    }
}

impl Merge for RacNodeStatus {
    fn merge_from(&mut self, latest: &Self) {
        self.name.merge_from(&latest.name);
        merge_option_struct(&mut self.node_details, &latest.node_details);
    }
}

impl Merge for ConfigParamsStatus {
    fn merge_from(&mut self, latest: &Self) {
        self.crs_asm_disk_group.merge_from(&latest.crs_asm_disk_group);
        self.db_data_file_dest.merge_from(&latest.db_data_file_dest);
        self.db_recovery_file_dest.merge_from(&latest.db_recovery_file_dest);
        self.db_characterset.merge_from(&latest.db_characterset);
    }
}

impl Merge for RacDatabaseStatus {
    fn merge_from(&mut self, latest: &Self) {
        merge_option(&mut self.state, &latest.state);
        self.db_state.merge_from(&latest.db_state);
        merge_conditions(&mut self.conditions, &latest.conditions);
        merge_list(&mut self.asm_disk_groups, &latest.asm_disk_groups);
        merge_list(&mut self.rac_nodes, &latest.rac_nodes);
        merge_option_struct(&mut self.config_params, &latest.config_params);
        merge_option(&mut self.observed_generation, &latest.observed_generation);
        merge_scalar(&mut self.force_discovery, &latest.force_discovery);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::v1::{DiskGroupType, LifecycleState};
    use chrono::Utc;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn condition(type_: &str) -> Condition {
        Condition {
            type_: type_.to_string(),
            status: "True".to_string(),
            reason: "Testing".to_string(),
            message: "msg".to_string(),
            last_transition_time: Time(Utc::now()),
            observed_generation: Some(1),
        }
    }

    fn full_status() -> RacDatabaseStatus {
        RacDatabaseStatus {
            state: Some(LifecycleState::Available),
            db_state: "OPEN".to_string(),
            conditions: vec![condition("ReconcileComplete")],
            asm_disk_groups: vec![DiskGroupStatus {
                name: "+DATA".to_string(),
                type_: DiskGroupType::Data,
                redundancy: "EXTERNAL".to_string(),
                auto_update: true,
                disks: vec![DeviceStatus {
                    name: "/dev/sdb".to_string(),
                    size_gb: 100,
                    valid: true,
                }],
            }],
            rac_nodes: vec![RacNodeStatus {
                name: "racnode1-0".to_string(),
                node_details: Some(NodeDetails {
                    mounted_devices: vec!["/dev/sdb".to_string()],
                    pod_state: "Ready".to_string(),
                    cluster_state: "HEALTHY".to_string(),
                }),
            }],
            config_params: Some(ConfigParamsStatus {
                crs_asm_disk_group: "+DATA".to_string(),
                db_data_file_dest: "+DATA".to_string(),
                db_recovery_file_dest: "+RECO".to_string(),
                db_characterset: "AL32UTF8".to_string(),
            }),
            observed_generation: Some(4),
            force_discovery: true,
        }
    }

    #[test]
    fn merging_with_itself_is_identity() {
        let a = full_status();
        let mut merged = a.clone();
        merged.merge_from(&a);
        assert_eq!(merged, a);
    }

    #[test]
    fn set_fields_are_never_lost() {
        let a = full_status();
        let mut b = RacDatabaseStatus {
            state: Some(LifecycleState::Failed),
            db_state: "MOUNTED".to_string(),
            observed_generation: Some(9),
            ..Default::default()
        };
        b.rac_nodes = vec![RacNodeStatus {
            name: "racnode2-0".to_string(),
            node_details: None,
        }];

        let mut merged = a.clone();
        merged.merge_from(&b);
        assert_eq!(merged.state, a.state);
        assert_eq!(merged.db_state, a.db_state);
        assert_eq!(merged.observed_generation, a.observed_generation);
        assert_eq!(merged.asm_disk_groups, a.asm_disk_groups);
        assert_eq!(merged.rac_nodes, a.rac_nodes);
        assert_eq!(merged.config_params, a.config_params);
    }

    #[test]
    fn gaps_are_filled_from_latest() {
        let latest = full_status();
        let mut ours = RacDatabaseStatus {
            state: Some(LifecycleState::Updating),
            ..Default::default()
        };
        ours.merge_from(&latest);
        assert_eq!(ours.state, Some(LifecycleState::Updating));
        assert_eq!(ours.db_state, "OPEN");
        assert_eq!(ours.asm_disk_groups, latest.asm_disk_groups);
        assert_eq!(ours.observed_generation, Some(4));
        assert_eq!(ours.conditions.len(), 1);
    }

    #[test]
    fn sentinel_strings_are_not_adopted() {
        let mut ours = String::new();
        ours.merge_from(&FIELD_NOT_DEFINED.to_string());
        assert!(ours.is_empty());
    }

    #[test]
    fn lists_merge_by_position_and_append_extras() {
        let mut ours = vec![DeviceStatus {
            name: "/dev/sdb".to_string(),
            size_gb: 0,
            valid: true,
        }];
        let latest = vec![
            DeviceStatus {
                name: "/dev/sdb".to_string(),
                size_gb: 100,
                valid: true,
            },
            DeviceStatus {
                name: "/dev/sdc".to_string(),
                size_gb: 100,
                valid: true,
            },
        ];
        merge_list(&mut ours, &latest);
        assert_eq!(ours, latest);
    }

    #[test]
    fn optional_structs_recurse() {
        let mut ours = Some(ConfigParamsStatus {
            crs_asm_disk_group: "+CRS".to_string(),
            ..Default::default()
        });
        let latest = Some(ConfigParamsStatus {
            crs_asm_disk_group: "+DATA".to_string(),
            db_characterset: "AL32UTF8".to_string(),
            ..Default::default()
        });
        merge_option_struct(&mut ours, &latest);
        let merged = ours.unwrap();
        assert_eq!(merged.crs_asm_disk_group, "+CRS");
        assert_eq!(merged.db_characterset, "AL32UTF8");
    }

    #[test]
    fn conditions_keyed_by_type() {
        let mut ours = vec![condition("ReconcileError")];
        let latest = vec![condition("ReconcileError"), condition("ReconcileQueued")];
        merge_conditions(&mut ours, &latest);
        assert_eq!(ours.len(), 2);
        assert_eq!(ours[1].type_, "ReconcileQueued");
    }
}
