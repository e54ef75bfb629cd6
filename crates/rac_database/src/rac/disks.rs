//! Disk-change detection.
//!
//! The baseline is always the last fully applied spec, never the live status:
//! a pass that fails halfway leaves the baseline alone so the same change is
//! reconsidered next time.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::{info, warn};

use crate::api::v1::racdatabase::{DiskGroupSpec, DiskGroupStatus, RacDatabaseSpec, RacDatabaseStatus};
use crate::api::v1::DiskGroupType;
use crate::client::ClusterClient;
use crate::rac::asm;
use crate::util::errors::{Error, Result, StdError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskChanges {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// No last applied spec: everything goes through full discovery
    pub new_setup: bool,
}

impl DiskChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

type GroupKey = (String, DiskGroupType);

fn by_key(groups: &[DiskGroupSpec]) -> BTreeMap<GroupKey, Vec<String>> {
    let mut map: BTreeMap<GroupKey, Vec<String>> = BTreeMap::new();
    for g in groups {
        map.entry((g.name.clone(), g.type_))
            .or_default()
            .extend(g.disks.iter().filter(|d| !d.is_empty()).cloned());
    }
    map
}

fn push_unique(out: &mut Vec<String>, seen: &mut HashSet<String>, disk: &str) {
    if seen.insert(disk.to_string()) {
        out.push(disk.to_string());
    }
}

/// Per-group symmetric difference keyed by `(name, type)`, flattened and deduplicated.
pub fn diff_disk_groups(old: &[DiskGroupSpec], new: &[DiskGroupSpec]) -> (Vec<String>, Vec<String>) {
    let old = by_key(old);
    let new = by_key(new);
    let empty = Vec::new();

    let (mut added, mut removed) = (Vec::new(), Vec::new());
    let (mut seen_added, mut seen_removed) = (HashSet::new(), HashSet::new());

    let keys: HashSet<&GroupKey> = old.keys().chain(new.keys()).collect();
    let mut keys: Vec<&GroupKey> = keys.into_iter().collect();
    keys.sort();

    for key in keys {
        let before = old.get(key).unwrap_or(&empty);
        let after = new.get(key).unwrap_or(&empty);
        for d in after.iter().filter(|d| !before.contains(d)) {
            push_unique(&mut added, &mut seen_added, d);
        }
        for d in before.iter().filter(|d| !after.contains(d)) {
            push_unique(&mut removed, &mut seen_removed, d);
        }
    }
    (added, removed)
}

/// Drops every removal candidate that is still listed in any group of `new`.
pub fn filter_globally_safe(removed: Vec<String>, new: &[DiskGroupSpec]) -> Vec<String> {
    let in_spec: HashSet<&String> = new.iter().flat_map(|g| g.disks.iter()).collect();
    removed
        .into_iter()
        .filter(|d| {
            let keep = !in_spec.contains(d);
            if !keep {
                info!("disk {d} moved between disk groups, not treating it as removed");
            }
            keep
        })
        .collect()
}

/// A device may appear only once across all groups of a spec.
pub fn check_duplicates(groups: &[DiskGroupSpec]) -> Result<()> {
    let mut seen = HashSet::new();
    for d in groups.iter().flat_map(|g| g.disks.iter()).filter(|d| !d.is_empty()) {
        if !seen.insert(d) {
            return Err(Error::StdError(StdError::DiskValidation(format!(
                "disk '{d}' is defined more than once in the new spec"
            ))));
        }
    }
    Ok(())
}

/// Rejects additions already claimed by another reserved ASM device list.
pub fn validate_additions(added: &[String], new: &[DiskGroupSpec], status_groups: &[DiskGroupStatus]) -> Result<()> {
    let target: HashMap<&String, &DiskGroupSpec> =
        new.iter().flat_map(|g| g.disks.iter().map(move |d| (d, g))).collect();

    for disk in added {
        for existing in status_groups.iter().filter(|g| g.type_ != DiskGroupType::Others) {
            if !existing.disks.iter().any(|d| &d.name == disk) {
                continue;
            }
            let same_group = target
                .get(disk)
                .map(|g| g.name == existing.name && g.type_ == existing.type_)
                .unwrap_or(false);
            if !same_group {
                return Err(Error::StdError(StdError::DiskValidation(format!(
                    "disk '{disk}' is already part of {} ASM device list",
                    existing.type_
                ))));
            }
        }
    }
    Ok(())
}

/// Pure part of the detector: diff, global safety, duplicate and reserved
/// list checks, mutual exclusion.
pub fn compute_disk_changes(
    last_applied: Option<&RacDatabaseSpec>,
    spec: &RacDatabaseSpec,
    status_groups: &[DiskGroupStatus],
) -> Result<DiskChanges> {
    let new = spec.effective_disk_groups();
    check_duplicates(&new)?;

    let Some(old) = last_applied else {
        return Ok(DiskChanges {
            new_setup: true,
            ..Default::default()
        });
    };

    let (added, removed) = diff_disk_groups(&old.effective_disk_groups(), &new);
    let removed = filter_globally_safe(removed, &new);
    validate_additions(&added, &new, status_groups)?;

    if !added.is_empty() && !removed.is_empty() {
        return Err(Error::StdError(StdError::DiskChangeConflict { added, removed }));
    }
    Ok(DiskChanges {
        added,
        removed,
        new_setup: false,
    })
}

/// Fails if ASM still counts any removal candidate as a member of its old group.
pub async fn corroborate_removals<C: ClusterClient>(
    client: &C,
    ns: &str,
    pod: &str,
    removed: &[String],
    last_applied: &RacDatabaseSpec,
) -> Result<()> {
    let mut by_group: BTreeMap<String, Vec<&String>> = BTreeMap::new();
    for disk in removed {
        match last_applied.group_of(disk) {
            Some(g) if g.type_ != DiskGroupType::Others => by_group.entry(g.name).or_default().push(disk),
            Some(_) => {}
            None => warn!("removed disk {disk} has no group in the last applied spec"),
        }
    }

    for (group, disks) in by_group {
        let members = asm::group_members(client, ns, pod, &group).await?;
        if let Some(disk) = disks.into_iter().find(|d| members.contains(d)) {
            return Err(Error::StdError(StdError::DiskInUse {
                disk: disk.clone(),
                disk_group: group,
            }));
        }
    }
    Ok(())
}

/// Known devices whose size or validity cannot be trusted.
pub fn stale_devices(status_groups: &[DiskGroupStatus]) -> Vec<String> {
    status_groups
        .iter()
        .flat_map(|g| g.disks.iter())
        .filter(|d| d.size_gb == 0 || !d.valid)
        .map(|d| d.name.clone())
        .collect()
}

/// Moving from the legacy size-bucketed layout to explicit groups.
pub fn is_upgrade(last_applied: Option<&RacDatabaseSpec>, spec: &RacDatabaseSpec) -> bool {
    last_applied
        .map(|old| old.has_legacy_storage() && old.asm_disk_groups.is_empty() && !spec.asm_disk_groups.is_empty())
        .unwrap_or(false)
}

pub fn should_run_discovery(
    changes: &DiskChanges,
    status: &RacDatabaseStatus,
    last_applied: Option<&RacDatabaseSpec>,
    spec: &RacDatabaseSpec,
) -> bool {
    changes.new_setup
        || is_upgrade(last_applied, spec)
        || status.force_discovery
        || status.asm_disk_groups.is_empty()
        || !stale_devices(&status.asm_disk_groups).is_empty()
        || !changes.added.is_empty()
}
