use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use kube::ResourceExt;
use tracing::{info, warn};

use crate::api::v1::racdatabase::{DeviceStatus, RacDatabase};
use crate::client::ClusterClient;
use crate::rac::builders::{build_pv, build_pvc, pv_name, pvc_name};
use crate::rac::discovery::Inventory;
use crate::util::errors::{Error, Result, StdError};

/// Spec devices that discovery found usable, in spec order.
pub fn provisionable(db: &RacDatabase, inventory: &Inventory) -> Vec<DeviceStatus> {
    db.spec
        .all_disks()
        .iter()
        .filter_map(|d| inventory.get(d))
        .filter(|d| d.valid && d.size_gb > 0)
        .cloned()
        .collect()
}

fn local_path(pv: &PersistentVolume) -> Option<&str> {
    pv.spec
        .as_ref()
        .and_then(|s| s.local.as_ref())
        .map(|l| l.path.as_str())
}

/// Create-if-absent for the PV and PVC of every usable device.
///
/// An existing PV that points at a different device is never touched; the
/// pass fails so a human can sort it out. Returns the number of objects created.
pub async fn ensure_volumes<C: ClusterClient>(client: &C, db: &RacDatabase, devices: &[DeviceStatus]) -> Result<usize> {
    let ns = db.namespace().unwrap_or_default();
    let mut created = 0;

    for device in devices.iter().filter(|d| d.valid && d.size_gb > 0) {
        if db.spec.storage_class.is_none() {
            let name = pv_name(&device.name, &db.spec.db_name);
            match client.get_pv(&name).await? {
                Some(existing) => {
                    if local_path(&existing) != Some(device.name.as_str()) {
                        return Err(Error::StdError(StdError::VolumeDrift(name)));
                    }
                }
                None => {
                    client.create_pv(&build_pv(db, &device.name, device.size_gb)).await?;
                    info!("created PV {name} for {}", device.name);
                    created += 1;
                }
            }
        }

        let claim = pvc_name(&device.name, &db.spec.db_name);
        if client.get_opt::<PersistentVolumeClaim>(&ns, &claim).await?.is_none() {
            client.create(&ns, &build_pvc(db, &device.name, device.size_gb)).await?;
            info!("created PVC {ns}/{claim} for {}", device.name);
            created += 1;
        }
    }
    Ok(created)
}

/// Deletes the claim and, for local volumes, the PV backing each device.
pub async fn delete_volumes<C: ClusterClient>(client: &C, db: &RacDatabase, devices: &[String]) -> Result<()> {
    let ns = db.namespace().unwrap_or_default();
    for device in devices {
        let claim = pvc_name(device, &db.spec.db_name);
        if !client.delete::<PersistentVolumeClaim>(&ns, &claim).await? {
            warn!("PVC {ns}/{claim} was already gone");
        }
        if db.spec.storage_class.is_none() {
            let name = pv_name(device, &db.spec.db_name);
            if !client.delete_pv(&name).await? {
                warn!("PV {name} was already gone");
            }
        }
        info!("released volume for {device}");
    }
    Ok(())
}
