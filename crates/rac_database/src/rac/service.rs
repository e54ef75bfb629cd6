use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use tracing::info;

use crate::api::v1::racdatabase::RacDatabase;
use crate::client::ClusterClient;
use crate::rac::builders::{build_node_service, build_scan_service};
use crate::util::errors::Result;

/// Creates the per-node headless services and the SCAN service if absent.
pub async fn ensure_services<C: ClusterClient>(client: &C, db: &RacDatabase) -> Result<usize> {
    let ns = db.namespace().unwrap_or_default();
    let mut desired: Vec<Service> = db
        .spec
        .node_names()
        .iter()
        .map(|node| build_node_service(db, node))
        .collect();
    desired.push(build_scan_service(db));

    let mut created = 0;
    for svc in desired {
        let name = svc.name_any();
        if client.get_opt::<Service>(&ns, &name).await?.is_none() {
            client.create(&ns, &svc).await?;
            info!("created Service {ns}/{name}");
            created += 1;
        }
    }
    Ok(created)
}
