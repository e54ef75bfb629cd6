//! One reconcile pass over a `RacDatabase`.
//!
//! Order matters: pods are observed first, then the lifecycle gate decides
//! whether anything may be mutated. Discovery strictly precedes provisioning,
//! provisioning precedes rollout, and disks are only added or released after
//! the rollout wait succeeded.

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api::v1::racdatabase::{
    DeviceStatus, DiskGroupStatus, NodeDetails, RacDatabase, RacDatabaseSpec, RacDatabaseStatus, RacNodeStatus,
};
use crate::api::v1::LifecycleState;
use crate::client::ClusterClient;
use crate::rac::asm;
use crate::rac::builders::node_selector;
use crate::rac::config::{ensure_config_maps, resolved_params};
use crate::rac::discovery::{run_discovery, Inventory};
use crate::rac::disks::{compute_disk_changes, corroborate_removals, should_run_discovery, stale_devices};
use crate::rac::lifecycle::{
    flag_state, gate, is_pod_pending, is_pod_ready, needs_recovery, pods_state, refresh_transition, Gate,
    PodsState,
};
use crate::rac::nodes::{added_nodes, remove_dropped_nodes};
use crate::rac::rollout::{
    add_disks, attached_devices, desired_devices, ensure_statefulset, remove_disk_volumes, wait_for_rollout,
    RolloutAction,
};
use crate::rac::service::ensure_services;
use crate::rac::volumes::{ensure_volumes, provisionable};
use crate::util::config::OperatorConfig;
use crate::util::errors::{Error, ErrorClass, Result, StdError};
use crate::util::metrics::Metrics;
use crate::util::poll::sleep_or_cancel;
use crate::util::rac_status::{ReconcileOutcome, StatusManager};

const CLUSTER_HEALTHY: &str = "HEALTHY";
const CLUSTER_PENDING: &str = "PENDING";

/// Human readable cause, without the error layering prefix.
fn cause(e: &Error) -> String {
    match e {
        Error::StdError(e) => e.to_string(),
        Error::ErrorWithRequeue(e) => e.error.to_string(),
    }
}

fn is_cancelled(e: &Error) -> bool {
    match e {
        Error::StdError(e) => matches!(e, StdError::Cancelled(_)),
        Error::ErrorWithRequeue(e) => matches!(e.error, StdError::Cancelled(_)),
    }
}

fn pod_state(pod: &Pod) -> String {
    if is_pod_ready(pod) {
        "Ready".to_string()
    } else if is_pod_pending(pod) {
        "Pending".to_string()
    } else {
        pod.status
            .as_ref()
            .and_then(|s| s.phase.clone())
            .unwrap_or_else(|| "Unknown".to_string())
    }
}

pub struct RacReconciler<'a, C: ClusterClient> {
    client: &'a C,
    config: &'a OperatorConfig,
    metrics: &'a Metrics,
    cancel: &'a CancellationToken,
    status: StatusManager<'a, C>,
    db: RacDatabase,
    ns: String,
    /// Status computed during the pass; merged into the latest copy when written
    local: RacDatabaseStatus,
}

impl<'a, C: ClusterClient> RacReconciler<'a, C> {
    pub fn new(
        client: &'a C,
        config: &'a OperatorConfig,
        metrics: &'a Metrics,
        cancel: &'a CancellationToken,
        db: &RacDatabase,
    ) -> Self {
        let ns = db.namespace().unwrap_or_default();
        Self {
            client,
            config,
            metrics,
            cancel,
            status: StatusManager::new(client, config, cancel, &ns, &db.name_any()),
            db: db.clone(),
            ns,
            local: db.status.clone().unwrap_or_default(),
        }
    }

    pub async fn run(mut self) -> Result<Action> {
        if self.db.status.as_ref().and_then(|s| s.state).is_none() {
            self.set_state(LifecycleState::Pending).await?;
        }

        let observed = self.observe_pods().await?;
        if let Some(next) = refresh_transition(self.local.state, observed) {
            self.set_state(next).await?;
        }
        if observed == PodsState::AnyPending && self.local.state == Some(LifecycleState::Pending) {
            self.refresh_nodes().await?;
            self.finish(ReconcileOutcome::Waiting("pods are pending".to_string()))
                .await?;
            return Ok(Action::requeue(self.config.waiting_requeue));
        }

        let resume = self.resume_if_released().await?;
        let flagged = flag_state(&self.db.spec);
        if let Some(flagged) = flagged {
            if self.local.state != Some(flagged) {
                match flagged {
                    LifecycleState::Failed => self.mark_failed().await?,
                    other => self.set_state(other).await?,
                }
            }
        }

        let decision = match (resume, flagged) {
            (true, None) => Gate::Proceed,
            _ => gate(self.local.state, &self.db.spec),
        };
        if let Gate::Busy(reason) = decision {
            return self.refresh_only(reason).await;
        }

        match self.apply().await {
            Ok(()) => {
                self.status.set_last_applied_spec(&self.db).await?;
                self.local.observed_generation = self.db.metadata.generation;
                self.finish(ReconcileOutcome::Completed).await?;
                info!("reconciled {}/{}", self.ns, self.db.name_any());
                Ok(Action::requeue(self.config.success_requeue))
            }
            Err(e) => self.fail(e).await,
        }
    }

    async fn set_state(&mut self, state: LifecycleState) -> Result<()> {
        self.status.set_state(state).await?;
        self.local.state = Some(state);
        Ok(())
    }

    /// Failed also records the generation, so recovery waits for the next spec edit.
    async fn mark_failed(&mut self) -> Result<()> {
        self.status
            .update(|db, s| {
                s.state = Some(LifecycleState::Failed);
                s.observed_generation = db.metadata.generation;
            })
            .await?;
        self.local.state = Some(LifecycleState::Failed);
        self.local.observed_generation = self.db.metadata.generation;
        warn!("{}/{} marked Failed", self.ns, self.db.name_any());
        Ok(())
    }

    /// Failed with a newer spec, or Manual with the flag cleared, resumes as Updating.
    async fn resume_if_released(&mut self) -> Result<bool> {
        let leaving_manual = self.local.state == Some(LifecycleState::Manual) && !self.db.spec.is_manual;
        if !needs_recovery(&self.db) && !leaving_manual {
            return Ok(false);
        }
        info!("resuming {}/{} from {:?}", self.ns, self.db.name_any(), self.local.state);
        if self.db.spec.is_failed {
            self.client
                .patch_merge::<RacDatabase>(&self.ns, &self.db.name_any(), json!({ "spec": { "isFailed": false } }))
                .await?;
            self.db.spec.is_failed = false;
        }
        self.set_state(LifecycleState::Updating).await?;
        Ok(true)
    }

    async fn node_pods(&self, node: &str) -> Result<Vec<Pod>> {
        self.client.list(&self.ns, &node_selector(&self.db, node)).await
    }

    async fn all_pods(&self) -> Result<Vec<Pod>> {
        let mut pods = Vec::new();
        for node in self.db.spec.node_names() {
            pods.extend(self.node_pods(&node).await?);
        }
        Ok(pods)
    }

    /// Pod readiness, rechecked a few times while anything is Pending.
    async fn observe_pods(&self) -> Result<PodsState> {
        let expected = self.db.spec.node_names().len();
        let attempts = self.config.pending_pod_attempts.max(1);
        let mut state = PodsState::NotReady;
        for attempt in 1..=attempts {
            state = pods_state(&self.all_pods().await?, expected);
            if state != PodsState::AnyPending || attempt == attempts {
                break;
            }
            if !sleep_or_cancel(self.config.pending_pod_delay, self.cancel).await {
                return Err(Error::StdError(StdError::Cancelled("checking for pending pods".to_string())));
            }
        }
        Ok(state)
    }

    /// Rebuilds the per-node status and returns the aggregate pod state.
    async fn refresh_nodes(&mut self) -> Result<PodsState> {
        let nodes = self.db.spec.node_names();
        let mut statuses = Vec::new();
        let mut pods = Vec::new();

        for node in &nodes {
            let mounted: Vec<String> = match self.client.get_opt::<StatefulSet>(&self.ns, node).await? {
                Some(sts) => attached_devices(&sts).into_iter().map(|d| d.device_path).collect(),
                None => Vec::new(),
            };
            let node_pods = self.node_pods(node).await?;
            if node_pods.is_empty() {
                statuses.push(RacNodeStatus {
                    name: format!("{node}-0"),
                    node_details: Some(NodeDetails {
                        mounted_devices: mounted.clone(),
                        pod_state: "NotCreated".to_string(),
                        cluster_state: CLUSTER_PENDING.to_string(),
                    }),
                });
            }
            for pod in &node_pods {
                statuses.push(RacNodeStatus {
                    name: pod.name_any(),
                    node_details: Some(NodeDetails {
                        mounted_devices: mounted.clone(),
                        pod_state: pod_state(pod),
                        cluster_state: if is_pod_ready(pod) { CLUSTER_HEALTHY } else { CLUSTER_PENDING }.to_string(),
                    }),
                });
            }
            pods.extend(node_pods);
        }

        self.local.rac_nodes = statuses;
        Ok(pods_state(&pods, nodes.len()))
    }

    /// Busy pass: status refresh only. PodAvailable with every pod ready completes.
    async fn refresh_only(mut self, reason: String) -> Result<Action> {
        let pods = self.refresh_nodes().await?;
        let outcome = if self.local.state == Some(LifecycleState::PodAvailable) && pods == PodsState::AllReady {
            ReconcileOutcome::Completed
        } else {
            info!("{}/{} is busy: {reason}", self.ns, self.db.name_any());
            ReconcileOutcome::Waiting(reason)
        };
        let requeue = match outcome {
            ReconcileOutcome::Completed => self.config.success_requeue,
            _ => self.config.busy_requeue,
        };
        self.finish(outcome).await?;
        Ok(Action::requeue(requeue))
    }

    async fn finish(&mut self, outcome: ReconcileOutcome) -> Result<()> {
        self.status.update_reconcile_status(&self.local, &outcome).await?;
        Ok(())
    }

    /// Maps a failed pass onto status and the controller's retry policy.
    async fn fail(mut self, e: Error) -> Result<Action> {
        if is_cancelled(&e) {
            info!("pass for {}/{} cancelled", self.ns, self.db.name_any());
            return Err(e);
        }
        let message = cause(&e);

        if let Error::ErrorWithRequeue(requeue) = &e {
            warn!("{}/{} requeued: {message}", self.ns, self.db.name_any());
            self.metrics.reconcile_failure(&self.db, &e);
            if let Err(status_err) = self.finish(ReconcileOutcome::Queued(message)).await {
                warn!("could not record requeue: {status_err}");
            }
            return Ok(Action::requeue(requeue.duration));
        }

        let outcome = match e.class() {
            ErrorClass::Fatal => {
                error!("{}/{} needs manual intervention: {message}", self.ns, self.db.name_any());
                if let Err(status_err) = self.mark_failed().await {
                    warn!("could not mark Failed: {status_err}");
                }
                ReconcileOutcome::Failed(message)
            }
            ErrorClass::Blocking => {
                warn!("{}/{} blocked: {message}", self.ns, self.db.name_any());
                ReconcileOutcome::Failed(message)
            }
            ErrorClass::Transient => {
                warn!("{}/{} will retry: {message}", self.ns, self.db.name_any());
                ReconcileOutcome::Queued(message)
            }
        };
        if let Err(status_err) = self.finish(outcome).await {
            warn!("could not record reconcile error: {status_err}");
        }
        Err(e)
    }

    async fn discover(&mut self) -> Result<Inventory> {
        let discovery = run_discovery(self.client, &self.db, self.config, self.cancel).await?;
        self.status.replace_disk_groups(&discovery.groups).await?;
        self.local.asm_disk_groups = discovery.groups;
        self.local.force_discovery = false;
        Ok(discovery.inventory)
    }

    /// Status disk groups restricted to the devices the spec still names.
    fn spec_disk_groups(&self) -> Vec<DiskGroupStatus> {
        let spec_disks = self.db.spec.all_disks();
        self.local
            .asm_disk_groups
            .iter()
            .cloned()
            .map(|mut g| {
                g.disks.retain(|d| spec_disks.contains(&d.name));
                g
            })
            .collect()
    }

    /// Released devices leave status for good, both in place and locally.
    async fn release_devices(&mut self, removed: &[String]) -> Result<()> {
        self.status.prune_devices(removed).await?;
        for group in self.local.asm_disk_groups.iter_mut() {
            group.disks.retain(|d| !removed.contains(&d.name));
        }
        Ok(())
    }

    /// Devices for the StatefulSets: spec order, minus anything known to be unusable.
    fn attachable_devices(&self, inventory: Option<&Inventory>) -> Vec<String> {
        desired_devices(&self.db, &self.local.asm_disk_groups)
            .into_iter()
            .filter(|d| match inventory.and_then(|inv| inv.get(d)) {
                Some(found) => found.valid && found.size_gb > 0,
                None => true,
            })
            .collect()
    }

    async fn apply(&mut self) -> Result<()> {
        let last_applied: Option<RacDatabaseSpec> = self.db.last_applied_spec()?;
        let changes = compute_disk_changes(last_applied.as_ref(), &self.db.spec, &self.local.asm_disk_groups)?;
        if !changes.is_empty() {
            info!(
                "disk changes for {}/{}: added {:?}, removed {:?}",
                self.ns,
                self.db.name_any(),
                changes.added,
                changes.removed
            );
        }

        if let (false, Some(old)) = (changes.removed.is_empty(), last_applied.as_ref()) {
            let pod = asm::healthy_pod(self.client, &self.db).await?;
            corroborate_removals(self.client, &self.ns, &pod, &changes.removed, old).await?;

            if let Some(device) = stale_devices(&self.local.asm_disk_groups).first().cloned() {
                self.status.set_force_discovery(true).await?;
                self.local.force_discovery = true;
                self.discover().await?;
                return Err(Error::StdError(StdError::DiskValidation(format!(
                    "cannot remove disks while device {device} has unknown size; re-run discovery first"
                ))));
            }
        }

        let removed_nodes = remove_dropped_nodes(self.client, &self.db, last_applied.as_ref()).await?;
        if !removed_nodes.is_empty() {
            info!("removed nodes {removed_nodes:?} from {}/{}", self.ns, self.db.name_any());
            if self.local.state != Some(LifecycleState::Updating) {
                self.set_state(LifecycleState::Updating).await?;
            }
        }
        let growing = !added_nodes(last_applied.as_ref(), &self.db.spec).is_empty();
        if growing && self.local.state != Some(LifecycleState::AddingInstance) {
            self.set_state(LifecycleState::AddingInstance).await?;
        }

        let inventory = if should_run_discovery(&changes, &self.local, last_applied.as_ref(), &self.db.spec) {
            Some(self.discover().await?)
        } else {
            None
        };

        let to_provision: Vec<DeviceStatus> = match &inventory {
            Some(inv) => provisionable(&self.db, inv),
            None => self
                .spec_disk_groups()
                .into_iter()
                .flat_map(|g| g.disks.into_iter())
                .collect(),
        };
        let created = ensure_volumes(self.client, &self.db, &to_provision).await?;
        if created > 0 {
            info!("created {created} volume objects for {}/{}", self.ns, self.db.name_any());
        }
        ensure_config_maps(self.client, &self.db, &self.spec_disk_groups()).await?;
        ensure_services(self.client, &self.db).await?;

        let devices = self.attachable_devices(inventory.as_ref());
        let nodes = self.db.spec.node_names();
        for (i, node) in nodes.iter().enumerate() {
            match ensure_statefulset(self.client, &self.db, node, &devices).await? {
                RolloutAction::Created => {
                    let next = if growing {
                        LifecycleState::AddingInstance
                    } else {
                        LifecycleState::Provisioning
                    };
                    if self.local.state != Some(next) {
                        self.set_state(next).await?;
                    }
                }
                RolloutAction::Updated => {
                    if self.local.state != Some(LifecycleState::Updating) {
                        self.set_state(LifecycleState::Updating).await?;
                    }
                    wait_for_rollout(self.client, &self.db, node, &devices, self.config, self.cancel).await?;
                }
                RolloutAction::Unchanged => {}
            }
            if remove_disk_volumes(self.client, &self.db, &changes.removed, i + 1 == nodes.len()).await? {
                self.metrics.disk_changes("removed", changes.removed.len());
                self.release_devices(&changes.removed).await?;
            }
        }

        if !changes.added.is_empty() {
            let added = add_disks(self.client, &self.db, &changes.added).await?;
            self.metrics.disk_changes("added", added);
        }

        let pods = self.refresh_nodes().await?;
        if let Some(next) = refresh_transition(self.local.state, pods) {
            self.set_state(next).await?;
        }
        self.local.config_params = Some(resolved_params(&self.db));
        Ok(())
    }
}

/// Runs one pass for `db`.
pub async fn reconcile_database<C: ClusterClient>(
    client: &C,
    config: &OperatorConfig,
    metrics: &Metrics,
    cancel: &CancellationToken,
    db: &RacDatabase,
) -> Result<Action> {
    RacReconciler::new(client, config, metrics, cancel, db).run().await
}
