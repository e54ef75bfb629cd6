use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use serde_json::json;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::v1::racdatabase::{
    DiskGroupStatus, RacDatabase, RacDatabaseStatus, LAST_APPLIED_SPEC_ANNOTATION,
};
use crate::api::v1::LifecycleState;
use crate::client::ClusterClient;
use crate::util::config::OperatorConfig;
use crate::util::errors::{Error, Result, StdError};
use crate::util::merge::Merge;
use crate::util::poll::sleep_or_cancel;
use crate::util::status::{is_status_condition_true, new_condition, remove_status_condition, set_status_condition};

pub const RECONCILE_COMPLETE_CONDITION: &str = "ReconcileComplete";
pub const RECONCILE_WAITING_CONDITION: &str = "ReconcileWaiting";
pub const RECONCILE_QUEUED_CONDITION: &str = "ReconcileQueued";
pub const RECONCILE_ERROR_CONDITION: &str = "ReconcileError";

#[derive(Debug, Clone, PartialEq)]
pub enum StatusReason {
    Completed,
    Waiting,
    Queued,
    Failed,
}

impl fmt::Display for StatusReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StatusReason::Completed => write!(f, "LastReconcileCycleCompleted"),
            StatusReason::Waiting => write!(f, "LastReconcileCycleWaiting"),
            StatusReason::Queued => write!(f, "LastReconcileCycleQueued"),
            StatusReason::Failed => write!(f, "LastReconcileCycleFailed"),
        }
    }
}

/// How a reconcile pass ended, as reflected in the conditions.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    Completed,
    /// Another operation owns the resource right now
    Waiting(String),
    /// Retry scheduled after a transient problem
    Queued(String),
    Failed(String),
}

/// Fetch, mutate, write; retried on version conflicts.
///
/// `mutate` gets the freshly fetched object and a copy of its status to edit.
/// Returns `Ok(None)` when the object is gone or every attempt conflicted; the
/// latter is left for the next pass to catch up.
pub async fn optimistic_update<C, F>(
    client: &C,
    namespace: &str,
    name: &str,
    attempts: u32,
    delay: Duration,
    cancel: &CancellationToken,
    mut mutate: F,
) -> Result<Option<RacDatabase>>
where
    C: ClusterClient,
    F: FnMut(&RacDatabase, &mut RacDatabaseStatus) + Send,
{
    for attempt in 1..=attempts.max(1) {
        let Some(latest) = client.get_opt::<RacDatabase>(namespace, name).await? else {
            debug!("{namespace}/{name} is gone, dropping status write");
            return Ok(None);
        };

        let mut status = latest.status.clone().unwrap_or_default();
        mutate(&latest, &mut status);
        if latest.status.as_ref() == Some(&status) {
            return Ok(Some(latest));
        }

        match client
            .write_status(namespace, name, latest.metadata.resource_version.clone(), &status)
            .await
        {
            Ok(updated) => return Ok(Some(updated)),
            Err(e) if e.is_conflict() => {
                warn!("status conflict on {namespace}/{name} (attempt {attempt}/{attempts}), retrying");
                if !sleep_or_cancel(delay, cancel).await {
                    return Err(Error::StdError(StdError::Cancelled(format!(
                        "status write for {namespace}/{name}"
                    ))));
                }
            }
            Err(e) => return Err(e),
        }
    }

    warn!("giving up on status write for {namespace}/{name} after {attempts} conflicts, next pass will catch up");
    Ok(None)
}

fn apply_outcome(conditions: &[Condition], outcome: &ReconcileOutcome, generation: Option<i64>) -> Vec<Condition> {
    let mut conditions = conditions.to_vec();
    for type_ in [
        RECONCILE_COMPLETE_CONDITION,
        RECONCILE_WAITING_CONDITION,
        RECONCILE_QUEUED_CONDITION,
    ] {
        conditions = remove_status_condition(&conditions, type_).0;
    }

    let condition = match outcome {
        ReconcileOutcome::Completed => {
            // keep the last error around, but no longer active
            if let Some(err) = conditions.iter_mut().find(|c| c.type_ == RECONCILE_ERROR_CONDITION) {
                err.status = "False".to_string();
            }
            new_condition(
                RECONCILE_COMPLETE_CONDITION,
                true,
                &StatusReason::Completed.to_string(),
                "reconcile cycle completed",
                generation,
            )
        }
        ReconcileOutcome::Waiting(msg) => new_condition(
            RECONCILE_WAITING_CONDITION,
            true,
            &StatusReason::Waiting.to_string(),
            msg.clone(),
            generation,
        ),
        ReconcileOutcome::Queued(msg) => new_condition(
            RECONCILE_QUEUED_CONDITION,
            true,
            &StatusReason::Queued.to_string(),
            msg.clone(),
            generation,
        ),
        ReconcileOutcome::Failed(msg) => new_condition(
            RECONCILE_ERROR_CONDITION,
            true,
            &StatusReason::Failed.to_string(),
            msg.clone(),
            generation,
        ),
    };
    set_status_condition(&conditions, condition).0
}

/// Writes status for one `RacDatabase`, always through [`optimistic_update`].
pub struct StatusManager<'a, C: ClusterClient> {
    client: &'a C,
    config: &'a OperatorConfig,
    cancel: &'a CancellationToken,
    namespace: String,
    name: String,
}

impl<'a, C: ClusterClient> StatusManager<'a, C> {
    pub fn new(
        client: &'a C,
        config: &'a OperatorConfig,
        cancel: &'a CancellationToken,
        namespace: &str,
        name: &str,
    ) -> Self {
        Self {
            client,
            config,
            cancel,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub async fn update<F>(&self, mutate: F) -> Result<Option<RacDatabase>>
    where
        F: FnMut(&RacDatabase, &mut RacDatabaseStatus) + Send,
    {
        optimistic_update(
            self.client,
            &self.namespace,
            &self.name,
            self.config.status_write_attempts,
            self.config.status_write_delay,
            self.cancel,
            mutate,
        )
        .await
    }

    pub async fn set_state(&self, state: LifecycleState) -> Result<()> {
        self.update(|_, s| s.state = Some(state)).await?;
        info!("{}/{} state set to {}", self.namespace, self.name, state);
        Ok(())
    }

    /// Disk group status is rebuilt from discovery, so it is replaced rather than merged.
    pub async fn replace_disk_groups(&self, groups: &[DiskGroupStatus]) -> Result<()> {
        self.update(|_, s| {
            s.asm_disk_groups = groups.to_vec();
            s.force_discovery = false;
        })
        .await?;
        Ok(())
    }

    /// Drops released devices from every disk group. Written in place so the
    /// end-of-pass merge cannot bring them back.
    pub async fn prune_devices(&self, removed: &[String]) -> Result<()> {
        self.update(|_, s| {
            for group in s.asm_disk_groups.iter_mut() {
                group.disks.retain(|d| !removed.contains(&d.name));
            }
        })
        .await?;
        Ok(())
    }

    pub async fn set_force_discovery(&self, force: bool) -> Result<()> {
        self.update(|_, s| s.force_discovery = force).await?;
        Ok(())
    }

    /// End-of-pass write: merge local status, then set the outcome condition on the merged copy.
    ///
    /// The node list is rebuilt every pass and is taken as is; a positional
    /// merge would keep entries of nodes that no longer exist.
    pub async fn update_reconcile_status(
        &self,
        local: &RacDatabaseStatus,
        outcome: &ReconcileOutcome,
    ) -> Result<Option<RacDatabase>> {
        self.update(|db, latest| {
            let mut merged = local.clone();
            merged.merge_from(latest);
            merged.rac_nodes = local.rac_nodes.clone();
            merged.conditions = apply_outcome(&latest.conditions, outcome, db.metadata.generation);
            if merged.state == Some(LifecycleState::PodAvailable)
                && is_status_condition_true(&merged.conditions, RECONCILE_COMPLETE_CONDITION)
            {
                merged.state = Some(LifecycleState::Available);
            }
            *latest = merged;
        })
        .await
    }

    /// Records `db.spec` as the baseline for the next diff and marks its generation observed.
    pub async fn set_last_applied_spec(&self, db: &RacDatabase) -> Result<()> {
        let snapshot = serde_json::to_string(&db.spec)?;
        self.client
            .patch_merge::<RacDatabase>(
                &self.namespace,
                &self.name,
                json!({ "metadata": { "annotations": { LAST_APPLIED_SPEC_ANNOTATION: snapshot } } }),
            )
            .await?;
        let generation = db.metadata.generation;
        self.update(|_, s| s.observed_generation = generation).await?;
        Ok(())
    }
}
