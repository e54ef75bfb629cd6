//! Lifecycle state machine of a `RacDatabase`.
//!
//! The persisted `status.state` doubles as a lock: while an operation that
//! spans several passes is running, new passes only refresh status.

use k8s_openapi::api::core::v1::Pod;

use crate::api::v1::racdatabase::{RacDatabase, RacDatabaseSpec};
use crate::api::v1::LifecycleState;

/// Whether a pass may mutate anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Gate {
    Proceed,
    /// Only the read-only status refresh runs; the reason ends up in the Waiting condition
    Busy(String),
}

/// States that own the resource until they finish.
pub fn is_busy_state(state: LifecycleState) -> bool {
    matches!(
        state,
        LifecycleState::Provisioning
            | LifecycleState::Updating
            | LifecycleState::PodAvailable
            | LifecycleState::AddingInstance
            | LifecycleState::Deleting
            | LifecycleState::Failed
            | LifecycleState::Manual
    )
}

pub fn gate(state: Option<LifecycleState>, spec: &RacDatabaseSpec) -> Gate {
    if spec.is_failed {
        return Gate::Busy("spec.isFailed is set".to_string());
    }
    if spec.is_manual {
        return Gate::Busy("spec.isManual is set".to_string());
    }
    match state {
        Some(s) if is_busy_state(s) => Gate::Busy(format!("resource is in state {s}")),
        _ => Gate::Proceed,
    }
}

/// State forced by the control flags, if any. `isFailed` wins over `isManual`.
pub fn flag_state(spec: &RacDatabaseSpec) -> Option<LifecycleState> {
    if spec.is_failed {
        Some(LifecycleState::Failed)
    } else if spec.is_manual {
        Some(LifecycleState::Manual)
    } else {
        None
    }
}

/// A Failed resource whose spec was edited since it failed.
pub fn needs_recovery(db: &RacDatabase) -> bool {
    let Some(status) = &db.status else {
        return false;
    };
    status.state == Some(LifecycleState::Failed) && db.metadata.generation != status.observed_generation
}

/// Aggregate readiness of the pods expected for the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodsState {
    /// At least one pod is unschedulable or still pulling
    AnyPending,
    AllReady,
    NotReady,
}

pub fn is_pod_ready(pod: &Pod) -> bool {
    let Some(status) = &pod.status else {
        return false;
    };
    status.phase.as_deref() == Some("Running")
        && status
            .conditions
            .as_ref()
            .map(|cs| cs.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
            .unwrap_or(false)
}

pub fn is_pod_pending(pod: &Pod) -> bool {
    pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Pending")
}

pub fn pods_state(pods: &[Pod], expected: usize) -> PodsState {
    if pods.iter().any(is_pod_pending) {
        return PodsState::AnyPending;
    }
    if expected > 0 && pods.len() >= expected && pods.iter().all(is_pod_ready) {
        PodsState::AllReady
    } else {
        PodsState::NotReady
    }
}

/// Transition driven by observed pods, applied before the gate.
pub fn refresh_transition(current: Option<LifecycleState>, pods: PodsState) -> Option<LifecycleState> {
    match (pods, current) {
        (
            PodsState::AnyPending,
            Some(
                LifecycleState::Pending | LifecycleState::Failed | LifecycleState::Manual | LifecycleState::Deleting,
            ),
        ) => None,
        (PodsState::AnyPending, _) => Some(LifecycleState::Pending),
        (
            PodsState::AllReady,
            Some(
                LifecycleState::Pending
                | LifecycleState::Provisioning
                | LifecycleState::Updating
                | LifecycleState::AddingInstance,
            ),
        ) => Some(LifecycleState::PodAvailable),
        _ => None,
    }
}
