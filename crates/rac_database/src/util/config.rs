use tokio::time::Duration;

use crate::util::poll::PollConfig;

/// Tunables for the controller. Defaults match what the database images expect
/// in a typical cluster; the operator binary overrides them from flags and env.
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Readiness polling of the disk probe DaemonSet
    pub probe_ready: PollConfig,
    /// Waiting for the probe DaemonSet to disappear after delete
    pub probe_delete: PollConfig,
    /// Waiting for owned objects to disappear during finalizer cleanup
    pub cleanup: PollConfig,
    /// Waiting for a StatefulSet rollout after the device list changed
    pub rollout: PollConfig,
    /// Checks for Pending pods before doing any work
    pub pending_pod_attempts: u32,
    pub pending_pod_delay: Duration,
    /// Optimistic status writes
    pub status_write_attempts: u32,
    pub status_write_delay: Duration,

    pub busy_requeue: Duration,
    pub waiting_requeue: Duration,
    pub success_requeue: Duration,
    pub error_requeue: Duration,

    pub max_concurrent_reconciles: u16,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            probe_ready: PollConfig::new(Duration::from_secs(10), Duration::from_secs(120)),
            probe_delete: PollConfig::new(Duration::from_secs(5), Duration::from_secs(30)),
            cleanup: PollConfig::new(Duration::from_secs(5), Duration::from_secs(60)),
            rollout: PollConfig::new(Duration::from_secs(5), Duration::from_secs(15 * 60)),
            pending_pod_attempts: 5,
            pending_pod_delay: Duration::from_millis(200),
            status_write_attempts: 5,
            status_write_delay: Duration::from_secs(2),
            busy_requeue: Duration::from_secs(30),
            waiting_requeue: Duration::from_secs(10),
            success_requeue: Duration::from_secs(60),
            error_requeue: Duration::from_secs(5 * 60),
            max_concurrent_reconciles: 100,
        }
    }
}
