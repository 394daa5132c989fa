use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::cfg::SchedulerConfig;
use crate::error::{Error, Result};
use crate::executor::RetryingExecutor;
use crate::gateway::{BackendGateway, DeviceInfo, GatewayError};
use crate::job::{Action, Job, JobSummary};
use crate::registry::{JobRegistry, SweepReport};
use crate::retry::RetryPolicy;
use crate::scheduler::DelayScheduler;
use crate::session::SessionCache;

/// Aggregate returned by [`Service::status`].
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    /// Jobs currently registered, in any state.
    pub active_jobs: usize,
    /// Server time of the report.
    pub now: DateTime<Utc>,
}

/// Caller-facing handle over the job registry, the scheduler and the
/// backend session. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Service {
    registry: Arc<JobRegistry>,
    scheduler: Arc<DelayScheduler>,
    executor: Arc<RetryingExecutor>,
    retention: Duration,
}

impl Service {
    /// Wire every component from the `[scheduler]` settings.
    pub fn new(gateway: Arc<dyn BackendGateway>, settings: &SchedulerConfig) -> Self {
        Self::with_parts(gateway, settings.retry_policy(), settings.session_ttl(), settings.retention())
    }

    /// Wire every component from explicit timings.
    pub fn with_parts(
        gateway: Arc<dyn BackendGateway>,
        policy: RetryPolicy,
        session_ttl: Duration,
        retention: Duration,
    ) -> Self {
        let registry = Arc::new(JobRegistry::new());
        let cache = Arc::new(SessionCache::new(session_ttl));
        let executor = Arc::new(RetryingExecutor::new(gateway, cache, policy));
        let scheduler = Arc::new(DelayScheduler::new(registry.clone(), executor.clone(), retention));
        Self { registry, scheduler, executor, retention }
    }

    /// Register a job firing after `delay`. Returns at once; must run inside a Tokio runtime.
    pub fn schedule_job(&self, device_name: &str, action: Action, delay: Duration) -> String {
        self.scheduler.schedule(device_name, action, delay)
    }

    /// Snapshot of all jobs with their remaining time.
    pub fn list_jobs(&self) -> Vec<JobSummary> {
        self.registry.list()
    }

    /// One job by id.
    pub fn job(&self, id: &str) -> Result<Job> {
        self.registry.get(id)
    }

    /// Job count and server time.
    pub fn status(&self) -> Status {
        Status { active_jobs: self.registry.len(), now: Utc::now() }
    }

    /// Cancel a Waiting job.
    pub fn cancel_job(&self, id: &str) -> Result<()> {
        self.registry.cancel(id)
    }

    /// Forget the cached backend session.
    pub fn clear_session_cache(&self) {
        self.executor.cache().clear();
    }

    /// Force a fresh session and report the inventory; runs no command.
    pub async fn test_connection(&self) -> Result<Vec<DeviceInfo>> {
        let cache = self.executor.cache();
        let budget = self.executor.policy().call_timeout.saturating_mul(2);
        match timeout(budget, cache.refresh(self.executor.gateway())).await {
            Ok(Ok(session)) => {
                info!(devices = session.devices.len(), "connection test succeeded");
                Ok(session.devices.clone())
            }
            Ok(Err(e)) => {
                if matches!(e, GatewayError::Auth(_)) {
                    cache.invalidate();
                }
                warn!(error = %e, "connection test failed");
                Err(Error::Gateway(e))
            }
            Err(_) => Err(Error::Gateway(GatewayError::Timeout(format!(
                "no session within {budget:?}"
            )))),
        }
    }

    /// Mark stuck executions as crashed and drop expired finished jobs.
    pub fn housekeep(&self) -> SweepReport {
        self.housekeep_at(Utc::now())
    }

    fn housekeep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let policy = self.executor.policy();
        let budget = policy.execution_budget() + policy.call_timeout;
        let report = self.registry.sweep(now, budget, self.retention);
        if report.crashed > 0 || report.purged > 0 {
            info!(crashed = report.crashed, purged = report.purged, "housekeeping sweep");
        }
        report
    }
}
