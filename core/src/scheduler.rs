use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info};

use crate::executor::RetryingExecutor;
use crate::job::Action;
use crate::registry::JobRegistry;

/// Arms one background task per job: wait, fire, execute, record, retain, purge.
pub struct DelayScheduler {
    registry: Arc<JobRegistry>,
    executor: Arc<RetryingExecutor>,
    retention: Duration,
}

impl DelayScheduler {
    /// Scheduler recording into `registry` and running jobs on `executor`.
    /// Finished jobs stay visible for `retention` before being purged.
    pub fn new(registry: Arc<JobRegistry>, executor: Arc<RetryingExecutor>, retention: Duration) -> Self {
        Self { registry, executor, retention }
    }

    /// Register a job and return its id; everything else happens in the background.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn schedule(&self, device_name: &str, action: Action, delay: Duration) -> String {
        self.spawn(device_name, action, delay).0
    }

    pub(crate) fn spawn(&self, device_name: &str, action: Action, delay: Duration) -> (String, JoinHandle<()>) {
        let id = self.registry.create(device_name, action, delay);
        info!(job = %id, device = device_name, %action, ?delay, "job scheduled");

        let timeline = Timeline {
            registry: self.registry.clone(),
            executor: self.executor.clone(),
            id: id.clone(),
            device_name: device_name.to_string(),
            action,
            delay,
            retention: self.retention,
        };
        (id, tokio::spawn(timeline.run()))
    }
}

struct Timeline {
    registry: Arc<JobRegistry>,
    executor: Arc<RetryingExecutor>,
    id: String,
    device_name: String,
    action: Action,
    delay: Duration,
    retention: Duration,
}

impl Timeline {
    async fn run(self) {
        sleep(self.delay).await;

        if !self.registry.begin_execution(&self.id) {
            debug!(job = %self.id, "job gone before firing");
            return;
        }
        info!(job = %self.id, "job firing");

        // Separate task so a panic inside the executor still lands on the job.
        let executor = self.executor.clone();
        let device_name = self.device_name.clone();
        let action = self.action;
        let run = tokio::spawn(async move { executor.execute(&device_name, action).await });

        match run.await {
            Ok(outcome) => {
                self.registry.finish(&self.id, &outcome);
                info!(job = %self.id, success = outcome.is_success(), "job finished");
            }
            Err(e) => {
                error!(job = %self.id, error = %e, "job execution crashed");
                self.registry.fail(&self.id, &format!("execution crashed: {e}"));
            }
        }

        sleep(self.retention).await;
        if self.registry.purge(&self.id) {
            debug!(job = %self.id, "job purged");
        }
    }
}
