use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::executor::Outcome;
use crate::job::{Action, Job, JobState, JobSummary};

/// What a [`JobRegistry::sweep`] pass changed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Executing jobs past their budget, marked Error.
    pub crashed: usize,
    /// Terminal jobs past retention, removed.
    pub purged: usize,
}

/// Concurrent `id -> Job` map.
///
/// Every transition is applied under the entry's shard lock, so a cancel and
/// a timer firing for the same job can never both succeed.
#[derive(Default)]
pub struct JobRegistry {
    jobs: DashMap<String, Job>,
}

fn to_chrono(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}

impl JobRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a Waiting job due after `delay`; returns its id.
    pub fn create(&self, device_name: &str, action: Action, delay: Duration) -> String {
        self.create_at(device_name, action, delay, Utc::now())
    }

    pub(crate) fn create_at(
        &self,
        device_name: &str,
        action: Action,
        delay: Duration,
        now: DateTime<Utc>,
    ) -> String {
        let scheduled_for = now
            .checked_add_signed(to_chrono(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let base = Job::base_id(device_name, action, now);

        let mut n = 1u32;
        loop {
            let id = if n == 1 { base.clone() } else { format!("{base}-{n}") };
            match self.jobs.entry(id.clone()) {
                Entry::Occupied(_) => n += 1,
                Entry::Vacant(slot) => {
                    slot.insert(Job {
                        id: id.clone(),
                        device_name: device_name.to_string(),
                        action,
                        created_at: now,
                        scheduled_for,
                        state: JobState::Waiting,
                        started_at: None,
                        finished_at: None,
                        result: None,
                        error: None,
                    });
                    return id;
                }
            }
        }
    }

    /// Copy of the job with this id.
    pub fn get(&self, id: &str) -> Result<Job> {
        self.jobs
            .get(id)
            .map(|j| j.value().clone())
            .ok_or_else(|| Error::JobNotFound(id.to_string()))
    }

    /// Snapshot of every job, ordered by fire time.
    pub fn list(&self) -> Vec<JobSummary> {
        let now = Utc::now();
        let mut out: Vec<JobSummary> = self.jobs.iter().map(|j| j.value().summary(now)).collect();
        out.sort_by(|a, b| a.scheduled_for.cmp(&b.scheduled_for).then_with(|| a.id.cmp(&b.id)));
        out
    }

    /// Number of registered jobs, in any state.
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// True when no job is registered.
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Remove a Waiting job.
    pub fn cancel(&self, id: &str) -> Result<()> {
        if self.jobs.remove_if(id, |_, j| j.state == JobState::Waiting).is_some() {
            info!(job = id, "job cancelled");
            return Ok(());
        }
        match self.jobs.get(id) {
            Some(j) => Err(Error::InvalidState { id: id.to_string(), state: j.state }),
            None => Err(Error::JobNotFound(id.to_string())),
        }
    }

    /// Waiting -> Executing. False if the job is gone (cancelled) or not Waiting.
    pub fn begin_execution(&self, id: &str) -> bool {
        match self.jobs.get_mut(id) {
            Some(mut j) if j.state == JobState::Waiting => {
                j.state = JobState::Executing;
                j.started_at = Some(Utc::now());
                true
            }
            _ => false,
        }
    }

    /// Executing -> Completed | Error, recording the outcome message.
    pub fn finish(&self, id: &str, outcome: &Outcome) -> bool {
        let Some(mut j) = self.jobs.get_mut(id) else { return false };
        if j.state != JobState::Executing {
            warn!(job = id, state = %j.state, "late outcome ignored");
            return false;
        }
        if outcome.is_success() {
            j.state = JobState::Completed;
            j.result = Some(outcome.message());
        } else {
            j.state = JobState::Error;
            j.error = Some(outcome.message());
        }
        j.finished_at = Some(Utc::now());
        true
    }

    /// Force a non-terminal job into Error.
    pub fn fail(&self, id: &str, message: &str) -> bool {
        let Some(mut j) = self.jobs.get_mut(id) else { return false };
        if j.state.is_terminal() {
            return false;
        }
        j.state = JobState::Error;
        j.error = Some(message.to_string());
        j.finished_at = Some(Utc::now());
        true
    }

    /// Remove a terminal job. Non-terminal jobs are left alone.
    pub fn purge(&self, id: &str) -> bool {
        self.jobs.remove_if(id, |_, j| j.state.is_terminal()).is_some()
    }

    /// Mark jobs executing for longer than `budget` as crashed, and drop
    /// terminal jobs finished more than `retention` ago.
    pub fn sweep(&self, now: DateTime<Utc>, budget: Duration, retention: Duration) -> SweepReport {
        let budget = to_chrono(budget);
        let retention = to_chrono(retention);
        let mut report = SweepReport::default();

        for mut j in self.jobs.iter_mut() {
            let stuck = j.state == JobState::Executing
                && j.started_at.is_some_and(|t| now.signed_duration_since(t) > budget);
            if stuck {
                warn!(job = %j.id, "execution exceeded its budget, marking crashed");
                j.state = JobState::Error;
                j.error = Some("execution crashed: no outcome within its time budget".to_string());
                j.finished_at = Some(now);
                report.crashed += 1;
            }
        }

        self.jobs.retain(|_, j| {
            let expired = j.state.is_terminal()
                && j.finished_at.is_some_and(|t| now.signed_duration_since(t) >= retention);
            if expired {
                report.purged += 1;
            }
            !expired
        });
        report
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeZone;

    use super::*;
    use crate::error::ExecError;

    fn done() -> Outcome {
        Outcome::Done { message: "Device 'Lamp' switched on".into(), attempts: 1 }
    }

    #[test]
    fn create_is_immediately_visible_as_waiting() {
        let reg = JobRegistry::new();
        let id = reg.create("Lamp", Action::On, Duration::from_secs(120));
        let job = reg.get(&id).unwrap();
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.scheduled_for - job.created_at, TimeDelta::seconds(120));
        assert!(id.starts_with("Lamp_on_"));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn same_second_ids_get_a_suffix() {
        let reg = JobRegistry::new();
        let at = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let a = reg.create_at("Lamp", Action::On, Duration::ZERO, at);
        let b = reg.create_at("Lamp", Action::On, Duration::ZERO, at);
        let c = reg.create_at("Lamp", Action::On, Duration::ZERO, at);
        assert_eq!(a, "Lamp_on_20240102_030405");
        assert_eq!(b, "Lamp_on_20240102_030405-2");
        assert_eq!(c, "Lamp_on_20240102_030405-3");
    }

    #[test]
    fn cancel_only_while_waiting() {
        let reg = JobRegistry::new();
        let id = reg.create("Heater", Action::Off, Duration::from_secs(300));
        reg.cancel(&id).unwrap();
        assert!(matches!(reg.get(&id), Err(Error::JobNotFound(_))));
        assert!(matches!(reg.cancel(&id), Err(Error::JobNotFound(_))));
        assert!(!reg.begin_execution(&id));

        let id = reg.create("Heater", Action::Off, Duration::ZERO);
        assert!(reg.begin_execution(&id));
        assert!(matches!(
            reg.cancel(&id),
            Err(Error::InvalidState { state: JobState::Executing, .. })
        ));
        reg.finish(&id, &done());
        assert!(matches!(
            reg.cancel(&id),
            Err(Error::InvalidState { state: JobState::Completed, .. })
        ));
    }

    #[test]
    fn finish_records_result_or_error() {
        let reg = JobRegistry::new();
        let ok = reg.create("Lamp", Action::On, Duration::ZERO);
        let bad = reg.create("Fan", Action::On, Duration::ZERO);
        assert!(!reg.finish(&ok, &done()), "not executing yet");

        reg.begin_execution(&ok);
        reg.begin_execution(&bad);
        assert!(reg.finish(&ok, &done()));
        let failed = Outcome::Failed {
            error: ExecError::DeviceNotFound { requested: "Fan".into(), available: vec!["Lamp".into()] },
            attempts: 1,
        };
        assert!(reg.finish(&bad, &failed));

        let ok = reg.get(&ok).unwrap();
        assert_eq!(ok.state, JobState::Completed);
        assert!(ok.result.unwrap().contains("Lamp"));
        let bad = reg.get(&bad).unwrap();
        assert_eq!(bad.state, JobState::Error);
        assert!(bad.error.unwrap().contains("Fan"));
        assert!(!reg.fail(&bad.id, "again"));
    }

    #[test]
    fn purge_skips_live_jobs() {
        let reg = JobRegistry::new();
        let id = reg.create("Lamp", Action::On, Duration::ZERO);
        assert!(!reg.purge(&id));
        reg.begin_execution(&id);
        assert!(!reg.purge(&id));
        reg.fail(&id, "boom");
        assert!(reg.purge(&id));
        assert!(reg.is_empty());
    }

    #[test]
    fn sweep_recovers_stuck_and_expires_terminal() {
        let reg = JobRegistry::new();
        let stuck = reg.create("Lamp", Action::On, Duration::ZERO);
        let waiting = reg.create("Fan", Action::Off, Duration::from_secs(3600));
        reg.begin_execution(&stuck);

        let later = Utc::now() + TimeDelta::seconds(200);
        let report = reg.sweep(later, Duration::from_secs(100), Duration::from_secs(300));
        assert_eq!(report, SweepReport { crashed: 1, purged: 0 });
        let job = reg.get(&stuck).unwrap();
        assert_eq!(job.state, JobState::Error);
        assert!(job.error.unwrap().contains("crashed"));

        let report = reg.sweep(later + TimeDelta::seconds(300), Duration::from_secs(100), Duration::from_secs(300));
        assert_eq!(report, SweepReport { crashed: 0, purged: 1 });
        assert!(reg.get(&stuck).is_err());
        assert_eq!(reg.get(&waiting).unwrap().state, JobState::Waiting);
    }

    #[test]
    fn list_reports_remaining_time() {
        let reg = JobRegistry::new();
        reg.create("Later", Action::On, Duration::from_secs(600));
        reg.create("Sooner", Action::Off, Duration::from_secs(60));
        let jobs = reg.list();
        assert_eq!(jobs[0].device_name, "Sooner");
        assert!(jobs[0].remaining_seconds <= 60 && jobs[0].remaining_seconds >= 58);
        assert!(jobs[1].remaining_seconds > 500);
    }

    #[test]
    fn cancel_and_fire_are_exclusive() {
        for _ in 0..200 {
            let reg = Arc::new(JobRegistry::new());
            let id = reg.create("Lamp", Action::On, Duration::ZERO);

            let (r1, i1) = (reg.clone(), id.clone());
            let canceller = std::thread::spawn(move || r1.cancel(&i1).is_ok());
            let (r2, i2) = (reg.clone(), id.clone());
            let firer = std::thread::spawn(move || r2.begin_execution(&i2));

            let cancelled = canceller.join().unwrap();
            let fired = firer.join().unwrap();
            assert!(cancelled ^ fired, "cancelled={cancelled} fired={fired}");
        }
    }
}
