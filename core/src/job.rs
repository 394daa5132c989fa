use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Desired device state.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Switch the device on.
    On,
    /// Switch the device off.
    Off,
}

impl Action {
    /// Lowercase wire name (`"on"` / `"off"`).
    pub fn as_str(self) -> &'static str {
        match self {
            Action::On => "on",
            Action::Off => "off",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on" => Ok(Action::On),
            "off" => Ok(Action::Off),
            other => Err(format!("unknown action '{other}', expected 'on' or 'off'")),
        }
    }
}

/// Lifecycle of a job.
///
/// `Waiting -> Executing -> Completed | Error`; a Waiting job may instead be
/// cancelled, which removes it outright.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Armed, timer not yet fired.
    Waiting,
    /// Timer fired, executor running.
    Executing,
    /// Executor reported success.
    Completed,
    /// Executor reported failure, or the execution crashed.
    Error,
}

impl JobState {
    /// Completed and Error are terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Error)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Waiting => "waiting",
            JobState::Executing => "executing",
            JobState::Completed => "completed",
            JobState::Error => "error",
        };
        f.write_str(s)
    }
}

/// One scheduled device action and its tracked lifecycle.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Job {
    /// Unique id, `{device}_{action}_{YYYYmmdd_HHMMSS}` (plus `-N` on collision).
    pub id: String,
    /// Target name, substring-matched against the backend inventory.
    pub device_name: String,
    /// Desired state.
    pub action: Action,
    /// When the job was registered.
    pub created_at: DateTime<Utc>,
    /// When the timer fires.
    pub scheduled_for: DateTime<Utc>,
    /// Current lifecycle state.
    pub state: JobState,
    /// Set on the Executing transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Set on reaching Completed or Error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Outcome message once Completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Failure message once Error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Job {
    /// Id prefix for a job created at `at`; the registry appends a suffix on collision.
    pub fn base_id(device_name: &str, action: Action, at: DateTime<Utc>) -> String {
        format!("{}_{}_{}", device_name, action, at.format("%Y%m%d_%H%M%S"))
    }

    /// Snapshot annotated with the seconds left until the timer fires.
    pub fn summary(&self, now: DateTime<Utc>) -> JobSummary {
        let remaining_seconds = (self.scheduled_for - now).num_seconds().max(0) as u64;
        JobSummary {
            id: self.id.clone(),
            name: format!("Control {} -> {}", self.device_name, self.action),
            device_name: self.device_name.clone(),
            action: self.action,
            scheduled_for: self.scheduled_for,
            state: self.state,
            remaining_seconds,
            remaining_minutes: remaining_seconds / 60,
            result: self.result.clone(),
            error: self.error.clone(),
        }
    }
}

/// Read-time view of a job, as reported by `list`.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct JobSummary {
    /// Job id.
    pub id: String,
    /// Display label, `Control {device} -> {action}`.
    pub name: String,
    /// Target device name.
    pub device_name: String,
    /// Desired state.
    pub action: Action,
    /// Fire time.
    pub scheduled_for: DateTime<Utc>,
    /// State at read time.
    pub state: JobState,
    /// `max(0, scheduled_for - now)` in whole seconds.
    pub remaining_seconds: u64,
    /// `remaining_seconds / 60`.
    pub remaining_minutes: u64,
    /// Outcome message, Completed only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Failure message, Error only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn action_parses_case_insensitively() {
        assert_eq!("ON".parse::<Action>().unwrap(), Action::On);
        assert_eq!(" off ".parse::<Action>().unwrap(), Action::Off);
        assert!("toggle".parse::<Action>().is_err());
    }

    #[test]
    fn base_id_uses_device_action_and_second() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(Job::base_id("Lamp", Action::On, at), "Lamp_on_20240309_070501");
    }

    #[test]
    fn summary_clamps_remaining_at_zero() {
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 7, 0, 0).unwrap();
        let mut job = Job {
            id: "x".into(),
            device_name: "Lamp".into(),
            action: Action::Off,
            created_at: now,
            scheduled_for: now + Duration::seconds(150),
            state: JobState::Waiting,
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
        };
        let s = job.summary(now);
        assert_eq!(s.remaining_seconds, 150);
        assert_eq!(s.remaining_minutes, 2);
        assert_eq!(s.name, "Control Lamp -> off");

        job.scheduled_for = now - Duration::seconds(30);
        assert_eq!(job.summary(now).remaining_seconds, 0);
    }
}
