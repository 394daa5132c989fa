use std::sync::Arc;
use std::time::Duration;

use backon::Retryable;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::ExecError;
use crate::gateway::{resolve_device, BackendGateway, GatewayError};
use crate::job::Action;
use crate::retry::RetryPolicy;
use crate::session::SessionCache;

/// Result of running one device action to completion.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// The command was delivered (or very likely delivered).
    Done {
        /// Human-readable confirmation naming device and action.
        message: String,
        /// Attempts used, including the successful one.
        attempts: u32,
    },
    /// The command could not be delivered.
    Failed {
        /// Last failure observed.
        error: ExecError,
        /// Attempts used.
        attempts: u32,
    },
}

impl Outcome {
    /// True for [`Outcome::Done`].
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Done { .. })
    }

    /// Attempts used to reach this outcome.
    pub fn attempts(&self) -> u32 {
        match self {
            Outcome::Done { attempts, .. } | Outcome::Failed { attempts, .. } => *attempts,
        }
    }

    /// Message stored on the job.
    pub fn message(&self) -> String {
        match self {
            Outcome::Done { message, .. } => message.clone(),
            Outcome::Failed { error: e @ ExecError::DeviceNotFound { .. }, .. } => e.to_string(),
            Outcome::Failed { error, attempts } => {
                format!("failed after {attempts} attempt(s): {error}")
            }
        }
    }
}

/// Resolves devices through the [`SessionCache`] and delivers commands,
/// retrying transient failures per its [`RetryPolicy`].
pub struct RetryingExecutor {
    gateway: Arc<dyn BackendGateway>,
    cache: Arc<SessionCache>,
    policy: RetryPolicy,
}

impl RetryingExecutor {
    /// Executor over `gateway`, sharing `cache` with other users of the backend.
    pub fn new(gateway: Arc<dyn BackendGateway>, cache: Arc<SessionCache>, policy: RetryPolicy) -> Self {
        Self { gateway, cache, policy }
    }

    /// Policy used by [`RetryingExecutor::execute`].
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Session cache shared with this executor.
    pub fn cache(&self) -> &Arc<SessionCache> {
        &self.cache
    }

    /// Backend this executor talks to.
    pub fn gateway(&self) -> &dyn BackendGateway {
        self.gateway.as_ref()
    }

    /// Run `action` on `device_name` with the configured attempt budget.
    pub async fn execute(&self, device_name: &str, action: Action) -> Outcome {
        self.execute_with(device_name, action, self.policy.max_attempts).await
    }

    /// Run `action` on `device_name` with at most `max_attempts` attempts.
    pub async fn execute_with(&self, device_name: &str, action: Action, max_attempts: u32) -> Outcome {
        let policy = self.policy.with_max_attempts(max_attempts);
        let mut attempt = 0u32;

        let result = (|| {
            attempt += 1;
            let n = attempt;
            async move { self.try_once(device_name, action, n).await }
        })
        .retry(policy.backoff())
        .when(RetryPolicy::is_retryable)
        .notify(|err: &ExecError, wait: Duration| {
            warn!(device = device_name, %action, error = %err, ?wait, "attempt failed, retrying");
        })
        .await;

        match result {
            Ok(message) => {
                info!(device = device_name, %action, attempts = attempt, "{message}");
                Outcome::Done { message, attempts: attempt }
            }
            Err(error) => {
                warn!(device = device_name, %action, attempts = attempt, error = %error, "giving up");
                Outcome::Failed { error, attempts: attempt }
            }
        }
    }

    async fn try_once(&self, device_name: &str, action: Action, n: u32) -> Result<String, ExecError> {
        debug!(device = device_name, %action, attempt = n, "attempt");
        let call_timeout = self.policy.call_timeout;

        let session = match timeout(
            call_timeout.saturating_mul(2),
            self.cache.get_or_refresh(self.gateway.as_ref()),
        )
        .await
        {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => return Err(self.classify(ExecError::Session(e))),
            Err(_) => {
                return Err(ExecError::Session(GatewayError::Timeout(
                    "no session from backend".to_string(),
                )))
            }
        };

        let device = resolve_device(&session.devices, device_name)?;
        let sent = timeout(
            call_timeout,
            self.gateway.send_command(&session.credential, &device.id, action),
        )
        .await;

        match sent {
            Ok(Ok(())) => Ok(format!("Device '{}' switched {}", device.name, action)),
            // Commands routinely apply even when the confirmation never arrives.
            Ok(Err(GatewayError::Timeout(_))) | Err(_) => {
                warn!(device = %device.name, %action, "no confirmation within timeout");
                Ok(format!(
                    "Device '{}' switched {} (confirmation timed out; command likely applied)",
                    device.name, action
                ))
            }
            Ok(Err(e)) => Err(self.classify(ExecError::Command(e))),
        }
    }

    fn classify(&self, err: ExecError) -> ExecError {
        if err.is_auth() {
            self.cache.invalidate();
        }
        err
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use tokio::time::Instant;

    use super::*;
    use crate::gateway::testing::{credential, device, MockGateway};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff_unit: Duration::from_secs(15),
            call_timeout: Duration::from_secs(10),
        }
    }

    fn gateway_with(devices: Vec<crate::gateway::DeviceInfo>, auths: usize) -> MockGateway {
        let mut gw = MockGateway::new();
        gw.expect_authenticate().times(auths).returning(|| Ok(credential(1)));
        gw.expect_list_devices().times(auths).returning(move |_| Ok(devices.clone()));
        gw
    }

    fn executor(gw: MockGateway) -> (RetryingExecutor, Arc<SessionCache>) {
        let cache = Arc::new(SessionCache::new(Duration::from_secs(300)));
        (RetryingExecutor::new(Arc::new(gw), cache.clone(), policy()), cache)
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_to_matching_device() {
        let mut gw = gateway_with(vec![device("Lamp", "abc123")], 1);
        gw.expect_send_command()
            .withf(|_, id, action| id == "abc123" && *action == Action::On)
            .times(1)
            .returning(|_, _, _| Ok(()));
        let (exec, _) = executor(gw);

        let outcome = exec.execute("lamp", Action::On).await;
        assert!(outcome.is_success());
        assert_eq!(outcome.attempts(), 1);
        let msg = outcome.message();
        assert!(msg.contains("Lamp") && msg.contains("on"), "{msg}");
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_device_is_final_without_retries() {
        let mut gw = gateway_with(vec![device("Lamp", "abc123")], 1);
        gw.expect_send_command().never();
        let (exec, _) = executor(gw);

        let started = Instant::now();
        let outcome = exec.execute("Unknown", Action::Off).await;
        assert_eq!(started.elapsed(), Duration::ZERO);
        match &outcome {
            Outcome::Failed { error: ExecError::DeviceNotFound { available, .. }, attempts } => {
                assert_eq!(available, &vec!["Lamp".to_string()]);
                assert_eq!(*attempts, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(outcome.message().contains("Lamp"));
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_two_failures_with_growing_waits() {
        let mut gw = gateway_with(vec![device("Lamp", "abc123")], 1);
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let calls = calls.clone();
            let seen = seen.clone();
            gw.expect_send_command().times(3).returning(move |_, _, _| {
                seen.lock().unwrap().push(Instant::now());
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(GatewayError::Backend("device busy".into()))
                } else {
                    Ok(())
                }
            });
        }
        let (exec, _) = executor(gw);

        let outcome = exec.execute_with("Lamp", Action::On, 3).await;
        assert!(outcome.is_success());
        assert_eq!(outcome.attempts(), 3);

        let at = seen.lock().unwrap().clone();
        let first_wait = at[1] - at[0];
        let second_wait = at[2] - at[1];
        assert!(first_wait >= Duration::from_secs(15));
        assert!(first_wait <= second_wait);
    }

    #[tokio::test(start_paused = true)]
    async fn auth_failure_invalidates_session() {
        let mut gw = gateway_with(vec![device("Lamp", "abc123")], 2);
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = calls.clone();
            gw.expect_send_command().times(2).returning(move |_, _, _| {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(GatewayError::Auth("token expired".into()))
                } else {
                    Ok(())
                }
            });
        }
        let (exec, cache) = executor(gw);

        let outcome = exec.execute_with("Lamp", Action::Off, 1).await;
        assert!(!outcome.is_success());
        assert!(cache.get().is_none());

        // next access re-authenticates
        assert!(exec.execute_with("Lamp", Action::Off, 1).await.is_success());
        assert!(cache.get().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn backend_errors_keep_session_and_exhaust() {
        let mut gw = gateway_with(vec![device("Heater", "h1")], 1);
        gw.expect_send_command()
            .times(3)
            .returning(|_, _, _| Err(GatewayError::Backend("503".into())));
        let (exec, cache) = executor(gw);

        let outcome = exec.execute("heater", Action::Off).await;
        assert_eq!(outcome.attempts(), 3);
        assert!(outcome.message().contains("3 attempt"));
        assert!(outcome.message().contains("503"));
        assert!(cache.get().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn command_timeout_counts_as_likely_success() {
        let mut gw = gateway_with(vec![device("Lamp", "abc123")], 1);
        gw.expect_send_command()
            .times(1)
            .returning(|_, _, _| Err(GatewayError::Timeout("no ack".into())));
        let (exec, _) = executor(gw);

        let outcome = exec.execute("Lamp", Action::On).await;
        assert!(outcome.is_success());
        assert!(outcome.message().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_failures_are_retried() {
        let mut gw = MockGateway::new();
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = calls.clone();
            gw.expect_authenticate().times(2).returning(move || {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(GatewayError::Timeout("connect".into()))
                } else {
                    Ok(credential(2))
                }
            });
        }
        gw.expect_list_devices().times(1).returning(|_| Ok(vec![device("Lamp", "abc123")]));
        gw.expect_send_command().times(1).returning(|_, _, _| Ok(()));
        let (exec, _) = executor(gw);

        let outcome = exec.execute("Lamp", Action::On).await;
        assert!(outcome.is_success());
        assert_eq!(outcome.attempts(), 2);
    }
}
