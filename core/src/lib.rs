#![deny(missing_docs)]
//! plug_core: delayed device-action jobs, backend session cache, retrying
//! executor, plus the shared config and logging helpers.

/// Configuration helpers (AppId, dirs, load_or_init, env overrides).
pub mod cfg;
/// Tracing/log initialization helpers.
pub mod logx;
/// Error taxonomy shared by every component.
pub mod error;
/// Job model: actions, lifecycle states, summaries.
pub mod job;
/// Contract of the remote device-control backend.
pub mod gateway;
/// Single-entry cache of the authenticated backend session.
pub mod session;
/// Linear backoff retry policy.
pub mod retry;
/// Device command execution with session reuse and retries.
pub mod executor;
/// Concurrent in-memory job registry.
pub mod registry;
/// One background timeline per scheduled job.
pub mod scheduler;
/// Caller-facing facade over registry, scheduler and session cache.
pub mod service;

pub use error::{Error, ExecError, Result};
pub use gateway::{BackendGateway, Credential, DeviceInfo, GatewayError};
pub use job::{Action, Job, JobState, JobSummary};
pub use service::{Service, Status};
