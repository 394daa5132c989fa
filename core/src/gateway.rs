use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ExecError;
use crate::job::Action;

/// Authenticated backend session material. Opaque to the core.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credential {
    /// Bearer token.
    pub token: String,
    /// Signing key paired with the token.
    pub key: String,
    /// Account id the token was issued for.
    pub user_id: String,
}

/// One entry of the backend's device inventory.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Display name, matched against caller-supplied names.
    pub name: String,
    /// Backend device id (uuid).
    pub id: String,
    /// Device model/type.
    #[serde(rename = "type")]
    pub kind: String,
    /// Whether the backend currently sees the device online.
    pub online: bool,
}

/// Failures reported by a [`BackendGateway`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// Credential rejected or expired.
    #[error("authentication rejected: {0}")]
    Auth(String),
    /// No answer within the allotted time.
    #[error("timed out: {0}")]
    Timeout(String),
    /// Any other backend-reported failure.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Remote device-control backend.
///
/// Implementations own the account credentials, so `authenticate` takes none.
#[async_trait]
pub trait BackendGateway: Send + Sync {
    /// Sign in and obtain a fresh credential.
    async fn authenticate(&self) -> Result<Credential, GatewayError>;

    /// Device inventory visible to `credential`, in backend order.
    async fn list_devices(&self, credential: &Credential) -> Result<Vec<DeviceInfo>, GatewayError>;

    /// Switch `device_id` to `action`.
    async fn send_command(
        &self,
        credential: &Credential,
        device_id: &str,
        action: Action,
    ) -> Result<(), GatewayError>;
}

/// First device whose name contains `requested`, case-insensitively.
pub fn resolve_device<'a>(devices: &'a [DeviceInfo], requested: &str) -> Result<&'a DeviceInfo, ExecError> {
    let needle = requested.to_lowercase();
    devices
        .iter()
        .find(|d| d.name.to_lowercase().contains(&needle))
        .ok_or_else(|| ExecError::DeviceNotFound {
            requested: requested.to_string(),
            available: devices.iter().map(|d| d.name.clone()).collect(),
        })
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    mockall::mock! {
        pub Gateway {}

        #[async_trait]
        impl BackendGateway for Gateway {
            async fn authenticate(&self) -> Result<Credential, GatewayError>;
            async fn list_devices(&self, credential: &Credential) -> Result<Vec<DeviceInfo>, GatewayError>;
            async fn send_command(
                &self,
                credential: &Credential,
                device_id: &str,
                action: Action,
            ) -> Result<(), GatewayError>;
        }
    }

    pub fn credential(n: u32) -> Credential {
        Credential { token: format!("tok{n}"), key: format!("key{n}"), user_id: "u1".into() }
    }

    pub fn device(name: &str, id: &str) -> DeviceInfo {
        DeviceInfo { name: name.into(), id: id.into(), kind: "mss310".into(), online: true }
    }
}
