use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use md5::{Digest, Md5};
use plug_core::cfg::BackendConfig;
use plug_core::{Action, BackendGateway, Credential, DeviceInfo, GatewayError};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

/// `apiStatus` codes the cloud uses for a missing, expired or foreign token.
const TOKEN_REJECTED: [i64; 4] = [1019, 1022, 1200, 1201];

/// Account client for the Meross cloud HTTP API.
pub struct MerossGateway {
    http: reqwest::Client,
    base_url: String,
    email: String,
    password: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    #[serde(default)]
    api_status: Option<i64>,
    #[serde(default)]
    info: Option<String>,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignIn {
    token: String,
    #[serde(default)]
    key: String,
    user_id: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DevList {
    Bare(Vec<RawDevice>),
    Wrapped { list: Vec<RawDevice> },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDevice {
    uuid: String,
    #[serde(default)]
    dev_name: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    device_type: Option<String>,
    #[serde(default)]
    online_status: i64,
}

impl From<RawDevice> for DeviceInfo {
    fn from(d: RawDevice) -> Self {
        DeviceInfo {
            name: d.dev_name.or(d.name).unwrap_or_else(|| "Unknown".to_string()),
            id: d.uuid,
            kind: d.device_type.unwrap_or_else(|| "Unknown".to_string()),
            online: d.online_status == 1,
        }
    }
}

fn md5_hex(s: &str) -> String {
    hex::encode(Md5::digest(s.as_bytes()))
}

/// Sign-in signature: `md5(email + md5(password) + timestamp + nonce)`.
fn sign_in_signature(email: &str, password_md5: &str, timestamp: i64, nonce: &str) -> String {
    md5_hex(&format!("{email}{password_md5}{timestamp}{nonce}"))
}

fn transport_error(e: reqwest::Error) -> GatewayError {
    if e.is_timeout() {
        GatewayError::Timeout(e.to_string())
    } else {
        GatewayError::Backend(e.to_string())
    }
}

fn check_status(status: StatusCode) -> Result<(), GatewayError> {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(GatewayError::Auth(format!("http {status}"))),
        s if s.is_success() => Ok(()),
        s => Err(GatewayError::Backend(format!("http {s}"))),
    }
}

fn check_envelope(env: &Envelope) -> Result<(), GatewayError> {
    let info = env.info.clone().unwrap_or_default();
    match env.api_status {
        None | Some(0) => Ok(()),
        Some(code) if TOKEN_REJECTED.contains(&code) => Err(GatewayError::Auth(format!("apiStatus {code} {info}"))),
        Some(code) => Err(GatewayError::Backend(format!("apiStatus {code} {info}"))),
    }
}

fn parse_devices(data: Value) -> Result<Vec<DeviceInfo>, GatewayError> {
    let list: DevList = serde_json::from_value(data)
        .map_err(|e| GatewayError::Backend(format!("unexpected device list: {e}")))?;
    let raw = match list {
        DevList::Bare(v) | DevList::Wrapped { list: v } => v,
    };
    Ok(raw.into_iter().map(DeviceInfo::from).collect())
}

impl MerossGateway {
    /// Client for the account in `cfg`; every request is bounded by `call_timeout`.
    pub fn from_config(cfg: &BackendConfig, call_timeout: Duration) -> Result<Self> {
        let (Some(email), Some(password)) = (cfg.email.clone(), cfg.password.clone()) else {
            anyhow::bail!("backend account not configured (set PLUGTIMER_EMAIL and PLUGTIMER_PASSWORD)");
        };
        let http = reqwest::Client::builder()
            .timeout(call_timeout)
            .build()
            .context("build http client")?;
        Ok(Self { http, base_url: cfg.base_url.trim_end_matches('/').to_string(), email, password })
    }

    async fn post(&self, path: &str, token: Option<&str>, body: Value) -> Result<Envelope, GatewayError> {
        let url = format!("{}/{}", self.base_url, path);
        debug!(%url, "backend request");
        let mut req = self.http.post(&url).json(&body);
        if let Some(token) = token {
            req = req.header(reqwest::header::AUTHORIZATION, token);
        }
        let resp = req.send().await.map_err(transport_error)?;
        check_status(resp.status())?;
        let env: Envelope = resp.json().await.map_err(transport_error)?;
        check_envelope(&env)?;
        Ok(env)
    }
}

#[async_trait]
impl BackendGateway for MerossGateway {
    async fn authenticate(&self) -> Result<Credential, GatewayError> {
        let timestamp = Utc::now().timestamp();
        let nonce: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
        let password = md5_hex(&self.password);
        let body = json!({
            "email": self.email,
            "password": password,
            "timestamp": timestamp,
            "nonce": nonce,
            "sign": sign_in_signature(&self.email, &password, timestamp, &nonce),
        });

        let env = self.post("Auth/signIn", None, body).await.map_err(|e| match e {
            // any API-level refusal of a sign-in is a credential problem
            GatewayError::Backend(m) if m.starts_with("apiStatus") => GatewayError::Auth(m),
            other => other,
        })?;
        let data: SignIn = serde_json::from_value(env.data)
            .map_err(|_| GatewayError::Auth(format!("sign-in refused: {}", env.info.unwrap_or_default())))?;
        Ok(Credential { token: data.token, key: data.key, user_id: data.user_id })
    }

    async fn list_devices(&self, credential: &Credential) -> Result<Vec<DeviceInfo>, GatewayError> {
        let body = json!({ "timestamp": Utc::now().timestamp(), "userId": credential.user_id });
        let env = self.post("Device/devList", Some(&credential.token), body).await?;
        parse_devices(env.data)
    }

    async fn send_command(
        &self,
        credential: &Credential,
        device_id: &str,
        action: Action,
    ) -> Result<(), GatewayError> {
        let onoff: u8 = if action == Action::On { 1 } else { 0 };
        let body = json!({
            "header": {
                "messageId": Uuid::new_v4().simple().to_string(),
                "namespace": "Appliance.Control.ToggleX",
                "method": "SET",
                "payloadVersion": 1,
                "timestamp": Utc::now().timestamp(),
                "from": "",
                "sign": "",
            },
            "payload": {
                "deviceId": device_id,
                "channel": 0,
                "onoff": onoff,
            },
        });
        self.post("Appliance.Control.ToggleX", Some(&credential.token), body).await?;
        Ok(())
    }
}
