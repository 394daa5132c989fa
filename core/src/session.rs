use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::gateway::{BackendGateway, Credential, DeviceInfo, GatewayError};

/// Authenticated credential plus the inventory fetched with it.
#[derive(Debug)]
pub struct Session {
    /// Credential issued by the backend.
    pub credential: Credential,
    /// Inventory snapshot taken right after authenticating.
    pub devices: Vec<DeviceInfo>,
    /// When the snapshot was taken.
    pub fetched_at: Instant,
}

/// Holds at most one [`Session`], valid for `ttl` after it was fetched.
///
/// The entry is swapped as a whole behind a lock, so readers see either the
/// previous session, the new one, or nothing. Refreshes are serialized: a
/// caller that waited for an in-flight refresh reuses its result.
pub struct SessionCache {
    ttl: Duration,
    entry: RwLock<Option<Arc<Session>>>,
    generation: AtomicU64,
    refresh_lock: Mutex<()>,
}

impl SessionCache {
    /// Empty cache with the given time-to-live.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entry: RwLock::new(None),
            generation: AtomicU64::new(0),
            refresh_lock: Mutex::new(()),
        }
    }

    /// The cached session if present and younger than the TTL.
    pub fn get(&self) -> Option<Arc<Session>> {
        self.entry
            .read()
            .as_ref()
            .filter(|s| s.fetched_at.elapsed() < self.ttl)
            .cloned()
    }

    /// Cached session, or a fresh one if the cache is empty or stale.
    pub async fn get_or_refresh(&self, gateway: &dyn BackendGateway) -> Result<Arc<Session>, GatewayError> {
        match self.get() {
            Some(s) => Ok(s),
            None => self.refresh(gateway).await,
        }
    }

    /// Re-authenticate, reload the inventory and replace the entry.
    pub async fn refresh(&self, gateway: &dyn BackendGateway) -> Result<Arc<Session>, GatewayError> {
        let seen = self.generation.load(Ordering::Acquire);
        let _guard = self.refresh_lock.lock().await;

        if self.generation.load(Ordering::Acquire) != seen {
            if let Some(s) = self.get() {
                debug!("reusing session refreshed while waiting");
                return Ok(s);
            }
        }

        let credential = gateway.authenticate().await?;
        let devices = gateway.list_devices(&credential).await?;
        let session = Arc::new(Session { credential, devices, fetched_at: Instant::now() });

        *self.entry.write() = Some(session.clone());
        self.generation.fetch_add(1, Ordering::AcqRel);
        info!(devices = session.devices.len(), "backend session refreshed");
        Ok(session)
    }

    /// Drop the entry so the next access re-authenticates.
    pub fn invalidate(&self) {
        *self.entry.write() = None;
        self.generation.fetch_add(1, Ordering::AcqRel);
        debug!("session invalidated");
    }

    /// Manual cache reset.
    pub fn clear(&self) {
        self.invalidate();
        info!("session cache cleared");
    }
}
