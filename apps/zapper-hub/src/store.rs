//! Coordination store: presence registry, role state, arbitration lease, and
//! cooldown tracker behind one async trait.
//!
//! Redis is the production backend ([`crate::store_redis::RedisStore`]); the
//! in-memory implementation here mirrors its semantics for tests and
//! single-process development, including lazy TTL expiry at read time.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;
use zapper_proto::DeviceType;

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// One live device of an account, as tracked by the presence registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub device_id: String,
    pub device_type: DeviceType,
    pub can_play: bool,
    /// Transport session currently backing this device. Changes on reconnect.
    pub session_id: String,
    pub connected_at_ms: i64,
    pub last_heartbeat_ms: i64,
}

/// Input to a presence join; the store stamps the timestamps.
#[derive(Debug, Clone)]
pub struct DeviceJoinInfo {
    pub device_id: String,
    pub device_type: DeviceType,
    pub can_play: bool,
    pub session_id: String,
}

/// Durable role assignment for one account. Mutated only through
/// [`CoordinationStore::commit_roles`] under the arbitration lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolesState {
    pub version: u64,
    pub player_device_id: Option<String>,
    pub remote_device_id: Option<String>,
}

impl RolesState {
    pub fn empty() -> Self {
        Self {
            version: 0,
            player_device_id: None,
            remote_device_id: None,
        }
    }

    pub fn holds(&self, device_id: &str) -> bool {
        self.player_device_id.as_deref() == Some(device_id)
            || self.remote_device_id.as_deref() == Some(device_id)
    }

    pub fn label(&self) -> &'static str {
        match (
            self.player_device_id.is_some(),
            self.remote_device_id.is_some(),
        ) {
            (false, false) => "empty",
            (true, false) => "player_only",
            (false, true) => "remote_only",
            (true, true) => "both",
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis command failed: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("corrupt record at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Single source of truth for presence, role state, the per-account
/// arbitration lease, and the reassignment cooldown.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Upsert a device record, stamping both timestamps to now and resetting
    /// the presence TTL. Rejoining refreshes rather than duplicates.
    async fn join_device(
        &self,
        account_id: &str,
        info: DeviceJoinInfo,
    ) -> Result<DeviceRecord, StoreError>;

    /// Extend a known device's TTL. Returns false for unknown (or already
    /// expired) devices; the caller should ask the device to re-join.
    async fn heartbeat_device(&self, account_id: &str, device_id: &str)
        -> Result<bool, StoreError>;

    /// Remove a device record immediately.
    async fn disconnect_device(&self, account_id: &str, device_id: &str) -> Result<(), StoreError>;

    /// Remove a device record only if it still belongs to the given transport
    /// session. A close arriving after the device re-joined on a newer
    /// connection must not delete the fresh record.
    async fn disconnect_if_session(
        &self,
        account_id: &str,
        device_id: &str,
        session_id: &str,
    ) -> Result<bool, StoreError>;

    /// Non-expired devices for the account. Expiry is evaluated lazily here;
    /// the periodic sweep handles active reaping.
    async fn list_live_devices(&self, account_id: &str) -> Result<Vec<DeviceRecord>, StoreError>;

    /// Device ids still indexed for the account whose backing record is
    /// missing or expired. Input for the sweep.
    async fn stale_devices(&self, account_id: &str) -> Result<Vec<String>, StoreError>;

    /// Accounts with at least one tracked device, for sweep iteration.
    async fn accounts_with_presence(&self) -> Result<Vec<String>, StoreError>;

    async fn load_roles(&self, account_id: &str) -> Result<RolesState, StoreError>;

    /// Optimistic commit: writes `next` only if the stored version still
    /// equals `expected_version`. Returns false on a version conflict.
    async fn commit_roles(
        &self,
        account_id: &str,
        expected_version: u64,
        next: &RolesState,
    ) -> Result<bool, StoreError>;

    /// Set-if-absent lease with expiry. Returns the holder token on success,
    /// None while another holder is alive.
    async fn acquire_lease(
        &self,
        account_id: &str,
        ttl_ms: u64,
    ) -> Result<Option<String>, StoreError>;

    /// Compare-and-delete release. Returns false if the lease already expired
    /// or belongs to someone else.
    async fn release_lease(&self, account_id: &str, token: &str) -> Result<bool, StoreError>;

    /// Returns true and opens a new cooldown window only if none is active.
    /// A closed window is left untouched.
    async fn try_consume_cooldown(
        &self,
        account_id: &str,
        window_ms: u64,
    ) -> Result<bool, StoreError>;
}

struct MemoryLease {
    token: String,
    expires_at_ms: i64,
}

#[derive(Default)]
struct MemoryInner {
    devices: HashMap<String, HashMap<String, DeviceRecord>>,
    roles: HashMap<String, RolesState>,
    leases: HashMap<String, MemoryLease>,
    cooldowns: HashMap<String, i64>,
}

/// In-process [`CoordinationStore`] used by tests and as the development
/// fallback when no Redis URL is configured. Not shared across processes, so
/// the lease only serializes arbitration within this process.
pub struct MemoryStore {
    presence_ttl: Duration,
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new(presence_ttl: Duration) -> Self {
        Self {
            presence_ttl,
            inner: Mutex::new(MemoryInner::default()),
        }
    }

    fn expired(&self, record: &DeviceRecord, now: i64) -> bool {
        now - record.last_heartbeat_ms > self.presence_ttl.as_millis() as i64
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn join_device(
        &self,
        account_id: &str,
        info: DeviceJoinInfo,
    ) -> Result<DeviceRecord, StoreError> {
        let now = now_ms();
        let record = DeviceRecord {
            device_id: info.device_id.clone(),
            device_type: info.device_type,
            can_play: info.can_play,
            session_id: info.session_id,
            connected_at_ms: now,
            last_heartbeat_ms: now,
        };
        let mut inner = self.inner.lock().await;
        inner
            .devices
            .entry(account_id.to_string())
            .or_default()
            .insert(info.device_id, record.clone());
        Ok(record)
    }

    async fn heartbeat_device(
        &self,
        account_id: &str,
        device_id: &str,
    ) -> Result<bool, StoreError> {
        let now = now_ms();
        let mut inner = self.inner.lock().await;
        let Some(devices) = inner.devices.get_mut(account_id) else {
            return Ok(false);
        };
        match devices.get_mut(device_id) {
            Some(record) if now - record.last_heartbeat_ms <= self.presence_ttl.as_millis() as i64 => {
                record.last_heartbeat_ms = now;
                Ok(true)
            }
            Some(_) => {
                // Matches Redis, where the TTL would have deleted the key.
                devices.remove(device_id);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn disconnect_device(&self, account_id: &str, device_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(devices) = inner.devices.get_mut(account_id) {
            devices.remove(device_id);
            if devices.is_empty() {
                inner.devices.remove(account_id);
            }
        }
        Ok(())
    }

    async fn disconnect_if_session(
        &self,
        account_id: &str,
        device_id: &str,
        session_id: &str,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(devices) = inner.devices.get_mut(account_id) else {
            return Ok(false);
        };
        let matches = devices
            .get(device_id)
            .map(|record| record.session_id == session_id)
            .unwrap_or(false);
        if matches {
            devices.remove(device_id);
            if devices.is_empty() {
                inner.devices.remove(account_id);
            }
        }
        Ok(matches)
    }

    async fn list_live_devices(&self, account_id: &str) -> Result<Vec<DeviceRecord>, StoreError> {
        let now = now_ms();
        let inner = self.inner.lock().await;
        let Some(devices) = inner.devices.get(account_id) else {
            return Ok(Vec::new());
        };
        Ok(devices
            .values()
            .filter(|record| !self.expired(record, now))
            .cloned()
            .collect())
    }

    async fn stale_devices(&self, account_id: &str) -> Result<Vec<String>, StoreError> {
        let now = now_ms();
        let inner = self.inner.lock().await;
        let Some(devices) = inner.devices.get(account_id) else {
            return Ok(Vec::new());
        };
        Ok(devices
            .values()
            .filter(|record| self.expired(record, now))
            .map(|record| record.device_id.clone())
            .collect())
    }

    async fn accounts_with_presence(&self) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .devices
            .iter()
            .filter(|(_, devices)| !devices.is_empty())
            .map(|(account_id, _)| account_id.clone())
            .collect())
    }

    async fn load_roles(&self, account_id: &str) -> Result<RolesState, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .roles
            .get(account_id)
            .cloned()
            .unwrap_or_else(RolesState::empty))
    }

    async fn commit_roles(
        &self,
        account_id: &str,
        expected_version: u64,
        next: &RolesState,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let current_version = inner
            .roles
            .get(account_id)
            .map(|state| state.version)
            .unwrap_or(0);
        if current_version != expected_version {
            return Ok(false);
        }
        inner.roles.insert(account_id.to_string(), next.clone());
        Ok(true)
    }

    async fn acquire_lease(
        &self,
        account_id: &str,
        ttl_ms: u64,
    ) -> Result<Option<String>, StoreError> {
        let now = now_ms();
        let mut inner = self.inner.lock().await;
        if let Some(lease) = inner.leases.get(account_id) {
            if lease.expires_at_ms > now {
                return Ok(None);
            }
        }
        let token = Uuid::new_v4().to_string();
        inner.leases.insert(
            account_id.to_string(),
            MemoryLease {
                token: token.clone(),
                expires_at_ms: now + ttl_ms as i64,
            },
        );
        Ok(Some(token))
    }

    async fn release_lease(&self, account_id: &str, token: &str) -> Result<bool, StoreError> {
        let now = now_ms();
        let mut inner = self.inner.lock().await;
        let matches = inner
            .leases
            .get(account_id)
            .map(|lease| lease.token == token && lease.expires_at_ms > now)
            .unwrap_or(false);
        if matches {
            inner.leases.remove(account_id);
        }
        Ok(matches)
    }

    async fn try_consume_cooldown(
        &self,
        account_id: &str,
        window_ms: u64,
    ) -> Result<bool, StoreError> {
        let now = now_ms();
        let mut inner = self.inner.lock().await;
        if let Some(&closed_until) = inner.cooldowns.get(account_id) {
            if closed_until > now {
                return Ok(false);
            }
        }
        inner
            .cooldowns
            .insert(account_id.to_string(), now + window_ms as i64);
        Ok(true)
    }
}
