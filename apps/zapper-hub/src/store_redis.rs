//! Redis-backed [`CoordinationStore`].
//!
//! Layout per account: a hash per device record with a presence TTL, a set of
//! device ids as the account index (kept alive twice as long so the sweep can
//! find orphaned entries), a roles hash guarded by a version field, and two
//! short-lived string keys for the arbitration lease and the cooldown marker.
//! Multi-key writes go through `MULTI`/`EXEC` pipelines; the conditional
//! mutations (heartbeat, session-guarded delete, version compare-and-set,
//! lease compare-and-delete) are Lua scripts so they stay atomic under
//! concurrent access from other hub processes.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use uuid::Uuid;
use zapper_proto::DeviceType;

use crate::store::{
    now_ms, CoordinationStore, DeviceJoinInfo, DeviceRecord, RolesState, StoreError,
};

#[derive(Clone)]
pub struct RedisStore {
    redis: ConnectionManager,
    presence_ttl: Duration,
}

impl RedisStore {
    pub async fn connect(redis_url: &str, presence_ttl: Duration) -> Result<Self, StoreError> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self { redis, presence_ttl })
    }

    fn ttl_seconds(&self) -> i64 {
        (self.presence_ttl.as_secs() as i64).max(1)
    }

    fn ttl_ms(&self) -> i64 {
        self.presence_ttl.as_millis() as i64
    }

    async fn fetch_rows(
        &self,
        account_id: &str,
        device_ids: &[String],
    ) -> Result<Vec<HashMap<String, String>>, StoreError> {
        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        for device_id in device_ids {
            pipe.cmd("HGETALL").arg(device_key(account_id, device_id));
        }
        let rows: Vec<HashMap<String, String>> = pipe.query_async(&mut conn).await?;
        Ok(rows)
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn join_device(
        &self,
        account_id: &str,
        info: DeviceJoinInfo,
    ) -> Result<DeviceRecord, StoreError> {
        let mut conn = self.redis.clone();
        let now = now_ms();
        let record = DeviceRecord {
            device_id: info.device_id,
            device_type: info.device_type,
            can_play: info.can_play,
            session_id: info.session_id,
            connected_at_ms: now,
            last_heartbeat_ms: now,
        };
        let key = device_key(account_id, &record.device_id);
        let index_key = devices_key(account_id);
        redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(&key)
            .arg("device_id")
            .arg(&record.device_id)
            .arg("device_type")
            .arg(record.device_type.as_str())
            .arg("can_play")
            .arg(record.can_play.to_string())
            .arg("session_id")
            .arg(&record.session_id)
            .arg("connected_at_ms")
            .arg(record.connected_at_ms)
            .arg("last_heartbeat_ms")
            .arg(record.last_heartbeat_ms)
            .ignore()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(self.ttl_seconds())
            .ignore()
            .cmd("SADD")
            .arg(&index_key)
            .arg(&record.device_id)
            .ignore()
            .cmd("EXPIRE")
            .arg(&index_key)
            .arg(self.ttl_seconds() * 2)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(record)
    }

    async fn heartbeat_device(
        &self,
        account_id: &str,
        device_id: &str,
    ) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let refreshed: i64 = redis::cmd("EVAL")
            .arg(HEARTBEAT_SCRIPT)
            .arg(2)
            .arg(device_key(account_id, device_id))
            .arg(devices_key(account_id))
            .arg(now_ms())
            .arg(self.ttl_seconds())
            .arg(self.ttl_seconds() * 2)
            .query_async(&mut conn)
            .await?;
        Ok(refreshed == 1)
    }

    async fn disconnect_device(&self, account_id: &str, device_id: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(device_key(account_id, device_id))
            .ignore()
            .cmd("SREM")
            .arg(devices_key(account_id))
            .arg(device_id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn disconnect_if_session(
        &self,
        account_id: &str,
        device_id: &str,
        session_id: &str,
    ) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let removed: i64 = redis::cmd("EVAL")
            .arg(DISCONNECT_IF_SESSION_SCRIPT)
            .arg(2)
            .arg(device_key(account_id, device_id))
            .arg(devices_key(account_id))
            .arg(session_id)
            .arg(device_id)
            .query_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn list_live_devices(&self, account_id: &str) -> Result<Vec<DeviceRecord>, StoreError> {
        let mut conn = self.redis.clone();
        let device_ids: Vec<String> = conn.smembers(devices_key(account_id)).await?;
        if device_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = self.fetch_rows(account_id, &device_ids).await?;
        let now = now_ms();
        let mut live = Vec::new();
        for (device_id, row) in device_ids.iter().zip(rows) {
            if row.is_empty() {
                // Index entry outlived the record; the sweep will clean it up.
                continue;
            }
            let record = parse_record(&device_key(account_id, device_id), row)?;
            if now - record.last_heartbeat_ms <= self.ttl_ms() {
                live.push(record);
            }
        }
        Ok(live)
    }

    async fn stale_devices(&self, account_id: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();
        let device_ids: Vec<String> = conn.smembers(devices_key(account_id)).await?;
        if device_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = self.fetch_rows(account_id, &device_ids).await?;
        let now = now_ms();
        let mut stale = Vec::new();
        for (device_id, row) in device_ids.into_iter().zip(rows) {
            if row.is_empty() {
                stale.push(device_id);
                continue;
            }
            let record = parse_record(&device_key(account_id, &device_id), row)?;
            if now - record.last_heartbeat_ms > self.ttl_ms() {
                stale.push(device_id);
            }
        }
        Ok(stale)
    }

    async fn accounts_with_presence(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();
        let mut cursor: u64 = 0;
        let mut accounts = Vec::new();
        loop {
            let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .cursor_arg(cursor)
                .arg("MATCH")
                .arg("zap:acct:*:devices")
                .arg("COUNT")
                .arg(100u32)
                .query_async(&mut conn)
                .await?;
            cursor = next_cursor;
            for key in keys {
                if let Some(account_id) = account_from_devices_key(&key) {
                    accounts.push(account_id.to_string());
                }
            }
            if cursor == 0 {
                break;
            }
        }
        Ok(accounts)
    }

    async fn load_roles(&self, account_id: &str) -> Result<RolesState, StoreError> {
        let mut conn = self.redis.clone();
        let key = roles_key(account_id);
        let map: HashMap<String, String> = conn.hgetall(&key).await?;
        if map.is_empty() {
            return Ok(RolesState::empty());
        }
        let version = map
            .get("version")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| StoreError::Corrupt {
                key: key.clone(),
                reason: "missing or non-numeric version".to_string(),
            })?;
        Ok(RolesState {
            version,
            player_device_id: map.get("player").filter(|v| !v.is_empty()).cloned(),
            remote_device_id: map.get("remote").filter(|v| !v.is_empty()).cloned(),
        })
    }

    async fn commit_roles(
        &self,
        account_id: &str,
        expected_version: u64,
        next: &RolesState,
    ) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let committed: i64 = redis::cmd("EVAL")
            .arg(COMMIT_ROLES_SCRIPT)
            .arg(1)
            .arg(roles_key(account_id))
            .arg(expected_version.to_string())
            .arg(next.version.to_string())
            .arg(next.player_device_id.as_deref().unwrap_or(""))
            .arg(next.remote_device_id.as_deref().unwrap_or(""))
            .query_async(&mut conn)
            .await?;
        Ok(committed == 1)
    }

    async fn acquire_lease(
        &self,
        account_id: &str,
        ttl_ms: u64,
    ) -> Result<Option<String>, StoreError> {
        let mut conn = self.redis.clone();
        let token = Uuid::new_v4().to_string();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(lease_key(account_id))
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(acquired.map(|_| token))
    }

    async fn release_lease(&self, account_id: &str, token: &str) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let released: i64 = redis::cmd("EVAL")
            .arg(RELEASE_LEASE_SCRIPT)
            .arg(1)
            .arg(lease_key(account_id))
            .arg(token)
            .query_async(&mut conn)
            .await?;
        Ok(released == 1)
    }

    async fn try_consume_cooldown(
        &self,
        account_id: &str,
        window_ms: u64,
    ) -> Result<bool, StoreError> {
        if window_ms == 0 {
            // A zero window disables the cooldown entirely.
            return Ok(true);
        }
        let mut conn = self.redis.clone();
        let opened: Option<String> = redis::cmd("SET")
            .arg(cooldown_key(account_id))
            .arg(now_ms())
            .arg("NX")
            .arg("PX")
            .arg(window_ms)
            .query_async(&mut conn)
            .await?;
        Ok(opened.is_some())
    }
}

fn parse_record(key: &str, row: HashMap<String, String>) -> Result<DeviceRecord, StoreError> {
    let corrupt = |reason: &str| StoreError::Corrupt {
        key: key.to_string(),
        reason: reason.to_string(),
    };
    let field = |name: &str| {
        row.get(name)
            .ok_or_else(|| corrupt(&format!("missing field {name}")))
    };
    let device_type: DeviceType = field("device_type")?
        .parse()
        .map_err(|_| corrupt("unknown device_type"))?;
    Ok(DeviceRecord {
        device_id: field("device_id")?.clone(),
        device_type,
        can_play: field("can_play")?.as_str() == "true",
        session_id: field("session_id")?.clone(),
        connected_at_ms: field("connected_at_ms")?
            .parse()
            .map_err(|_| corrupt("non-numeric connected_at_ms"))?,
        last_heartbeat_ms: field("last_heartbeat_ms")?
            .parse()
            .map_err(|_| corrupt("non-numeric last_heartbeat_ms"))?,
    })
}

const HEARTBEAT_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return 0
end
redis.call('HSET', KEYS[1], 'last_heartbeat_ms', ARGV[1])
redis.call('EXPIRE', KEYS[1], ARGV[2])
redis.call('EXPIRE', KEYS[2], ARGV[3])
return 1
"#;

const DISCONNECT_IF_SESSION_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'session_id') == ARGV[1] then
  redis.call('DEL', KEYS[1])
  redis.call('SREM', KEYS[2], ARGV[2])
  return 1
end
return 0
"#;

const COMMIT_ROLES_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'version')
if current == false then
  current = '0'
end
if current ~= ARGV[1] then
  return 0
end
redis.call('HSET', KEYS[1], 'version', ARGV[2], 'player', ARGV[3], 'remote', ARGV[4])
return 1
"#;

const RELEASE_LEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

fn devices_key(account_id: &str) -> String {
    format!("zap:acct:{}:devices", account_id)
}

fn device_key(account_id: &str, device_id: &str) -> String {
    format!("zap:acct:{}:dev:{}", account_id, device_id)
}

fn roles_key(account_id: &str) -> String {
    format!("zap:acct:{}:roles", account_id)
}

fn lease_key(account_id: &str) -> String {
    format!("zap:acct:{}:lock", account_id)
}

fn cooldown_key(account_id: &str) -> String {
    format!("zap:acct:{}:cooldown", account_id)
}

fn account_from_devices_key(key: &str) -> Option<&str> {
    key.strip_prefix("zap:acct:")?.strip_suffix(":devices")
}
