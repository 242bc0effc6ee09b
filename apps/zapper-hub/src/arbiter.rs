//! Role arbitration sequencing.
//!
//! Every role-affecting event flows through [`RoleArbiter`]: presence is
//! refreshed first, then the per-account lease is taken, the engine passes
//! run, a version-checked commit persists the outcome, the lease is released,
//! and a committed transition is broadcast to the account's devices. The
//! cooldown gates only the discretionary pass; vacating a dead device's role
//! always goes through.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use rand::Rng;
use tracing::{debug, info, warn};
use zapper_proto::{DesiredRole, RoleName, RolesUpdatePayload, ServerMessage};

use crate::broadcast::Broadcaster;
use crate::config::{
    DEFAULT_LOCK_RETRY_ATTEMPTS, DEFAULT_LOCK_RETRY_DELAY_MS, DEFAULT_ROLE_COOLDOWN_MS,
    DEFAULT_ROLE_LOCK_TTL_MS,
};
use crate::roles::{self, RoleEvent};
use crate::store::{CoordinationStore, DeviceJoinInfo, DeviceRecord, RolesState, StoreError};

#[derive(Debug, Clone)]
pub struct ArbiterConfig {
    pub cooldown_window: Duration,
    pub lease_ttl: Duration,
    pub lease_retry_attempts: u32,
    pub lease_retry_delay: Duration,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            cooldown_window: Duration::from_millis(DEFAULT_ROLE_COOLDOWN_MS),
            lease_ttl: Duration::from_millis(DEFAULT_ROLE_LOCK_TTL_MS),
            lease_retry_attempts: DEFAULT_LOCK_RETRY_ATTEMPTS,
            lease_retry_delay: Duration::from_millis(DEFAULT_LOCK_RETRY_DELAY_MS),
        }
    }
}

/// How an event came out of arbitration.
#[derive(Debug, Clone, PartialEq)]
pub enum EventOutcome {
    /// A transition was committed and broadcast.
    Committed(RolesUpdatePayload),
    NoChange,
    /// The device has no live presence record; it should re-join.
    UnknownDevice,
    /// The arbitration lease stayed busy; the event was dropped and the next
    /// heartbeat or sweep tick will re-evaluate.
    Dropped,
}

#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub record: DeviceRecord,
    /// Set when the join itself committed a transition (bootstrap).
    pub committed: Option<RolesUpdatePayload>,
    /// Current state for the joining device's catch-up unicast.
    pub snapshot: RolesUpdatePayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectCause {
    Graceful,
    Expired,
}

impl DisconnectCause {
    pub fn as_str(self) -> &'static str {
        match self {
            DisconnectCause::Graceful => "graceful",
            DisconnectCause::Expired => "expired",
        }
    }
}

pub struct RoleArbiter {
    store: Arc<dyn CoordinationStore>,
    broadcaster: Arc<dyn Broadcaster>,
    config: ArbiterConfig,
}

impl RoleArbiter {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        broadcaster: Arc<dyn Broadcaster>,
        config: ArbiterConfig,
    ) -> Self {
        Self {
            store,
            broadcaster,
            config,
        }
    }

    pub async fn device_join(
        &self,
        account_id: &str,
        info: DeviceJoinInfo,
    ) -> Result<JoinOutcome, StoreError> {
        let record = self.store.join_device(account_id, info).await?;
        info!(
            account = %account_id,
            device = %record.device_id,
            device_type = %record.device_type,
            can_play = record.can_play,
            "device joined"
        );
        let outcome = self
            .arbitrate(
                account_id,
                RoleEvent::Joined {
                    device_id: record.device_id.clone(),
                },
            )
            .await?;
        let committed = match outcome {
            EventOutcome::Committed(payload) => Some(payload),
            _ => None,
        };
        let snapshot = match &committed {
            Some(payload) => payload.clone(),
            None => self.snapshot(account_id).await?,
        };
        Ok(JoinOutcome {
            record,
            committed,
            snapshot,
        })
    }

    pub async fn device_heartbeat(
        &self,
        account_id: &str,
        device_id: &str,
    ) -> Result<EventOutcome, StoreError> {
        if !self.store.heartbeat_device(account_id, device_id).await? {
            debug!(account = %account_id, device = %device_id, "heartbeat from unknown device");
            return Ok(EventOutcome::UnknownDevice);
        }
        // A presence refresh alone does not take the lease; arbitration runs
        // only if some role holder has actually gone missing.
        let current = self.store.load_roles(account_id).await?;
        let live = self.store.list_live_devices(account_id).await?;
        if roles::vacate_absent(&current, &live).is_none() {
            return Ok(EventOutcome::NoChange);
        }
        self.arbitrate(
            account_id,
            RoleEvent::Heartbeat {
                device_id: device_id.to_string(),
            },
        )
        .await
    }

    pub async fn role_request(
        &self,
        account_id: &str,
        device_id: &str,
        desired: DesiredRole,
    ) -> Result<EventOutcome, StoreError> {
        if !self.is_live(account_id, device_id).await? {
            debug!(account = %account_id, device = %device_id, "role request from unknown device");
            return Ok(EventOutcome::UnknownDevice);
        }
        self.arbitrate(
            account_id,
            RoleEvent::Requested {
                device_id: device_id.to_string(),
                desired,
            },
        )
        .await
    }

    pub async fn role_release(
        &self,
        account_id: &str,
        device_id: &str,
        role: DesiredRole,
    ) -> Result<EventOutcome, StoreError> {
        if !self.is_live(account_id, device_id).await? {
            debug!(account = %account_id, device = %device_id, "role release from unknown device");
            return Ok(EventOutcome::UnknownDevice);
        }
        self.arbitrate(
            account_id,
            RoleEvent::Released {
                device_id: device_id.to_string(),
                role,
            },
        )
        .await
    }

    /// Remove a device and re-arbitrate. Used by the expiry sweep and by
    /// administrative teardown; transport closes go through
    /// [`Self::transport_closed`] instead.
    pub async fn device_disconnect(
        &self,
        account_id: &str,
        device_id: &str,
        cause: DisconnectCause,
    ) -> Result<EventOutcome, StoreError> {
        self.store.disconnect_device(account_id, device_id).await?;
        info!(
            account = %account_id,
            device = %device_id,
            cause = cause.as_str(),
            "device disconnected"
        );
        self.arbitrate(
            account_id,
            RoleEvent::Disconnected {
                device_id: device_id.to_string(),
            },
        )
        .await
    }

    /// Session-guarded disconnect for a closing socket. A close that lost a
    /// race against the device's re-join is ignored.
    pub async fn transport_closed(
        &self,
        account_id: &str,
        device_id: &str,
        session_id: &str,
    ) -> Result<EventOutcome, StoreError> {
        if !self
            .store
            .disconnect_if_session(account_id, device_id, session_id)
            .await?
        {
            debug!(account = %account_id, device = %device_id, "stale transport close ignored");
            return Ok(EventOutcome::NoChange);
        }
        info!(
            account = %account_id,
            device = %device_id,
            cause = DisconnectCause::Graceful.as_str(),
            "device disconnected"
        );
        self.arbitrate(
            account_id,
            RoleEvent::Disconnected {
                device_id: device_id.to_string(),
            },
        )
        .await
    }

    /// Current state as a broadcast-shaped payload; read-only, no lease.
    pub async fn snapshot(&self, account_id: &str) -> Result<RolesUpdatePayload, StoreError> {
        let state = self.store.load_roles(account_id).await?;
        let live = self.store.list_live_devices(account_id).await?;
        Ok(build_update(&state, &live))
    }

    async fn is_live(&self, account_id: &str, device_id: &str) -> Result<bool, StoreError> {
        let live = self.store.list_live_devices(account_id).await?;
        Ok(live.iter().any(|record| record.device_id == device_id))
    }

    async fn arbitrate(
        &self,
        account_id: &str,
        event: RoleEvent,
    ) -> Result<EventOutcome, StoreError> {
        let Some(token) = self.acquire_lease_with_retry(account_id).await? else {
            counter!("zapper_hub_lease_give_ups_total", 1);
            warn!(account = %account_id, event = event.kind(), "arbitration lease busy, dropping event");
            return Ok(EventOutcome::Dropped);
        };
        let decided = self.decide_and_commit(account_id, &event).await;
        match self.store.release_lease(account_id, &token).await {
            Ok(true) => {}
            Ok(false) => warn!(account = %account_id, "arbitration lease expired before release"),
            Err(err) => warn!(account = %account_id, error = %err, "failed to release arbitration lease"),
        }
        match decided? {
            Some(payload) => {
                counter!("zapper_hub_role_transitions_total", 1, "event" => event.kind());
                self.broadcaster
                    .broadcast(account_id, &ServerMessage::RolesUpdate(payload.clone()))
                    .await;
                Ok(EventOutcome::Committed(payload))
            }
            None => Ok(EventOutcome::NoChange),
        }
    }

    async fn decide_and_commit(
        &self,
        account_id: &str,
        event: &RoleEvent,
    ) -> Result<Option<RolesUpdatePayload>, StoreError> {
        // Consult the cooldown at most once per arbitration so a commit retry
        // cannot be suppressed by the window it opened itself.
        let mut gate: Option<bool> = None;
        for attempt in 0..2u32 {
            let current = self.store.load_roles(account_id).await?;
            let live = self.store.list_live_devices(account_id).await?;
            let vacated = roles::vacate_absent(&current, &live);
            let base = vacated.clone().unwrap_or_else(|| current.clone());
            let mut next = vacated;
            if let Some(wanted) = roles::apply_discretionary(&base, &live, event) {
                let open = match gate {
                    Some(open) => open,
                    None => {
                        let window_ms = self.config.cooldown_window.as_millis() as u64;
                        let open = self.store.try_consume_cooldown(account_id, window_ms).await?;
                        gate = Some(open);
                        open
                    }
                };
                if open {
                    next = Some(wanted);
                } else {
                    counter!("zapper_hub_cooldown_suppressed_total", 1);
                    debug!(
                        account = %account_id,
                        event = event.kind(),
                        "cooldown active, discretionary change suppressed"
                    );
                }
            }
            let Some(mut next_state) = next else {
                return Ok(None);
            };
            next_state.version = current.version + 1;
            if self
                .store
                .commit_roles(account_id, current.version, &next_state)
                .await?
            {
                info!(
                    account = %account_id,
                    version = next_state.version,
                    state = next_state.label(),
                    event = event.kind(),
                    "role transition committed"
                );
                return Ok(Some(build_update(&next_state, &live)));
            }
            warn!(account = %account_id, attempt, "role commit hit a version conflict");
        }
        warn!(account = %account_id, event = event.kind(), "role transition abandoned after version conflicts");
        Ok(None)
    }

    async fn acquire_lease_with_retry(
        &self,
        account_id: &str,
    ) -> Result<Option<String>, StoreError> {
        let ttl_ms = self.config.lease_ttl.as_millis() as u64;
        for attempt in 0..self.config.lease_retry_attempts {
            if let Some(token) = self.store.acquire_lease(account_id, ttl_ms).await? {
                return Ok(Some(token));
            }
            if attempt + 1 == self.config.lease_retry_attempts {
                break;
            }
            counter!("zapper_hub_lease_retries_total", 1);
            let base_ms = self.config.lease_retry_delay.as_millis() as u64;
            let jitter = rand::thread_rng().gen_range(0..=base_ms / 2);
            tokio::time::sleep(Duration::from_millis(base_ms + jitter)).await;
        }
        Ok(None)
    }
}

fn build_update(state: &RolesState, live: &[DeviceRecord]) -> RolesUpdatePayload {
    let mut assigned = Vec::new();
    if state.player_device_id.is_some() {
        assigned.push(RoleName::Player);
    }
    if state.remote_device_id.is_some() {
        assigned.push(RoleName::Remote);
    }
    let player_socket_id = state.player_device_id.as_deref().and_then(|player| {
        live.iter()
            .find(|record| record.device_id == player)
            .map(|record| record.session_id.clone())
    });
    RolesUpdatePayload {
        version: state.version,
        player_device_id: state.player_device_id.clone(),
        remote_device_id: state.remote_device_id.clone(),
        roles: assigned,
        player_socket_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use tokio::sync::Mutex;
    use zapper_proto::DeviceType;

    #[derive(Default)]
    struct RecordingBroadcaster {
        sent: Mutex<Vec<ServerMessage>>,
    }

    impl RecordingBroadcaster {
        async fn updates(&self) -> Vec<RolesUpdatePayload> {
            self.sent
                .lock()
                .await
                .iter()
                .filter_map(|message| match message {
                    ServerMessage::RolesUpdate(payload) => Some(payload.clone()),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl Broadcaster for RecordingBroadcaster {
        async fn broadcast(&self, _account_id: &str, message: &ServerMessage) -> usize {
            self.sent.lock().await.push(message.clone());
            1
        }
    }

    fn join_info(device_id: &str, can_play: bool, session_id: &str) -> DeviceJoinInfo {
        DeviceJoinInfo {
            device_id: device_id.to_string(),
            device_type: DeviceType::Web,
            can_play,
            session_id: session_id.to_string(),
        }
    }

    fn fixture(cooldown_window: Duration) -> (Arc<MemoryStore>, Arc<RecordingBroadcaster>, RoleArbiter) {
        let store = Arc::new(MemoryStore::new(Duration::from_secs(30)));
        let broadcaster = Arc::new(RecordingBroadcaster::default());
        let arbiter = RoleArbiter::new(
            store.clone(),
            broadcaster.clone(),
            ArbiterConfig {
                cooldown_window,
                lease_ttl: Duration::from_millis(5_000),
                lease_retry_attempts: 2,
                lease_retry_delay: Duration::from_millis(10),
            },
        );
        (store, broadcaster, arbiter)
    }

    #[tokio::test]
    async fn bootstrap_join_commits_and_broadcasts() {
        let (_store, broadcaster, arbiter) = fixture(Duration::ZERO);
        let outcome = arbiter
            .device_join("acct", join_info("tv-1", true, "s1"))
            .await
            .unwrap();

        let committed = outcome.committed.expect("bootstrap should commit");
        assert_eq!(committed.version, 1);
        assert_eq!(committed.player_device_id.as_deref(), Some("tv-1"));
        assert_eq!(committed.player_socket_id.as_deref(), Some("s1"));
        assert_eq!(committed.roles, vec![RoleName::Player]);
        assert_eq!(outcome.snapshot, committed);
        assert_eq!(broadcaster.updates().await.len(), 1);
    }

    #[tokio::test]
    async fn rejoin_is_idempotent() {
        let (_store, broadcaster, arbiter) = fixture(Duration::ZERO);
        arbiter
            .device_join("acct", join_info("tv-1", true, "s1"))
            .await
            .unwrap();
        let outcome = arbiter
            .device_join("acct", join_info("tv-1", true, "s2"))
            .await
            .unwrap();

        assert!(outcome.committed.is_none());
        assert_eq!(outcome.snapshot.version, 1);
        // The rejoin refreshed the session, so the snapshot tracks it.
        assert_eq!(outcome.snapshot.player_socket_id.as_deref(), Some("s2"));
        assert_eq!(broadcaster.updates().await.len(), 1);
    }

    #[tokio::test]
    async fn request_fills_open_slot_without_preempting() {
        let (_store, broadcaster, arbiter) = fixture(Duration::ZERO);
        arbiter
            .device_join("acct", join_info("phone-1", false, "s1"))
            .await
            .unwrap();
        arbiter
            .device_join("acct", join_info("tv-1", true, "s2"))
            .await
            .unwrap();

        let outcome = arbiter
            .role_request("acct", "tv-1", DesiredRole::Player)
            .await
            .unwrap();
        let payload = match outcome {
            EventOutcome::Committed(payload) => payload,
            other => panic!("expected commit, got {other:?}"),
        };
        assert_eq!(payload.version, 2);
        assert_eq!(payload.player_device_id.as_deref(), Some("tv-1"));
        assert_eq!(payload.remote_device_id.as_deref(), Some("phone-1"));
        assert_eq!(payload.player_socket_id.as_deref(), Some("s2"));

        // The remote slot is already held, so the request is a no-op.
        let denied = arbiter
            .role_request("acct", "phone-1", DesiredRole::Remote)
            .await
            .unwrap();
        assert_eq!(denied, EventOutcome::NoChange);
        assert_eq!(broadcaster.updates().await.len(), 2);
    }

    #[tokio::test]
    async fn cooldown_suppresses_discretionary_changes() {
        let (_store, broadcaster, arbiter) = fixture(Duration::from_secs(10));
        arbiter
            .device_join("acct", join_info("phone-1", false, "s1"))
            .await
            .unwrap();
        arbiter
            .device_join("acct", join_info("tv-1", true, "s2"))
            .await
            .unwrap();

        // The bootstrap consumed the window; this request falls inside it.
        let outcome = arbiter
            .role_request("acct", "tv-1", DesiredRole::Player)
            .await
            .unwrap();
        assert_eq!(outcome, EventOutcome::NoChange);
        let snapshot = arbiter.snapshot("acct").await.unwrap();
        assert_eq!(snapshot.version, 1);
        assert_eq!(snapshot.player_device_id, None);
        assert_eq!(broadcaster.updates().await.len(), 1);
    }

    #[tokio::test]
    async fn vacate_bypasses_the_cooldown() {
        let (_store, broadcaster, arbiter) = fixture(Duration::from_secs(10));
        arbiter
            .device_join("acct", join_info("tv-1", true, "s1"))
            .await
            .unwrap();
        arbiter
            .device_join("acct", join_info("phone-1", false, "s2"))
            .await
            .unwrap();

        let outcome = arbiter
            .device_disconnect("acct", "tv-1", DisconnectCause::Expired)
            .await
            .unwrap();
        let payload = match outcome {
            EventOutcome::Committed(payload) => payload,
            other => panic!("expected vacate commit, got {other:?}"),
        };
        assert_eq!(payload.version, 2);
        assert_eq!(payload.player_device_id, None);
        assert!(payload.roles.is_empty());
        assert_eq!(broadcaster.updates().await.len(), 2);
    }

    #[tokio::test]
    async fn busy_lease_drops_the_event() {
        let (store, broadcaster, arbiter) = fixture(Duration::ZERO);
        arbiter
            .device_join("acct", join_info("tv-1", true, "s1"))
            .await
            .unwrap();

        let _held = store.acquire_lease("acct", 60_000).await.unwrap().unwrap();
        let outcome = arbiter
            .role_request("acct", "tv-1", DesiredRole::Remote)
            .await
            .unwrap();
        assert_eq!(outcome, EventOutcome::Dropped);
        assert_eq!(arbiter.snapshot("acct").await.unwrap().version, 1);
        assert_eq!(broadcaster.updates().await.len(), 1);
    }

    #[tokio::test]
    async fn unknown_device_is_told_to_rejoin() {
        let (_store, broadcaster, arbiter) = fixture(Duration::ZERO);
        let outcome = arbiter
            .role_request("acct", "ghost", DesiredRole::Player)
            .await
            .unwrap();
        assert_eq!(outcome, EventOutcome::UnknownDevice);
        assert_eq!(
            arbiter.device_heartbeat("acct", "ghost").await.unwrap(),
            EventOutcome::UnknownDevice
        );
        assert!(broadcaster.updates().await.is_empty());
    }

    #[tokio::test]
    async fn transport_close_ignores_stale_sessions() {
        let (_store, _broadcaster, arbiter) = fixture(Duration::ZERO);
        arbiter
            .device_join("acct", join_info("tv-1", true, "s1"))
            .await
            .unwrap();
        arbiter
            .device_join("acct", join_info("tv-1", true, "s2"))
            .await
            .unwrap();

        // Close of the superseded connection: no-op.
        let stale = arbiter.transport_closed("acct", "tv-1", "s1").await.unwrap();
        assert_eq!(stale, EventOutcome::NoChange);
        assert_eq!(arbiter.snapshot("acct").await.unwrap().version, 1);

        // Close of the current connection vacates the role.
        let real = arbiter.transport_closed("acct", "tv-1", "s2").await.unwrap();
        let payload = match real {
            EventOutcome::Committed(payload) => payload,
            other => panic!("expected vacate commit, got {other:?}"),
        };
        assert_eq!(payload.version, 2);
        assert_eq!(payload.player_device_id, None);
    }
}
