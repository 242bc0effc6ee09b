//! Outbound fanout to the devices of an account.
//!
//! The arbiter only sees the [`Broadcaster`] trait; the WebSocket gateway
//! registers each connection's sender with the [`ChannelBroadcaster`].
//! Delivery is fire-and-forget: a committed role change never rolls back
//! because some device's channel is gone.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use metrics::counter;
use tokio::sync::mpsc;
use tracing::debug;
use zapper_proto::ServerMessage;

#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Deliver to every registered device of the account; returns how many
    /// channels accepted the message.
    async fn broadcast(&self, account_id: &str, message: &ServerMessage) -> usize;
}

struct Subscriber {
    session_id: String,
    tx: mpsc::UnboundedSender<ServerMessage>,
}

#[derive(Clone, Default)]
pub struct ChannelBroadcaster {
    accounts: Arc<DashMap<String, DashMap<String, Subscriber>>>,
}

impl ChannelBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// A device re-joining on a new connection overwrites its previous
    /// registration, so the newest session always receives the fanout.
    pub fn register(
        &self,
        account_id: &str,
        device_id: &str,
        session_id: &str,
        tx: mpsc::UnboundedSender<ServerMessage>,
    ) {
        self.accounts.entry(account_id.to_string()).or_default().insert(
            device_id.to_string(),
            Subscriber {
                session_id: session_id.to_string(),
                tx,
            },
        );
    }

    /// Remove the registration only while it still belongs to the given
    /// session; a close racing a re-join must not evict the newer channel.
    pub fn unregister_if(&self, account_id: &str, device_id: &str, session_id: &str) -> bool {
        let Some(devices) = self.accounts.get(account_id) else {
            return false;
        };
        let removed = devices
            .remove_if(device_id, |_, subscriber| {
                subscriber.session_id == session_id
            })
            .is_some();
        let emptied = removed && devices.is_empty();
        drop(devices);
        if emptied {
            self.accounts
                .remove_if(account_id, |_, devices| devices.is_empty());
        }
        removed
    }

    /// Per-account connection counts for the debug stats endpoint.
    pub fn connection_counts(&self) -> Vec<(String, usize)> {
        self.accounts
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().len()))
            .collect()
    }
}

#[async_trait]
impl Broadcaster for ChannelBroadcaster {
    async fn broadcast(&self, account_id: &str, message: &ServerMessage) -> usize {
        let Some(devices) = self.accounts.get(account_id) else {
            return 0;
        };
        let mut delivered = 0usize;
        let mut dropped = 0usize;
        for entry in devices.iter() {
            if entry.value().tx.send(message.clone()).is_ok() {
                delivered += 1;
            } else {
                dropped += 1;
            }
        }
        drop(devices);
        counter!("zapper_hub_broadcast_deliveries_total", delivered as u64);
        if dropped > 0 {
            counter!("zapper_hub_broadcast_dropped_total", dropped as u64);
            debug!(account = %account_id, dropped, "skipped closed outbound channels");
        }
        delivered
    }
}
