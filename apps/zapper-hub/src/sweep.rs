//! Background expiry sweep.
//!
//! Reads already filter expired devices lazily, but a vanished device that
//! held a role would keep its slot until some other event forced arbitration.
//! The sweep turns prolonged silence into an ordinary disconnect so the
//! vacancy propagates through the same lease-gated path as everything else.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::arbiter::{DisconnectCause, RoleArbiter};
use crate::store::CoordinationStore;

pub fn spawn_sweeper(
    store: Arc<dyn CoordinationStore>,
    arbiter: Arc<RoleArbiter>,
    period: Duration,
) -> JoinHandle<()> {
    let mut interval = tokio::time::interval(period);
    tokio::spawn(async move {
        loop {
            interval.tick().await;
            sweep_once(store.as_ref(), &arbiter).await;
        }
    })
}

/// One pass over every account with recorded presence. Returns how many
/// expired devices were reaped.
pub async fn sweep_once(store: &dyn CoordinationStore, arbiter: &RoleArbiter) -> usize {
    let accounts = match store.accounts_with_presence().await {
        Ok(accounts) => accounts,
        Err(err) => {
            warn!(error = %err, "presence sweep could not list accounts");
            return 0;
        }
    };

    let mut reaped = 0;
    for account_id in accounts {
        let stale = match store.stale_devices(&account_id).await {
            Ok(stale) => stale,
            Err(err) => {
                warn!(account = %account_id, error = %err, "presence sweep failed");
                continue;
            }
        };
        for device_id in stale {
            debug!(account = %account_id, device = %device_id, "sweeping expired device");
            match arbiter
                .device_disconnect(&account_id, &device_id, DisconnectCause::Expired)
                .await
            {
                Ok(_) => {
                    counter!("zapper_hub_sweep_reaped_total", 1);
                    reaped += 1;
                }
                Err(err) => {
                    warn!(
                        account = %account_id,
                        device = %device_id,
                        error = %err,
                        "sweep disconnect failed"
                    );
                }
            }
        }
    }
    reaped
}
