//! WebSocket event gateway.
//!
//! One connection per device at `/ws/{accountId}`. Each connection gets a
//! fresh session id; the device names itself in `presence:join`. Outbound
//! traffic runs through an unbounded channel drained by a writer task, so
//! arbitration never blocks on a slow socket.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use zapper_proto::{ClientMessage, ServerMessage};

use crate::arbiter::EventOutcome;
use crate::handlers::AppState;
use crate::store::{DeviceJoinInfo, StoreError};

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(account_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, account_id, state))
}

async fn handle_socket(socket: WebSocket, account_id: String, state: AppState) {
    let session_id = Uuid::new_v4().to_string();
    counter!("zapper_hub_ws_connections_total", 1);
    info!(account = %account_id, session = %session_id, "websocket connected");

    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let writer_session = session_id.clone();
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Ok(json) = serde_json::to_string(&message) {
                if sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        }
        debug!(session = %writer_session, "outbound writer finished");
    });

    let mut joined_device: Option<String> = None;

    while let Some(frame) = receiver.next().await {
        let message = match frame {
            Ok(message) => message,
            Err(err) => {
                debug!(account = %account_id, session = %session_id, error = %err, "websocket receive error");
                break;
            }
        };
        match message {
            Message::Text(text) => {
                dispatch(
                    &state,
                    &account_id,
                    &session_id,
                    &tx,
                    &mut joined_device,
                    &text,
                )
                .await;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    if let Some(device_id) = joined_device {
        state
            .broadcaster
            .unregister_if(&account_id, &device_id, &session_id);
        if let Err(err) = state
            .arbiter
            .transport_closed(&account_id, &device_id, &session_id)
            .await
        {
            warn!(
                account = %account_id,
                device = %device_id,
                error = %err,
                "disconnect arbitration failed"
            );
        }
    }
    info!(account = %account_id, session = %session_id, "websocket disconnected");
}

async fn dispatch(
    state: &AppState,
    account_id: &str,
    session_id: &str,
    tx: &mpsc::UnboundedSender<ServerMessage>,
    joined_device: &mut Option<String>,
    text: &str,
) {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(err) => {
            warn!(account = %account_id, session = %session_id, error = %err, "invalid client message");
            counter!("zapper_hub_events_rejected_total", 1, "reason" => "malformed");
            let _ = tx.send(ServerMessage::Error {
                message: format!("invalid message format: {err}"),
            });
            return;
        }
    };
    if let Err(err) = message.validate() {
        warn!(account = %account_id, session = %session_id, error = %err, "rejected client message");
        counter!("zapper_hub_events_rejected_total", 1, "reason" => "invalid");
        let _ = tx.send(ServerMessage::Error {
            message: err.to_string(),
        });
        return;
    }
    counter!("zapper_hub_events_total", 1, "kind" => message.kind());

    match message {
        ClientMessage::PresenceJoin(payload) => {
            if let Some(preferred) = payload.preferred_role.as_deref() {
                debug!(
                    account = %account_id,
                    device = %payload.device_id,
                    preferred,
                    "preferred role hint noted"
                );
            }
            let info = DeviceJoinInfo {
                device_id: payload.device_id.clone(),
                device_type: payload.device_type,
                can_play: payload.can_play,
                session_id: session_id.to_string(),
            };
            // Register before arbitration so a bootstrap broadcast reaches
            // the joining device itself.
            state
                .broadcaster
                .register(account_id, &payload.device_id, session_id, tx.clone());
            match state.arbiter.device_join(account_id, info).await {
                Ok(outcome) => {
                    *joined_device = Some(payload.device_id);
                    if outcome.committed.is_none() {
                        // Nothing was broadcast; catch the device up directly.
                        let _ = tx.send(ServerMessage::RolesUpdate(outcome.snapshot));
                    }
                }
                Err(err) => {
                    state
                        .broadcaster
                        .unregister_if(account_id, &payload.device_id, session_id);
                    send_transient_error(tx, account_id, &err);
                }
            }
        }
        ClientMessage::PresenceHeartbeat(payload) => {
            match state
                .arbiter
                .device_heartbeat(account_id, &payload.device_id)
                .await
            {
                Ok(EventOutcome::UnknownDevice) => {
                    let _ = tx.send(ServerMessage::Rejoin {
                        device_id: payload.device_id,
                    });
                }
                Ok(_) => {}
                Err(err) => send_transient_error(tx, account_id, &err),
            }
        }
        ClientMessage::RolesRequest(payload) => {
            match state
                .arbiter
                .role_request(account_id, &payload.device_id, payload.desired)
                .await
            {
                Ok(EventOutcome::UnknownDevice) => {
                    let _ = tx.send(ServerMessage::Rejoin {
                        device_id: payload.device_id,
                    });
                }
                Ok(_) => {}
                Err(err) => send_transient_error(tx, account_id, &err),
            }
        }
        ClientMessage::RolesRelease(payload) => {
            match state
                .arbiter
                .role_release(account_id, &payload.device_id, payload.role)
                .await
            {
                Ok(EventOutcome::UnknownDevice) => {
                    let _ = tx.send(ServerMessage::Rejoin {
                        device_id: payload.device_id,
                    });
                }
                Ok(_) => {}
                Err(err) => send_transient_error(tx, account_id, &err),
            }
        }
    }
}

fn send_transient_error(
    tx: &mpsc::UnboundedSender<ServerMessage>,
    account_id: &str,
    err: &StoreError,
) {
    error!(account = %account_id, error = %err, "coordination store unavailable");
    counter!("zapper_hub_store_failures_total", 1);
    let _ = tx.send(ServerMessage::Error {
        message: "temporary coordination failure, retry shortly".to_string(),
    });
}
