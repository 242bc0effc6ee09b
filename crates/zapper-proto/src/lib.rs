//! Shared wire-protocol types for Zapper remote-control sessions.
//!
//! Devices and the hub exchange JSON text frames shaped as tagged envelopes:
//! [`ClientMessage`] inbound, [`ServerMessage`] outbound. Payload field names
//! are camelCase on the wire; event names are fixed strings like
//! `presence:join` and `roles:update`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound on device identifiers accepted from the wire.
pub const MAX_DEVICE_ID_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Phone,
    Tablet,
    Desktop,
    Web,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Phone => "phone",
            DeviceType::Tablet => "tablet",
            DeviceType::Desktop => "desktop",
            DeviceType::Web => "web",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "phone" => Ok(DeviceType::Phone),
            "tablet" => Ok(DeviceType::Tablet),
            "desktop" => Ok(DeviceType::Desktop),
            "web" => Ok(DeviceType::Web),
            other => Err(ValidationError::UnknownDeviceType(other.to_string())),
        }
    }
}

/// What a device asks for in `roles:request` / gives up in `roles:release`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredRole {
    Player,
    Remote,
    Both,
}

impl DesiredRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            DesiredRole::Player => "player",
            DesiredRole::Remote => "remote",
            DesiredRole::Both => "both",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleName {
    Player,
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceJoinPayload {
    pub device_id: String,
    pub device_type: DeviceType,
    pub can_play: bool,
    /// Advisory hint only; arbitration assigns roles through bootstrap or
    /// explicit requests. Unrecognized values (including "auto") are accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_role: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceHeartbeatPayload {
    pub device_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolesRequestPayload {
    pub device_id: String,
    pub desired: DesiredRole,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolesReleasePayload {
    pub device_id: String,
    pub role: DesiredRole,
}

/// Broadcast projection of an account's role state.
///
/// `version` is monotonically increasing; clients drop any update older than
/// the newest one they have applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolesUpdatePayload {
    pub version: u64,
    pub player_device_id: Option<String>,
    pub remote_device_id: Option<String>,
    pub roles: Vec<RoleName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_socket_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "presence:join")]
    PresenceJoin(PresenceJoinPayload),
    #[serde(rename = "presence:heartbeat")]
    PresenceHeartbeat(PresenceHeartbeatPayload),
    #[serde(rename = "roles:request")]
    RolesRequest(RolesRequestPayload),
    #[serde(rename = "roles:release")]
    RolesRelease(RolesReleasePayload),
}

impl ClientMessage {
    /// Stable event name, used for logging and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::PresenceJoin(_) => "presence:join",
            ClientMessage::PresenceHeartbeat(_) => "presence:heartbeat",
            ClientMessage::RolesRequest(_) => "roles:request",
            ClientMessage::RolesRelease(_) => "roles:release",
        }
    }

    pub fn device_id(&self) -> &str {
        match self {
            ClientMessage::PresenceJoin(p) => &p.device_id,
            ClientMessage::PresenceHeartbeat(p) => &p.device_id,
            ClientMessage::RolesRequest(p) => &p.device_id,
            ClientMessage::RolesRelease(p) => &p.device_id,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_device_id(self.device_id())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "roles:update")]
    RolesUpdate(RolesUpdatePayload),
    #[serde(rename = "error")]
    Error { message: String },
    #[serde(rename = "presence:rejoin", rename_all = "camelCase")]
    Rejoin { device_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("deviceId must not be empty")]
    EmptyDeviceId,
    #[error("deviceId exceeds {MAX_DEVICE_ID_LEN} characters")]
    DeviceIdTooLong,
    #[error("unknown device type: {0}")]
    UnknownDeviceType(String),
}

pub fn validate_device_id(device_id: &str) -> Result<(), ValidationError> {
    if device_id.is_empty() {
        return Err(ValidationError::EmptyDeviceId);
    }
    if device_id.len() > MAX_DEVICE_ID_LEN {
        return Err(ValidationError::DeviceIdTooLong);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_round_trips_with_wire_names() {
        let msg = ClientMessage::PresenceJoin(PresenceJoinPayload {
            device_id: "phone-1".into(),
            device_type: DeviceType::Phone,
            can_play: false,
            preferred_role: Some("auto".into()),
        });
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"presence:join""#));
        assert!(json.contains(r#""deviceId":"phone-1""#));
        assert!(json.contains(r#""canPlay":false"#));

        let parsed: ClientMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.kind(), "presence:join");
        assert_eq!(parsed.device_id(), "phone-1");
    }

    #[test]
    fn join_without_preferred_role_parses() {
        let json = r#"{"type":"presence:join","deviceId":"tv-1","deviceType":"web","canPlay":true}"#;
        let parsed: ClientMessage = serde_json::from_str(json).unwrap();
        match parsed {
            ClientMessage::PresenceJoin(p) => {
                assert!(p.can_play);
                assert_eq!(p.device_type, DeviceType::Web);
                assert!(p.preferred_role.is_none());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn request_parses_desired_role() {
        let json = r#"{"type":"roles:request","deviceId":"tv-1","desired":"player"}"#;
        let parsed: ClientMessage = serde_json::from_str(json).unwrap();
        match parsed {
            ClientMessage::RolesRequest(p) => assert_eq!(p.desired, DesiredRole::Player),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn unknown_event_type_is_rejected() {
        let json = r#"{"type":"presence:leave","deviceId":"tv-1"}"#;
        assert!(serde_json::from_str::<ClientMessage>(json).is_err());
    }

    #[test]
    fn update_serializes_null_slots_and_omits_missing_socket() {
        let update = ServerMessage::RolesUpdate(RolesUpdatePayload {
            version: 3,
            player_device_id: None,
            remote_device_id: Some("phone-1".into()),
            roles: vec![RoleName::Remote],
            player_socket_id: None,
        });
        let json = serde_json::to_string(&update).unwrap();
        assert!(json.contains(r#""type":"roles:update""#));
        assert!(json.contains(r#""playerDeviceId":null"#));
        assert!(json.contains(r#""remoteDeviceId":"phone-1""#));
        assert!(json.contains(r#""roles":["remote"]"#));
        assert!(!json.contains("playerSocketId"));
    }

    #[test]
    fn rejoin_uses_camel_case_device_id() {
        let msg = ServerMessage::Rejoin {
            device_id: "phone-1".into(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"presence:rejoin""#));
        assert!(json.contains(r#""deviceId":"phone-1""#));
    }

    #[test]
    fn device_id_validation() {
        assert_eq!(validate_device_id(""), Err(ValidationError::EmptyDeviceId));
        assert_eq!(
            validate_device_id(&"x".repeat(MAX_DEVICE_ID_LEN + 1)),
            Err(ValidationError::DeviceIdTooLong)
        );
        assert!(validate_device_id("tv-1").is_ok());
    }
}
