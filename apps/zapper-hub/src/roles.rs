//! Pure role-arbitration engine.
//!
//! Decisions are split into two passes. [`vacate_absent`] clears slots whose
//! holder is no longer live and is always applied. [`apply_discretionary`]
//! covers bootstrap grants, explicit requests, and self-releases; the caller
//! gates it behind the cooldown window. Neither pass touches `version`; the
//! arbiter bumps it by exactly one when a decision is committed.

use zapper_proto::DesiredRole;

use crate::store::{DeviceRecord, RolesState};

#[derive(Debug, Clone, PartialEq)]
pub enum RoleEvent {
    Joined { device_id: String },
    Heartbeat { device_id: String },
    Requested { device_id: String, desired: DesiredRole },
    Released { device_id: String, role: DesiredRole },
    Disconnected { device_id: String },
}

impl RoleEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            RoleEvent::Joined { .. } => "joined",
            RoleEvent::Heartbeat { .. } => "heartbeat",
            RoleEvent::Requested { .. } => "requested",
            RoleEvent::Released { .. } => "released",
            RoleEvent::Disconnected { .. } => "disconnected",
        }
    }

    pub fn device_id(&self) -> &str {
        match self {
            RoleEvent::Joined { device_id }
            | RoleEvent::Heartbeat { device_id }
            | RoleEvent::Requested { device_id, .. }
            | RoleEvent::Released { device_id, .. }
            | RoleEvent::Disconnected { device_id } => device_id,
        }
    }
}

/// Clear any slot whose holder has no live record. Returns None when nothing
/// changed. Never suppressed: a role must not stay with a dead device.
pub fn vacate_absent(current: &RolesState, live: &[DeviceRecord]) -> Option<RolesState> {
    let mut next = current.clone();
    let mut changed = false;
    if let Some(player) = next.player_device_id.as_deref() {
        if find_live(live, player).is_none() {
            next.player_device_id = None;
            changed = true;
        }
    }
    if let Some(remote) = next.remote_device_id.as_deref() {
        if find_live(live, remote).is_none() {
            next.remote_device_id = None;
            changed = true;
        }
    }
    changed.then_some(next)
}

/// Discretionary transitions, evaluated against `base` (the state after the
/// vacate pass). Returns None for every no-op, including denied requests.
pub fn apply_discretionary(
    base: &RolesState,
    live: &[DeviceRecord],
    event: &RoleEvent,
) -> Option<RolesState> {
    match event {
        RoleEvent::Joined { device_id } => bootstrap(base, live, device_id),
        RoleEvent::Requested { device_id, desired } => grant(base, live, device_id, *desired),
        RoleEvent::Released { device_id, role } => release(base, device_id, *role),
        // Presence-only events; the vacate pass does any required work.
        RoleEvent::Heartbeat { .. } | RoleEvent::Disconnected { .. } => None,
    }
}

/// Single-device bootstrap: the only live device joining an account with both
/// slots empty gets player if it can play, remote otherwise. Any other join
/// leaves roles to explicit requests.
fn bootstrap(base: &RolesState, live: &[DeviceRecord], device_id: &str) -> Option<RolesState> {
    let record = find_live(live, device_id)?;
    if live.len() != 1 || base.player_device_id.is_some() || base.remote_device_id.is_some() {
        return None;
    }
    let mut next = base.clone();
    if record.can_play {
        next.player_device_id = Some(record.device_id.clone());
    } else {
        next.remote_device_id = Some(record.device_id.clone());
    }
    Some(next)
}

fn grant(
    base: &RolesState,
    live: &[DeviceRecord],
    device_id: &str,
    desired: DesiredRole,
) -> Option<RolesState> {
    let record = find_live(live, device_id)?;
    let sole = live.len() == 1;
    match desired {
        DesiredRole::Player => {
            if base.player_device_id.is_some() || !record.can_play {
                return None;
            }
            // Holding both roles is reserved for a device with no peers.
            if base.remote_device_id.as_deref() == Some(device_id) && !sole {
                return None;
            }
            let mut next = base.clone();
            next.player_device_id = Some(record.device_id.clone());
            Some(next)
        }
        DesiredRole::Remote => {
            if base.remote_device_id.is_some() {
                return None;
            }
            if base.player_device_id.as_deref() == Some(device_id) && !sole {
                return None;
            }
            let mut next = base.clone();
            next.remote_device_id = Some(record.device_id.clone());
            Some(next)
        }
        DesiredRole::Both => {
            if !sole
                || !record.can_play
                || base.player_device_id.is_some()
                || base.remote_device_id.is_some()
            {
                return None;
            }
            let mut next = base.clone();
            next.player_device_id = Some(record.device_id.clone());
            next.remote_device_id = Some(record.device_id.clone());
            Some(next)
        }
    }
}

fn release(base: &RolesState, device_id: &str, role: DesiredRole) -> Option<RolesState> {
    let mut next = base.clone();
    let mut changed = false;
    if matches!(role, DesiredRole::Player | DesiredRole::Both)
        && next.player_device_id.as_deref() == Some(device_id)
    {
        next.player_device_id = None;
        changed = true;
    }
    if matches!(role, DesiredRole::Remote | DesiredRole::Both)
        && next.remote_device_id.as_deref() == Some(device_id)
    {
        next.remote_device_id = None;
        changed = true;
    }
    changed.then_some(next)
}

fn find_live<'a>(live: &'a [DeviceRecord], device_id: &str) -> Option<&'a DeviceRecord> {
    live.iter().find(|record| record.device_id == device_id)
}
