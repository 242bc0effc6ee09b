//! Device presence and role arbitration hub for Zapper remote-control
//! sessions. One player, one remote, per account; the modules here track
//! who is present, arbitrate who holds which role, and fan the result out
//! to every connected device.

pub mod arbiter;
pub mod broadcast;
pub mod config;
pub mod gateway;
pub mod handlers;
pub mod roles;
pub mod store;
pub mod store_redis;
pub mod sweep;
pub mod telemetry;
