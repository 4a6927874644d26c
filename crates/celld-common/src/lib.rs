//! Shared types for the celld control plane.
//!
//! This crate contains:
//! - **Subscription models**: `SubscriptionIdentity`, `SubscriptionRoster`, app types
//! - **Purposes**: the closed set of connection purposes and their priorities
//! - **Protocol messages**: outbound notifications for listeners
//! - **ID generation**: Prefixed UUIDv7 helpers (`apn_`, `evt_`)

pub mod ids;
pub mod models;
pub mod protocol;
