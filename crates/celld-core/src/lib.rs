//! # celld core
//!
//! Control plane for cellular data connection attempts across one or more
//! SIM slots.
//!
//! - [`context`]: per-(slot, purpose) state machine with the ordered
//!   candidate list and permanent-failure countdown
//! - [`candidate`]: immutable access-point profiles and the shared catalog
//! - [`backend`]: GSM- and CDMA-flavored per-slot backends
//! - [`router`]: slot → backend resolution and technology reconciliation
//! - [`service`]: the inbound API used by connectivity policy and the
//!   radio layer
//! - [`config`]: TOML configuration

pub mod backend;
pub mod candidate;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod router;
pub mod service;
mod util;

pub use celld_common::models::{ContextState, Purpose, TechFlavor};
pub use error::{ConfigError, ContextError, RouteError, ServiceError};
