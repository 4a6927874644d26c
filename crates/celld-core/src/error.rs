use celld_common::models::{AppType, ContextState, Purpose, RosterError, UnknownPurpose};
use thiserror::Error;

// ── Routing ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("slot {slot} out of range (0..{slots})")]
    OutOfRange { slot: usize, slots: usize },
    #[error("slot {slot} has no backend provisioned")]
    NotProvisioned { slot: usize },
    #[error("slot {slot}: application type {app_type} does not determine a technology")]
    AmbiguousApplicationType { slot: usize, app_type: AppType },
}

// ── Context state machine ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("slot {slot} {purpose}: not ready (disabled, dependency unmet, or tethered call active)")]
    NotReady { slot: usize, purpose: Purpose },
    #[error("slot {slot} {purpose}: no candidates left to try")]
    NoCandidates { slot: usize, purpose: Purpose },
    #[error("slot {slot} {purpose}: cannot go from {from} to {to}")]
    InvalidTransition {
        slot: usize,
        purpose: Purpose,
        from: ContextState,
        to: ContextState,
    },
    #[error("slot {slot} {purpose}: result for {candidate} does not match the pending attempt")]
    StaleAttempt {
        slot: usize,
        purpose: Purpose,
        candidate: String,
    },
    #[error("slot {slot} {purpose}: candidate {candidate} cannot carry this purpose")]
    UnsupportedPurpose {
        slot: usize,
        purpose: Purpose,
        candidate: String,
    },
    #[error("slot {slot} {purpose}: candidate {candidate} listed twice")]
    DuplicateCandidate {
        slot: usize,
        purpose: Purpose,
        candidate: String,
    },
    #[error("slot {slot}: mobile data is disabled")]
    DataDisabled { slot: usize },
    #[error("slot {slot}: backend was retired by a technology change")]
    BackendRetired { slot: usize },
}

// ── Configuration ───────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("unsupported config version {0}")]
    UnsupportedVersion(u32),
    #[error("at least one slot is required")]
    NoSlots,
    #[error("default data slot {slot} out of range (0..{slots})")]
    DefaultSlotOutOfRange { slot: usize, slots: usize },
    #[error(transparent)]
    UnknownPurpose(#[from] UnknownPurpose),
    #[error("candidate {index}: missing {field}")]
    MissingField { index: usize, field: &'static str },
    #[error("invalid {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
    #[error(transparent)]
    Roster(#[from] RosterError),
}

// ── Service ─────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Route(#[from] RouteError),
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Roster(#[from] RosterError),
}
